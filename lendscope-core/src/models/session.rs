use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::offer::OfferTerms;

/// Title given to sessions until a turn produces one.
pub const DEFAULT_TITLE: &str = "new chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i32>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            feedback: None,
            rating: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Chat,
    Upload,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Chat => "chat",
            SessionKind::Upload => "upload",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(SessionKind::Chat),
            "upload" => Ok(SessionKind::Upload),
            other => Err(format!("unknown session kind: {}", other)),
        }
    }
}

/// A user's conversation. `messages` is append-only and chronological.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub kind: SessionKind,
    pub messages: Vec<ConversationTurn>,
    pub document_id: Option<String>,
    pub document_snapshot: Option<OfferTerms>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, kind: SessionKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            kind,
            messages: Vec::new(),
            document_id: None,
            document_snapshot: None,
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            last_interaction_at: now,
        }
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> &[ConversationTurn] {
        recent_turns(&self.messages, n)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            kind: self.kind,
            title: self.title.clone(),
            document_id: self.document_id.clone(),
            created_at: self.created_at,
            last_interaction_at: self.last_interaction_at,
        }
    }
}

/// Tail slice of a conversation, at most `n` turns long.
pub fn recent_turns(turns: &[ConversationTurn], n: usize) -> &[ConversationTurn] {
    &turns[turns.len().saturating_sub(n)..]
}

/// Normalise a model-proposed title to at most three words. Blank input
/// yields `None`, which leaves the current title in place.
pub fn clamp_title(raw: &str) -> Option<String> {
    let words: Vec<&str> = raw
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '#'))
        .filter(|w| !w.is_empty())
        .take(3)
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// Session list entry, without the message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: SessionKind,
    pub title: String,
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}
