//! The chat turn pipeline.
//!
//! `classify -> extract filters -> compile -> retrieve -> synthesize -> persist`.
//! Each model-backed stage runs under the configured timeout and degrades
//! instead of failing: a slow classifier yields the default intent, slow
//! filter extraction yields no filters, a slow retrieval yields no hits and
//! a failed synthesis yields a fixed apology. Only state-store failures
//! surface as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lendscope_core::config::RetrievalConfig;
use lendscope_core::models::session::recent_turns;
use lendscope_core::models::{Confidence, ConversationTurn, SessionKind};
use lendscope_core::{CompletionGateway, LendscopeError, StateStore, StorePredicate};
use serde::Serialize;

use super::filters::{compile, extract_filters, Filter};
use super::intent::{classify, Classification, Intent};
use super::retrieve::{Grounding, HybridRetriever, MatchKind, APPROXIMATE_DISCLOSURE};
use super::synthesize::{generate, Reply};

pub const REFUSAL: &str = "I'm sorry, I don't understand that. Please ask me about lending or loan options.";
pub const NO_MATCH: &str = "I'm sorry, I couldn't find any information. Please try again.";
pub const APOLOGY: &str = "I'm sorry, I couldn't generate a response. Please try again.";
pub const CRITERIA_REQUEST: &str = "I can help you find a lender. Could you tell me the loan amount you need, \
the purpose of the loan, the term you're looking for, where the property is located and your credit score?";

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub history_window: usize,
    pub stage_timeout: Duration,
}

impl ChatSettings {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            history_window: config.history_window,
            stage_timeout: Duration::from_secs(config.stage_timeout_seconds),
        }
    }
}

/// Result of one chat turn, as returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub intent: Intent,
    pub confidence: Confidence,
    pub reason: String,
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_kind: Option<MatchKind>,
    pub offers: Vec<String>,
}

#[derive(Clone)]
pub struct ChatPipeline {
    gateway: Arc<dyn CompletionGateway>,
    retriever: HybridRetriever,
    state: StateStore,
    settings: ChatSettings,
}

impl ChatPipeline {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        retriever: HybridRetriever,
        state: StateStore,
        settings: ChatSettings,
    ) -> Self {
        Self {
            gateway,
            retriever,
            state,
            settings,
        }
    }

    pub async fn run_turn(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        message: &str,
    ) -> Result<TurnOutcome, LendscopeError> {
        let session = self.state.open_session(session_id, user_id, SessionKind::Chat).await?;
        let sid = session.session_id;
        let conversation = self.state.conversation(&sid).await?;
        let history = recent_turns(&conversation, self.settings.history_window);
        let gateway = self.gateway.as_ref();

        let classification = self
            .stage("classify", classify(gateway, history, message))
            .await
            .unwrap_or_else(|| Classification::fallback("classification timed out"));
        tracing::info!(
            session_id = %sid,
            intent = classification.intent.as_str(),
            confidence = classification.confidence.as_str(),
            "Chat turn classified"
        );

        let mut outcome = TurnOutcome {
            session_id: sid.clone(),
            response: String::new(),
            title: None,
            intent: classification.intent,
            confidence: classification.confidence,
            reason: classification.reason,
            filters: Vec::new(),
            match_kind: None,
            offers: Vec::new(),
        };

        if outcome.intent == Intent::OutOfScope {
            outcome.response = REFUSAL.to_string();
            return self.persist(message, outcome).await;
        }

        let grounding = if outcome.intent.retrieves() {
            let filters = self
                .stage("extract_filters", extract_filters(gateway, history, message))
                .await
                .unwrap_or_default();
            let predicate: StorePredicate = compile(&filters);
            outcome.filters = filters;

            let grounding = self
                .stage("retrieve", self.retriever.retrieve(outcome.intent, message, &predicate))
                .await
                .unwrap_or_default()
                .merge();
            outcome.match_kind = Some(grounding.kind());
            outcome.offers = grounding.document_ids();

            if matches!(grounding, Grounding::NoMatch) {
                outcome.response = NO_MATCH.to_string();
                return self.persist(message, outcome).await;
            }
            grounding
        } else {
            Grounding::NoMatch
        };

        let reply = self
            .stage("synthesize", generate(gateway, outcome.intent, history, message, &grounding))
            .await;
        match reply {
            Some(Ok(Reply { text, title })) => {
                outcome.response = match grounding {
                    Grounding::Approximate(_) if !text.starts_with(APPROXIMATE_DISCLOSURE) => {
                        format!("{}\n\n{}", APPROXIMATE_DISCLOSURE, text)
                    }
                    _ => text,
                };
                outcome.title = title;
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %sid, error = %e, "Synthesis failed");
                outcome.response = fallback_reply(outcome.intent).to_string();
            }
            None => outcome.response = fallback_reply(outcome.intent).to_string(),
        }

        self.persist(message, outcome).await
    }

    /// Run one stage under the stage timeout. `None` means it timed out.
    async fn stage<F: Future>(&self, name: &'static str, fut: F) -> Option<F::Output> {
        match tokio::time::timeout(self.settings.stage_timeout, fut).await {
            Ok(output) => Some(output),
            Err(_) => {
                tracing::warn!(
                    stage = name,
                    timeout_secs = self.settings.stage_timeout.as_secs_f64(),
                    "Chat stage timed out"
                );
                None
            }
        }
    }

    async fn persist(&self, message: &str, outcome: TurnOutcome) -> Result<TurnOutcome, LendscopeError> {
        let turns = [
            ConversationTurn::user(message),
            ConversationTurn::assistant(outcome.response.clone()),
        ];
        self.state
            .append_turns(&outcome.session_id, &turns, outcome.title.as_deref())
            .await?;
        Ok(outcome)
    }
}

fn fallback_reply(intent: Intent) -> &'static str {
    match intent {
        Intent::CriteriaMissing => CRITERIA_REQUEST,
        _ => APOLOGY,
    }
}
