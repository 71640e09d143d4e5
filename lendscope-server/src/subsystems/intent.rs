//! Intent classification for chat turns.
//!
//! Maps recent history plus the new message to one of a closed set of
//! intents. Classification never fails: upstream errors and unreadable
//! output fall back to `general_lending` with low confidence.

use lendscope_core::completion::complete_structured;
use lendscope_core::models::session::recent_turns;
use lendscope_core::models::{Confidence, ConversationTurn};
use lendscope_core::{CompletionGateway, StructuredOutput};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Turns of history the classifier sees.
pub const HISTORY_LIMIT: usize = 10;

const INTENT_PROMPT: &str = "\
You route messages for a commercial lending assistant. Pick exactly one intent:
- filtered_lender: the user asks for lenders and gives at least one concrete criterion \
(location, loan amount, LTV, rate, property type, program, credit score, ...).
- criteria_missing: the user wants a lender but gives no usable criteria.
- follow_up_lender: the user asks about lenders or offers already discussed in this conversation.
- general_lending: a general question about loans or lending that needs no specific offer.
- out_of_scope: anything unrelated to lending.
Give your confidence (high, medium or low) and a one-sentence reason.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FilteredLender,
    CriteriaMissing,
    FollowUpLender,
    GeneralLending,
    OutOfScope,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::FilteredLender => "filtered_lender",
            Intent::CriteriaMissing => "criteria_missing",
            Intent::FollowUpLender => "follow_up_lender",
            Intent::GeneralLending => "general_lending",
            Intent::OutOfScope => "out_of_scope",
        }
    }

    /// Intents answered from catalogued offers.
    pub fn retrieves(&self) -> bool {
        matches!(self, Intent::FilteredLender | Intent::FollowUpLender)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IntentClassification {
    intent: Intent,
    confidence: Confidence,
    #[serde(default)]
    reason: String,
}

impl StructuredOutput for IntentClassification {
    const SCHEMA_NAME: &'static str = "intent";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: Confidence,
    pub reason: String,
}

impl Classification {
    /// Used whenever the classifier cannot produce an answer.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            intent: Intent::GeneralLending,
            confidence: Confidence::Low,
            reason: reason.into(),
        }
    }
}

pub async fn classify(
    gateway: &dyn CompletionGateway,
    history: &[ConversationTurn],
    message: &str,
) -> Classification {
    let mut turns = recent_turns(history, HISTORY_LIMIT).to_vec();
    turns.push(ConversationTurn::user(message));

    match complete_structured::<IntentClassification>(gateway, INTENT_PROMPT, &turns).await {
        Ok(c) => {
            tracing::debug!(intent = c.intent.as_str(), confidence = c.confidence.as_str(), "Message classified");
            Classification {
                intent: c.intent,
                confidence: c.confidence,
                reason: c.reason,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Intent classification failed, using default intent");
            Classification::fallback("classification unavailable")
        }
    }
}
