//! Relevance gate run before extraction.

use lendscope_core::completion::complete_structured;
use lendscope_core::models::{Confidence, ConversationTurn};
use lendscope_core::{CompletionGateway, StructuredOutput};
use schemars::JsonSchema;
use serde::Deserialize;

const RELEVANCE_PROMPT: &str = "\
You classify documents for a commercial lending catalog.
Answer `relevant_document` when the text describes loans, lending programs or \
lender terms (rates, amounts, LTV, credit requirements, eligible properties). \
Answer `irrelevant_document` for anything else.
Reply only with the requested JSON object.";

/// Longest document prefix sent to the model in one call.
pub(crate) const MAX_DOCUMENT_CHARS: usize = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    RelevantDocument,
    IrrelevantDocument,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RelevanceCheck {
    pub document_type: DocumentType,
    pub confidence: Confidence,
}

impl StructuredOutput for RelevanceCheck {
    const SCHEMA_NAME: &'static str = "relevance_check";
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relevance {
    Relevant(Confidence),
    Irrelevant(Confidence),
    /// The check itself failed; carries the reason for logging.
    Error(String),
}

/// Classify `text`. Never fails; upstream problems become `Relevance::Error`.
pub async fn check_relevance(gateway: &dyn CompletionGateway, text: &str) -> Relevance {
    let turns = [ConversationTurn::user(truncate_chars(text, MAX_DOCUMENT_CHARS))];
    match complete_structured::<RelevanceCheck>(gateway, RELEVANCE_PROMPT, &turns).await {
        Ok(check) => match check.document_type {
            DocumentType::RelevantDocument => Relevance::Relevant(check.confidence),
            DocumentType::IrrelevantDocument => Relevance::Irrelevant(check.confidence),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Relevance check failed");
            Relevance::Error(e.to_string())
        }
    }
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
