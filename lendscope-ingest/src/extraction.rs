//! Structured extraction of offer terms.
//!
//! `extracted_info` is declared to the model with the `OfferTerms` schema but
//! kept as raw JSON here so [`conform`] can flag fields that do not fit
//! instead of silently coercing them.

use lendscope_core::models::OfferTerms;
use lendscope_core::{CompletionError, StructuredOutput};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

pub const EXTRACTION_PROMPT: &str = "\
You extract lender terms from a loan document supplied in the user message.
Fill every field of `extracted_info`. Write `MISSING` for anything the document does not state.
- Numbers are plain values: \"3M\" becomes 3000000, \"500k\" becomes 500000, percentages drop the % sign.
- Ranges carry `min` and `max`; when only one value is given use it for both.
- `service_areas` are two-letter US state codes; \"nationwide\" means every state code.
- `construction` and `value_add` are yes or no; `personal_guarantee` is yes, no or partial.
In `message`, list the fields you marked MISSING, ask the user to supply them if they can, \
and ask whether to add the extracted terms to the lender catalog.
`chat_title` is at most three words.";

pub const UPLOAD_CHAT_PROMPT: &str = "\
You maintain the lender terms extracted from a document the user uploaded. \
The current extraction is given below as JSON.
Merge any corrections or additions from the user's latest message into `extracted_info`, \
keeping every value the user did not change. Use `MISSING` for unknown values.
Set `consent` to true only when the user clearly agrees to save or update the terms in the catalog.
Set `is_updated` to true when any field changed in this turn.
In `message`, reply in markdown: summarise what changed or is still missing, \
thank the user and confirm the catalog was updated when consent is given, \
otherwise ask for consent. If the user asks an unrelated question, answer it in `message` \
and leave the extraction unchanged.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DocumentExtraction {
    #[schemars(with = "OfferTerms")]
    pub extracted_info: Value,
    pub message: String,
    #[serde(default)]
    pub chat_title: String,
}

impl StructuredOutput for DocumentExtraction {
    const SCHEMA_NAME: &'static str = "document_extraction";
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UploadChatReply {
    #[schemars(with = "OfferTerms")]
    pub extracted_info: Value,
    pub message: String,
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub is_updated: bool,
}

impl StructuredOutput for UploadChatReply {
    const SCHEMA_NAME: &'static str = "upload_chat";
}

/// Read `extracted_info` into typed terms. Conformance issues are logged and
/// returned; output that cannot be read at all is a malformed response.
pub fn conform(raw: &Value, schema: &str) -> Result<(OfferTerms, Vec<String>), CompletionError> {
    let (terms, issues) = OfferTerms::conform(raw).map_err(|e| CompletionError::MalformedOutput {
        schema: schema.to_string(),
        reason: e.to_string(),
    })?;
    for issue in &issues {
        tracing::warn!(schema = %schema, issue = %issue, "Extracted field flagged");
    }
    Ok((terms, issues))
}
