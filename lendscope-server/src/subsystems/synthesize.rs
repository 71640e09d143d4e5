//! Grounded answer generation.

use lendscope_core::completion::complete_structured;
use lendscope_core::models::session::recent_turns;
use lendscope_core::models::{clamp_title, ConversationTurn};
use lendscope_core::{CompletionError, CompletionGateway, StructuredOutput};
use schemars::JsonSchema;
use serde::Deserialize;

use super::intent::{Intent, HISTORY_LIMIT};
use super::retrieve::Grounding;

const BASE_PROMPT: &str = "\
You are a commercial lending assistant. Answer in concise markdown.
`chat_title` summarises the conversation in at most three words.";

#[derive(Debug, Deserialize, JsonSchema)]
struct SynthesizedReply {
    response: String,
    #[serde(default)]
    chat_title: String,
}

impl StructuredOutput for SynthesizedReply {
    const SCHEMA_NAME: &'static str = "chat_response";
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// `None` leaves the session title unchanged.
    pub title: Option<String>,
}

fn system_prompt(intent: Intent, grounding: &Grounding) -> String {
    let instructions = match (intent, grounding) {
        (_, Grounding::Structured(_)) => "\
The offers below are catalogued lenders that match every criterion the user gave (source: lender catalog). \
Present each one with its key terms and contact details. \
Make no claims about lenders or terms that are not listed.",
        (_, Grounding::Approximate(_)) => "\
No catalogued lender matched all of the user's criteria. The offers below are the closest matches \
by similarity (source: similarity search). Say plainly that they are approximate matches, \
note where they differ from the request, and make no claims beyond what is listed.",
        (Intent::CriteriaMissing, _) => "\
The user wants a lender but has not said what they need. Ask for the loan amount, the purpose \
of the loan, the desired term, the property location and their credit score. Do not name any lender.",
        _ => "\
Answer the general lending question from common knowledge. Do not name or recommend specific \
lenders or quote specific offers.",
    };

    let offers = grounding.render();
    if offers.is_empty() {
        format!("{}\n{}", BASE_PROMPT, instructions)
    } else {
        format!("{}\n{}\n\nOFFERS:\n{}", BASE_PROMPT, instructions, offers)
    }
}

pub async fn generate(
    gateway: &dyn CompletionGateway,
    intent: Intent,
    history: &[ConversationTurn],
    message: &str,
    grounding: &Grounding,
) -> Result<Reply, CompletionError> {
    let mut turns = recent_turns(history, HISTORY_LIMIT).to_vec();
    turns.push(ConversationTurn::user(message));

    let reply = complete_structured::<SynthesizedReply>(gateway, &system_prompt(intent, grounding), &turns).await?;
    if reply.response.trim().is_empty() {
        return Err(CompletionError::EmptyResponse);
    }
    Ok(Reply {
        text: reply.response.trim().to_string(),
        title: clamp_title(&reply.chat_title),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lendscope_core::models::{LoanOffer, OfferTerms};

    #[test]
    fn test_prompt_names_grounding_source() {
        let offers = vec![LoanOffer::new(
            "d1",
            OfferTerms {
                company_name: Some("Bay Capital".into()),
                ..Default::default()
            },
            "u1",
        )];
        let prompt = system_prompt(Intent::FilteredLender, &Grounding::Structured(offers));
        assert!(prompt.contains("source: lender catalog"));
        assert!(prompt.contains("document_id: d1"));
    }

    #[test]
    fn test_ungrounded_prompts_avoid_offers() {
        let criteria = system_prompt(Intent::CriteriaMissing, &Grounding::NoMatch);
        assert!(criteria.contains("loan amount"));
        assert!(criteria.contains("credit score"));
        assert!(!criteria.contains("OFFERS:"));

        let general = system_prompt(Intent::GeneralLending, &Grounding::NoMatch);
        assert!(general.contains("Do not name or recommend"));
    }
}
