//! Offer rendering and vector indexing.
//!
//! `describe_offer` produces the prose that is embedded and stored as vector
//! metadata; `grounding_block` is the compact form handed to the synthesizer.

use std::sync::Arc;

use lendscope_core::models::regions::state_name;
use lendscope_core::models::{FieldRef, LoanOffer, NumericRange, OfferTerms, SchemaField, MISSING};
use lendscope_core::{EmbeddingBackend, VectorIndex};

use crate::error::IngestError;

/// Embeds offers and writes them to the vector index.
#[derive(Clone)]
pub struct OfferIndexer {
    embeddings: Arc<dyn EmbeddingBackend>,
    index: Arc<dyn VectorIndex>,
}

impl OfferIndexer {
    pub fn new(embeddings: Arc<dyn EmbeddingBackend>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embeddings, index }
    }

    pub fn embeddings(&self) -> &Arc<dyn EmbeddingBackend> {
        &self.embeddings
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Embed and upsert one offer. Returns `false` when the backend produced
    /// no vector; the re-index worker picks the offer up later.
    pub async fn index_offer(&self, offer: &LoanOffer) -> Result<bool, IngestError> {
        let description = describe_offer(&offer.terms);
        let Some(vector) = self.embeddings.embed(&description).await? else {
            tracing::debug!(document_id = %offer.document_id, "No vector produced, offer left for re-index");
            return Ok(false);
        };

        let metadata = serde_json::json!({
            "document_id": offer.document_id,
            "company_name": offer.terms.company_name,
            "created_by": offer.created_by,
            "created_at": offer.created_at,
            "description": description,
        });
        self.index.upsert(&offer.document_id, vector, metadata).await?;
        tracing::info!(
            document_id = %offer.document_id,
            namespace = self.index.namespace(),
            "Offer indexed"
        );
        Ok(true)
    }
}

/// Plain-language summary of an offer. Missing fields are left out.
pub fn describe_offer(terms: &OfferTerms) -> String {
    let mut parts = Vec::new();

    let company = terms.company_name.as_deref().unwrap_or("This lender");
    match terms.loan_plans.as_deref() {
        Some(plans) => parts.push(format!("{} offers {} loan programs.", company, plans)),
        None => parts.push(format!("{} offers loan programs.", company)),
    }

    if !terms.service_areas.is_empty() {
        let states: Vec<&str> = terms
            .service_areas
            .iter()
            .map(|code| state_name(code).unwrap_or(code.as_str()))
            .collect();
        parts.push(format!("They lend in {}.", join_list(&states)));
    }

    if let Some(r) = format_range(&terms.loan_amount, "$", "") {
        parts.push(format!("Loan amounts from {}.", r));
    }
    if let Some(r) = format_range(&terms.ltv_ratio, "", "%") {
        parts.push(format!("Loan to value ratio {}.", r));
    }
    if let Some(r) = format_range(&terms.ltc_ratio, "", "%") {
        parts.push(format!("Loan to cost ratio {}.", r));
    }
    if let Some(r) = format_range(&terms.interest_rate, "", "%") {
        parts.push(format!("Interest rates {}.", r));
    }
    if let Some(r) = format_range(&terms.points_charged, "", " points") {
        parts.push(format!("Points charged {}.", r));
    }
    if let Some(r) = format_range(&terms.loan_term, "", " years") {
        parts.push(format!("Loan terms {}.", r));
    }
    if let Some(r) = format_range(&terms.dscr, "", "x") {
        parts.push(format!("Debt service coverage ratio {}.", r));
    }
    if let Some(a) = terms.amortization.as_deref() {
        parts.push(format!("Amortization: {}.", a));
    }
    if let Some(c) = terms.credit_score_requirements.as_deref() {
        parts.push(format!("Credit score requirements: {}.", c));
    }
    if !terms.property_types.is_empty() {
        parts.push(format!("Eligible property types: {}.", join_list(&terms.property_types)));
    }
    if !terms.application_requirements.is_empty() {
        parts.push(format!("Application requirements: {}.", terms.application_requirements.join("; ")));
    }
    if !terms.guidelines.is_empty() {
        parts.push(format!("Guidelines: {}.", terms.guidelines.join("; ")));
    }
    if !terms.liquidity_requirements.is_empty() {
        parts.push(format!("Liquidity requirements: {}.", terms.liquidity_requirements.join("; ")));
    }

    for (label, flag) in [
        ("Construction loans", terms.construction.as_str()),
        ("Value add loans", terms.value_add.as_str()),
        ("Personal guarantee required", terms.personal_guarantee.as_str()),
    ] {
        if flag != MISSING {
            parts.push(format!("{}: {}.", label, flag));
        }
    }

    let contact = &terms.contact_information;
    let mut reach = Vec::new();
    if let Some(person) = contact.person.as_deref() {
        reach.push(format!("Contact {}", person));
    }
    if let Some(phone) = contact.phone.as_deref() {
        reach.push(format!("at {}", phone));
    }
    if let Some(email) = contact.email.as_deref() {
        reach.push(format!("or email {}", email));
    }
    if !reach.is_empty() {
        parts.push(format!("{}.", reach.join(" ")));
    }

    parts.join(" ")
}

/// One `field: value` line per known field, for prompt grounding.
pub fn grounding_block(offer: &LoanOffer) -> String {
    let mut lines = vec![format!("document_id: {}", offer.document_id)];
    for field in SchemaField::ALL {
        let value = match offer.terms.field(field) {
            FieldRef::Text(Some(t)) => t.to_string(),
            FieldRef::Text(None) => continue,
            FieldRef::List([]) => continue,
            FieldRef::List(items) => items.join(", "),
            FieldRef::Range(r) => match format_range(r, "", "") {
                Some(s) => s,
                None => continue,
            },
            FieldRef::Flag(MISSING) => continue,
            FieldRef::Flag(f) => f.to_string(),
            FieldRef::Contact(c) => {
                let parts: Vec<&str> = c.parts().collect();
                if parts.is_empty() {
                    continue;
                }
                parts.join(", ")
            }
        };
        lines.push(format!("{}: {}", field.name(), value));
    }
    lines.join("\n")
}

fn format_range(range: &NumericRange, prefix: &str, suffix: &str) -> Option<String> {
    let fmt = |v: f64| format!("{}{}{}", prefix, format_number(v), suffix);
    match (range.min, range.max) {
        (Some(lo), Some(hi)) if lo == hi => Some(fmt(lo)),
        (Some(lo), Some(hi)) => Some(format!("{} to {}", fmt(lo), fmt(hi))),
        (Some(lo), None) => Some(format!("at least {}", fmt(lo))),
        (None, Some(hi)) => Some(format!("up to {}", fmt(hi))),
        (None, None) => None,
    }
}

/// Whole numbers get thousands separators; fractions keep up to two places.
fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        let digits = format!("{}", v.abs() as u64);
        let mut out = String::new();
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(ch);
        }
        if v < 0.0 {
            out.insert(0, '-');
        }
        out
    } else {
        let s = format!("{:.2}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    match items {
        [] => String::new(),
        [one] => one.as_ref().to_string(),
        [init @ .., last] => format!(
            "{} and {}",
            init.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", "),
            last.as_ref()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lendscope_core::models::{ContactInformation, TriState};
    use lendscope_core::store::MemoryVectorIndex;
    use lendscope_core::EmbeddingError;
    use async_trait::async_trait;

    struct FixedEmbedding(Option<Vec<f32>>);

    #[async_trait]
    impl EmbeddingBackend for FixedEmbedding {
        async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
            Ok(self.0.clone())
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn sample_terms() -> OfferTerms {
        OfferTerms {
            company_name: Some("Acme Lending".into()),
            loan_plans: Some("Bridge, Fix and Flip".into()),
            service_areas: vec!["CA".into(), "TX".into(), "NY".into()],
            loan_amount: NumericRange::new(Some(100_000.0), Some(2_500_000.0)),
            ltv_ratio: NumericRange::new(None, Some(75.0)),
            interest_rate: NumericRange::new(Some(9.5), Some(9.5)),
            construction: TriState::Yes,
            contact_information: ContactInformation {
                person: Some("Dana".into()),
                phone: None,
                email: Some("dana@acme.test".into()),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_describe_offer_expands_states_and_ranges() {
        let text = describe_offer(&sample_terms());
        assert!(text.starts_with("Acme Lending offers Bridge, Fix and Flip loan programs."));
        assert!(text.contains("They lend in California, Texas and New York."));
        assert!(text.contains("Loan amounts from $100,000 to $2,500,000."));
        assert!(text.contains("Loan to value ratio up to 75%."));
        assert!(text.contains("Interest rates 9.5%."));
        assert!(text.contains("Construction loans: yes."));
        assert!(!text.contains("Value add"));
        assert!(text.ends_with("Contact Dana or email dana@acme.test."));
    }

    #[test]
    fn test_grounding_block_skips_missing_fields() {
        let offer = LoanOffer::new("doc-1", sample_terms(), "u1");
        let block = grounding_block(&offer);
        assert!(block.starts_with("document_id: doc-1\ncompany_name: Acme Lending"));
        assert!(block.contains("service_areas: CA, TX, NY"));
        assert!(block.contains("loan_amount: 100,000 to 2,500,000"));
        assert!(!block.contains("dscr"));
        assert!(!block.contains("personal_guarantee"));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1_500_000.0), "1,500,000");
        assert_eq!(format_number(75.0), "75");
        assert_eq!(format_number(1.25), "1.25");
        assert_eq!(format_number(9.5), "9.5");
    }

    #[tokio::test]
    async fn test_index_offer_upserts_with_description() {
        let index = Arc::new(MemoryVectorIndex::new("test"));
        let indexer = OfferIndexer::new(Arc::new(FixedEmbedding(Some(vec![1.0, 0.0, 0.0]))), index.clone());
        let offer = LoanOffer::new("doc-1", sample_terms(), "u1");

        assert!(indexer.index_offer(&offer).await.unwrap());
        let hits = index.query(vec![1.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].document_id, "doc-1");
        assert!(hits[0].description().unwrap().contains("Acme Lending"));
    }

    #[tokio::test]
    async fn test_index_offer_without_vector() {
        let index = Arc::new(MemoryVectorIndex::new("test"));
        let indexer = OfferIndexer::new(Arc::new(FixedEmbedding(None)), index.clone());
        let offer = LoanOffer::new("doc-1", sample_terms(), "u1");

        assert!(!indexer.index_offer(&offer).await.unwrap());
        assert!(!index.contains("doc-1"));
    }
}
