//! Duplicate detection on the normalised company name.

use lendscope_core::models::OfferTerms;
use lendscope_core::{LendscopeError, OfferStore, SessionStore};

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateCheck {
    /// No catalogued offer shares the company.
    Unique,
    /// The uploader already has a session on one of the matching offers.
    Redirect { session_id: String, document_id: String },
    /// Matching offers exist but none is reachable from the uploader's sessions.
    Rejected { document_ids: Vec<String> },
}

/// Look up catalogued offers from the same company. Terms without a usable
/// company name are never treated as duplicates.
pub async fn check_duplicate(
    offers: &dyn OfferStore,
    sessions: &dyn SessionStore,
    user_id: &str,
    terms: &OfferTerms,
) -> Result<DuplicateCheck, LendscopeError> {
    resolve(offers, sessions, user_id, terms, None).await
}

/// Same lookup for an offer about to be catalogued as `document_id`.
/// That document itself never counts as a duplicate, so re-saving an offer
/// under its own id stays `Unique`.
pub async fn check_catalogue_conflict(
    offers: &dyn OfferStore,
    sessions: &dyn SessionStore,
    user_id: &str,
    terms: &OfferTerms,
    document_id: &str,
) -> Result<DuplicateCheck, LendscopeError> {
    resolve(offers, sessions, user_id, terms, Some(document_id)).await
}

async fn resolve(
    offers: &dyn OfferStore,
    sessions: &dyn SessionStore,
    user_id: &str,
    terms: &OfferTerms,
    own_document: Option<&str>,
) -> Result<DuplicateCheck, LendscopeError> {
    let Some(key) = terms.company_key() else {
        return Ok(DuplicateCheck::Unique);
    };

    let document_ids: Vec<String> = offers
        .find_by_company(&key)
        .await?
        .into_iter()
        .map(|o| o.document_id)
        .filter(|id| Some(id.as_str()) != own_document)
        .collect();
    if document_ids.is_empty() {
        return Ok(DuplicateCheck::Unique);
    }

    match sessions.find_for_documents(user_id, &document_ids).await? {
        Some(session) => {
            let document_id = session
                .document_id
                .clone()
                .filter(|d| document_ids.contains(d))
                .unwrap_or_else(|| document_ids[0].clone());
            tracing::info!(
                company = %key,
                session_id = %session.session_id,
                document_id = %document_id,
                "Duplicate upload redirected to existing session"
            );
            Ok(DuplicateCheck::Redirect {
                session_id: session.session_id,
                document_id,
            })
        }
        None => {
            tracing::info!(company = %key, matches = document_ids.len(), "Duplicate upload rejected");
            Ok(DuplicateCheck::Rejected { document_ids })
        }
    }
}
