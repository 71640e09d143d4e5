//! Hybrid retrieval over the offer catalog and the vector index.
//!
//! Structured search runs the compiled predicate; the vector query embeds
//! the raw message. Both run concurrently and independently. Structured hits
//! are authoritative when present, vector hits are the approximate fallback,
//! and nothing from either is a terminal no-match.

use std::sync::Arc;

use lendscope_core::models::{LoanOffer, VectorHit};
use lendscope_core::{EmbeddingBackend, OfferStore, StorePredicate, VectorIndex};
use lendscope_ingest::grounding_block;
use serde::Serialize;

use super::intent::Intent;

/// Prepended to answers grounded only in similarity matches.
pub const APPROXIMATE_DISCLOSURE: &str =
    "No offers matched all of your criteria exactly. These are the closest approximate matches:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Structured,
    Approximate,
    NoMatch,
}

#[derive(Debug, Default)]
pub struct Retrieval {
    pub structured: Vec<LoanOffer>,
    pub vector: Vec<VectorHit>,
}

/// What the synthesizer is allowed to talk about.
#[derive(Debug)]
pub enum Grounding {
    Structured(Vec<LoanOffer>),
    Approximate(Vec<VectorHit>),
    NoMatch,
}

impl Retrieval {
    pub fn merge(self) -> Grounding {
        if !self.structured.is_empty() {
            Grounding::Structured(self.structured)
        } else if !self.vector.is_empty() {
            Grounding::Approximate(self.vector)
        } else {
            Grounding::NoMatch
        }
    }
}

impl Grounding {
    pub fn kind(&self) -> MatchKind {
        match self {
            Grounding::Structured(_) => MatchKind::Structured,
            Grounding::Approximate(_) => MatchKind::Approximate,
            Grounding::NoMatch => MatchKind::NoMatch,
        }
    }

    pub fn document_ids(&self) -> Vec<String> {
        match self {
            Grounding::Structured(offers) => offers.iter().map(|o| o.document_id.clone()).collect(),
            Grounding::Approximate(hits) => hits.iter().map(|h| h.document_id.clone()).collect(),
            Grounding::NoMatch => Vec::new(),
        }
    }

    /// Offer blocks separated by blank lines.
    pub fn render(&self) -> String {
        match self {
            Grounding::Structured(offers) => offers.iter().map(grounding_block).collect::<Vec<_>>().join("\n\n"),
            Grounding::Approximate(hits) => hits
                .iter()
                .map(|h| {
                    format!(
                        "document_id: {}\nsimilarity: {:.2}\n{}",
                        h.document_id,
                        h.score,
                        h.description().unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            Grounding::NoMatch => String::new(),
        }
    }
}

#[derive(Clone)]
pub struct HybridRetriever {
    offers: Arc<dyn OfferStore>,
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<dyn EmbeddingBackend>,
    structured_limit: usize,
    top_k: usize,
}

impl HybridRetriever {
    pub fn new(
        offers: Arc<dyn OfferStore>,
        index: Arc<dyn VectorIndex>,
        embeddings: Arc<dyn EmbeddingBackend>,
        structured_limit: usize,
        top_k: usize,
    ) -> Self {
        Self {
            offers,
            index,
            embeddings,
            structured_limit,
            top_k,
        }
    }

    /// Run both searches for a retrieving intent. Failures on either side
    /// are logged and leave that side empty.
    ///
    /// Conversation history is not an input: earlier turns reach retrieval
    /// only through `predicate`, which the filter compiler built from them,
    /// and the vector side embeds the raw `message`.
    pub async fn retrieve(&self, intent: Intent, message: &str, predicate: &StorePredicate) -> Retrieval {
        if !intent.retrieves() {
            return Retrieval::default();
        }

        let (structured, vector) = tokio::join!(self.structured(predicate), self.similar(message));
        tracing::info!(
            intent = intent.as_str(),
            conditions = predicate.conditions.len(),
            structured = structured.len(),
            vector = vector.len(),
            "Retrieval complete"
        );
        Retrieval { structured, vector }
    }

    async fn structured(&self, predicate: &StorePredicate) -> Vec<LoanOffer> {
        // Without conditions every offer would match; leave it to the vector side.
        if predicate.is_empty() {
            return Vec::new();
        }
        match self.offers.search(predicate, self.structured_limit).await {
            Ok(offers) => offers,
            Err(e) => {
                tracing::warn!(error = %e, "Structured search failed");
                Vec::new()
            }
        }
    }

    async fn similar(&self, message: &str) -> Vec<VectorHit> {
        let vector = match self.embeddings.embed(message).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                tracing::debug!(backend = self.embeddings.name(), "No query vector, skipping similarity search");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query embedding failed");
                return Vec::new();
            }
        };
        match self.index.query(vector, self.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(namespace = self.index.namespace(), error = %e, "Vector query failed");
                Vec::new()
            }
        }
    }
}
