//! Durable stores: sessions, offers and the vector index.
//!
//! Postgres implementations back the running service; the in-memory ones
//! serve tests and local runs without a database.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LendscopeError;
use crate::models::{ConversationTurn, LoanOffer, OfferTerms, Session, SessionSummary, VectorHit};
use crate::predicate::StorePredicate;

pub use memory::{MemoryOfferStore, MemorySessionStore, MemoryVectorIndex};
pub use postgres::{PgOfferStore, PgSessionStore, PgVectorIndex};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails if `session_id` already exists.
    async fn create(&self, session: &Session) -> Result<(), LendscopeError>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>, LendscopeError>;

    /// A user's sessions, most recent interaction first.
    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>, LendscopeError>;

    /// Append turns in order and bump `last_interaction_at` strictly forward.
    /// A non-empty `title` replaces the current one. Returns the new turn count.
    async fn append_turns(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
        title: Option<&str>,
    ) -> Result<usize, LendscopeError>;

    /// Bind a catalogued document and/or store the latest extraction snapshot.
    /// `None` leaves the respective column unchanged.
    async fn set_document(
        &self,
        session_id: &str,
        document_id: Option<&str>,
        snapshot: Option<&OfferTerms>,
    ) -> Result<(), LendscopeError>;

    /// Returns false when the session or message index does not exist.
    async fn set_feedback(
        &self,
        session_id: &str,
        index: usize,
        feedback: Option<&str>,
        rating: Option<i32>,
    ) -> Result<bool, LendscopeError>;

    async fn set_title(&self, session_id: &str, title: &str) -> Result<bool, LendscopeError>;

    /// The user's most recent session bound to any of `document_ids`.
    async fn find_for_documents(
        &self,
        user_id: &str,
        document_ids: &[String],
    ) -> Result<Option<Session>, LendscopeError>;
}

#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn get(&self, document_id: &str) -> Result<Option<LoanOffer>, LendscopeError>;

    async fn insert(&self, offer: &LoanOffer) -> Result<(), LendscopeError>;

    /// Merge `terms` into the stored offer. Returns false if absent.
    async fn update(&self, document_id: &str, terms: &OfferTerms) -> Result<bool, LendscopeError>;

    /// Offers matching `predicate`, store-default order, at most `limit`.
    async fn search(&self, predicate: &StorePredicate, limit: usize) -> Result<Vec<LoanOffer>, LendscopeError>;

    /// Offers whose normalised company name equals `company_key`.
    async fn find_by_company(&self, company_key: &str) -> Result<Vec<LoanOffer>, LendscopeError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, document_id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), LendscopeError>;

    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<VectorHit>, LendscopeError>;

    fn namespace(&self) -> &str;
}
