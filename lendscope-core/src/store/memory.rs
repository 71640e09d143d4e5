//! In-process stores with the same observable behavior as the Postgres ones.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::{OfferStore, SessionStore, VectorIndex};
use crate::error::LendscopeError;
use crate::models::{ConversationTurn, LoanOffer, OfferTerms, Session, SessionSummary, VectorHit};
use crate::predicate::StorePredicate;

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), LendscopeError> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(session.session_id.clone()) {
            Entry::Occupied(_) => Err(LendscopeError::Other(format!(
                "session {} already exists",
                session.session_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, LendscopeError> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>, LendscopeError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| b.last_interaction_at.cmp(&a.last_interaction_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn append_turns(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
        title: Option<&str>,
    ) -> Result<usize, LendscopeError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| LendscopeError::NotFound(format!("session {}", session_id)))?;
        session.messages.extend_from_slice(turns);
        let bumped = session.last_interaction_at + ChronoDuration::microseconds(1);
        session.last_interaction_at = Utc::now().max(bumped);
        if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
            session.title = title.to_string();
        }
        Ok(session.messages.len())
    }

    async fn set_document(
        &self,
        session_id: &str,
        document_id: Option<&str>,
        snapshot: Option<&OfferTerms>,
    ) -> Result<(), LendscopeError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| LendscopeError::NotFound(format!("session {}", session_id)))?;
        if let Some(id) = document_id {
            session.document_id = Some(id.to_string());
        }
        if let Some(terms) = snapshot {
            session.document_snapshot = Some(terms.clone());
        }
        Ok(())
    }

    async fn set_feedback(
        &self,
        session_id: &str,
        index: usize,
        feedback: Option<&str>,
        rating: Option<i32>,
    ) -> Result<bool, LendscopeError> {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let Some(turn) = session.messages.get_mut(index) else {
            return Ok(false);
        };
        turn.feedback = feedback.map(str::to_string);
        turn.rating = rating;
        Ok(true)
    }

    async fn set_title(&self, session_id: &str, title: &str) -> Result<bool, LendscopeError> {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.title = title.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_for_documents(
        &self,
        user_id: &str,
        document_ids: &[String],
    ) -> Result<Option<Session>, LendscopeError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .filter(|s| s.document_id.as_ref().is_some_and(|d| document_ids.contains(d)))
            .max_by_key(|s| s.last_interaction_at)
            .map(|s| s.clone()))
    }
}

#[derive(Default)]
pub struct MemoryOfferStore {
    offers: DashMap<String, LoanOffer>,
}

impl MemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

#[async_trait]
impl OfferStore for MemoryOfferStore {
    async fn get(&self, document_id: &str) -> Result<Option<LoanOffer>, LendscopeError> {
        Ok(self.offers.get(document_id).map(|o| o.clone()))
    }

    async fn insert(&self, offer: &LoanOffer) -> Result<(), LendscopeError> {
        use dashmap::mapref::entry::Entry;
        match self.offers.entry(offer.document_id.clone()) {
            Entry::Occupied(_) => Err(LendscopeError::Other(format!(
                "offer {} already exists",
                offer.document_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(offer.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, document_id: &str, terms: &OfferTerms) -> Result<bool, LendscopeError> {
        match self.offers.get_mut(document_id) {
            Some(mut offer) => {
                offer.terms = terms.clone();
                offer.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search(&self, predicate: &StorePredicate, limit: usize) -> Result<Vec<LoanOffer>, LendscopeError> {
        let mut hits: Vec<LoanOffer> = self
            .offers
            .iter()
            .filter(|o| predicate.matches(&o.terms))
            .map(|o| o.clone())
            .collect();
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn find_by_company(&self, company_key: &str) -> Result<Vec<LoanOffer>, LendscopeError> {
        Ok(self
            .offers
            .iter()
            .filter(|o| o.terms.company_key().as_deref() == Some(company_key))
            .map(|o| o.clone())
            .collect())
    }
}

pub struct MemoryVectorIndex {
    namespace: String,
    entries: DashMap<String, (Vec<f32>, Value)>,
}

impl MemoryVectorIndex {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: DashMap::new(),
        }
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.entries.contains_key(document_id)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, document_id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), LendscopeError> {
        self.entries.insert(document_id.to_string(), (vector, metadata));
        Ok(())
    }

    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<VectorHit>, LendscopeError> {
        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .map(|e| VectorHit {
                document_id: e.key().clone(),
                score: cosine_similarity(&vector, &e.value().0),
                metadata: e.value().1.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NumericRange, SessionKind};
    use crate::predicate::{Comparison, Condition, RangeSide};
    use crate::models::SchemaField;

    #[tokio::test]
    async fn test_session_append_is_ordered_and_monotonic() {
        let store = MemorySessionStore::new();
        let session = Session::new("s1", "u1", SessionKind::Chat);
        store.create(&session).await.unwrap();
        assert!(store.create(&session).await.is_err(), "duplicate session_id must fail");

        let mut last = session.last_interaction_at;
        for i in 0..5 {
            store
                .append_turns("s1", &[ConversationTurn::user(format!("m{}", i))], None)
                .await
                .unwrap();
            let now = store.get("s1").await.unwrap().unwrap().last_interaction_at;
            assert!(now > last);
            last = now;
        }
        let stored = store.get("s1").await.unwrap().unwrap();
        let contents: Vec<_> = stored.messages.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_empty_title_does_not_overwrite() {
        let store = MemorySessionStore::new();
        store.create(&Session::new("s1", "u1", SessionKind::Chat)).await.unwrap();
        store.append_turns("s1", &[], Some("Bridge Loans")).await.unwrap();
        store.append_turns("s1", &[], Some("   ")).await.unwrap();
        store.append_turns("s1", &[], None).await.unwrap();
        assert_eq!(store.get("s1").await.unwrap().unwrap().title, "Bridge Loans");
    }

    #[tokio::test]
    async fn test_list_for_user_most_recent_first() {
        let store = MemorySessionStore::new();
        for id in ["a", "b", "c"] {
            store.create(&Session::new(id, "u1", SessionKind::Chat)).await.unwrap();
        }
        store.create(&Session::new("other", "u2", SessionKind::Chat)).await.unwrap();
        store.append_turns("a", &[ConversationTurn::user("hi")], None).await.unwrap();

        let listed = store.list_for_user("u1", 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "a");
    }

    #[tokio::test]
    async fn test_offer_search_and_company_lookup() {
        let store = MemoryOfferStore::new();
        let terms = OfferTerms {
            company_name: Some("Acme Lending LLC".into()),
            loan_amount: NumericRange::new(Some(1.0), Some(900_000.0)),
            ..Default::default()
        };
        store.insert(&LoanOffer::new("d1", terms, "u1")).await.unwrap();

        let predicate = StorePredicate {
            conditions: vec![Condition::RangeBound {
                field: SchemaField::LoanAmount,
                side: RangeSide::Max,
                cmp: Comparison::Gte,
                value: 500_000.0,
            }],
        };
        assert_eq!(store.search(&predicate, 10).await.unwrap().len(), 1);
        assert_eq!(store.find_by_company("acme lending").await.unwrap().len(), 1);
        assert!(store.find_by_company("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_index_orders_by_cosine() {
        let index = MemoryVectorIndex::new("test");
        index.upsert("x", vec![1.0, 0.0], Value::Null).await.unwrap();
        index.upsert("y", vec![0.0, 1.0], Value::Null).await.unwrap();
        index.upsert("z", vec![0.7, 0.7], Value::Null).await.unwrap();

        let hits = index.query(vec![1.0, 0.1], 2).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "z"]);
    }
}
