//! Cache-aside access to session state.
//!
//! The session store is authoritative. Every cached projection (conversation,
//! pending extraction, document binding) is rebuilt from it on a miss. Cache
//! failures are logged and never fail the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{keys, Cache};
use crate::error::LendscopeError;
use crate::models::{ConversationTurn, OfferTerms, Session, SessionKind, SessionSummary};
use crate::store::SessionStore;

#[derive(Clone)]
pub struct StateStore {
    sessions: Arc<dyn SessionStore>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl StateStore {
    pub fn new(sessions: Arc<dyn SessionStore>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { sessions, cache, ttl }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Resolve the caller's session, creating it on first use.
    ///
    /// A `session_id` owned by another user resolves to `NotFound`, the same
    /// as one that never existed.
    pub async fn open_session(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        kind: SessionKind,
    ) -> Result<Session, LendscopeError> {
        if let Some(sid) = session_id.map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(existing) = self.sessions.get(sid).await? {
                if existing.user_id != user_id {
                    return Err(LendscopeError::NotFound(format!("session {}", sid)));
                }
                return Ok(existing);
            }
            let session = Session::new(sid, user_id, kind);
            self.sessions.create(&session).await?;
            tracing::info!(session_id = %sid, kind = %kind, "Session created");
            return Ok(session);
        }

        let session = Session::new(uuid::Uuid::new_v4().to_string(), user_id, kind);
        self.sessions.create(&session).await?;
        tracing::info!(session_id = %session.session_id, kind = %kind, "Session created");
        Ok(session)
    }

    /// The session if it exists and belongs to `user_id`.
    pub async fn owned_session(&self, session_id: &str, user_id: &str) -> Result<Option<Session>, LendscopeError> {
        Ok(self
            .sessions
            .get(session_id)
            .await?
            .filter(|s| s.user_id == user_id))
    }

    pub async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>, LendscopeError> {
        self.sessions.list_for_user(user_id, limit).await
    }

    /// Full conversation, read through the cache.
    pub async fn conversation(&self, session_id: &str) -> Result<Vec<ConversationTurn>, LendscopeError> {
        let key = keys::conversation(session_id);
        if let Some(turns) = self.cache_get::<Vec<ConversationTurn>>(&key).await {
            return Ok(turns);
        }

        let turns = self
            .sessions
            .get(session_id)
            .await?
            .map(|s| s.messages)
            .unwrap_or_default();
        self.cache_put(&key, &turns).await;
        Ok(turns)
    }

    /// Append turns durably, then reconcile the cached conversation.
    ///
    /// The cached copy is extended only when it was exactly in step with the
    /// store before this append; any other state drops the key.
    pub async fn append_turns(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
        title: Option<&str>,
    ) -> Result<usize, LendscopeError> {
        let key = keys::conversation(session_id);
        let cached = self.cache_get::<Vec<ConversationTurn>>(&key).await;

        let count = self.sessions.append_turns(session_id, turns, title).await?;

        match cached {
            Some(mut conversation) if conversation.len() + turns.len() == count => {
                conversation.extend_from_slice(turns);
                self.cache_put(&key, &conversation).await;
            }
            Some(conversation) => {
                tracing::debug!(
                    session_id = %session_id,
                    cached = conversation.len(),
                    durable = count,
                    "Cached conversation out of step, invalidating"
                );
                self.cache_delete(&key).await;
            }
            None => {}
        }
        Ok(count)
    }

    /// Extraction awaiting consent, falling back to the session snapshot.
    pub async fn pending_offer(&self, session_id: &str) -> Result<Option<OfferTerms>, LendscopeError> {
        let key = keys::pending_offer(session_id);
        if let Some(terms) = self.cache_get::<OfferTerms>(&key).await {
            return Ok(Some(terms));
        }

        let snapshot = self
            .sessions
            .get(session_id)
            .await?
            .and_then(|s| s.document_snapshot);
        if let Some(terms) = &snapshot {
            self.cache_put(&key, terms).await;
        }
        Ok(snapshot)
    }

    /// Record the latest extraction on the session, then cache it.
    pub async fn save_pending_offer(&self, session_id: &str, terms: &OfferTerms) -> Result<(), LendscopeError> {
        self.sessions.set_document(session_id, None, Some(terms)).await?;
        self.cache_put(&keys::pending_offer(session_id), terms).await;
        Ok(())
    }

    /// Reserve `document_id` for a fresh extraction and snapshot its terms on
    /// the session. Nothing is catalogued until the user consents.
    pub async fn stage_document(
        &self,
        session_id: &str,
        document_id: &str,
        terms: &OfferTerms,
    ) -> Result<(), LendscopeError> {
        self.sessions.set_document(session_id, Some(document_id), Some(terms)).await?;
        self.cache_put(&keys::document_id(session_id), &document_id).await;
        self.cache_put(&keys::pending_offer(session_id), terms).await;
        Ok(())
    }

    pub async fn document_id(&self, session_id: &str) -> Result<Option<String>, LendscopeError> {
        let key = keys::document_id(session_id);
        if let Some(id) = self.cache_get::<String>(&key).await {
            return Ok(Some(id));
        }

        let document_id = self.sessions.get(session_id).await?.and_then(|s| s.document_id);
        if let Some(id) = &document_id {
            self.cache_put(&key, id).await;
        }
        Ok(document_id)
    }

    /// Bind `document_id` to the session durably, then cache the binding.
    pub async fn bind_document(&self, session_id: &str, document_id: &str) -> Result<(), LendscopeError> {
        self.sessions.set_document(session_id, Some(document_id), None).await?;
        self.cache_put(&keys::document_id(session_id), &document_id).await;
        Ok(())
    }

    /// Populate every cached projection from a freshly loaded session.
    pub async fn warm(&self, session: &Session) {
        let sid = &session.session_id;
        self.cache_put(&keys::conversation(sid), &session.messages).await;
        if let Some(id) = &session.document_id {
            self.cache_put(&keys::document_id(sid), id).await;
        }
        if let Some(terms) = &session.document_snapshot {
            self.cache_put(&keys::pending_offer(sid), terms).await;
        }
    }

    /// Update feedback on the message at `index`. The cached conversation is
    /// dropped so the next read sees the change.
    pub async fn set_feedback(
        &self,
        session_id: &str,
        index: usize,
        feedback: Option<&str>,
        rating: Option<i32>,
    ) -> Result<bool, LendscopeError> {
        let updated = self.sessions.set_feedback(session_id, index, feedback, rating).await?;
        if updated {
            self.cache_delete(&keys::conversation(session_id)).await;
        }
        Ok(updated)
    }

    pub async fn rename(&self, session_id: &str, title: &str) -> Result<bool, LendscopeError> {
        self.sessions.set_title(session_id, title).await
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                    self.cache_delete(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, cache = self.cache.name(), error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn cache_put<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache value not serializable");
                return;
            }
        };
        if let Err(e) = self.cache.set_with_ttl(key, &value, self.ttl).await {
            tracing::warn!(key = %key, cache = self.cache.name(), error = %e, "Cache write failed");
        }
    }

    async fn cache_delete(&self, key: &str) {
        if let Err(e) = self.cache.delete(key).await {
            tracing::warn!(key = %key, cache = self.cache.name(), error = %e, "Cache delete failed");
        }
    }
}
