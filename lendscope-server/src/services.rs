//! Wiring of stores, gateways and pipelines shared by every request.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lendscope_core::store::{PgOfferStore, PgSessionStore, PgVectorIndex};
use lendscope_core::{
    create_backend, create_cache, Cache, ChatCompletionClient, ChatCompletionSettings, CompletionGateway,
    EmbeddingBackend, LendscopeConfig, OfferStore, SessionStore, StateStore, VectorIndex,
};
use lendscope_ingest::{DocumentExtractor, OfferIndexer, TextExtractor, UploadPipeline};
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::subsystems::chat::{ChatPipeline, ChatSettings};
use crate::subsystems::retrieve::HybridRetriever;

/// Per-session turn locks. Waiters are served in arrival order.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct Services {
    pub config: LendscopeConfig,
    /// `None` when running on in-memory stores.
    pub pool: Option<PgPool>,
    pub gateway: Arc<dyn CompletionGateway>,
    pub embeddings: Arc<dyn EmbeddingBackend>,
    pub offers: Arc<dyn OfferStore>,
    pub index: Arc<dyn VectorIndex>,
    pub state: StateStore,
    pub uploads: UploadPipeline,
    pub chat: ChatPipeline,
    pub locks: SessionLocks,
}

impl Services {
    /// Build the Postgres-backed service graph.
    pub async fn connect(config: LendscopeConfig, pool: PgPool) -> anyhow::Result<Self> {
        let gateway: Arc<dyn CompletionGateway> = Arc::new(ChatCompletionClient::new(
            ChatCompletionSettings::from_config(&config.completion, None),
            config.completion.base_url.clone(),
        )?);
        let embeddings: Arc<dyn EmbeddingBackend> = Arc::from(create_backend(&config.embedding)?);
        let offers: Arc<dyn OfferStore> = Arc::new(PgOfferStore::new(pool.clone()));
        let index: Arc<dyn VectorIndex> =
            Arc::new(PgVectorIndex::new(pool.clone(), config.service.environment.clone()));
        let sessions: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
        let cache = create_cache(&config.cache, &pool);
        let extractor: Arc<dyn TextExtractor> = Arc::new(DocumentExtractor::new(gateway.clone()));

        tracing::info!(
            model = %config.completion.model,
            embeddings = embeddings.name(),
            namespace = index.namespace(),
            cache = %config.cache.backend,
            "Services connected"
        );

        Ok(Self::from_parts(
            config,
            Some(pool),
            gateway,
            embeddings,
            offers,
            index,
            sessions,
            cache,
            extractor,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        config: LendscopeConfig,
        pool: Option<PgPool>,
        gateway: Arc<dyn CompletionGateway>,
        embeddings: Arc<dyn EmbeddingBackend>,
        offers: Arc<dyn OfferStore>,
        index: Arc<dyn VectorIndex>,
        sessions: Arc<dyn SessionStore>,
        cache: Arc<dyn Cache>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        let state = StateStore::new(sessions, cache, Duration::from_secs(config.cache.ttl_seconds));
        let indexer = OfferIndexer::new(embeddings.clone(), index.clone());
        let uploads = UploadPipeline::new(gateway.clone(), extractor, offers.clone(), state.clone(), indexer)
            .with_history_window(config.retrieval.history_window);
        let retriever = HybridRetriever::new(
            offers.clone(),
            index.clone(),
            embeddings.clone(),
            config.retrieval.structured_limit,
            config.retrieval.vector_top_k,
        );
        let chat = ChatPipeline::new(
            gateway.clone(),
            retriever,
            state.clone(),
            ChatSettings::from_config(&config.retrieval),
        );

        Self {
            config,
            pool,
            gateway,
            embeddings,
            offers,
            index,
            state,
            uploads,
            chat,
            locks: SessionLocks::new(),
        }
    }

    pub fn indexer(&self) -> OfferIndexer {
        OfferIndexer::new(self.embeddings.clone(), self.index.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lock_serialises_turns() {
        let locks = Arc::new(SessionLocks::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let guard = locks.acquire("s1").await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire("s1").await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(order.lock().unwrap().is_empty());
        drop(guard);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_prune_drops_idle_locks_only() {
        let locks = SessionLocks::new();
        let held = locks.acquire("busy").await;
        drop(locks.acquire("idle").await);
        assert_eq!(locks.len(), 2);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
