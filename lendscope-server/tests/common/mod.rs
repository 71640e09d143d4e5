#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lendscope_core::config::{
    CacheConfig, CompletionConfig, DatabaseConfig, EmbeddingConfig, HttpConfig, RetrievalConfig, ServiceConfig,
};
use lendscope_core::models::{ConversationTurn, LoanOffer, NumericRange, OfferTerms};
use lendscope_core::store::{MemoryOfferStore, MemorySessionStore, MemoryVectorIndex};
use lendscope_core::{
    CompletionError, CompletionGateway, EmbeddingBackend, EmbeddingError, LendscopeConfig, MemoryCache,
    OfferStore, OutputSchema, VectorIndex,
};
use lendscope_ingest::{ExtractError, TextExtractor};
use lendscope_server::services::Services;
use serde_json::Value;

/// Replies to structured calls from per-schema queues. An unscripted call
/// fails with `Timeout`; a stalled schema never answers.
#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<HashMap<String, VecDeque<Value>>>,
    stalled: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn reply(self, schema: &str, value: Value) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .push_back(value);
        self
    }

    pub fn stall(self, schema: &str) -> Self {
        self.stalled.lock().unwrap().insert(schema.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete(&self, _system: &str, _turns: &[ConversationTurn]) -> Result<String, CompletionError> {
        Err(CompletionError::EmptyResponse)
    }

    async fn complete_structured_raw(
        &self,
        _system: &str,
        _turns: &[ConversationTurn],
        schema: &OutputSchema,
    ) -> Result<Value, CompletionError> {
        self.calls.lock().unwrap().push(schema.name.clone());
        let stalled = self.stalled.lock().unwrap().contains(&schema.name);
        if stalled {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.replies
            .lock()
            .unwrap()
            .get_mut(&schema.name)
            .and_then(VecDeque::pop_front)
            .ok_or(CompletionError::Timeout)
    }

    async fn vision_extract_text(&self, _image: &[u8], _mime: &str) -> Result<String, CompletionError> {
        Err(CompletionError::EmptyResponse)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Every query lands on the same axis, so stored vectors near it are hits.
pub struct AxisEmbedding;

#[async_trait]
impl EmbeddingBackend for AxisEmbedding {
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        Ok(Some(vec![1.0, 0.0, 0.0]))
    }
    fn dimensions(&self) -> usize {
        3
    }
    fn name(&self) -> &str {
        "axis"
    }
}

pub struct PlainText;

#[async_trait]
impl TextExtractor for PlainText {
    async fn extract_text(&self, bytes: &[u8], _filename: &str) -> Result<String, ExtractError> {
        String::from_utf8(bytes.to_vec())
            .map(|s| s.trim().to_string())
            .map_err(|_| ExtractError::Encoding)
    }
}

pub fn test_config() -> LendscopeConfig {
    LendscopeConfig {
        service: ServiceConfig {
            log_level: "debug".to_string(),
            environment: "test".to_string(),
        },
        database: DatabaseConfig {
            url: "postgresql://localhost/unused".to_string(),
            max_connections: 1,
            run_migrations: false,
        },
        cache: CacheConfig::default(),
        completion: CompletionConfig::default(),
        embedding: EmbeddingConfig::default(),
        retrieval: RetrievalConfig {
            stage_timeout_seconds: 1,
            ..Default::default()
        },
        http: HttpConfig::default(),
    }
}

pub struct TestServices {
    pub services: Arc<Services>,
    pub gateway: Arc<ScriptedGateway>,
    pub offers: Arc<MemoryOfferStore>,
    pub index: Arc<MemoryVectorIndex>,
    pub sessions: Arc<MemorySessionStore>,
}

pub fn services(gateway: ScriptedGateway) -> TestServices {
    let gateway = Arc::new(gateway);
    let offers = Arc::new(MemoryOfferStore::new());
    let index = Arc::new(MemoryVectorIndex::new("test"));
    let sessions = Arc::new(MemorySessionStore::new());
    let services = Services::from_parts(
        test_config(),
        None,
        gateway.clone(),
        Arc::new(AxisEmbedding),
        offers.clone(),
        index.clone(),
        sessions.clone(),
        Arc::new(MemoryCache::new()),
        Arc::new(PlainText),
    );
    TestServices {
        services: Arc::new(services),
        gateway,
        offers,
        index,
        sessions,
    }
}

pub fn offer_terms(company: &str, regions: &[&str], amount_min: f64, amount_max: f64) -> OfferTerms {
    OfferTerms {
        company_name: Some(company.to_string()),
        service_areas: regions.iter().map(|r| r.to_string()).collect(),
        loan_amount: NumericRange::new(Some(amount_min), Some(amount_max)),
        ..Default::default()
    }
}

pub async fn catalogue(offers: &MemoryOfferStore, document_id: &str, terms: OfferTerms) {
    offers
        .insert(&LoanOffer::new(document_id, terms, "seed"))
        .await
        .unwrap();
}

pub async fn index_hit(index: &MemoryVectorIndex, document_id: &str, description: &str) {
    index
        .upsert(
            document_id,
            vec![1.0, 0.05, 0.0],
            serde_json::json!({"document_id": document_id, "description": description}),
        )
        .await
        .unwrap();
}
