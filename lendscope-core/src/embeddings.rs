//! Embeddings for the offer vector index
//!
//! Provides an `EmbeddingBackend` trait with implementations for:
//! - **openai** : any OpenAI-compatible `/embeddings` endpoint
//! - **openai-fallback** : the same client, degrading to `Ok(None)` on failure

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

// ============================================================================
// EmbeddingBackend trait
// ============================================================================

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed a single text. Returns `None` if embedding is unavailable
    /// (used in fallback mode to signal graceful degradation).
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError>;

    /// Returns the embedding dimension.
    fn dimensions(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing embedding in response")]
    MissingEmbedding,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

// ============================================================================
// Config types
// ============================================================================

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl EmbeddingSettings {
    pub fn new(api_key: Option<String>, model: String, dimensions: usize) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model,
            dimensions,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Build the backend named by `[embedding] backend`.
pub fn create_backend(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    let settings = EmbeddingSettings::new(None, config.model.clone(), config.dimensions as usize);
    match config.backend.as_str() {
        "openai" => Ok(Box::new(OpenAiEmbeddingClient::new(settings, &config.base_url)?)),
        _ => Ok(Box::new(FallbackEmbeddingClient::new(settings, &config.base_url)?)),
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ============================================================================
// OpenAiEmbeddingClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingClient {
    client: Client,
    settings: EmbeddingSettings,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(settings: EmbeddingSettings, base_url: &str) -> Result<Self, EmbeddingError> {
        if settings.api_key.is_empty() {
            return Err(EmbeddingError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            settings,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Generate an embedding (direct call, returns raw Vec)
    pub async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.settings.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.settings.max_retries);

        let result = Retry::spawn(retry_strategy, || self.embed_once(text)).await;

        match result {
            Ok(vec) => Ok(vec),
            Err(e) => {
                tracing::error!(
                    attempts = self.settings.max_retries,
                    error = %e,
                    "All embedding retry attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts: self.settings.max_retries,
                })
            }
        }
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: &self.settings.model,
            input: text,
            dimensions: self.settings.dimensions,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Embedding API error");

            return Err(EmbeddingError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingResponse = response.json().await?;

        let values = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(EmbeddingError::MissingEmbedding)?;

        if values.len() != self.settings.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.settings.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.embed_raw(text).await.map(Some)
    }

    fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// FallbackEmbeddingClient
// ============================================================================

/// Wraps `OpenAiEmbeddingClient`. On any error, logs a warning and returns
/// `Ok(None)`; the offer stays catalogued and the re-index worker fills in
/// the vector later.
pub struct FallbackEmbeddingClient {
    inner: OpenAiEmbeddingClient,
}

impl FallbackEmbeddingClient {
    pub fn new(settings: EmbeddingSettings, base_url: &str) -> Result<Self, EmbeddingError> {
        Ok(Self {
            inner: OpenAiEmbeddingClient::new(settings, base_url)?,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for FallbackEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        match self.inner.embed_raw(text).await {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Embedding failed, continuing without a vector"
                );
                Ok(None)
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn name(&self) -> &str {
        "openai-fallback"
    }
}

// ============================================================================
// TESTS
// ============================================================================
