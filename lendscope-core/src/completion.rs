//! Completion gateway
//!
//! One interface to the text-generation service:
//! - `complete` returns free text
//! - `complete_structured_raw` returns a JSON value produced under a declared schema
//! - `vision_extract_text` reads the text out of an image
//!
//! Retries live inside the gateway; callers never retry. Structured output is
//! declared per call site as a Rust type implementing [`StructuredOutput`], and
//! [`complete_structured`] validates the response by deserializing into it.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::CompletionConfig;
use crate::models::{ConversationTurn, Role};

// ============================================================================
// Gateway trait
// ============================================================================

#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Free-text completion over a system prompt and a conversation.
    async fn complete(&self, system: &str, turns: &[ConversationTurn]) -> Result<String, CompletionError>;

    /// Completion constrained to `schema`. Returns the parsed JSON value;
    /// typed validation happens in [`complete_structured`].
    async fn complete_structured_raw(
        &self,
        system: &str,
        turns: &[ConversationTurn],
        schema: &OutputSchema,
    ) -> Result<Value, CompletionError>;

    /// Transcribe the text content of an image.
    async fn vision_extract_text(&self, image: &[u8], mime: &str) -> Result<String, CompletionError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed {schema} output: {reason}")]
    MalformedOutput { schema: String, reason: String },

    #[error("Empty completion")]
    EmptyResponse,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl CompletionError {
    /// Transport failures, rate limits and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Http(_) | CompletionError::Timeout => true,
            CompletionError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Structured output declarations
// ============================================================================

/// A named, versioned JSON Schema sent with a structured completion.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub version: u32,
    pub schema: Value,
}

impl OutputSchema {
    /// Identifier sent to the API, e.g. `intent_v1`.
    pub fn qualified_name(&self) -> String {
        format!("{}_v{}", self.name, self.version)
    }
}

/// A Rust type that a structured completion must produce.
pub trait StructuredOutput: DeserializeOwned + JsonSchema + Send {
    const SCHEMA_NAME: &'static str;
    const SCHEMA_VERSION: u32 = 1;

    fn output_schema() -> OutputSchema {
        let root = schemars::gen::SchemaGenerator::default().into_root_schema_for::<Self>();
        OutputSchema {
            name: Self::SCHEMA_NAME.to_string(),
            version: Self::SCHEMA_VERSION,
            schema: serde_json::to_value(root).unwrap_or_else(|_| serde_json::json!({"type": "object"})),
        }
    }
}

/// Run a structured completion and validate it as `T`. Output that does not
/// deserialize is rejected whole as [`CompletionError::MalformedOutput`].
pub async fn complete_structured<T: StructuredOutput>(
    gateway: &dyn CompletionGateway,
    system: &str,
    turns: &[ConversationTurn],
) -> Result<T, CompletionError> {
    let schema = T::output_schema();
    let raw = gateway.complete_structured_raw(system, turns, &schema).await?;
    serde_json::from_value(raw).map_err(|e| CompletionError::MalformedOutput {
        schema: schema.qualified_name(),
        reason: e.to_string(),
    })
}

/// Parse model text as JSON, tolerating a surrounding markdown code fence.
pub fn parse_json_output(text: &str, schema: &str) -> Result<Value, CompletionError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| CompletionError::MalformedOutput {
        schema: schema.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Chat-completions wire format (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

const VISION_PROMPT: &str = "Transcribe all text in this image exactly as written. \
Preserve tables as plain rows. Return only the text.";

// ============================================================================
// ChatCompletionClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChatCompletionSettings {
    pub api_key: String,
    pub model: String,
    pub vision_model: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout: Duration,
}

impl ChatCompletionSettings {
    /// Build from config, reading the key from `XAI_API_KEY` when not given.
    pub fn from_config(config: &CompletionConfig, api_key: Option<String>) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("XAI_API_KEY").ok())
            .unwrap_or_default();
        Self {
            api_key,
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    client: Client,
    settings: ChatCompletionSettings,
    base_url: String,
}

impl ChatCompletionClient {
    pub fn new(settings: ChatCompletionSettings, base_url: impl Into<String>) -> Result<Self, CompletionError> {
        if settings.api_key.is_empty() {
            return Err(CompletionError::MissingApiKey);
        }

        let client = Client::builder().timeout(settings.timeout).build()?;

        Ok(Self {
            client,
            settings,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn messages(system: &str, turns: &[ConversationTurn]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(ChatMessage {
            role: "system",
            content: Value::String(system.to_string()),
        });
        for turn in turns {
            messages.push(ChatMessage {
                role: turn.role.as_str(),
                content: Value::String(turn.content.clone()),
            });
        }
        messages
    }

    /// POST the request with bounded, jittered retries on transient failures.
    async fn send_with_retry(&self, request: &ChatRequest<'_>) -> Result<String, CompletionError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.settings.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.settings.max_retries.saturating_sub(1));

        let result = RetryIf::spawn(
            retry_strategy,
            || self.send_once(request),
            |e: &CompletionError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(error = %e, "Transient completion failure, retrying");
                }
                retry
            },
        )
        .await;

        match result {
            Ok(text) => Ok(text),
            Err(e) if e.is_transient() => {
                tracing::error!(
                    attempts = self.settings.max_retries,
                    error = %e,
                    "All completion retry attempts failed"
                );
                Err(CompletionError::RetryExhausted {
                    attempts: self.settings.max_retries,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn send_once(&self, request: &ChatRequest<'_>) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { CompletionError::Timeout } else { CompletionError::Http(e) })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Completion API error");

            return Err(CompletionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(CompletionError::EmptyResponse)
    }
}

#[async_trait]
impl CompletionGateway for ChatCompletionClient {
    async fn complete(&self, system: &str, turns: &[ConversationTurn]) -> Result<String, CompletionError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: Self::messages(system, turns),
            temperature: 0.2,
            response_format: None,
        };
        self.send_with_retry(&request).await
    }

    async fn complete_structured_raw(
        &self,
        system: &str,
        turns: &[ConversationTurn],
        schema: &OutputSchema,
    ) -> Result<Value, CompletionError> {
        let request = ChatRequest {
            model: &self.settings.model,
            messages: Self::messages(system, turns),
            temperature: 0.0,
            response_format: Some(serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.qualified_name(),
                    "schema": schema.schema,
                }
            })),
        };
        let text = self.send_with_retry(&request).await?;
        parse_json_output(&text, &schema.qualified_name())
    }

    async fn vision_extract_text(&self, image: &[u8], mime: &str) -> Result<String, CompletionError> {
        let data_uri = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let request = ChatRequest {
            model: &self.settings.vision_model,
            messages: vec![ChatMessage {
                role: Role::User.as_str(),
                content: serde_json::json!([
                    {"type": "text", "text": VISION_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_uri}},
                ]),
            }],
            temperature: 0.0,
            response_format: None,
        };
        self.send_with_retry(&request).await
    }

    fn name(&self) -> &str {
        "chat-completions"
    }
}

// ============================================================================
// TESTS
// ============================================================================
