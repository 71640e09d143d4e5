use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct LendscopeConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
    /// Deployment environment; also the vector index namespace.
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// `postgres` or `memory`
    pub backend: String,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "postgres".to_string(),
            ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    pub vision_model: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.x.ai/v1".to_string(),
            model: "grok-beta".to_string(),
            vision_model: "grok-2-vision-1212".to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `openai` or `openai-fallback`
    pub backend: String,
    pub base_url: String,
    pub model: String,
    pub dimensions: u32,
    pub rate_limit_rpm: u32,
    pub reembed_enabled: bool,
    pub reembed_interval_minutes: u64,
    pub reembed_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "openai-fallback".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            rate_limit_rpm: 0,
            reembed_enabled: true,
            reembed_interval_minutes: 10,
            reembed_batch_size: 25,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Most recent turns handed to the classifier, compiler and synthesizer.
    pub history_window: usize,
    pub structured_limit: usize,
    pub vector_top_k: usize,
    pub stage_timeout_seconds: u64,
    pub session_list_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            structured_limit: 10,
            vector_top_k: 3,
            stage_timeout_seconds: 45,
            session_list_limit: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl LendscopeConfig {
    /// Load from a TOML file. `DATABASE_URL`, when set, overrides `[database] url`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(File::with_name(path));
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }
        builder.build()?.try_deserialize()
    }
}
