pub mod api;
pub mod cache;
pub mod completion;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod models;
pub mod predicate;
pub mod state;
pub mod store;

pub use cache::{create_cache, Cache, MemoryCache, PgCache};
pub use completion::{
    complete_structured, ChatCompletionClient, ChatCompletionSettings, CompletionError,
    CompletionGateway, OutputSchema, StructuredOutput,
};
pub use config::LendscopeConfig;
pub use embeddings::{create_backend, EmbeddingBackend, EmbeddingError, FallbackEmbeddingClient, OpenAiEmbeddingClient};
pub use error::LendscopeError;
pub use predicate::{Condition, StorePredicate};
pub use state::StateStore;
pub use store::{OfferStore, SessionStore, VectorIndex};
