use lendscope_core::{CompletionError, EmbeddingError, LendscopeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Unsupported file type: {0}")]
    Unsupported(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("DOCX extraction failed: {0}")]
    Docx(String),

    #[error("Document is not valid UTF-8")]
    Encoding,

    #[error("Vision extraction failed: {0}")]
    Vision(#[from] CompletionError),

    #[error("Extraction task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Relevance check failed: {0}")]
    Relevance(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] LendscopeError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No extraction pending on session {0}")]
    NoPendingExtraction(String),
}

impl IngestError {
    /// Failures caused by the request itself rather than an upstream.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::Extract(ExtractError::Unsupported(_))
                | IngestError::Extract(ExtractError::Encoding)
                | IngestError::SessionNotFound(_)
                | IngestError::NoPendingExtraction(_)
        )
    }
}
