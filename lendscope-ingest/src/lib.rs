//! Document ingestion for the offer catalog.
//!
//! Text extraction, the relevance gate, structured extraction, duplicate
//! detection and vector indexing, tied together by [`UploadPipeline`].

pub mod dedup;
pub mod error;
pub mod extract;
pub mod extraction;
pub mod indexing;
pub mod pipeline;
pub mod relevance;

pub use dedup::{check_catalogue_conflict, check_duplicate, DuplicateCheck};
pub use error::{ExtractError, IngestError};
pub use extract::{DocumentExtractor, DocumentFormat, TextExtractor};
pub use indexing::{describe_offer, grounding_block, OfferIndexer};
pub use pipeline::{CatalogueConflict, UploadChatOutcome, UploadOutcome, UploadPipeline};
pub use relevance::{check_relevance, Relevance};
