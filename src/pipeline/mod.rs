//! Document-level orchestration: every page of a document through sampling,
//! consensus, scoring, standardization and summarization.

pub mod processor;
pub mod triage;

pub use processor::{
    build_processor, DocumentInput, DocumentProcessor, DocumentResult, PageResult, PageStatus,
};
pub use triage::{build_inventory, DocumentInventory, Era, PageFacts, TriageTag};

use thiserror::Error;

use crate::cache::CacheError;
use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Cache failures halt the run; see [`CacheError::Corruption`].
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Processing of '{document}' was cancelled")]
    Cancelled { document: String },

    #[error("Page {0} is not part of the document")]
    PageNotFound(u32),

    #[error("Model client setup failed: {0}")]
    Client(#[from] LlmError),
}
