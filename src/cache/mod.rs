//! Persistent, hand-editable caches of derived classifications.
//!
//! Each cache is one pretty-printed JSON file. Entries are created on first
//! miss and never expire; an entry a person edited (or marked as a manual
//! override) is never replaced by a computed result.

pub mod entry;
pub mod persistent;
pub mod standardization;
pub mod store;
pub mod summarization;

pub use entry::{CacheEntry, EntrySource};
pub use persistent::{OverridePolicy, PersistentCache, StoreOutcome};
pub use standardization::{
    Classifier, ExamCategory, LlmClassifier, Standardization, StandardizationCache, Standardizer,
};
pub use store::{CacheStore, JsonFileStore, MemoryStore};
pub use summarization::{
    build_summary_input, content_hash, DocumentSummarizer, LlmSummarizer, SummarizationCache,
    Summarizer, SummaryOutcome, SummarySection,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The file exists but cannot be trusted. Running on with an empty cache
    /// would silently drop manual overrides, so this halts the run.
    #[error("Cache '{name}' at {location} is corrupted: {reason}")]
    Corruption {
        name: String,
        location: String,
        reason: String,
    },

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialize(String),
}
