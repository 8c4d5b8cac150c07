//! Multi-sample consensus extraction.
//!
//! sample (N attempts) → resolve field by field → date resolution with
//! document context → confidence score.

pub mod arbitration;
pub mod confidence;
pub mod dates;
pub mod extractor;
pub mod normalize;
pub mod resolver;
pub mod sampler;
pub mod types;

pub use arbitration::{ArbitrationRequest, Arbitrator, LlmArbitrator, NoArbitrator};
pub use confidence::{needs_review, score_record, thresholds, ConfidenceBand};
pub use dates::DocumentContext;
pub use extractor::{parse_candidate, VisionExtractor};
pub use resolver::ConsensusResolver;
pub use sampler::{
    CancellationToken, CandidateSource, PageImage, SampleBatch, SampleFailure, Sampler,
    SamplerConfig,
};
pub use types::*;

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Extraction attempt {attempt} failed: {source}")]
    SampleFailure { attempt: usize, source: LlmError },

    #[error("No extraction attempt succeeded ({requested} requested)")]
    InsufficientSamples { requested: usize },

    #[error("Arbitration failed for '{field}': {reason}")]
    ArbitrationFailure { field: String, reason: String },

    #[error("No date majority for '{field}' and arbitration gave no date")]
    DateUnresolvable { field: String },

    #[error("Cancelled")]
    Cancelled,
}
