//! Boundary to the external content-understanding service.
//!
//! Everything past this module treats the model as a black box:
//! image + instructions in, text out. Two narrow traits keep the
//! consensus engine testable with the mocks in [`mock`].

pub mod mock;
pub mod openrouter;
pub mod response;

pub use mock::MockLlmClient;
pub use openrouter::OpenRouterClient;
pub use response::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Model service is not reachable at {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Model service returned error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Transport-level failures are worth another attempt; a response we
    /// could not use is not (the next sample will be drawn anyway).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::HttpClient(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse(_) => false,
        }
    }
}

/// Text-only completion (arbitration, classification, summarization).
pub trait LlmClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError>;
}

/// Completion over one or more base64-encoded images (page extraction).
pub trait VisionClient: Send + Sync {
    fn chat_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        system: Option<&str>,
    ) -> Result<String, LlmError>;
}
