use std::sync::Arc;

use super::types::FieldKind;
use super::ConsensusError;
use crate::llm::{parse_llm_json, sanitize_llm_output, LlmClient};
use crate::prompts::{build_arbitration_prompt, ARBITRATION_SYSTEM_PROMPT};

/// A tie the samples could not break on their own.
#[derive(Debug, Clone)]
pub struct ArbitrationRequest<'a> {
    pub field: &'a str,
    pub kind: FieldKind,
    /// Distinct candidate values, most supported first.
    pub candidates: &'a [String],
    /// Free-form context (page dates, document date frequencies, file name).
    pub context: &'a str,
}

/// Picks one value among tied candidates.
pub trait Arbitrator: Send + Sync {
    fn arbitrate(&self, request: &ArbitrationRequest<'_>) -> Result<String, ConsensusError>;
}

impl<F> Arbitrator for F
where
    F: Fn(&ArbitrationRequest<'_>) -> Result<String, ConsensusError> + Send + Sync,
{
    fn arbitrate(&self, request: &ArbitrationRequest<'_>) -> Result<String, ConsensusError> {
        self(request)
    }
}

/// Arbitrator that always declines, forcing the deterministic fallbacks.
pub struct NoArbitrator;

impl Arbitrator for NoArbitrator {
    fn arbitrate(&self, request: &ArbitrationRequest<'_>) -> Result<String, ConsensusError> {
        Err(ConsensusError::ArbitrationFailure {
            field: request.field.to_string(),
            reason: "no arbitrator configured".into(),
        })
    }
}

/// Asks a text model to choose among the candidates.
pub struct LlmArbitrator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmArbitrator {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            llm,
            model: model.to_string(),
        }
    }
}

impl Arbitrator for LlmArbitrator {
    fn arbitrate(&self, request: &ArbitrationRequest<'_>) -> Result<String, ConsensusError> {
        let failure = |reason: String| ConsensusError::ArbitrationFailure {
            field: request.field.to_string(),
            reason,
        };

        let prompt = build_arbitration_prompt(request.field, request.candidates, request.context);
        let raw = self
            .llm
            .generate(&self.model, &prompt, ARBITRATION_SYSTEM_PROMPT)
            .map_err(|e| failure(e.to_string()))?;

        let answer = match parse_llm_json(&raw) {
            Ok(json) => json
                .get("value")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| failure("response has no \"value\"".into()))?,
            // Plain-text answers are accepted as-is
            Err(_) => sanitize_llm_output(&raw),
        };

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(failure("empty answer".into()));
        }
        tracing::debug!(field = request.field, answer, "Arbitration answered");
        Ok(answer.to_string())
    }
}
