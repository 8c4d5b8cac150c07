use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{LlmClient, LlmError, VisionClient};

/// Mock model client for tests. Serves scripted responses in call order,
/// then falls back to a fixed response.
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Result<String, LlmError>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new(response: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(response.to_string()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A client whose every call fails with `error`.
    pub fn failing(error: LlmError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new("")
        }
    }

    /// Queue responses served before the fallback, one per call.
    pub fn with_script(self, responses: Vec<Result<String, LlmError>>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(responses);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, _model: &str, prompt: &str, _system: &str) -> Result<String, LlmError> {
        self.next_response(prompt)
    }
}

impl VisionClient for MockLlmClient {
    fn chat_with_images(
        &self,
        _model: &str,
        prompt: &str,
        _images: &[String],
        _system: Option<&str>,
    ) -> Result<String, LlmError> {
        self.next_response(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_client_returns_configured_response() {
        let client = MockLlmClient::new("test response");
        let result = client.generate("model", "prompt", "system").unwrap();
        assert_eq!(result, "test response");
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn script_is_served_before_fallback() {
        let client = MockLlmClient::new("fallback").with_script(vec![
            Ok("first".into()),
            Err(LlmError::Timeout(5)),
        ]);
        assert_eq!(client.generate("m", "p", "s").unwrap(), "first");
        assert_eq!(client.generate("m", "p", "s"), Err(LlmError::Timeout(5)));
        assert_eq!(client.generate("m", "p", "s").unwrap(), "fallback");
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn failing_client_always_errors() {
        let client = MockLlmClient::failing(LlmError::Connection("x".into()));
        assert!(client.chat_with_images("m", "p", &[], None).is_err());
        assert!(client.chat_with_images("m", "p", &[], None).is_err());
    }

    #[test]
    fn prompts_are_recorded() {
        let client = MockLlmClient::new("ok");
        client.generate("m", "first prompt", "s").unwrap();
        client.chat_with_images("m", "second prompt", &[], None).unwrap();
        assert_eq!(client.prompts(), vec!["first prompt", "second prompt"]);
    }
}
