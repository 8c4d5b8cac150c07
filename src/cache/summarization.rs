use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::entry::EntrySource;
use super::persistent::{OverridePolicy, PersistentCache, StoreOutcome};
use super::store::CacheStore;
use super::CacheError;
use crate::llm::{sanitize_llm_output, LlmClient, LlmError};
use crate::prompts::{build_summarization_prompt, SUMMARIZATION_SYSTEM_PROMPT};

/// SHA-256 of the exact summarization input, hex-encoded.
pub fn content_hash(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Summaries keyed by the content hash of their input. Any edit to the
/// input changes the key, so there is nothing to override.
pub struct SummarizationCache {
    inner: PersistentCache<String>,
}

impl SummarizationCache {
    pub const NAME: &'static str = "summarization";

    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self {
            inner: PersistentCache::new(store, OverridePolicy::Ignore, EntrySource::Computed),
        }
    }

    pub fn lookup(&self, hash: &str) -> Result<Option<String>, CacheError> {
        Ok(self.inner.lookup(hash)?.map(|entry| entry.value))
    }

    pub fn store(&self, hash: &str, summary: &str) -> Result<StoreOutcome, CacheError> {
        self.inner.store(hash, summary.to_string(), EntrySource::Computed)
    }

    pub fn ensure_loaded(&self) -> Result<usize, CacheError> {
        self.inner.ensure_loaded()
    }
}

/// Produces a summary from prepared input text.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, input: &str) -> Result<String, LlmError>;
}

pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            llm,
            model: model.to_string(),
        }
    }
}

impl Summarizer for LlmSummarizer {
    fn summarize(&self, input: &str) -> Result<String, LlmError> {
        let raw = self.llm.generate(
            &self.model,
            &build_summarization_prompt(input),
            SUMMARIZATION_SYSTEM_PROMPT,
        )?;
        Ok(sanitize_llm_output(&raw))
    }
}

/// One resolved page as it enters the summary.
#[derive(Debug, Clone, Default)]
pub struct SummarySection {
    pub page_number: u32,
    pub exam_type: Option<String>,
    pub exam_name: Option<String>,
    pub transcription: String,
}

/// Render the summarization input, cut to at most `max_chars` characters.
pub fn build_summary_input(sections: &[SummarySection], max_chars: usize) -> String {
    let mut input = sections
        .iter()
        .filter(|s| !s.transcription.trim().is_empty())
        .map(|s| {
            format!(
                "## Page {} | {} | {}\n{}",
                s.page_number,
                s.exam_type.as_deref().unwrap_or("other"),
                s.exam_name.as_deref().unwrap_or("unknown exam"),
                s.transcription.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    if let Some((cut, _)) = input.char_indices().nth(max_chars) {
        tracing::warn!(
            max_chars,
            "Summarization input exceeds budget, truncating"
        );
        input.truncate(cut);
    }
    input
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutcome {
    pub text: String,
    pub hash: String,
    /// Served from the cache without a model call.
    pub cached: bool,
}

/// Cache-first document summaries.
pub struct DocumentSummarizer {
    cache: SummarizationCache,
    summarizer: Arc<dyn Summarizer>,
    max_input_chars: usize,
}

impl DocumentSummarizer {
    pub fn new(
        cache: SummarizationCache,
        summarizer: Arc<dyn Summarizer>,
        max_input_chars: usize,
    ) -> Self {
        Self {
            cache,
            summarizer,
            max_input_chars,
        }
    }

    pub fn cache(&self) -> &SummarizationCache {
        &self.cache
    }

    /// `Ok(None)` when there is nothing to summarize or the summarizer
    /// failed; failures are not cached.
    pub fn summarize(
        &self,
        sections: &[SummarySection],
    ) -> Result<Option<SummaryOutcome>, CacheError> {
        let input = build_summary_input(sections, self.max_input_chars);
        if input.trim().is_empty() {
            return Ok(None);
        }

        let hash = content_hash(&input);
        if let Some(text) = self.cache.lookup(&hash)? {
            tracing::debug!(hash = &hash[..8], "Using cached summary");
            return Ok(Some(SummaryOutcome {
                text,
                hash,
                cached: true,
            }));
        }

        match self.summarizer.summarize(&input) {
            Ok(text) if !text.trim().is_empty() => {
                self.cache.store(&hash, &text)?;
                Ok(Some(SummaryOutcome {
                    text,
                    hash,
                    cached: false,
                }))
            }
            Ok(_) => {
                tracing::warn!("Summarizer returned an empty summary");
                Ok(None)
            }
            Err(e) => {
                tracing::error!(error = %e, "Summarization failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::llm::MockLlmClient;

    fn section(page: u32, text: &str) -> SummarySection {
        SummarySection {
            page_number: page,
            exam_type: Some("ultrasound".into()),
            exam_name: Some("Abdominal Ultrasound".into()),
            transcription: text.into(),
        }
    }

    fn summarizer(llm: Arc<MockLlmClient>) -> DocumentSummarizer {
        DocumentSummarizer::new(
            SummarizationCache::new(Box::new(MemoryStore::new(SummarizationCache::NAME))),
            Arc::new(LlmSummarizer::new(llm, "model")),
            10_000,
        )
    }

    #[test]
    fn hash_is_sha256_hex() {
        let hash = content_hash("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn second_call_is_served_from_cache() {
        let llm = Arc::new(MockLlmClient::new("Fígado normal. Sem lesões."));
        let summarizer = summarizer(llm.clone());
        let sections = vec![section(1, "Fígado de dimensões normais.")];

        let first = summarizer.summarize(&sections).unwrap().unwrap();
        assert!(!first.cached);
        let second = summarizer.summarize(&sections).unwrap().unwrap();
        assert!(second.cached);
        assert_eq!(first.text, second.text);
        assert_eq!(first.hash, second.hash);
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn edited_transcription_misses_cache() {
        let llm = Arc::new(MockLlmClient::new("Summary."));
        let summarizer = summarizer(llm.clone());
        summarizer.summarize(&[section(1, "Texto original.")]).unwrap();
        summarizer.summarize(&[section(1, "Texto corrigido.")]).unwrap();
        assert_eq!(llm.call_count(), 2);
    }

    #[test]
    fn empty_input_skips_model() {
        let llm = Arc::new(MockLlmClient::new("Summary."));
        let summarizer = summarizer(llm.clone());
        assert_eq!(summarizer.summarize(&[section(1, "   ")]).unwrap(), None);
        assert_eq!(summarizer.summarize(&[]).unwrap(), None);
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn failure_is_not_cached() {
        let llm = Arc::new(MockLlmClient::failing(LlmError::Timeout(60)));
        let summarizer = summarizer(llm.clone());
        let sections = vec![section(1, "Texto.")];
        assert_eq!(summarizer.summarize(&sections).unwrap(), None);
        assert_eq!(summarizer.cache().ensure_loaded().unwrap(), 0);
    }

    #[test]
    fn input_is_truncated_on_char_boundary() {
        let input = build_summary_input(&[section(1, "ééééééééééé")], 20);
        assert_eq!(input.chars().count(), 20);
    }

    #[test]
    fn input_lists_pages_in_order() {
        let input = build_summary_input(&[section(1, "A."), section(2, "B.")], 10_000);
        assert!(input.find("Page 1").unwrap() < input.find("Page 2").unwrap());
        assert!(input.contains("ultrasound | Abdominal Ultrasound"));
    }
}
