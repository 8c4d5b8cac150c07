use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::types::ExtractionCandidate;
use super::ConsensusError;
use crate::llm::LlmError;

/// One rasterized page, as opaque image bytes.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based page number within its document.
    pub page_number: u32,
    pub bytes: Vec<u8>,
    /// Where the image came from, for logs.
    pub label: String,
}

impl PageImage {
    pub fn new(page_number: u32, bytes: Vec<u8>, label: &str) -> Self {
        Self {
            page_number,
            bytes,
            label: label.to_string(),
        }
    }

    pub fn from_file(page_number: u32, path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::new(page_number, bytes, &path.display().to_string()))
    }
}

/// Produces one candidate extraction of a page per call.
pub trait CandidateSource: Send + Sync {
    fn extract(
        &self,
        page: &PageImage,
        attempt_index: usize,
    ) -> Result<ExtractionCandidate, LlmError>;
}

/// Cooperative cancellation shared between a caller and running work.
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop issuing new attempts. In-flight calls finish.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    /// Independent attempts per page (N).
    pub samples: usize,
    /// Attempts allowed to run at the same time.
    pub parallelism: usize,
    /// Extra tries of one attempt after a transient transport error.
    pub max_retries: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            samples: 3,
            parallelism: 1,
            max_retries: 2,
        }
    }
}

/// A dropped attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFailure {
    pub attempt_index: usize,
    pub error: LlmError,
}

/// What one sampling run produced.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub requested: usize,
    /// Surviving candidates, in attempt order.
    pub candidates: Vec<ExtractionCandidate>,
    pub failures: Vec<SampleFailure>,
}

/// Issues N independent extraction attempts for a page.
pub struct Sampler {
    source: Arc<dyn CandidateSource>,
    config: SamplerConfig,
}

impl Sampler {
    pub fn new(source: Arc<dyn CandidateSource>, config: SamplerConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Run the attempts on a pool of at most `parallelism` workers.
    ///
    /// Failed attempts are logged and dropped. Fails only when no attempt
    /// survived, or when `cancel` fired before the run completed.
    pub fn sample(
        &self,
        page: &PageImage,
        cancel: &CancellationToken,
    ) -> Result<SampleBatch, ConsensusError> {
        let requested = self.config.samples.max(1);
        let workers = self.config.parallelism.clamp(1, requested);
        let next_attempt = AtomicUsize::new(0);
        let outcomes: Mutex<Vec<(usize, Result<ExtractionCandidate, LlmError>)>> =
            Mutex::new(Vec::with_capacity(requested));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let attempt = next_attempt.fetch_add(1, Ordering::SeqCst);
                    if attempt >= requested {
                        return;
                    }
                    let outcome = self.attempt_with_retry(page, attempt, cancel);
                    outcomes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((attempt, outcome));
                });
            }
        });

        if cancel.is_cancelled() {
            tracing::info!(page = page.page_number, "Sampling cancelled");
            return Err(ConsensusError::Cancelled);
        }

        let mut outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
        outcomes.sort_by_key(|(attempt, _)| *attempt);

        let mut candidates = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (attempt, outcome) in outcomes {
            match outcome {
                Ok(candidate) => candidates.push(candidate),
                Err(error) => {
                    let failure = ConsensusError::SampleFailure {
                        attempt,
                        source: error.clone(),
                    };
                    tracing::warn!(page = page.page_number, attempt, "{failure}");
                    failures.push(SampleFailure {
                        attempt_index: attempt,
                        error,
                    });
                }
            }
        }

        if candidates.is_empty() {
            return Err(ConsensusError::InsufficientSamples { requested });
        }

        tracing::info!(
            page = page.page_number,
            requested,
            succeeded = candidates.len(),
            "Sampling complete"
        );
        Ok(SampleBatch {
            requested,
            candidates,
            failures,
        })
    }

    fn attempt_with_retry(
        &self,
        page: &PageImage,
        attempt: usize,
        cancel: &CancellationToken,
    ) -> Result<ExtractionCandidate, LlmError> {
        let mut tries = 0;
        loop {
            match self.source.extract(page, attempt) {
                Ok(mut candidate) => {
                    candidate.attempt_index = attempt;
                    return Ok(candidate);
                }
                Err(e)
                    if e.is_retryable()
                        && tries < self.config.max_retries
                        && !cancel.is_cancelled() =>
                {
                    tries += 1;
                    tracing::warn!(
                        page = page.page_number,
                        attempt,
                        retry = tries,
                        error = %e,
                        "Extraction call failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Source that answers from a per-call script keyed by attempt.
    struct ScriptedSource {
        answers: Mutex<BTreeMap<usize, Vec<Result<&'static str, LlmError>>>>,
        calls: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedSource {
        fn new(per_attempt: Vec<Vec<Result<&'static str, LlmError>>>) -> Self {
            Self {
                answers: Mutex::new(per_attempt.into_iter().enumerate().collect()),
                calls: AtomicUsize::new(0),
                cancel_after: None,
            }
        }
    }

    impl CandidateSource for ScriptedSource {
        fn extract(
            &self,
            _page: &PageImage,
            attempt: usize,
        ) -> Result<ExtractionCandidate, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if call >= *limit {
                    token.cancel();
                }
            }
            let mut answers = self.answers.lock().unwrap();
            let script = answers.get_mut(&attempt).expect("scripted attempt");
            let answer = if script.len() > 1 { script.remove(0) } else { script[0].clone() };
            answer.map(|value| {
                let mut fields = BTreeMap::new();
                fields.insert("exam_name_raw".to_string(), Some(value.to_string()));
                // Deliberately wrong index: the sampler owns attempt numbering
                ExtractionCandidate::new(99, fields)
            })
        }
    }

    fn page() -> PageImage {
        PageImage::new(1, vec![0xFF, 0xD8], "test page")
    }

    fn sampler(
        source: ScriptedSource,
        samples: usize,
        parallelism: usize,
    ) -> (Sampler, Arc<ScriptedSource>) {
        let source = Arc::new(source);
        let config = SamplerConfig {
            samples,
            parallelism,
            max_retries: 2,
        };
        (Sampler::new(source.clone(), config), source)
    }

    #[test]
    fn candidates_come_back_in_attempt_order() {
        let (sampler, _) = sampler(
            ScriptedSource::new(vec![vec![Ok("A")], vec![Ok("B")], vec![Ok("C")], vec![Ok("D")]]),
            4,
            3,
        );
        let batch = sampler.sample(&page(), &CancellationToken::new()).unwrap();
        let indices: Vec<usize> = batch.candidates.iter().map(|c| c.attempt_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let values: Vec<&str> = batch
            .candidates
            .iter()
            .map(|c| c.value("exam_name_raw").unwrap())
            .collect();
        assert_eq!(values, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn failed_attempts_are_dropped() {
        let (sampler, _) = sampler(
            ScriptedSource::new(vec![
                vec![Ok("A")],
                vec![Err(LlmError::MalformedResponse("no json".into()))],
                vec![Ok("A")],
            ]),
            3,
            1,
        );
        let batch = sampler.sample(&page(), &CancellationToken::new()).unwrap();
        assert_eq!(batch.requested, 3);
        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].attempt_index, 1);
    }

    #[test]
    fn one_survivor_is_enough() {
        let (sampler, _) = sampler(
            ScriptedSource::new(vec![
                vec![Err(LlmError::Status { status: 400, body: String::new() })],
                vec![Ok("only")],
                vec![Err(LlmError::MalformedResponse("refusal".into()))],
            ]),
            3,
            2,
        );
        let batch = sampler.sample(&page(), &CancellationToken::new()).unwrap();
        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.candidates[0].attempt_index, 1);
    }

    #[test]
    fn zero_survivors_is_insufficient() {
        let (sampler, _) = sampler(
            ScriptedSource::new(vec![
                vec![Err(LlmError::MalformedResponse("x".into()))],
                vec![Err(LlmError::MalformedResponse("y".into()))],
            ]),
            2,
            1,
        );
        let err = sampler.sample(&page(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ConsensusError::InsufficientSamples { requested: 2 }));
    }

    #[test]
    fn transient_errors_are_retried() {
        let (sampler, source) = sampler(
            ScriptedSource::new(vec![vec![
                Err(LlmError::Timeout(30)),
                Err(LlmError::Timeout(30)),
                Ok("A"),
            ]]),
            1,
            1,
        );
        let batch = sampler.sample(&page(), &CancellationToken::new()).unwrap();
        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let (sampler, source) = sampler(
            ScriptedSource::new(vec![vec![Err(LlmError::Connection("x".into()))], vec![Ok("B")]]),
            2,
            1,
        );
        let batch = sampler.sample(&page(), &CancellationToken::new()).unwrap();
        assert_eq!(batch.candidates.len(), 1);
        // 1 + 2 retries for attempt 0, 1 call for attempt 1
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn malformed_responses_are_not_retried() {
        let (sampler, source) = sampler(
            ScriptedSource::new(vec![
                vec![Err(LlmError::MalformedResponse("x".into()))],
                vec![Ok("B")],
            ]),
            2,
            1,
        );
        sampler.sample(&page(), &CancellationToken::new()).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pre_cancelled_token_issues_no_calls() {
        let (sampler, source) = sampler(ScriptedSource::new(vec![vec![Ok("A")]]), 1, 1);
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            sampler.sample(&page(), &token),
            Err(ConsensusError::Cancelled)
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_stops_new_attempts() {
        let token = CancellationToken::new();
        let mut source = ScriptedSource::new(vec![vec![Ok("A")]; 5]);
        source.cancel_after = Some((2, token.clone()));
        let (sampler, source) = sampler(source, 5, 1);

        assert!(matches!(sampler.sample(&page(), &token), Err(ConsensusError::Cancelled)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancellation_token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
