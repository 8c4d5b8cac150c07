//! Document processing orchestrator.
//!
//! sample every page → build the document date context → resolve each page
//! → score → standardize exam names (one batch) → summarize → triage.
//!
//! Engines sit behind traits so the whole flow runs against mocks in tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::triage::{build_inventory, DocumentInventory, PageFacts};
use super::PipelineError;
use crate::cache::{
    DocumentSummarizer, JsonFileStore, LlmClassifier, LlmSummarizer, Standardization,
    StandardizationCache, Standardizer, SummarizationCache, SummarySection,
};
use crate::config::{self, PipelineConfig};
use crate::consensus::{
    needs_review, score_record, CancellationToken, ConfidenceScore, ConsensusError, ConsensusRecord,
    ConsensusResolver, DocumentContext, ExtractionCandidate, FieldSchema, LlmArbitrator,
    PageImage, Sampler, SamplerConfig, VisionExtractor, FIELD_EXAM_DATE, FIELD_EXAM_NAME,
    FIELD_TRANSCRIPTION,
};
use crate::llm::OpenRouterClient;

// ---------------------------------------------------------------------------
// Input / result types
// ---------------------------------------------------------------------------

/// One source document: its rasterized pages in reading order.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub name: String,
    pub pages: Vec<PageImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PageStatus {
    Resolved,
    /// No attempt produced a usable candidate.
    Unresolved { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub page_number: u32,
    #[serde(flatten)]
    pub status: PageStatus,
    /// Kept so a single page can be reprocessed against the rest.
    pub candidates: Vec<ExtractionCandidate>,
    pub record: Option<ConsensusRecord>,
    pub confidence: Option<ConfidenceScore>,
    pub standardization: Option<Standardization>,
    pub failed_attempts: usize,
}

impl PageResult {
    pub fn is_resolved(&self) -> bool {
        self.status == PageStatus::Resolved
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub run_id: Uuid,
    pub document: String,
    pub pages: Vec<PageResult>,
    pub summary: Option<String>,
    pub summary_hash: Option<String>,
    pub inventory: DocumentInventory,
}

/// Raw sampling output of one page, before resolution.
struct SampledPage {
    page_number: u32,
    candidates: Vec<ExtractionCandidate>,
    failed_attempts: usize,
    unresolved_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct DocumentProcessor {
    sampler: Sampler,
    resolver: ConsensusResolver,
    standardizer: Standardizer,
    summarizer: DocumentSummarizer,
}

impl DocumentProcessor {
    pub fn new(
        sampler: Sampler,
        resolver: ConsensusResolver,
        standardizer: Standardizer,
        summarizer: DocumentSummarizer,
    ) -> Self {
        Self {
            sampler,
            resolver,
            standardizer,
            summarizer,
        }
    }

    /// Process every page of a document.
    ///
    /// A page with no surviving sample is reported as unresolved and the
    /// rest of the document carries on. Cache errors and cancellation
    /// abort the document.
    pub fn process(
        &self,
        doc: &DocumentInput,
        cancel: &CancellationToken,
    ) -> Result<DocumentResult, PipelineError> {
        tracing::info!(document = %doc.name, pages = doc.pages.len(), "Processing document");

        let sampled = doc
            .pages
            .iter()
            .map(|page| self.sample_page(&doc.name, page, cancel))
            .collect::<Result<Vec<_>, _>>()?;

        let context = DocumentContext::from_pages(
            &doc.name,
            sampled.iter().map(|p| p.candidates.as_slice()),
            self.resolver.schema(),
        );

        let pages = sampled
            .into_iter()
            .map(|page| self.resolve_page(page, &context))
            .collect();

        self.finish(Uuid::new_v4(), &doc.name, pages)
    }

    /// Re-sample one page and re-resolve it against the stored candidates
    /// of every other page. The other pages' records are kept as they are.
    pub fn reprocess_page(
        &self,
        previous: &DocumentResult,
        doc: &DocumentInput,
        page_number: u32,
        cancel: &CancellationToken,
    ) -> Result<DocumentResult, PipelineError> {
        let page = doc
            .pages
            .iter()
            .find(|p| p.page_number == page_number)
            .ok_or(PipelineError::PageNotFound(page_number))?;
        let index = previous
            .pages
            .iter()
            .position(|p| p.page_number == page_number)
            .ok_or(PipelineError::PageNotFound(page_number))?;

        tracing::info!(document = %doc.name, page = page_number, "Reprocessing page");
        let fresh = self.sample_page(&doc.name, page, cancel)?;

        let context = DocumentContext::from_pages(
            &doc.name,
            previous.pages.iter().map(|p| {
                if p.page_number == page_number {
                    fresh.candidates.as_slice()
                } else {
                    p.candidates.as_slice()
                }
            }),
            self.resolver.schema(),
        );

        let mut pages = previous.pages.clone();
        pages[index] = self.resolve_page(fresh, &context);
        self.finish(previous.run_id, &previous.document, pages)
    }

    fn sample_page(
        &self,
        document: &str,
        page: &PageImage,
        cancel: &CancellationToken,
    ) -> Result<SampledPage, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                document: document.to_string(),
            });
        }

        match self.sampler.sample(page, cancel) {
            Ok(batch) => Ok(SampledPage {
                page_number: page.page_number,
                failed_attempts: batch.failures.len(),
                candidates: batch.candidates,
                unresolved_reason: None,
            }),
            Err(ConsensusError::Cancelled) => Err(PipelineError::Cancelled {
                document: document.to_string(),
            }),
            Err(e) => {
                tracing::error!(
                    document,
                    page = page.page_number,
                    error = %e,
                    "Page could not be sampled"
                );
                Ok(SampledPage {
                    page_number: page.page_number,
                    candidates: Vec::new(),
                    failed_attempts: self.sampler.config().samples,
                    unresolved_reason: Some(e.to_string()),
                })
            }
        }
    }

    fn resolve_page(&self, page: SampledPage, context: &DocumentContext) -> PageResult {
        if let Some(reason) = page.unresolved_reason {
            return PageResult {
                page_number: page.page_number,
                status: PageStatus::Unresolved { reason },
                candidates: page.candidates,
                record: None,
                confidence: None,
                standardization: None,
                failed_attempts: page.failed_attempts,
            };
        }

        let record = self
            .resolver
            .resolve(page.page_number, &page.candidates, context);
        let confidence = score_record(&record, self.resolver.schema());
        tracing::info!(
            page = page.page_number,
            confidence = confidence.value,
            band = %confidence.band(),
            needs_review = needs_review(&confidence),
            "Page resolved"
        );

        PageResult {
            page_number: page.page_number,
            status: PageStatus::Resolved,
            candidates: page.candidates,
            record: Some(record),
            confidence: Some(confidence),
            standardization: None,
            failed_attempts: page.failed_attempts,
        }
    }

    /// Standardization, summary and inventory over the resolved pages.
    fn finish(
        &self,
        run_id: Uuid,
        document: &str,
        mut pages: Vec<PageResult>,
    ) -> Result<DocumentResult, PipelineError> {
        let labels: Vec<&str> = pages
            .iter()
            .filter_map(|p| p.record.as_ref()?.value(FIELD_EXAM_NAME))
            .collect();
        let standardized = self.standardizer.standardize(&labels)?;

        for page in &mut pages {
            page.standardization = page
                .record
                .as_ref()
                .and_then(|r| r.value(FIELD_EXAM_NAME))
                .and_then(|label| standardized.get(label).cloned());
        }

        let sections: Vec<SummarySection> = pages
            .iter()
            .filter_map(|p| {
                let record = p.record.as_ref()?;
                Some(SummarySection {
                    page_number: p.page_number,
                    exam_type: p
                        .standardization
                        .as_ref()
                        .map(|s| s.category.as_str().to_string()),
                    exam_name: p
                        .standardization
                        .as_ref()
                        .map(|s| s.standardized_name.clone()),
                    transcription: record.value(FIELD_TRANSCRIPTION)?.to_string(),
                })
            })
            .collect();
        let summary = self.summarizer.summarize(&sections)?;

        let facts: Vec<PageFacts<'_>> = pages
            .iter()
            .map(|p| PageFacts {
                exam_date: p.record.as_ref().and_then(|r| r.value(FIELD_EXAM_DATE)),
                transcription: p.record.as_ref().and_then(|r| r.value(FIELD_TRANSCRIPTION)),
                confidence: p.confidence.as_ref().map(|c| c.value),
                resolved: p.is_resolved(),
            })
            .collect();
        let primary_category = pages
            .iter()
            .find_map(|p| p.standardization.as_ref().map(|s| s.category.clone()));
        let inventory = build_inventory(document, &facts, primary_category);

        tracing::info!(
            document,
            pages = pages.len(),
            tags = ?inventory.tags,
            summarized = summary.is_some(),
            "Document complete"
        );

        Ok(DocumentResult {
            run_id,
            document: document.to_string(),
            pages,
            summary_hash: summary.as_ref().map(|s| s.hash.clone()),
            summary: summary.map(|s| s.text),
            inventory,
        })
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build a `DocumentProcessor` against the configured model endpoint and the
/// file-backed caches in `config.cache_dir`.
///
/// Both caches are loaded here, so a corrupted cache file stops the run
/// before any model call is made.
pub fn build_processor(config: &PipelineConfig) -> Result<DocumentProcessor, PipelineError> {
    let schema = FieldSchema::medical_exam();

    let vision =
        OpenRouterClient::new(&config.base_url, &config.api_key, config.request_timeout_secs)?
            .with_temperature(config::SAMPLING_TEMPERATURE);
    let text = Arc::new(
        OpenRouterClient::new(&config.base_url, &config.api_key, config.request_timeout_secs)?
            .with_temperature(config::DETERMINISTIC_TEMPERATURE),
    );
    tracing::info!(
        extract_model = %config.extract_model_id,
        arbitration_model = %config.arbitration_model_id,
        summarize_model = %config.summarize_model_id,
        samples = config.n_samples,
        "Document processor using remote models"
    );

    let extractor = VisionExtractor::new(Arc::new(vision), &config.extract_model_id, &schema);
    let sampler = Sampler::new(
        Arc::new(extractor),
        SamplerConfig {
            samples: config.n_samples,
            parallelism: config.parallelism,
            max_retries: config.max_retries,
        },
    );

    let arbitrator = LlmArbitrator::new(text.clone(), &config.arbitration_model_id);
    let resolver = ConsensusResolver::new(schema, Arc::new(arbitrator))
        .with_document_date_inheritance(config.inherit_document_date);

    let standardization_cache = StandardizationCache::new(Box::new(JsonFileStore::in_dir(
        &config.cache_dir,
        StandardizationCache::NAME,
    )));
    let summarization_cache = SummarizationCache::new(Box::new(JsonFileStore::in_dir(
        &config.cache_dir,
        SummarizationCache::NAME,
    )));
    let standardized = standardization_cache.ensure_loaded()?;
    let summaries = summarization_cache.ensure_loaded()?;
    tracing::info!(
        cache_dir = %config.cache_dir.display(),
        standardized,
        summaries,
        "Caches loaded"
    );

    let standardizer = Standardizer::new(
        standardization_cache,
        Arc::new(LlmClassifier::new(text.clone(), config.classification_model_id())),
    );
    let summarizer = DocumentSummarizer::new(
        summarization_cache,
        Arc::new(LlmSummarizer::new(text, &config.summarize_model_id)),
        config.summarize_max_input_chars,
    );

    Ok(DocumentProcessor::new(sampler, resolver, standardizer, summarizer))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
