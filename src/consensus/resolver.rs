use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::arbitration::{ArbitrationRequest, Arbitrator};
use super::dates::{resolve_date_field, DocumentContext};
use super::normalize::comparison_key;
use super::types::{
    ConsensusRecord, ExtractionCandidate, FieldKind, FieldSchema, ResolutionMethod, ResolvedField,
    ValueSupport,
};
use crate::llm::is_likely_truncated;

/// Group values by comparison key. Each group keeps the original text of its
/// earliest attempt. Sorted by support, then by earliest attempt.
pub(crate) fn tally<'a>(
    values: impl IntoIterator<Item = (usize, &'a str)>,
    key: impl Fn(&str) -> String,
) -> Vec<ValueSupport> {
    let mut groups: BTreeMap<String, (ValueSupport, BTreeSet<&'a str>)> = BTreeMap::new();
    for (attempt, value) in values {
        let (group, spellings) = groups.entry(key(value)).or_insert_with(|| {
            let group = ValueSupport {
                value: value.to_string(),
                count: 0,
                first_attempt: attempt,
                variants: 0,
            };
            (group, BTreeSet::new())
        });
        group.count += 1;
        spellings.insert(value.trim());
        if attempt < group.first_attempt {
            group.first_attempt = attempt;
            group.value = value.to_string();
        }
    }

    let mut support: Vec<ValueSupport> = groups
        .into_values()
        .map(|(mut group, spellings)| {
            group.variants = spellings.len();
            group
        })
        .collect();
    support.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.first_attempt.cmp(&b.first_attempt))
    });
    support
}

/// The most complete of the given values: not cut off, then longest,
/// then earliest attempt.
fn most_complete(groups: &[ValueSupport]) -> Option<&ValueSupport> {
    groups.iter().min_by(|a, b| {
        is_likely_truncated(&a.value)
            .cmp(&is_likely_truncated(&b.value))
            .then(b.value.chars().count().cmp(&a.value.chars().count()))
            .then(a.first_attempt.cmp(&b.first_attempt))
    })
}

/// Reduces the candidates of one page to a single record, field by field.
pub struct ConsensusResolver {
    schema: FieldSchema,
    arbitrator: Arc<dyn Arbitrator>,
    inherit_document_date: bool,
}

impl ConsensusResolver {
    pub fn new(schema: FieldSchema, arbitrator: Arc<dyn Arbitrator>) -> Self {
        Self {
            schema,
            arbitrator,
            inherit_document_date: false,
        }
    }

    /// Let pages with no date at all take the document's dominant date.
    pub fn with_document_date_inheritance(mut self, inherit: bool) -> Self {
        self.inherit_document_date = inherit;
        self
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Resolve every field seen in any candidate of the page.
    pub fn resolve(
        &self,
        page_number: u32,
        candidates: &[ExtractionCandidate],
        context: &DocumentContext,
    ) -> ConsensusRecord {
        let field_names: BTreeSet<&str> = candidates
            .iter()
            .flat_map(|c| c.fields.keys().map(String::as_str))
            .collect();

        let fields = field_names
            .into_iter()
            .map(|field| {
                let resolved = match self.schema.kind_of(field) {
                    FieldKind::Date => resolve_date_field(
                        field,
                        candidates,
                        context,
                        self.arbitrator.as_ref(),
                        self.inherit_document_date,
                    ),
                    kind => self.resolve_text_field(page_number, field, kind, candidates, context),
                };
                tracing::debug!(
                    page = page_number,
                    field,
                    method = %resolved.method,
                    distinct = resolved.support.len(),
                    "Field resolved"
                );
                (field.to_string(), resolved)
            })
            .collect();

        ConsensusRecord {
            page_number,
            candidate_count: candidates.len(),
            fields,
        }
    }

    fn resolve_text_field(
        &self,
        page_number: u32,
        field: &str,
        kind: FieldKind,
        candidates: &[ExtractionCandidate],
        context: &DocumentContext,
    ) -> ResolvedField {
        let values: Vec<(usize, &str)> = candidates
            .iter()
            .filter_map(|c| c.value(field).map(|v| (c.attempt_index, v)))
            .collect();
        let null_count = candidates.len() - values.len();
        let support = tally(values, comparison_key);

        let (value, method) = match support.as_slice() {
            [] => (None, ResolutionMethod::Unanimous),
            [only] => (Some(only.value.clone()), ResolutionMethod::Unanimous),
            [top, second, ..] if top.count > second.count => {
                (Some(top.value.clone()), ResolutionMethod::Majority)
            }
            [top, ..] => {
                let tied: Vec<ValueSupport> = support
                    .iter()
                    .take_while(|s| s.count == top.count)
                    .cloned()
                    .collect();
                match kind {
                    FieldKind::Scalar => {
                        self.arbitrate_scalar(page_number, field, &support, &tied, context)
                    }
                    _ => (
                        most_complete(&tied).map(|s| s.value.clone()),
                        ResolutionMethod::LongestFallback,
                    ),
                }
            }
        };

        ResolvedField {
            value,
            method,
            support,
            null_count,
        }
    }

    fn arbitrate_scalar(
        &self,
        page_number: u32,
        field: &str,
        support: &[ValueSupport],
        tied: &[ValueSupport],
        context: &DocumentContext,
    ) -> (Option<String>, ResolutionMethod) {
        let candidates: Vec<String> = support.iter().map(|s| s.value.clone()).collect();
        let description = format!(
            "Document: {}\nPage: {page_number}",
            context.document_name()
        );
        let request = ArbitrationRequest {
            field,
            kind: FieldKind::Scalar,
            candidates: &candidates,
            context: &description,
        };

        match self.arbitrator.arbitrate(&request) {
            Ok(answer) => {
                // Prefer the candidate's own spelling when the answer matches one
                let key = comparison_key(&answer);
                let value = support
                    .iter()
                    .find(|s| comparison_key(&s.value) == key)
                    .map(|s| s.value.clone())
                    .unwrap_or(answer);
                (Some(value), ResolutionMethod::Arbitrated)
            }
            Err(e) => {
                tracing::warn!(
                    page = page_number,
                    field,
                    error = %e,
                    "Arbitration failed, keeping most complete candidate"
                );
                (
                    most_complete(tied).map(|s| s.value.clone()),
                    ResolutionMethod::LongestFallback,
                )
            }
        }
    }
}
