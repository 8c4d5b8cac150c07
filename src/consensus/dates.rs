//! Date resolution for documents that span more than one era.
//!
//! A page keeps its own date when its samples agree on it, even if another
//! date dominates the rest of the document (a recent cover letter stapled to
//! a decades-old report). Document-wide frequencies only break page-local
//! ties or fill in pages whose dates are all unreadable. The date in the
//! document's file name is the last resort before a date is left unresolved.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::arbitration::{ArbitrationRequest, Arbitrator};
use super::normalize::{comparison_key, date_from_filename, parse_date};
use super::resolver::tally;
use super::types::{ExtractionCandidate, FieldKind, FieldSchema, ResolutionMethod, ResolvedField};
use super::ConsensusError;

/// Dates extracted across every page of one source document.
#[derive(Debug, Clone, Default)]
pub struct DocumentContext {
    document_name: String,
    filename_date: Option<NaiveDate>,
    /// Per date field: how many candidates (over all pages) gave each date.
    frequencies: BTreeMap<String, BTreeMap<NaiveDate, usize>>,
}

impl DocumentContext {
    /// Build the context from the candidates of every page of a document.
    pub fn from_pages<'a>(
        document_name: &str,
        pages: impl IntoIterator<Item = &'a [ExtractionCandidate]>,
        schema: &FieldSchema,
    ) -> Self {
        let date_fields: Vec<&str> = schema.fields_of_kind(FieldKind::Date).collect();
        let mut frequencies: BTreeMap<String, BTreeMap<NaiveDate, usize>> = BTreeMap::new();

        for candidate in pages.into_iter().flatten() {
            for field in &date_fields {
                if let Some(date) = candidate.value(field).and_then(parse_date) {
                    *frequencies
                        .entry(field.to_string())
                        .or_default()
                        .entry(date)
                        .or_default() += 1;
                }
            }
        }

        Self {
            document_name: document_name.to_string(),
            filename_date: date_from_filename(document_name),
            frequencies,
        }
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    /// Date embedded in the document's file name, if any.
    pub fn filename_date(&self) -> Option<NaiveDate> {
        self.filename_date
    }

    /// Number of candidates in the whole document that gave `date`.
    pub fn frequency(&self, field: &str, date: NaiveDate) -> usize {
        self.frequencies
            .get(field)
            .and_then(|f| f.get(&date))
            .copied()
            .unwrap_or(0)
    }

    /// The single most frequent date of the document; `None` on a tie.
    pub fn dominant_date(&self, field: &str) -> Option<NaiveDate> {
        let freqs = self.frequencies.get(field)?;
        let top = freqs.values().copied().max()?;
        let mut at_top = freqs.iter().filter(|(_, n)| **n == top);
        let (date, _) = at_top.next()?;
        at_top.next().is_none().then_some(*date)
    }

    fn describe(&self, field: &str, page_dates: &[String]) -> String {
        let mut lines = vec![format!("Dates read on this page: {}", page_dates.join(", "))];

        if let Some(freqs) = self.frequencies.get(field) {
            let listed = freqs
                .iter()
                .map(|(d, n)| format!("{d} (x{n})"))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Dates read across the whole document: {listed}"));
        }
        if !self.document_name.is_empty() {
            lines.push(format!("Document file name: {}", self.document_name));
        }
        if let Some(hint) = self.filename_date {
            lines.push(format!("Date in file name: {hint}"));
        }
        lines.join("\n")
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Resolve a date field for one page against the document context.
pub(crate) fn resolve_date_field(
    field: &str,
    candidates: &[ExtractionCandidate],
    context: &DocumentContext,
    arbitrator: &dyn Arbitrator,
    inherit_document_date: bool,
) -> ResolvedField {
    let raw: Vec<(usize, &str)> = candidates
        .iter()
        .filter_map(|c| c.value(field).map(|v| (c.attempt_index, v)))
        .collect();
    let null_count = candidates.len() - raw.len();

    // Group by calendar date; unparsable values keep their own groups in the
    // support listing but never take part in clustering
    let support = tally(raw.iter().copied(), |v| {
        parse_date(v).map(iso).unwrap_or_else(|| comparison_key(v))
    });
    let resolved = |value: Option<NaiveDate>, method| ResolvedField {
        value: value.map(iso),
        method,
        support: support.clone(),
        null_count,
    };

    if raw.is_empty() {
        if inherit_document_date {
            if let Some(dominant) = context.dominant_date(field) {
                tracing::debug!(field, date = %dominant, "Undated page inherits document date");
                return resolved(Some(dominant), ResolutionMethod::Majority);
            }
            if let Some(hint) = context.filename_date() {
                tracing::debug!(field, date = %hint, "Undated page takes file-name date");
                return resolved(Some(hint), ResolutionMethod::FilenameFallback);
            }
        }
        return resolved(None, ResolutionMethod::Unanimous);
    }

    // Page-local clusters: (date, count, first attempt), most supported first
    let mut clusters: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
    let mut unparsable = 0usize;
    for (attempt, value) in &raw {
        match parse_date(value) {
            Some(date) => {
                let entry = clusters.entry(date).or_insert((0, *attempt));
                entry.0 += 1;
                entry.1 = entry.1.min(*attempt);
            }
            None => unparsable += 1,
        }
    }
    let mut ranked: Vec<(NaiveDate, usize, usize)> =
        clusters.into_iter().map(|(d, (n, first))| (d, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let Some(&(top_date, top_count, _)) = ranked.first() else {
        // Every value was unreadable
        if let Some(dominant) = context.dominant_date(field) {
            tracing::debug!(field, date = %dominant, "Unreadable page dates, using document date");
            return resolved(Some(dominant), ResolutionMethod::Majority);
        }
        let values: Vec<String> = support.iter().map(|s| s.value.clone()).collect();
        return arbitrate_date(field, &values, context, arbitrator, resolved);
    };

    if ranked.len() == 1 {
        let method = if unparsable == 0 {
            ResolutionMethod::Unanimous
        } else {
            ResolutionMethod::Majority
        };
        return resolved(Some(top_date), method);
    }

    if top_count > ranked[1].1 {
        if context.dominant_date(field).is_some_and(|d| d != top_date) {
            tracing::debug!(
                field,
                page_date = %top_date,
                "Page date differs from document-wide dominant date, keeping page date"
            );
        }
        return resolved(Some(top_date), ResolutionMethod::Majority);
    }

    // Page-local tie: the document decides if one tied date is strictly more frequent
    let tied: Vec<NaiveDate> = ranked
        .iter()
        .take_while(|(_, n, _)| *n == top_count)
        .map(|(d, _, _)| *d)
        .collect();
    let mut by_document: Vec<(NaiveDate, usize)> = tied
        .iter()
        .map(|d| (*d, context.frequency(field, *d)))
        .collect();
    by_document.sort_by(|a, b| b.1.cmp(&a.1));
    if by_document.len() == 1 || by_document[0].1 > by_document[1].1 {
        return resolved(Some(by_document[0].0), ResolutionMethod::Majority);
    }

    let values: Vec<String> = ranked.iter().map(|(d, _, _)| iso(*d)).collect();
    arbitrate_date(field, &values, context, arbitrator, resolved)
}

fn arbitrate_date(
    field: &str,
    values: &[String],
    context: &DocumentContext,
    arbitrator: &dyn Arbitrator,
    resolved: impl Fn(Option<NaiveDate>, ResolutionMethod) -> ResolvedField,
) -> ResolvedField {
    let description = context.describe(field, values);
    let request = ArbitrationRequest {
        field,
        kind: FieldKind::Date,
        candidates: values,
        context: &description,
    };

    let outcome = arbitrator.arbitrate(&request).and_then(|answer| {
        parse_date(&answer).ok_or_else(|| ConsensusError::ArbitrationFailure {
            field: field.to_string(),
            reason: format!("answer is not a date: '{answer}'"),
        })
    });

    match outcome {
        Ok(date) => resolved(Some(date), ResolutionMethod::Arbitrated),
        Err(e) => match context.filename_date() {
            Some(hint) => {
                tracing::warn!(error = %e, field, date = %hint, "Using file-name date");
                resolved(Some(hint), ResolutionMethod::FilenameFallback)
            }
            None => {
                let unresolvable = ConsensusError::DateUnresolvable {
                    field: field.to_string(),
                };
                tracing::warn!(error = %e, "{unresolvable}");
                resolved(None, ResolutionMethod::Unresolved)
            }
        },
    }
}
