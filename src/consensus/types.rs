use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Rendered in place of a field that could not be resolved.
pub const ABSENCE_MARKER: &str = "$UNKNOWN$";

pub const FIELD_EXAM_DATE: &str = "exam_date";
pub const FIELD_TRANSCRIPTION: &str = "transcription";
pub const FIELD_EXAM_NAME: &str = "exam_name_raw";
pub const FIELD_FACILITY: &str = "facility_name";
pub const FIELD_PHYSICIAN: &str = "physician_name";
pub const FIELD_DEPARTMENT: &str = "department";
/// Names of further exams listed on the same page (only the first is extracted).
pub const FIELD_ADDITIONAL_EXAMS: &str = "additional_exams";

/// One extraction attempt's output for a page. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCandidate {
    /// Position in the sampling run (0..N-1). Only used for tie-breaks.
    pub attempt_index: usize,
    pub fields: BTreeMap<String, Option<String>>,
}

impl ExtractionCandidate {
    pub fn new(attempt_index: usize, fields: BTreeMap<String, Option<String>>) -> Self {
        Self {
            attempt_index,
            fields,
        }
    }

    /// The non-null value this attempt produced for `field`.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }
}

/// How a field's final value was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMethod {
    Unanimous,
    Majority,
    Arbitrated,
    LongestFallback,
    /// Taken from the date in the document's file name
    FilenameFallback,
    Unresolved,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unanimous => "unanimous",
            Self::Majority => "majority",
            Self::Arbitrated => "arbitrated",
            Self::LongestFallback => "longest-fallback",
            Self::FilenameFallback => "filename-fallback",
            Self::Unresolved => "unresolved",
        }
    }

    /// Resolved without a majority among the samples.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            Self::Arbitrated | Self::LongestFallback | Self::FilenameFallback | Self::Unresolved
        )
    }
}

impl std::fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution strategy applied when samples disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Short categorical value; disagreement goes to arbitration.
    Scalar,
    /// Free text that must never be synthesized; the most complete sample wins.
    LongText,
    /// Calendar date, resolved with document-wide context.
    Date,
}

/// Field kinds and which fields carry the record's meaning.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    kinds: BTreeMap<String, FieldKind>,
    material: Vec<String>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
            material: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: &str, kind: FieldKind) -> Self {
        self.kinds.insert(name.to_string(), kind);
        self
    }

    /// Register a field whose fallback resolution caps the confidence score.
    pub fn with_material_field(mut self, name: &str, kind: FieldKind) -> Self {
        self.kinds.insert(name.to_string(), kind);
        self.material.push(name.to_string());
        self
    }

    /// Schema of a medical exam page.
    pub fn medical_exam() -> Self {
        Self::new()
            .with_material_field(FIELD_TRANSCRIPTION, FieldKind::LongText)
            .with_material_field(FIELD_EXAM_DATE, FieldKind::Date)
            .with_material_field(FIELD_EXAM_NAME, FieldKind::Scalar)
            .with_field(FIELD_FACILITY, FieldKind::Scalar)
            .with_field(FIELD_PHYSICIAN, FieldKind::Scalar)
            .with_field(FIELD_DEPARTMENT, FieldKind::Scalar)
    }

    /// Unknown fields are scalar.
    pub fn kind_of(&self, field: &str) -> FieldKind {
        self.kinds.get(field).copied().unwrap_or(FieldKind::Scalar)
    }

    pub fn is_material(&self, field: &str) -> bool {
        self.material.iter().any(|m| m == field)
    }

    /// Fields of the given kind, in name order.
    pub fn fields_of_kind(&self, kind: FieldKind) -> impl Iterator<Item = &str> {
        self.kinds
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(name, _)| name.as_str())
    }
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self::medical_exam()
    }
}

/// A distinct value seen among the candidates and how many attempts gave it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSupport {
    /// Original text from the earliest attempt that produced it.
    pub value: String,
    pub count: usize,
    pub first_attempt: usize,
    /// Distinct spellings folded into this value.
    #[serde(default = "one")]
    pub variants: usize,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub value: Option<String>,
    pub method: ResolutionMethod,
    /// Every distinct value seen, most supported first.
    pub support: Vec<ValueSupport>,
    /// Candidates that gave no value for this field.
    pub null_count: usize,
}

impl ResolvedField {
    /// Value for rendering, with the absence marker for unresolved fields.
    pub fn display_value(&self) -> &str {
        match (&self.value, self.method) {
            (Some(v), _) => v,
            (None, ResolutionMethod::Unresolved) => ABSENCE_MARKER,
            (None, _) => "",
        }
    }
}

/// The single reconciled record for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub page_number: u32,
    pub candidate_count: usize,
    pub fields: BTreeMap<String, ResolvedField>,
}

impl ConsensusRecord {
    pub fn get(&self, field: &str) -> Option<&ResolvedField> {
        self.fields.get(field)
    }

    /// Resolved value of `field`, if any.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|f| f.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    /// In [0, 1].
    pub value: f32,
    pub reasoning: String,
}
