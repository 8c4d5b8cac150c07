//! Per-document inventory for quality review.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::cache::ExamCategory;
use crate::consensus::normalize::{date_from_filename, parse_date};
use crate::consensus::thresholds;

/// Pages whose transcription is shorter than this count as empty.
const EMPTY_PAGE_CHARS: usize = 10;

const MULTI_PAGE_MIN: usize = 3;
const COMPLEX_MIN: usize = 10;

/// Decade bucket of a document's primary date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Era {
    /// Anything before 2000.
    #[serde(rename = "1990s")]
    Nineties,
    #[serde(rename = "2000s")]
    Noughties,
    #[serde(rename = "2010s")]
    Tens,
    /// 2020 onwards.
    #[serde(rename = "2020s")]
    Twenties,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Era {
    pub fn from_date(date: Option<NaiveDate>) -> Self {
        match date.map(|d| d.year()) {
            None => Self::Unknown,
            Some(y) if y < 2000 => Self::Nineties,
            Some(y) if y < 2010 => Self::Noughties,
            Some(y) if y < 2020 => Self::Tens,
            Some(_) => Self::Twenties,
        }
    }

    pub fn is_old(&self) -> bool {
        matches!(self, Self::Nineties | Self::Noughties)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriageTag {
    OldDoc,
    MultiPage,
    Complex,
    HasEmptyPages,
    DateMismatch,
    LowConfidence,
    UnresolvedPages,
}

/// What triage needs to know about one processed page.
#[derive(Debug, Clone)]
pub struct PageFacts<'a> {
    pub exam_date: Option<&'a str>,
    pub transcription: Option<&'a str>,
    pub confidence: Option<f32>,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInventory {
    pub page_count: usize,
    pub primary_date: Option<NaiveDate>,
    pub era: Era,
    pub primary_category: Option<ExamCategory>,
    pub empty_pages: Vec<u32>,
    pub tags: Vec<TriageTag>,
}

impl DocumentInventory {
    pub fn has_tag(&self, tag: TriageTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// Build the inventory of a document from its processed pages (in page order).
pub fn build_inventory(
    document_name: &str,
    pages: &[PageFacts<'_>],
    primary_category: Option<ExamCategory>,
) -> DocumentInventory {
    let page_count = pages.len();
    // The first dated page speaks for the document
    let primary_date = pages.iter().find_map(|p| p.exam_date.and_then(parse_date));
    let era = Era::from_date(primary_date);

    let empty_pages: Vec<u32> = pages
        .iter()
        .zip(1u32..)
        .filter(|(p, _)| p.transcription.map_or(0, |t| t.trim().chars().count()) < EMPTY_PAGE_CHARS)
        .map(|(_, n)| n)
        .collect();

    let mut tags = Vec::new();
    if era.is_old() {
        tags.push(TriageTag::OldDoc);
    }
    if page_count >= COMPLEX_MIN {
        tags.push(TriageTag::Complex);
    } else if page_count >= MULTI_PAGE_MIN {
        tags.push(TriageTag::MultiPage);
    }
    if !empty_pages.is_empty() {
        tags.push(TriageTag::HasEmptyPages);
    }
    if let (Some(named), Some(primary)) = (date_from_filename(document_name), primary_date) {
        if named != primary {
            tags.push(TriageTag::DateMismatch);
        }
    }
    if pages
        .iter()
        .any(|p| p.confidence.is_some_and(|c| c < thresholds::MODERATE))
    {
        tags.push(TriageTag::LowConfidence);
    }
    if pages.iter().any(|p| !p.resolved) {
        tags.push(TriageTag::UnresolvedPages);
    }

    DocumentInventory {
        page_count,
        primary_date,
        era,
        primary_category,
        empty_pages,
        tags,
    }
}
