use serde::{Deserialize, Serialize};

use super::types::{
    ConfidenceScore, ConsensusRecord, FieldSchema, ResolutionMethod, ResolvedField,
};

/// Confidence thresholds for consensus records
pub mod thresholds {
    /// Below this: the record is mostly guesswork
    pub const LOW: f32 = 0.50;

    /// Below this: flag the page for human review
    pub const MODERATE: f32 = 0.70;

    /// Above this: samples agreed on nearly everything
    pub const HIGH: f32 = 0.85;
}

/// Coarse reading of a confidence value against [`thresholds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceBand {
    /// Below [`thresholds::LOW`]
    Low,
    /// Below [`thresholds::MODERATE`]; flagged for review
    Uncertain,
    Moderate,
    /// At or above [`thresholds::HIGH`]
    High,
}

impl ConfidenceBand {
    pub fn of(value: f32) -> Self {
        if value < thresholds::LOW {
            Self::Low
        } else if value < thresholds::MODERATE {
            Self::Uncertain
        } else if value < thresholds::HIGH {
            Self::Moderate
        } else {
            Self::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Uncertain => "uncertain",
            Self::Moderate => "moderate",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConfidenceScore {
    pub fn band(&self) -> ConfidenceBand {
        ConfidenceBand::of(self.value)
    }
}

/// Weight of a material field relative to the others.
const MATERIAL_WEIGHT: f32 = 3.0;

/// Scale applied when a material field needed a fallback resolution.
const MATERIAL_FALLBACK_SCALE: f32 = 0.65;

/// Scale applied when there was nothing to cross-check against.
const SINGLE_SAMPLE_SCALE: f32 = 0.5;

/// Agreement score of one resolved field.
fn field_score(field: &ResolvedField, candidate_count: usize) -> f32 {
    match field.method {
        ResolutionMethod::Unanimous => {
            let seen = candidate_count.saturating_sub(field.null_count);
            if seen == 0 {
                // Agreed absence
                return 1.0;
            }
            // One group written one way; otherwise the samples differ in formatting only
            let exact = field.support.len() <= 1 && field.support.iter().all(|g| g.variants <= 1);
            let base = if exact { 1.0 } else { 0.95 };
            if seen >= candidate_count {
                return base;
            }
            // Some samples saw nothing here
            let coverage = seen as f32 / candidate_count as f32;
            base * (0.7 + 0.3 * coverage)
        }
        ResolutionMethod::Majority => {
            let top = field.support.first().map_or(0, |s| s.count);
            0.4 + 0.5 * (top as f32 / candidate_count.max(1) as f32)
        }
        ResolutionMethod::Arbitrated => 0.35,
        ResolutionMethod::LongestFallback => 0.3,
        ResolutionMethod::FilenameFallback => 0.25,
        ResolutionMethod::Unresolved => 0.1,
    }
}

/// Summarize how much the samples agreed on a page.
///
/// Every field contributes an agreement score, material fields with three
/// times the weight. A fallback resolution of a material field scales the
/// result below [`thresholds::MODERATE`]; a single sample halves it.
pub fn score_record(record: &ConsensusRecord, schema: &FieldSchema) -> ConfidenceScore {
    if record.fields.is_empty() || record.candidate_count == 0 {
        return ConfidenceScore {
            value: 0.0,
            reasoning: "No fields were extracted".into(),
        };
    }

    let mut weighted = 0.0f32;
    let mut total_weight = 0.0f32;
    let mut counts = [0usize; 6];
    let mut material_fallbacks = Vec::new();

    for (name, field) in &record.fields {
        let weight = if schema.is_material(name) {
            MATERIAL_WEIGHT
        } else {
            1.0
        };
        weighted += weight * field_score(field, record.candidate_count);
        total_weight += weight;
        counts[method_slot(field.method)] += 1;

        if schema.is_material(name) && field.method.is_fallback() {
            material_fallbacks.push(format!("{name} ({})", field.method));
        }
    }

    let mut value = weighted / total_weight;
    let mut reasoning = format!(
        "{} candidate(s); {} unanimous, {} majority, {} arbitrated, {} longest-fallback, \
         {} filename-fallback, {} unresolved",
        record.candidate_count, counts[0], counts[1], counts[2], counts[3], counts[4], counts[5]
    );

    if !material_fallbacks.is_empty() {
        value *= MATERIAL_FALLBACK_SCALE;
        reasoning.push_str(&format!(
            "; no majority on material field(s): {}",
            material_fallbacks.join(", ")
        ));
    }
    if record.candidate_count == 1 {
        value *= SINGLE_SAMPLE_SCALE;
        reasoning.push_str("; single sample, unverifiable");
    }

    ConfidenceScore {
        value: value.clamp(0.0, 1.0),
        reasoning,
    }
}

fn method_slot(method: ResolutionMethod) -> usize {
    match method {
        ResolutionMethod::Unanimous => 0,
        ResolutionMethod::Majority => 1,
        ResolutionMethod::Arbitrated => 2,
        ResolutionMethod::LongestFallback => 3,
        ResolutionMethod::FilenameFallback => 4,
        ResolutionMethod::Unresolved => 5,
    }
}

/// The page should be looked at by a person.
pub fn needs_review(score: &ConfidenceScore) -> bool {
    score.value < thresholds::MODERATE
}
