use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use base64::Engine;
use regex::Regex;
use serde_json::Value;

use super::sampler::{CandidateSource, PageImage};
use super::types::{
    ExtractionCandidate, FieldKind, FieldSchema, FIELD_ADDITIONAL_EXAMS, FIELD_EXAM_NAME,
    FIELD_TRANSCRIPTION,
};
use crate::llm::{
    is_refusal, opens_with_refusal, parse_llm_json, sanitize_llm_output, LlmError, VisionClient,
};
use crate::prompts::{build_extraction_prompt, EXTRACTION_SYSTEM_PROMPT};

/// Transcriptions shorter than this are suspicious (likely a partial read).
const MIN_TRANSCRIPTION_CHARS: usize = 50;

/// Extracts one candidate per call by sending the page image to a vision model.
pub struct VisionExtractor {
    client: Arc<dyn VisionClient>,
    model: String,
    expected_fields: Vec<String>,
}

impl VisionExtractor {
    pub fn new(client: Arc<dyn VisionClient>, model: &str, schema: &FieldSchema) -> Self {
        let expected_fields = [FieldKind::Date, FieldKind::LongText, FieldKind::Scalar]
            .into_iter()
            .flat_map(|kind| schema.fields_of_kind(kind).map(str::to_string).collect::<Vec<_>>())
            .collect();
        Self {
            client,
            model: model.to_string(),
            expected_fields,
        }
    }
}

impl CandidateSource for VisionExtractor {
    fn extract(
        &self,
        page: &PageImage,
        attempt_index: usize,
    ) -> Result<ExtractionCandidate, LlmError> {
        let image = base64::engine::general_purpose::STANDARD.encode(&page.bytes);
        let prompt = build_extraction_prompt(page.page_number);

        let response = self.client.chat_with_images(
            &self.model,
            &prompt,
            &[image],
            Some(EXTRACTION_SYSTEM_PROMPT),
        )?;

        let expected: Vec<&str> = self.expected_fields.iter().map(String::as_str).collect();
        let candidate = parse_candidate(&response, attempt_index, &expected)?;

        if let Some(text) = candidate.value(FIELD_TRANSCRIPTION) {
            let chars = text.chars().count();
            if chars < MIN_TRANSCRIPTION_CHARS {
                tracing::warn!(
                    page = page.page_number,
                    attempt = attempt_index,
                    chars,
                    "Short transcription, page may be partially read"
                );
            }
        }
        Ok(candidate)
    }
}

/// Turn a model response into a candidate.
///
/// Accepts a JSON object (optionally wrapping the exam in an `exams` list, in
/// which case the first exam is used and the rest are logged) or `key: value` lines. Empty strings
/// become null. Every field in `expected` is present in the result.
pub fn parse_candidate(
    response: &str,
    attempt_index: usize,
    expected: &[&str],
) -> Result<ExtractionCandidate, LlmError> {
    let text = sanitize_llm_output(response);
    if text.is_empty() {
        return Err(LlmError::MalformedResponse("Empty response".into()));
    }

    let mut fields = match parse_llm_json(&text) {
        Ok(Value::Object(map)) => {
            let fields = fields_from_json(&map);
            // Structured reply whose content is itself a refusal
            let refused = fields
                .get(FIELD_TRANSCRIPTION)
                .and_then(Option::as_deref)
                .is_some_and(opens_with_refusal);
            if refused {
                return Err(refusal());
            }
            fields
        }
        Ok(_) => {
            return Err(LlmError::MalformedResponse(
                "Response is not a JSON object".into(),
            ))
        }
        Err(json_err) => {
            if is_refusal(&text) {
                return Err(refusal());
            }
            let fields = fields_from_lines(&text);
            if fields.is_empty() {
                return Err(json_err);
            }
            fields
        }
    };

    for field in expected {
        fields.entry(field.to_string()).or_insert(None);
    }
    Ok(ExtractionCandidate::new(attempt_index, fields))
}

fn refusal() -> LlmError {
    LlmError::MalformedResponse("Model refused to transcribe".into())
}

fn fields_from_json(map: &serde_json::Map<String, Value>) -> BTreeMap<String, Option<String>> {
    let mut fields: BTreeMap<String, Option<String>> = map
        .iter()
        .filter_map(|(k, v)| scalar_value(v).map(|value| (k.clone(), value)))
        .collect();

    // Page-level wrapper: the first exam's fields take precedence
    let exams: Vec<&serde_json::Map<String, Value>> = map
        .get("exams")
        .and_then(Value::as_array)
        .map(|exams| exams.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();
    if exams.len() > 1 {
        let others: Vec<String> = exams[1..]
            .iter()
            .enumerate()
            .map(|(i, e)| match e.get(FIELD_EXAM_NAME).and_then(Value::as_str) {
                Some(name) if !name.trim().is_empty() => name.trim().to_string(),
                _ => format!("exam {}", i + 2),
            })
            .collect();
        tracing::warn!(
            exams = exams.len(),
            dropped = others.len(),
            "Page lists several exams, only the first is extracted"
        );
        fields.insert(FIELD_ADDITIONAL_EXAMS.to_string(), Some(others.join("; ")));
    }
    if let Some(exam) = exams.first() {
        for (k, v) in exam.iter() {
            if let Some(value) = scalar_value(v) {
                fields.insert(k.clone(), value);
            }
        }
    }
    fields
}

/// `Some(None)` for an explicit absence, `None` for values that are not fields.
fn scalar_value(value: &Value) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(s) => {
            let trimmed = s.trim();
            Some((!trimmed.is_empty() && trimmed != "null").then(|| trimmed.to_string()))
        }
        Value::Number(n) => Some(Some(n.to_string())),
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

fn fields_from_lines(text: &str) -> BTreeMap<String, Option<String>> {
    static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*[-*]?\s*([a-z][a-z_]*)\s*:\s*(.*?)\s*$").expect("valid regex")
    });

    text.lines()
        .filter_map(|line| KEY_VALUE_RE.captures(line))
        .map(|caps| {
            let value = caps[2].trim_matches('"').trim();
            let value = (!value.is_empty() && value != "null").then(|| value.to_string());
            (caps[1].to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    const EXPECTED: &[&str] = &["exam_date", "exam_name_raw", "transcription"];

    #[test]
    fn parses_fenced_json() {
        let response = "```json\n{\"exam_date\": \"2021-03-04\", \"exam_name_raw\": \"Ecografia\", \
                        \"transcription\": \"Normal.\"}\n```";
        let candidate = parse_candidate(response, 2, EXPECTED).unwrap();
        assert_eq!(candidate.attempt_index, 2);
        assert_eq!(candidate.value("exam_date"), Some("2021-03-04"));
        assert_eq!(candidate.value("transcription"), Some("Normal."));
    }

    #[test]
    fn empty_strings_become_null_and_expected_fields_exist() {
        let response = r#"{"exam_name_raw": "  ", "exam_date": null}"#;
        let candidate = parse_candidate(response, 0, EXPECTED).unwrap();
        assert_eq!(candidate.fields.get("exam_name_raw"), Some(&None));
        assert_eq!(candidate.fields.get("exam_date"), Some(&None));
        assert_eq!(candidate.fields.get("transcription"), Some(&None));
    }

    #[test]
    fn first_exam_of_page_wrapper_is_used() {
        let response = r#"{
            "facility_name": "Hospital de Santa Maria",
            "page_has_exam_data": true,
            "exams": [
                {
                    "exam_name_raw": "RX Tórax",
                    "exam_date": "1997-03-02",
                    "transcription": "Sem alterações."
                },
                {"exam_name_raw": "Ecografia", "exam_date": "1997-03-05", "transcription": "Outro."}
            ]
        }"#;
        let candidate = parse_candidate(response, 0, EXPECTED).unwrap();
        assert_eq!(candidate.value("exam_name_raw"), Some("RX Tórax"));
        assert_eq!(candidate.value("facility_name"), Some("Hospital de Santa Maria"));
        assert!(!candidate.fields.contains_key("page_has_exam_data"));
        assert!(!candidate.fields.contains_key("exams"));
        assert_eq!(candidate.value("additional_exams"), Some("Ecografia"));
    }

    #[test]
    fn every_further_exam_is_listed() {
        let response = r#"{"exams": [
            {"exam_name_raw": "ECG", "transcription": "Ritmo sinusal."},
            {"exam_name_raw": "Holter"},
            {"transcription": "Sem nome."}
        ]}"#;
        let candidate = parse_candidate(response, 0, EXPECTED).unwrap();
        assert_eq!(candidate.value("exam_name_raw"), Some("ECG"));
        assert_eq!(candidate.value("additional_exams"), Some("Holter; exam 3"));
    }

    #[test]
    fn single_exam_has_no_additional_list() {
        let response =
            r#"{"exams": [{"exam_name_raw": "ECG", "transcription": "Ritmo sinusal."}]}"#;
        let candidate = parse_candidate(response, 0, EXPECTED).unwrap();
        assert!(!candidate.fields.contains_key("additional_exams"));
    }

    #[test]
    fn key_value_fallback() {
        let response =
            "exam_date: 2021-03-04\nexam_name_raw: \"Ecografia Abdominal\"\nphysician_name: null";
        let candidate = parse_candidate(response, 0, EXPECTED).unwrap();
        assert_eq!(candidate.value("exam_date"), Some("2021-03-04"));
        assert_eq!(candidate.value("exam_name_raw"), Some("Ecografia Abdominal"));
        assert_eq!(candidate.fields.get("physician_name"), Some(&None));
    }

    #[test]
    fn refusal_is_malformed() {
        let err = parse_candidate("I'm sorry, but I cannot transcribe this document.", 0, EXPECTED)
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }

    #[test]
    fn transcription_quoting_refusal_phrase_is_kept() {
        let response = r#"{
            "exam_date": "2021-03-04",
            "transcription": "Anamnese. Q: Dorme bem? A: I'm unable to sleep more than four hours."
        }"#;
        let candidate = parse_candidate(response, 0, EXPECTED).unwrap();
        assert!(candidate.value("transcription").unwrap().contains("unable to sleep"));
    }

    #[test]
    fn refusal_inside_json_is_malformed() {
        let padding = "x".repeat(300);
        let response = format!(
            r#"{{
                "notes": "{padding}",
                "transcription": "I'm sorry, but I cannot transcribe this document."
            }}"#
        );
        let err = parse_candidate(&response, 0, EXPECTED).unwrap_err();
        assert_eq!(err, LlmError::MalformedResponse("Model refused to transcribe".into()));
    }

    #[test]
    fn empty_or_prose_response_is_malformed() {
        assert!(parse_candidate("   ", 0, EXPECTED).is_err());
        assert!(parse_candidate("The page shows a chest x-ray.", 0, EXPECTED).is_err());
        assert!(parse_candidate("[1, 2, 3]", 0, EXPECTED).is_err());
    }

    #[test]
    fn numbers_are_kept_as_text() {
        let candidate = parse_candidate(r#"{"page_count": 3}"#, 0, &[]).unwrap();
        assert_eq!(candidate.value("page_count"), Some("3"));
    }

    #[test]
    fn vision_extractor_sends_image_and_parses() {
        let client = Arc::new(MockLlmClient::new(
            r#"{"exam_date": "2021-03-04", "exam_name_raw": "Ecografia",
                "transcription": "Fígado normal."}"#,
        ));
        let extractor =
            VisionExtractor::new(client.clone(), "vision", &FieldSchema::medical_exam());
        let page = PageImage::new(3, vec![1, 2, 3], "page-3.jpg");

        let candidate = extractor.extract(&page, 1).unwrap();
        assert_eq!(candidate.attempt_index, 1);
        assert_eq!(candidate.value("exam_name_raw"), Some("Ecografia"));
        // Schema fields the model left out are explicit nulls
        assert_eq!(candidate.fields.get("department"), Some(&None));
        assert!(client.prompts()[0].contains("page 3"));
    }
}
