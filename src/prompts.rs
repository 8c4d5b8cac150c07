//! Instructions sent to the content-understanding service.
//!
//! Wording is not contractual: the response parsers accept any reply that
//! carries the requested JSON keys.

pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"
You are a medical document transcription assistant. You read one scanned page
of a patient's medical record and transcribe it faithfully.

RULES:
1. Transcribe ALL visible text EXACTLY as written: questions, answers,
   checkboxes, values, findings, conclusions.
2. NEVER add interpretation, diagnosis, or advice.
3. NEVER translate. Keep the document's language and spelling.
4. If a field is not visible on the page, output null for it.
5. Dates must be written as YYYY-MM-DD.
6. Output ONLY a JSON object, no commentary.
"#;

/// Build the per-page extraction prompt.
pub fn build_extraction_prompt(page_number: u32) -> String {
    format!(
        r#"This image is page {page_number} of a medical document.

Return a JSON object with exactly these keys:

```json
{{
  "exam_date": "YYYY-MM-DD or null",
  "exam_name_raw": "Document title EXACTLY as shown (e.g. 'Radiografia do Tórax')",
  "transcription": "Full text of the page EXACTLY as written",
  "facility_name": "Healthcare facility name or null",
  "physician_name": "Physician who performed or signed the exam, or null",
  "department": "Department or service within the facility, or null"
}}
```"#
    )
}

pub const ARBITRATION_SYSTEM_PROMPT: &str = r#"
You settle disagreements between independent transcriptions of the same
medical document field. Choose the candidate that is most plausible given the
context. Answer with one candidate copied verbatim; never invent a new value.
Output ONLY a JSON object: {"value": "..."}
"#;

/// Build the tie-break prompt for one field.
pub fn build_arbitration_prompt(field: &str, candidates: &[String], context: &str) -> String {
    let listed = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {c}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    let context_block = if context.trim().is_empty() {
        String::new()
    } else {
        format!("\n<context>\n{context}\n</context>\n")
    };

    format!(
        r#"Field: {field}
{context_block}
Candidates:
{listed}

Which candidate is correct? Reply with {{"value": "<candidate>"}}."#
    )
}

pub const CLASSIFICATION_SYSTEM_PROMPT: &str = r#"
You are a medical exam classification expert.

Your task: classify raw exam names from medical reports into standardized
categories and names.

EXAM TYPE GUIDELINES:
- imaging: X-ray, MRI, CT, Mammography, DEXA, PET scans, angiography
- ultrasound: Ultrasound, Echocardiogram, Doppler studies
- endoscopy: Any scope procedure (gastroscopy, colonoscopy, bronchoscopy, cystoscopy)
- other: ECG, EEG, Spirometry, Sleep studies, Holter, stress tests, biopsies, pathology

RULES:
1. Classify each raw exam name into one exam_type category.
2. Provide a clean, standardized English name for the exam.
3. Handle Portuguese and English terminology.
4. Return JSON: {"raw_name": {"exam_type": "...", "standardized_name": "..."}}

EXAMPLES:
- "Radiografia do Tórax" -> {"exam_type": "imaging", "standardized_name": "Chest X-ray"}
- "Ecografia Abdominal" -> {"exam_type": "ultrasound", "standardized_name": "Abdominal Ultrasound"}
- "EDA" -> {"exam_type": "endoscopy", "standardized_name": "Upper GI Endoscopy"}
- "Eletrocardiograma" -> {"exam_type": "other", "standardized_name": "ECG"}
"#;

/// Build the batched classification prompt.
pub fn build_classification_prompt(labels: &[String]) -> String {
    let listed = serde_json::to_string_pretty(labels).unwrap_or_else(|_| labels.join("\n"));
    format!(
        "Classify these exam names:\n\n{listed}\n\n\
         Return a JSON object mapping each raw name to its classification."
    )
}

pub const SUMMARIZATION_SYSTEM_PROMPT: &str = r#"
You summarize medical exam reports for a clinician. Keep ONLY findings,
impressions and recommendations. Drop administrative text, technique
descriptions and normal boilerplate. Never add interpretation that is not
in the text. Answer in the document's language, as plain text.
"#;

/// Build the summarization prompt from the prepared document input.
pub fn build_summarization_prompt(input: &str) -> String {
    format!("<document>\n{input}\n</document>\n\nSummarize the exams above.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_prompt_names_every_field() {
        let prompt = build_extraction_prompt(3);
        assert!(prompt.contains("page 3"));
        for key in [
            "exam_date",
            "exam_name_raw",
            "transcription",
            "facility_name",
            "physician_name",
            "department",
        ] {
            assert!(prompt.contains(key), "missing {key}");
        }
    }

    #[test]
    fn arbitration_prompt_lists_candidates_and_context() {
        let candidates = vec!["2021-03-04".to_string(), "2012-03-04".to_string()];
        let prompt =
            build_arbitration_prompt("exam_date", &candidates, "file name: 2021-03-04.pdf");
        assert!(prompt.contains("1. 2021-03-04"));
        assert!(prompt.contains("2. 2012-03-04"));
        assert!(prompt.contains("<context>"));
    }

    #[test]
    fn arbitration_prompt_without_context() {
        let prompt = build_arbitration_prompt("facility_name", &["A".to_string()], "  ");
        assert!(!prompt.contains("<context>"));
    }

    #[test]
    fn classification_prompt_embeds_labels_as_json() {
        let prompt = build_classification_prompt(&["Ecografia Abdominal".to_string()]);
        assert!(prompt.contains("\"Ecografia Abdominal\""));
    }
}
