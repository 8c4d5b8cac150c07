//! Post-processing of raw model output.
//!
//! Strips model artifacts, locates the JSON payload in chatty responses,
//! repairs the most common string-escaping mistakes, and flags responses
//! that are refusals or look cut off.

use std::sync::LazyLock;

use regex::Regex;

use super::LlmError;

/// Strip reasoning blocks, stray special tokens and a wrapping code fence.
pub fn sanitize_llm_output(raw: &str) -> String {
    static THINK_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    static SPECIAL_TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<unused\d+>|<\|[a-z_]+\|>").expect("valid regex"));

    let text = THINK_BLOCK_RE.replace_all(raw, "");
    let text = SPECIAL_TOKEN_RE.replace_all(&text, "");
    strip_code_fence(text.trim()).to_string()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line (```json)
    let Some(newline) = rest.find('\n') else {
        return text;
    };
    let body = rest[newline + 1..].trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Locate the first balanced `{ ... }` object in `text`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escape raw control characters that models leave inside JSON strings
/// (multi-line transcriptions are the usual culprit).
pub fn repair_json_strings(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in json.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Parse the JSON object embedded in a model response.
pub fn parse_llm_json(raw: &str) -> Result<serde_json::Value, LlmError> {
    let text = sanitize_llm_output(raw);
    let json = extract_json_object(&text)
        .ok_or_else(|| LlmError::MalformedResponse("No JSON object found".into()))?;

    match serde_json::from_str(json) {
        Ok(value) => Ok(value),
        Err(first) => {
            // Invalid `\'` escapes and raw newlines are the common breakages
            let repaired = repair_json_strings(&json.replace("\\'", "'"));
            serde_json::from_str(&repaired).map_err(|_| {
                LlmError::MalformedResponse(format!("Invalid JSON in response: {first}"))
            })
        }
    }
}

/// Phrases a model uses when it declines to transcribe a document.
const REFUSAL_MARKERS: &[&str] = &[
    "i cannot transcribe",
    "i can't transcribe",
    "i cannot help with",
    "i can't help with",
    "i'm unable to",
    "i am unable to",
    "i cannot assist",
    "i can't assist",
    "i'm sorry, but",
    "i apologize, but",
    "due to privacy",
];

/// Detect a refusal instead of content. Only the opening of the text is
/// inspected so that a transcription quoting such a phrase is not rejected.
pub fn is_refusal(text: &str) -> bool {
    let head: String = text.trim().chars().take(200).collect::<String>().to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| head.contains(marker))
}

/// Stricter check for a single extracted value: the refusal must be the
/// first thing said, so a transcription that merely quotes such a phrase
/// passes.
pub fn opens_with_refusal(text: &str) -> bool {
    let lowered = text.trim_start().to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| lowered.starts_with(marker))
}

/// Detect text that appears to be cut off mid-content.
pub fn is_likely_truncated(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return false;
    }

    if trimmed.ends_with("...") || trimmed.ends_with('…') {
        return true;
    }

    // Dangling separator: the next token never arrived
    if matches!(trimmed.chars().last(), Some(',' | ';' | '-' | '(' | '[' | '{')) {
        return true;
    }

    // Unbalanced brackets
    let opens = trimmed.matches(['(', '[']).count();
    let closes = trimmed.matches([')', ']']).count();
    if opens > closes {
        return true;
    }

    // Ends on an empty list item
    matches!(trimmed.lines().last().map(str::trim), Some("*" | "•"))
}
