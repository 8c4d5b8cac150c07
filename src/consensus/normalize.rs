//! Value normalization shared by the resolvers and the caches.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

/// Comparison key of an extracted value: whitespace collapsed, case folded.
/// Two values with the same key count as the same answer.
pub fn comparison_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Lookup key of a classification label: trimmed and lowercased, nothing else.
pub fn normalize_label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Parse a date as written on an exam page.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed.starts_with("0000-00-00") {
        return None;
    }

    // Drop a trailing time component ("2021-03-04 10:30", "2021-03-04T10:30:00")
    let date_part = match trimmed.get(10..) {
        Some(rest) if rest.starts_with([' ', 'T']) => &trimmed[..10],
        _ => trimmed,
    };

    // ISO 8601: YYYY-MM-DD
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Some(d);
    }
    // Day first: DD/MM/YYYY
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%d/%m/%Y") {
        return Some(d);
    }
    // Day first, dashes: DD-MM-YYYY
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%d-%m-%Y") {
        return Some(d);
    }
    // Day first, dots: DD.MM.YYYY
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%d.%m.%Y") {
        return Some(d);
    }
    // YYYY/MM/DD
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%Y/%m/%d") {
        return Some(d);
    }
    parse_portuguese_textual_date(trimmed)
}

/// Parse a date and render it as ISO `YYYY-MM-DD`.
pub fn normalize_date(raw: &str) -> Option<String> {
    parse_date(raw).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Parse a Portuguese textual date like "4 de março de 2021" or "15 janeiro 2024".
fn parse_portuguese_textual_date(text: &str) -> Option<NaiveDate> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split_whitespace()
        .filter(|t| *t != "de")
        .collect();
    if tokens.len() != 3 {
        return None;
    }

    let day: u32 = tokens[0].trim_end_matches('º').parse().ok()?;
    let month = match tokens[1] {
        "janeiro" => 1,
        "fevereiro" => 2,
        "março" | "marco" => 3,
        "abril" => 4,
        "maio" => 5,
        "junho" => 6,
        "julho" => 7,
        "agosto" => 8,
        "setembro" => 9,
        "outubro" => 10,
        "novembro" => 11,
        "dezembro" => 12,
        _ => return None,
    };
    let year: i32 = tokens[2].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Extract a date embedded in a file name (`2021-03-04`, `2021_03_04`, `20210304`).
pub fn date_from_filename(name: &str) -> Option<NaiveDate> {
    static FILENAME_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(concat!(
            r"(?:^|\D)((?:19|20)\d{2})[-_]?(0[1-9]|1[0-2])",
            r"[-_]?(0[1-9]|[12]\d|3[01])(?:\D|$)",
        ))
        .expect("valid regex")
    });

    let caps = FILENAME_DATE_RE.captures(name)?;
    let year = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let day = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}
