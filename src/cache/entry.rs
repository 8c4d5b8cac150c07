use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::CacheError;

/// Who wrote a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntrySource {
    Computed,
    ManualOverride,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub source: EntrySource,
}

/// On-disk shape of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<EntrySource>,
    /// Hash of `value` as written by the pipeline. A mismatch means a person
    /// edited the value by hand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
}

/// Short content fingerprint of a JSON value.
pub(crate) fn fingerprint(value: &Value) -> String {
    let canonical = value.to_string();
    let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
    digest[..16].to_string()
}

impl<V: Serialize> CacheEntry<V> {
    pub(crate) fn to_stored(&self) -> Result<Value, CacheError> {
        let value =
            serde_json::to_value(&self.value).map_err(|e| CacheError::Serialize(e.to_string()))?;
        let fingerprint = match self.source {
            EntrySource::Computed => Some(fingerprint(&value)),
            EntrySource::ManualOverride => None,
        };
        serde_json::to_value(StoredEntry {
            value,
            source: Some(self.source),
            fingerprint,
        })
        .map_err(|e| CacheError::Serialize(e.to_string()))
    }
}

impl<V: DeserializeOwned> CacheEntry<V> {
    /// Decode a stored entry. Values written before entries carried a
    /// source (bare values) are attributed to `legacy_source`.
    pub(crate) fn from_stored(
        key: &str,
        raw: Value,
        legacy_source: EntrySource,
    ) -> Result<Self, String> {
        let wrapped = matches!(&raw, Value::Object(map)
            if map.contains_key("value")
                && map
                    .keys()
                    .all(|k| matches!(k.as_str(), "value" | "source" | "fingerprint")));

        let (value, source) = if wrapped {
            let stored: StoredEntry = serde_json::from_value(raw).map_err(|e| e.to_string())?;
            let source = match (stored.source, &stored.fingerprint) {
                (Some(EntrySource::Computed), Some(fp)) if *fp != fingerprint(&stored.value) => {
                    tracing::info!(
                        key,
                        "Cache entry was edited by hand, treating as manual override"
                    );
                    EntrySource::ManualOverride
                }
                (Some(source), _) => source,
                (None, _) => legacy_source,
            };
            (stored.value, source)
        } else {
            (raw, legacy_source)
        };

        let value = serde_json::from_value(value).map_err(|e| format!("entry '{key}': {e}"))?;
        Ok(Self {
            key: key.to_string(),
            value,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn computed(value: &str) -> CacheEntry<String> {
        CacheEntry {
            key: "k".into(),
            value: value.into(),
            source: EntrySource::Computed,
        }
    }

    #[test]
    fn computed_entry_round_trips() {
        let stored = computed("Chest X-ray").to_stored().unwrap();
        assert_eq!(stored["source"], "computed");
        assert!(stored["fingerprint"].is_string());

        let back =
            CacheEntry::<String>::from_stored("k", stored, EntrySource::ManualOverride).unwrap();
        assert_eq!(back, computed("Chest X-ray"));
    }

    #[test]
    fn hand_edited_value_becomes_override() {
        let mut stored = computed("Chest X-ray").to_stored().unwrap();
        stored["value"] = json!("Thorax X-ray");

        let back = CacheEntry::<String>::from_stored("k", stored, EntrySource::Computed).unwrap();
        assert_eq!(back.value, "Thorax X-ray");
        assert_eq!(back.source, EntrySource::ManualOverride);
    }

    #[test]
    fn override_has_no_fingerprint() {
        let entry = CacheEntry {
            source: EntrySource::ManualOverride,
            ..computed("x")
        };
        let stored = entry.to_stored().unwrap();
        assert_eq!(stored["source"], "manual-override");
        assert!(stored.get("fingerprint").is_none());
    }

    #[test]
    fn bare_legacy_value_uses_legacy_source() {
        let raw = json!({"exam_type": "imaging", "standardized_name": "Chest X-ray"});
        let back =
            CacheEntry::<Value>::from_stored("rx tórax", raw.clone(), EntrySource::ManualOverride)
                .unwrap();
        assert_eq!(back.value, raw);
        assert_eq!(back.source, EntrySource::ManualOverride);

        let back =
            CacheEntry::<String>::from_stored("hash", json!("A summary."), EntrySource::Computed)
                .unwrap();
        assert_eq!(back.source, EntrySource::Computed);
    }

    #[test]
    fn wrong_value_type_is_an_error() {
        assert!(CacheEntry::<String>::from_stored("k", json!(42), EntrySource::Computed).is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(&json!("abc")), fingerprint(&json!("abc")));
        assert_ne!(fingerprint(&json!("abc")), fingerprint(&json!("abd")));
        assert_eq!(fingerprint(&json!("abc")).len(), 16);
    }
}
