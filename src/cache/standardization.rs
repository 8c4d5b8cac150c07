use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::entry::EntrySource;
use super::persistent::{OverridePolicy, PersistentCache, StoreOutcome};
use super::store::CacheStore;
use super::CacheError;
use crate::consensus::normalize::normalize_label_key;
use crate::llm::{parse_llm_json, LlmClient, LlmError};
use crate::prompts::{build_classification_prompt, CLASSIFICATION_SYSTEM_PROMPT};

/// Canonical exam category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExamCategory {
    Imaging,
    Ultrasound,
    Endoscopy,
    Other,
    /// A category outside the known set (typically typed into the cache
    /// file by hand), kept as written.
    Unlisted(String),
}

impl ExamCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Imaging => "imaging",
            Self::Ultrasound => "ultrasound",
            Self::Endoscopy => "endoscopy",
            Self::Other => "other",
            Self::Unlisted(raw) => raw,
        }
    }

    /// Lenient parse: known synonyms map onto their category, blank is
    /// `Other`, anything else is kept as `Unlisted`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "imaging" | "radiology" => Self::Imaging,
            "ultrasound" | "echography" => Self::Ultrasound,
            "endoscopy" => Self::Endoscopy,
            "other" | "" => Self::Other,
            _ => Self::Unlisted(s.trim().to_string()),
        }
    }
}

impl Serialize for ExamCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExamCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_str_lossy(&raw))
    }
}

/// Canonical form of one raw exam label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standardization {
    #[serde(rename = "exam_type", alias = "category")]
    pub category: ExamCategory,
    pub standardized_name: String,
}

impl Standardization {
    /// Used when the classifier has nothing for a label.
    pub fn fallback(raw_label: &str) -> Self {
        Self {
            category: ExamCategory::Other,
            standardized_name: raw_label.trim().to_string(),
        }
    }
}

/// Raw exam label → canonical `{category, name}`, keyed by the trimmed,
/// lowercased label.
pub struct StandardizationCache {
    inner: PersistentCache<Standardization>,
}

impl StandardizationCache {
    pub const NAME: &'static str = "exam_type_standardization";

    /// Bare values from older cache files were curated by hand, so they
    /// load as manual overrides.
    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self {
            inner: PersistentCache::new(store, OverridePolicy::Honor, EntrySource::ManualOverride),
        }
    }

    pub fn lookup(&self, raw_label: &str) -> Result<Option<Standardization>, CacheError> {
        Ok(self
            .inner
            .lookup(&normalize_label_key(raw_label))?
            .map(|entry| entry.value))
    }

    pub fn store(
        &self,
        raw_label: &str,
        value: Standardization,
        source: EntrySource,
    ) -> Result<StoreOutcome, CacheError> {
        self.inner.store(&normalize_label_key(raw_label), value, source)
    }

    pub fn remove(&self, raw_label: &str) -> Result<Option<Standardization>, CacheError> {
        Ok(self
            .inner
            .remove(&normalize_label_key(raw_label))?
            .map(|entry| entry.value))
    }

    pub fn ensure_loaded(&self) -> Result<usize, CacheError> {
        self.inner.ensure_loaded()
    }
}

/// Classifies a batch of raw labels in one call.
pub trait Classifier: Send + Sync {
    /// Labels missing from the returned map had no answer.
    fn classify(&self, labels: &[String]) -> Result<BTreeMap<String, Standardization>, LlmError>;
}

/// Classification through a text model.
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            llm,
            model: model.to_string(),
        }
    }
}

impl Classifier for LlmClassifier {
    fn classify(&self, labels: &[String]) -> Result<BTreeMap<String, Standardization>, LlmError> {
        let prompt = build_classification_prompt(labels);
        let raw = self
            .llm
            .generate(&self.model, &prompt, CLASSIFICATION_SYSTEM_PROMPT)?;

        let serde_json::Value::Object(map) = parse_llm_json(&raw)? else {
            return Err(LlmError::MalformedResponse("Classification is not a JSON object".into()));
        };

        // Skip individual unusable answers; the caller falls back for them
        Ok(map
            .into_iter()
            .filter_map(|(label, value)| match serde_json::from_value(value) {
                Ok(answer) => Some((label, answer)),
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "Unusable classification answer");
                    None
                }
            })
            .collect())
    }
}

/// Cache-first standardization of exam labels.
pub struct Standardizer {
    cache: StandardizationCache,
    classifier: Arc<dyn Classifier>,
}

impl Standardizer {
    pub fn new(cache: StandardizationCache, classifier: Arc<dyn Classifier>) -> Self {
        Self { cache, classifier }
    }

    pub fn cache(&self) -> &StandardizationCache {
        &self.cache
    }

    /// Standardize every label, classifying all cache misses in one batch.
    ///
    /// Results are keyed by the label exactly as given. When the classifier
    /// call fails the misses get fallback values that are not cached, so the
    /// next run tries again.
    pub fn standardize(
        &self,
        labels: &[&str],
    ) -> Result<BTreeMap<String, Standardization>, CacheError> {
        let mut results = BTreeMap::new();
        let mut misses: Vec<String> = Vec::new();
        let mut seen_keys = BTreeSet::new();

        for label in labels {
            if label.trim().is_empty() || results.contains_key(*label) {
                continue;
            }
            match self.cache.lookup(label)? {
                Some(hit) => {
                    results.insert(label.to_string(), hit);
                }
                None => {
                    if seen_keys.insert(normalize_label_key(label)) {
                        misses.push(label.to_string());
                    }
                }
            }
        }

        if !misses.is_empty() {
            tracing::info!(
                cache = StandardizationCache::NAME,
                uncached = misses.len(),
                "Classifying uncached exam names"
            );
            match self.classifier.classify(&misses) {
                Ok(answers) => {
                    let answers: BTreeMap<String, Standardization> = answers
                        .into_iter()
                        .map(|(k, v)| (normalize_label_key(&k), v))
                        .collect();
                    for label in &misses {
                        let value = match answers.get(&normalize_label_key(label)) {
                            Some(answer) => answer.clone(),
                            None => {
                                tracing::warn!(
                                    label = %label,
                                    "Classifier returned no mapping, using raw name"
                                );
                                Standardization::fallback(label)
                            }
                        };
                        self.cache.store(label, value, EntrySource::Computed)?;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Exam standardization failed, using raw names");
                }
            }
        }

        // Second pass so duplicates of a miss and overrides kept on store resolve from the cache
        for label in labels {
            if label.trim().is_empty() || results.contains_key(*label) {
                continue;
            }
            let value = self
                .cache
                .lookup(label)?
                .unwrap_or_else(|| Standardization::fallback(label));
            results.insert(label.to_string(), value);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::cache::store::{JsonFileStore, MemoryStore};
    use crate::llm::MockLlmClient;

    struct FakeClassifier {
        answers: BTreeMap<String, Standardization>,
        fail: bool,
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl FakeClassifier {
        fn new(answers: &[(&str, ExamCategory, &str)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(raw, cat, name)| {
                        (
                            raw.to_string(),
                            Standardization {
                                category: cat.clone(),
                                standardized_name: name.to_string(),
                            },
                        )
                    })
                    .collect(),
                fail: false,
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl Classifier for FakeClassifier {
        fn classify(
            &self,
            labels: &[String],
        ) -> Result<BTreeMap<String, Standardization>, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(labels.to_vec());
            if self.fail {
                return Err(LlmError::Timeout(30));
            }
            Ok(labels
                .iter()
                .filter_map(|l| self.answers.get(l).map(|a| (l.clone(), a.clone())))
                .collect())
        }
    }

    fn memory_cache() -> StandardizationCache {
        StandardizationCache::new(Box::new(MemoryStore::new(StandardizationCache::NAME)))
    }

    #[test]
    fn key_is_trimmed_lowercase_only() {
        let cache = memory_cache();
        cache
            .store("  RX Tórax ", Standardization::fallback("RX Tórax"), EntrySource::Computed)
            .unwrap();
        assert!(cache.lookup("rx tórax").unwrap().is_some());
        assert!(cache.lookup("RX TÓRAX").unwrap().is_some());
        // No fuzzy matching
        assert!(cache.lookup("rx torax").unwrap().is_none());
        assert!(cache.lookup("rx  tórax").unwrap().is_none());
    }

    #[test]
    fn differently_cased_key_finds_same_entry() {
        let cache = memory_cache();
        let value = Standardization {
            category: ExamCategory::Imaging,
            standardized_name: "Brain MRI".into(),
        };
        cache.store("RM Cerebral", value.clone(), EntrySource::Computed).unwrap();
        assert_eq!(cache.lookup(" rm cerebral ").unwrap(), Some(value));
    }

    #[test]
    fn misses_are_classified_in_one_batch_and_cached() {
        let classifier = Arc::new(FakeClassifier::new(&[
            ("Ecografia Abdominal", ExamCategory::Ultrasound, "Abdominal Ultrasound"),
            ("RX Tórax", ExamCategory::Imaging, "Chest X-ray"),
        ]));
        let standardizer = Standardizer::new(memory_cache(), classifier.clone());

        let out = standardizer
            .standardize(&["Ecografia Abdominal", "RX Tórax", "ecografia abdominal "])
            .unwrap();
        assert_eq!(out["RX Tórax"].standardized_name, "Chest X-ray");
        assert_eq!(out["ecografia abdominal "].category, ExamCategory::Ultrasound);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(classifier.batches.lock().unwrap()[0].len(), 2);

        // Second run is served from the cache
        standardizer.standardize(&["RX Tórax"]).unwrap();
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn omitted_label_is_stored_as_other() {
        let classifier = Arc::new(FakeClassifier::new(&[]));
        let standardizer = Standardizer::new(memory_cache(), classifier);

        let out = standardizer.standardize(&["Polissonografia"]).unwrap();
        assert_eq!(out["Polissonografia"], Standardization::fallback("Polissonografia"));
        assert!(standardizer.cache().lookup("polissonografia").unwrap().is_some());
    }

    #[test]
    fn classifier_failure_is_not_cached() {
        let mut fake = FakeClassifier::new(&[]);
        fake.fail = true;
        let standardizer = Standardizer::new(memory_cache(), Arc::new(fake));

        let out = standardizer.standardize(&["EDA"]).unwrap();
        assert_eq!(out["EDA"].category, ExamCategory::Other);
        assert!(standardizer.cache().lookup("EDA").unwrap().is_none());
    }

    #[test]
    fn manual_override_wins_over_classifier() {
        let cache = memory_cache();
        let curated = Standardization {
            category: ExamCategory::Endoscopy,
            standardized_name: "Upper GI Endoscopy".into(),
        };
        cache.store("EDA", curated.clone(), EntrySource::ManualOverride).unwrap();
        let classifier = Arc::new(FakeClassifier::new(&[("EDA", ExamCategory::Other, "EDA")]));
        let standardizer = Standardizer::new(cache, classifier.clone());

        assert_eq!(standardizer.standardize(&["eda"]).unwrap()["eda"], curated);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn legacy_flat_entries_load_as_overrides() {
        let mut raw = BTreeMap::new();
        raw.insert(
            "eletrocardiograma".to_string(),
            json!({"exam_type": "other", "standardized_name": "ECG"}),
        );
        let cache = StandardizationCache::new(Box::new(MemoryStore::with_entries(
            StandardizationCache::NAME,
            raw,
        )));
        let hit = cache.lookup("Eletrocardiograma").unwrap().unwrap();
        assert_eq!(hit.standardized_name, "ECG");

        let outcome = cache
            .store("Eletrocardiograma", Standardization::fallback("x"), EntrySource::Computed)
            .unwrap();
        assert_eq!(outcome, StoreOutcome::KeptOverride);
    }

    #[test]
    fn unknown_category_is_kept_as_written() {
        let value: Standardization =
            serde_json::from_value(json!({"exam_type": "cardiology", "standardized_name": "ECG"}))
                .unwrap();
        assert_eq!(value.category, ExamCategory::Unlisted("cardiology".into()));
        assert_eq!(serde_json::to_value(&value).unwrap()["exam_type"], "cardiology");
        assert_eq!(ExamCategory::from_str_lossy(" Imaging "), ExamCategory::Imaging);
        assert_eq!(ExamCategory::from_str_lossy("  "), ExamCategory::Other);
    }

    #[test]
    fn unrelated_store_leaves_override_file_entry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{}.json", StandardizationCache::NAME));
        std::fs::write(
            &path,
            r#"{"ecg": {
                "value": {"exam_type": "Cardiology", "standardized_name": "ECG"},
                "source": "manual-override"
            }}"#,
        )
        .unwrap();

        let cache = StandardizationCache::new(Box::new(JsonFileStore::new(
            StandardizationCache::NAME,
            path.clone(),
        )));
        let rx = Standardization {
            category: ExamCategory::Imaging,
            standardized_name: "Chest X-ray".into(),
        };
        cache.store("RX Torax", rx, EntrySource::Computed).unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["ecg"]["value"]["exam_type"], "Cardiology");
        assert_eq!(on_disk["ecg"]["source"], "manual-override");
        assert_eq!(on_disk["rx torax"]["value"]["exam_type"], "imaging");
        assert_eq!(
            cache.lookup("ECG").unwrap().unwrap().category,
            ExamCategory::Unlisted("Cardiology".into())
        );
    }

    #[test]
    fn llm_classifier_parses_mapping() {
        let llm = Arc::new(MockLlmClient::new(
            r#"```json
{"RX Tórax": {"exam_type": "imaging", "standardized_name": "Chest X-ray"}, "Bad": "nope"}
```"#,
        ));
        let classifier = LlmClassifier::new(llm, "model");
        let out = classifier.classify(&["RX Tórax".to_string(), "Bad".to_string()]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["RX Tórax"].category, ExamCategory::Imaging);
    }
}
