use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::llm::openrouter::DEFAULT_BASE_URL;

/// Application-level constants
pub const APP_NAME: &str = "exam-consensus";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed temperature for i.i.d. extraction samples.
pub const SAMPLING_TEMPERATURE: f32 = 0.5;

/// Low temperature for arbitration, classification and summaries.
pub const DETERMINISTIC_TEMPERATURE: f32 = 0.1;

/// Rough characters-per-token ratio used to size the summarization budget.
const CHARS_PER_TOKEN: usize = 4;

/// Get the application data directory (~/.exam-consensus/).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{APP_NAME}"))
}

/// Get the default directory of the persistent caches
pub fn default_cache_dir() -> PathBuf {
    app_data_dir().join("cache")
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "exam_consensus=info,warn"
}

/// Swap loopback hosts for the Docker host gateway when running in a container,
/// so a model server on the host stays reachable.
pub fn resolve_base_url(url: &str) -> String {
    if is_running_in_docker() {
        url.replace("://127.0.0.1", "://host.docker.internal")
            .replace("://localhost", "://host.docker.internal")
    } else {
        url.to_string()
    }
}

fn is_running_in_docker() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("{var} has an invalid value: '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Independent extraction samples per page (N).
    pub n_samples: usize,
    /// Concurrent sampling calls per page.
    pub parallelism: usize,
    /// Retries of a single sampling call on transport errors.
    pub max_retries: usize,
    pub extract_model_id: String,
    /// Model used for arbitration (no-majority tie breaks).
    pub arbitration_model_id: String,
    /// Model used for label standardization and summaries.
    pub summarize_model_id: String,
    pub api_key: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub summarize_max_input_chars: usize,
    /// Undated pages inherit the document's dominant date.
    pub inherit_document_date: bool,
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| -> Result<String, ConfigError> {
            get(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let extract_model_id = required("EXTRACT_MODEL_ID")?;
        let arbitration_model_id =
            get("SELF_CONSISTENCY_MODEL_ID").unwrap_or_else(|| extract_model_id.clone());
        let summarize_model_id = required("SUMMARIZE_MODEL_ID")?;
        let api_key = required("OPENROUTER_API_KEY")?;

        let n_samples = parse_count(&get, "N_EXTRACTIONS", 1)?;
        let max_retries = parse_number(&get, "MAX_RETRIES", 2)?;
        let request_timeout_secs = parse_number(&get, "REQUEST_TIMEOUT_SECS", 300)?;
        let max_input_tokens: usize = parse_number(&get, "SUMMARIZE_MAX_INPUT_TOKENS", 100_000)?;

        // Bad worker counts degrade to sequential rather than failing the run
        let parallelism = match get("MAX_WORKERS").map(|v| v.trim().parse::<usize>()) {
            None => 1,
            Some(Ok(n)) => n.max(1),
            Some(Err(_)) => {
                tracing::warn!("MAX_WORKERS is not valid, defaulting to 1");
                1
            }
        };

        let base_url = resolve_base_url(
            &get("OPENROUTER_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        );
        let cache_dir = get("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);
        let inherit_document_date = matches!(
            get("INHERIT_DOCUMENT_DATE").as_deref().map(str::trim),
            Some("1" | "true" | "yes")
        );

        Ok(Self {
            n_samples,
            parallelism,
            max_retries,
            extract_model_id,
            arbitration_model_id,
            summarize_model_id,
            api_key,
            base_url,
            request_timeout_secs,
            cache_dir,
            summarize_max_input_chars: max_input_tokens.saturating_mul(CHARS_PER_TOKEN),
            inherit_document_date,
        })
    }

    /// Exam names are standardized by the extraction model.
    pub fn classification_model_id(&self) -> &str {
        &self.extract_model_id
    }
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_count(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let n = parse_number(get, var, default)?;
    if n == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".into(),
        });
    }
    Ok(n)
}
