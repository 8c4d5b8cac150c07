pub mod cache; // Persistent standardization + summarization caches
pub mod config;
pub mod consensus; // Sampling, field consensus, date resolution, confidence
pub mod llm;
pub mod pipeline; // Document orchestration + triage inventory
pub mod prompts;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// filter. Safe to call twice; the second call is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
