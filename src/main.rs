use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use exam_consensus::config::{self, PipelineConfig};
use exam_consensus::consensus::{CancellationToken, PageImage};
use exam_consensus::pipeline::{build_processor, DocumentInput, DocumentResult};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "tif", "tiff"];

#[derive(Parser)]
#[command(
    name = "exam-consensus",
    version,
    about = "Consensus extraction over scanned exam documents"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
    /// Extraction attempts per page (overrides N_EXTRACTIONS)
    #[arg(long, global = true)]
    samples: Option<usize>,
    /// Concurrent attempts per page (overrides MAX_WORKERS)
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Directory of the persistent caches (overrides CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Process every document directory under INPUT (one sub-directory of
    /// page images per document)
    Run {
        input: PathBuf,
        #[arg(long, default_value = "./output")]
        output: PathBuf,
        /// Reprocess documents that already have a result
        #[arg(long)]
        force: bool,
    },
    /// Re-sample one page of an already processed document
    Reprocess {
        /// Document directory (page images)
        document: PathBuf,
        #[arg(long)]
        page: u32,
        #[arg(long, default_value = "./output")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    exam_consensus::init_tracing();
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    let cli = Cli::parse();
    let mut pipeline_config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(samples) = cli.samples {
        if samples == 0 {
            bail!("--samples must be at least 1");
        }
        pipeline_config.n_samples = samples;
    }
    if let Some(workers) = cli.workers {
        pipeline_config.parallelism = workers.max(1);
    }
    if let Some(dir) = cli.cache_dir {
        pipeline_config.cache_dir = dir;
    }

    // A corrupted cache stops here, before any model call
    let processor = build_processor(&pipeline_config)?;
    let cancel = CancellationToken::new();

    match cli.cmd {
        Cmd::Run {
            input,
            output,
            force,
        } => {
            std::fs::create_dir_all(&output)
                .with_context(|| format!("Cannot create {}", output.display()))?;
            let documents = list_documents(&input)?;
            tracing::info!(documents = documents.len(), "Starting run");

            let mut processed = 0usize;
            for dir in documents {
                let target = result_path(&output, &dir)?;
                if target.exists() && !force {
                    tracing::info!(document = %dir.display(), "Result exists, skipping");
                    continue;
                }
                let doc = load_document(&dir)?;
                if doc.pages.is_empty() {
                    tracing::warn!(document = %doc.name, "No page images found, skipping");
                    continue;
                }
                let result = processor.process(&doc, &cancel)?;
                write_result(&target, &result)?;
                processed += 1;
            }
            tracing::info!(processed, "Run complete");
        }
        Cmd::Reprocess {
            document,
            page,
            output,
        } => {
            let target = result_path(&output, &document)?;
            let previous: DocumentResult = serde_json::from_str(
                &std::fs::read_to_string(&target)
                    .with_context(|| format!("No previous result at {}", target.display()))?,
            )
            .with_context(|| format!("Unreadable result {}", target.display()))?;

            let doc = load_document(&document)?;
            let result = processor.reprocess_page(&previous, &doc, page, &cancel)?;
            write_result(&target, &result)?;
        }
    }

    Ok(())
}

fn list_documents(input: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = std::fs::read_dir(input)
        .with_context(|| format!("Cannot read {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

/// Page images of one document, numbered from 1 in file-name order.
fn load_document(dir: &Path) -> Result<DocumentInput> {
    let name = document_name(dir)?;
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect::<Vec<_>>();
    files.sort();

    let pages = files
        .iter()
        .zip(1u32..)
        .map(|(path, number)| {
            PageImage::from_file(number, path)
                .with_context(|| format!("Cannot read page image {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DocumentInput { name, pages })
}

fn document_name(dir: &Path) -> Result<String> {
    match dir.file_name().and_then(|n| n.to_str()) {
        Some(name) => Ok(name.to_string()),
        None => bail!("Not a document directory: {}", dir.display()),
    }
}

fn result_path(output: &Path, dir: &Path) -> Result<PathBuf> {
    Ok(output.join(format!("{}.json", document_name(dir)?)))
}

fn write_result(path: &Path, result: &DocumentResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json).with_context(|| format!("Cannot write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Result written");
    Ok(())
}
