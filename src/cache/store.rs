use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use super::CacheError;

/// Durable backing of one cache: the whole map is read once and rewritten
/// on every flush.
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    /// Read every stored entry. A missing store is empty; an unreadable one
    /// is `CacheError::Corruption`.
    fn load(&self) -> Result<BTreeMap<String, Value>, CacheError>;

    /// Replace the stored entries. Either the old or the new content
    /// survives a crash, never a mix.
    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), CacheError>;
}

/// Cache stored as `<dir>/<name>.json`.
pub struct JsonFileStore {
    name: String,
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path,
        }
    }

    /// Store for cache `name` inside `dir`.
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(name, dir.join(format!("{name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corruption(&self, reason: String) -> CacheError {
        CacheError::Corruption {
            name: self.name.clone(),
            location: self.path.display().to_string(),
            reason,
        }
    }
}

impl CacheStore for JsonFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<BTreeMap<String, Value>, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(cache = %self.name, "No cache file yet, starting empty");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(self.corruption(format!("unreadable: {e}"))),
        };

        if content.trim().is_empty() {
            tracing::debug!(
                cache = %self.name,
                path = %self.path.display(),
                "Cache file is empty, starting empty"
            );
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => {
                tracing::debug!(cache = %self.name, entries = map.len(), "Cache loaded");
                Ok(map.into_iter().collect())
            }
            Ok(_) => Err(self.corruption("top-level value is not an object".into())),
            Err(e) => Err(self.corruption(format!("invalid JSON: {e}"))),
        }
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), CacheError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| CacheError::Serialize(e.to_string()))?;

        // Write beside the target, fsync, then rename over it
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;

        // Make the rename itself durable
        if let Ok(dir_handle) = std::fs::File::open(&dir) {
            if let Err(e) = dir_handle.sync_all() {
                tracing::debug!(cache = %self.name, error = %e, "Directory fsync failed");
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    name: String,
    entries: Mutex<BTreeMap<String, Value>>,
    corrupted: Option<String>,
    fail_flush: bool,
    flushes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_entries(name: &str, entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::new(name)
        }
    }

    /// A store whose `load` reports corruption.
    pub fn corrupted(name: &str, reason: &str) -> Self {
        Self {
            corrupted: Some(reason.to_string()),
            ..Self::new(name)
        }
    }

    /// A store whose every flush fails.
    pub fn read_only(name: &str) -> Self {
        Self {
            fail_flush: true,
            ..Self::new(name)
        }
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CacheStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<BTreeMap<String, Value>, CacheError> {
        if let Some(reason) = &self.corrupted {
            return Err(CacheError::Corruption {
                name: self.name.clone(),
                location: "memory".into(),
                reason: reason.clone(),
            });
        }
        Ok(self.snapshot())
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), CacheError> {
        if self.fail_flush {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only store",
            )));
        }
        *self.entries.lock().unwrap_or_else(PoisonError::into_inner) = entries.clone();
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
