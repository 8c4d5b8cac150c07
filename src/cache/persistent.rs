use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::entry::{CacheEntry, EntrySource};
use super::store::CacheStore;
use super::CacheError;

/// Whether manual overrides are protected from computed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverridePolicy {
    /// A manual-override entry is only removed by [`PersistentCache::remove`].
    Honor,
    /// Every entry is replaceable.
    Ignore,
}

/// Result of a [`PersistentCache::store`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Replaced,
    /// A manual override already holds the key; nothing was written.
    KeptOverride,
}

/// Decoded entries plus the on-disk form of every entry this process has
/// not rewritten. Untouched entries are flushed back byte-for-byte, so a
/// hand-written value survives even where decoding normalized it.
struct Loaded<V> {
    entries: BTreeMap<String, CacheEntry<V>>,
    untouched: BTreeMap<String, Value>,
}

type Guard<'a, V> = MutexGuard<'a, Option<Loaded<V>>>;

/// Typed cache over a [`CacheStore`], loaded at first use and flushed after
/// every mutation.
pub struct PersistentCache<V> {
    store: Box<dyn CacheStore>,
    policy: OverridePolicy,
    legacy_source: EntrySource,
    loaded: Mutex<Option<Loaded<V>>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> PersistentCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    pub fn new(
        store: Box<dyn CacheStore>,
        policy: OverridePolicy,
        legacy_source: EntrySource,
    ) -> Self {
        Self {
            store,
            policy,
            legacy_source,
            loaded: Mutex::new(None),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    fn guard(&self) -> Result<Guard<'_, V>, CacheError> {
        let mut guard = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.read_store()?);
        }
        Ok(guard)
    }

    fn read_store(&self) -> Result<Loaded<V>, CacheError> {
        let mut entries = BTreeMap::new();
        let mut untouched = BTreeMap::new();
        for (key, raw) in self.store.load()? {
            let entry = CacheEntry::from_stored(&key, raw.clone(), self.legacy_source).map_err(
                |reason| CacheError::Corruption {
                    name: self.store.name().to_string(),
                    location: "entry".into(),
                    reason,
                },
            )?;
            entries.insert(key.clone(), entry);
            untouched.insert(key, raw);
        }
        Ok(Loaded { entries, untouched })
    }

    fn write_store(&self, loaded: &Loaded<V>) -> Result<(), CacheError> {
        let raw = loaded
            .entries
            .iter()
            .map(|(k, e)| match loaded.untouched.get(k) {
                Some(original) => Ok((k.clone(), original.clone())),
                None => e.to_stored().map(|v| (k.clone(), v)),
            })
            .collect::<Result<BTreeMap<String, Value>, CacheError>>()?;
        self.store.flush(&raw)
    }

    /// Load now instead of at first use, surfacing corruption early.
    pub fn ensure_loaded(&self) -> Result<usize, CacheError> {
        Ok(self.guard()?.as_ref().map_or(0, |l| l.entries.len()))
    }

    pub fn lookup(&self, key: &str) -> Result<Option<CacheEntry<V>>, CacheError> {
        Ok(self
            .guard()?
            .as_ref()
            .and_then(|l| l.entries.get(key).cloned()))
    }

    /// Read-before-write: an existing manual override is kept when the
    /// policy honors overrides and the new value is computed.
    pub fn store(
        &self,
        key: &str,
        value: V,
        source: EntrySource,
    ) -> Result<StoreOutcome, CacheError> {
        let mut guard = self.guard()?;
        let Some(loaded) = guard.as_mut() else {
            return Ok(StoreOutcome::KeptOverride);
        };

        let previous = loaded.entries.get(key).cloned();
        if let Some(existing) = &previous {
            if self.policy == OverridePolicy::Honor
                && existing.source == EntrySource::ManualOverride
                && source == EntrySource::Computed
            {
                tracing::debug!(cache = self.store.name(), key, "Keeping manual override");
                return Ok(StoreOutcome::KeptOverride);
            }
        }

        let previous_raw = loaded.untouched.remove(key);
        loaded.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                source,
            },
        );

        if let Err(e) = self.write_store(loaded) {
            // Memory must not run ahead of disk
            match previous.clone() {
                Some(old) => loaded.entries.insert(key.to_string(), old),
                None => loaded.entries.remove(key),
            };
            if let Some(raw) = previous_raw {
                loaded.untouched.insert(key.to_string(), raw);
            }
            return Err(e);
        }

        Ok(if previous.is_some() {
            StoreOutcome::Replaced
        } else {
            StoreOutcome::Inserted
        })
    }

    /// Administrative delete; the only way to drop a manual override.
    pub fn remove(&self, key: &str) -> Result<Option<CacheEntry<V>>, CacheError> {
        let mut guard = self.guard()?;
        let Some(loaded) = guard.as_mut() else {
            return Ok(None);
        };
        let Some(removed) = loaded.entries.remove(key) else {
            return Ok(None);
        };
        let removed_raw = loaded.untouched.remove(key);
        if let Err(e) = self.write_store(loaded) {
            loaded.entries.insert(key.to_string(), removed);
            if let Some(raw) = removed_raw {
                loaded.untouched.insert(key.to_string(), raw);
            }
            return Err(e);
        }
        Ok(Some(removed))
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        self.ensure_loaded()
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Drop the in-memory copy and read the store again (after hand edits).
    pub fn reload(&self) -> Result<usize, CacheError> {
        let fresh = self.read_store()?;
        let count = fresh.entries.len();
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = Some(fresh);
        Ok(count)
    }
}
