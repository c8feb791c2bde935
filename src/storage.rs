//! Durable key-value storage boundary.
//!
//! DESIGN
//! ======
//! The engine only needs get/set/delete on string keys, so persistence is an
//! injected [`KeyValueStore`]. Writes go through [`KeyValueStore::update`],
//! a read-modify-write that is atomic against every other writer of the
//! same store, so callers can check-then-write without losing entries.
//! [`FileStore`] keeps every key in one JSON document on disk and rewrites it
//! on each mutation (write to a sibling temp file, then rename).
//! [`MemoryStore`] backs tests and ephemeral runs.
//!
//! ERROR HANDLING
//! ==============
//! A missing file reads as an empty store. A corrupt file is an error rather
//! than silently discarded, since discarding it would erase answer history.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// What an [`KeyValueStore::update`] callback does with the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyUpdate {
    Keep,
    Set(String),
    Delete,
}

/// String-keyed durable storage.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Atomically read `key`, pass the current value to `apply`, and write
    /// back what it returns. No other writer to the same store can land
    /// between the read and the write.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be read or written.
    fn update(&self, key: &str, apply: &mut dyn FnMut(Option<&str>) -> KeyUpdate) -> Result<(), StorageError>;

    /// Store `value` at `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(key, &mut |_| KeyUpdate::Set(value.to_owned()))
    }

    /// Remove `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be written.
    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.update(key, &mut |current| if current.is_some() { KeyUpdate::Delete } else { KeyUpdate::Keep })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Apply `update` to `entries`. Returns whether anything changed.
fn apply_update(entries: &mut BTreeMap<String, String>, key: &str, update: KeyUpdate) -> bool {
    match update {
        KeyUpdate::Keep => false,
        KeyUpdate::Set(value) => entries.insert(key.to_owned(), value.clone()).as_ref() != Some(&value),
        KeyUpdate::Delete => entries.remove(key).is_some(),
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Process-local store. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn update(&self, key: &str, apply: &mut dyn FnMut(Option<&str>) -> KeyUpdate) -> Result<(), StorageError> {
        let mut entries = lock(&self.entries);
        let update = apply(entries.get(key).map(String::as_str));
        apply_update(&mut entries, key, update);
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON document on disk holding every key.
///
/// Nothing is cached: reads go to disk, and each write re-reads the document
/// under an exclusive `flock` on a sibling `.lock` file before replacing it.
/// Several stores (or processes) on one path therefore see each other's
/// writes and never drop one.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        let tmp_path = sibling(&path, "tmp");
        let store = Self { path, lock_path, tmp_path };
        let entries = store.read()?;
        debug!(path = %store.path.display(), keys = entries.len(), "opened key-value store");
        Ok(store)
    }

    fn read(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Caller must hold the write lock; `tmp_path` is shared by all writers.
    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let text = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.tmp_path, text)?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    fn write_lock(&self) -> Result<File, StorageError> {
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }
}

/// `store.json` -> `store.json.<suffix>`, never the store file itself.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read()?.remove(key))
    }

    fn update(&self, key: &str, apply: &mut dyn FnMut(Option<&str>) -> KeyUpdate) -> Result<(), StorageError> {
        // Released when the handle drops.
        let _lock = self.write_lock()?;
        let mut entries = self.read()?;
        let update = apply(entries.get(key).map(String::as_str));
        if apply_update(&mut entries, key, update) {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
