//! Persisted key/value tier behind the memory cache.
//!
//! Synchronous, string-only and quota-limited. Quota is measured as the sum of
//! key and value lengths in bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Errors from a [`PersistentStorage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The write would push usage past the configured quota.
    #[error("storage quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A string key/value store that survives the memory tier.
pub trait PersistentStorage: Send + Sync + std::fmt::Debug {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::QuotaExceeded` when the write does not fit.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// Remove several values at once. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.remove_item(key)?;
        }
        Ok(())
    }

    /// All stored keys.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

fn usage(items: &BTreeMap<String, String>) -> usize {
    items.iter().map(|(k, v)| entry_size(k, v)).sum()
}

/// Check that replacing `key` with `value` stays within `quota`.
fn check_quota(
    items: &BTreeMap<String, String>,
    key: &str,
    value: &str,
    quota: Option<usize>,
) -> Result<(), StorageError> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let current = usage(items) - items.get(key).map_or(0, |old| entry_size(key, old));
    let needed = current + entry_size(key, value);
    if needed > quota {
        return Err(StorageError::QuotaExceeded { needed, quota });
    }
    Ok(())
}

// =============================================================================
// MemoryStorage
// =============================================================================

/// Process-local storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    /// Unbounded storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes past `quota_bytes`.
    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::default(),
            quota: Some(quota_bytes),
        }
    }

    /// Bytes currently used.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        usage(&self.items.lock())
    }
}

impl PersistentStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock();
        check_quota(&items, key, value, self.quota)?;
        items.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.lock().keys().cloned().collect())
    }
}

// =============================================================================
// FileStorage
// =============================================================================

/// Storage backed by a single JSON object file.
///
/// The file is read once on open and rewritten in full after every change,
/// through a temporary sibling file renamed into place.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl FileStorage {
    /// Open (or start) the storage file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>, quota_bytes: Option<usize>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let items = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = items.len(), "Opened cache storage file");
        Ok(Self {
            path,
            items: Mutex::new(items),
            quota: quota_bytes,
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string(items)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PersistentStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock();
        check_quota(&items, key, value, self.quota)?;
        let previous = items.insert(key.to_owned(), value.to_owned());
        if let Err(e) = self.flush(&items) {
            // Keep memory consistent with what is on disk
            match previous {
                Some(old) => items.insert(key.to_owned(), old),
                None => items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.remove_items(std::slice::from_ref(&key.to_owned()))
    }

    /// Removes every key, then rewrites the file once.
    fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut items = self.items.lock();
        let removed: Vec<(String, String)> = keys
            .iter()
            .filter_map(|key| items.remove_entry(key.as_str()))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.flush(&items) {
            items.extend(removed);
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set_item("a", "1").unwrap();
        assert_eq!(storage.get_item("a").unwrap().as_deref(), Some("1"));
        storage.remove_item("a").unwrap();
        assert!(storage.get_item("a").unwrap().is_none());
        storage.remove_item("a").unwrap();
    }

    #[test]
    fn test_quota_counts_keys_and_values() {
        let storage = MemoryStorage::with_quota(10);
        storage.set_item("abc", "defg").unwrap();
        assert_eq!(storage.used_bytes(), 7);

        let err = storage.set_item("xy", "zzz").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { needed: 12, quota: 10 }));
    }

    #[test]
    fn test_quota_replacing_value_frees_old_bytes() {
        let storage = MemoryStorage::with_quota(8);
        storage.set_item("k", "1234567").unwrap();
        storage.set_item("k", "7654321").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("7654321"));
    }

    #[test]
    fn test_file_storage_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let storage = FileStorage::open(&path, None).unwrap();
        storage.set_item("cache_x", "{\"v\":1}").unwrap();
        storage.set_item("other", "y").unwrap();
        storage.remove_item("other").unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path, None).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["cache_x".to_string()]);
        assert_eq!(reopened.get_item("cache_x").unwrap().as_deref(), Some("{\"v\":1}"));
    }

    #[test]
    fn test_file_storage_quota() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("c.json"), Some(4)).unwrap();
        assert!(matches!(
            storage.set_item("key", "value"),
            Err(StorageError::QuotaExceeded { .. })
        ));
        assert!(storage.keys().unwrap().is_empty());
    }

    #[test]
    fn test_file_storage_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStorage::open(&path, None),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_file_storage_remove_items_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let storage = FileStorage::open(&path, None).unwrap();
        for key in ["a", "b", "c"] {
            storage.set_item(key, "1").unwrap();
        }
        storage
            .remove_items(&["a".to_string(), "c".to_string(), "missing".to_string()])
            .unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path, None).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_file_storage_failed_remove_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let storage = FileStorage::open(sub.join("cache.json"), None).unwrap();
        storage.set_item("a", "1").unwrap();
        storage.set_item("b", "2").unwrap();
        std::fs::remove_dir_all(&sub).unwrap();

        assert!(storage.remove_item("a").is_err());
        assert!(storage.remove_items(&["a".to_string(), "b".to_string()]).is_err());
        assert_eq!(storage.get_item("a").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.keys().unwrap().len(), 2);
    }
}
