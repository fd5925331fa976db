//! Command implementations and the snapshot plumbing they share.

pub mod discover;
pub mod links;
pub mod lookup;
pub mod migrate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use couponhub_data::{DataError, DataLayer};
use couponhub_data::cache::StorageError;
use couponhub_data::config::{ConfigError, DataConfig};
use couponhub_data::store::{InMemoryStore, StoreError};

/// Errors that can occur while running a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// No snapshot path on the command line or in the environment.
    #[error("No snapshot given: pass --snapshot or set COUPONHUB_SNAPSHOT")]
    MissingSnapshot,

    /// Snapshot could not be read or written.
    #[error("Snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cache storage error: {0}")]
    CacheStorage(#[from] StorageError),

    #[error(transparent)]
    Data(#[from] DataError),

    /// A report could not be rendered.
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Arguments were parsed but make no sense together.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

/// A store loaded from a snapshot file.
pub struct Snapshot {
    path: PathBuf,
    store: Arc<InMemoryStore>,
}

impl Snapshot {
    /// Load the snapshot at `path`.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let store = InMemoryStore::load(path).map_err(|source| CliError::Snapshot {
            path: path.to_owned(),
            source,
        })?;
        tracing::info!("Loaded snapshot {}", path.display());
        Ok(Self {
            path: path.to_owned(),
            store: Arc::new(store),
        })
    }

    pub fn store(&self) -> Arc<InMemoryStore> {
        Arc::clone(&self.store)
    }

    /// Build the data layer over this snapshot with configuration from the
    /// environment.
    pub fn data_layer(&self) -> Result<DataLayer, CliError> {
        let config = DataConfig::from_env()?;
        Ok(DataLayer::open(config, self.store())?)
    }

    /// Write the store back to the file it was loaded from.
    pub fn save(&self) -> Result<(), CliError> {
        self.store.save(&self.path).map_err(|source| CliError::Snapshot {
            path: self.path.clone(),
            source,
        })?;
        tracing::info!("Saved snapshot {}", self.path.display());
        Ok(())
    }
}

/// Log a report as pretty JSON.
pub fn log_report<T: Serialize + ?Sized>(title: &str, report: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(report)?;
    tracing::info!("{title}:\n{json}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use couponhub_data::store::collections;

    use super::*;

    #[test]
    fn test_snapshot_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = InMemoryStore::new();
        store.seed(collections::CUSTOMERS, "c1", json!({"phone": "0832091122"})).unwrap();
        store.save(&path).unwrap();

        let snapshot = Snapshot::load(&path).unwrap();
        snapshot
            .store()
            .seed(collections::CUSTOMERS, "c2", json!({"phone": "0720000000"}))
            .unwrap();
        snapshot.save().unwrap();

        let reloaded = InMemoryStore::load(&path).unwrap();
        assert!(reloaded.document(collections::CUSTOMERS, "c2").is_some());
    }

    #[test]
    fn test_missing_snapshot_file_names_path() {
        let err = Snapshot::load(Path::new("/nonexistent/store.json")).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/store.json"));
    }
}
