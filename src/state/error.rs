//! Error types for the local state store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or writing persisted mirror state.
#[derive(Error, Debug)]
pub enum StateError {
    /// A state file exists but could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A state file could not be written or moved into place.
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A manifest is not valid TSV or lacks required columns.
    #[error("Malformed manifest at {path}: {source}")]
    Manifest { path: PathBuf, source: csv::Error },

    /// Another run holds the cache directory lock.
    #[error("Another cirtap-rs run is using this cache directory (lock: {path})")]
    Locked { path: PathBuf },

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

impl StateError {
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
