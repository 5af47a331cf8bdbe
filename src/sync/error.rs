use std::path::PathBuf;

use thiserror::Error;

use crate::remote::TransportError;
use crate::state::StateError;

/// Why a single entity pass failed.
///
/// Only the transport variants imply the entity directory was purged; local
/// failures leave the directory exactly as they found it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid entity id {0:?}")]
    InvalidEntity(String),

    #[error("Giving up on {entity} after {attempts} attempts: {source}")]
    RetriesExhausted {
        entity: String,
        attempts: u32,
        source: TransportError,
    },

    #[error("Unrecoverable transport error for {entity}: {source}")]
    Transport {
        entity: String,
        source: TransportError,
    },

    #[error("Local I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Transport failures are the ones the next run is expected to fix.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::RetriesExhausted { .. } | SyncError::Transport { .. }
        )
    }
}
