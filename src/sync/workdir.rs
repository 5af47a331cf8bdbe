//! Scoped ownership of an entity's local directory.
//!
//! The directory is purged on every exit path unless the pass explicitly
//! keeps it, including when the owning future is dropped mid-flight.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pause before the second removal attempt, giving an abandoned transfer
/// time to notice and stop writing.
const PURGE_RETRY_DELAY: Duration = Duration::from_millis(200);

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[derive(Debug)]
pub struct EntityDir {
    path: PathBuf,
    armed: bool,
}

impl EntityDir {
    /// Create the directory if needed and take ownership of its fate.
    pub async fn acquire(path: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory in place.
    pub fn keep(mut self) {
        self.armed = false;
    }

    /// Remove the directory now, retrying once if a straggling writer
    /// raced the first attempt.
    pub async fn purge(mut self) -> std::io::Result<()> {
        self.armed = false;
        if let Err(e) = remove_dir(&self.path).await {
            tracing::debug!(path = %self.path.display(), error = %e, "Retrying directory removal");
            tokio::time::sleep(PURGE_RETRY_DELAY).await;
            remove_dir(&self.path).await?;
        }
        Ok(())
    }
}

impl Drop for EntityDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(path = %self.path.display(), "Purging abandoned entity directory");
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to purge entity directory"
                );
            }
        }
    }
}
