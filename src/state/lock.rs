//! Advisory lock on the cache directory.
//!
//! The processed list has exactly one writer per run; the lock extends that
//! to one run per cache directory.

use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::error::StateError;

pub const LOCK_FILE: &str = "mirror.lock";

/// Held for the lifetime of a run. Dropping it closes the file, which
/// releases the lock.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl CacheLock {
    pub async fn acquire(cache_dir: &Path) -> Result<Self, StateError> {
        let path = cache_dir.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let file =
                    std::fs::File::create(&path).map_err(|e| StateError::write(&path, e))?;
                file.try_lock_exclusive()
                    .map_err(|_| StateError::Locked { path: path.clone() })?;
                Ok::<_, StateError>(file)
            }
        })
        .await??;
        tracing::debug!(path = %path.display(), "Cache lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
