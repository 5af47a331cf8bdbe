//! Persistent mirror state.
//!
//! Everything the mirror remembers between runs lives in plain files:
//! - a TSV manifest per synced directory (entity or release notes)
//! - the processed-entity list in the cache directory
//! - the release version marker
//! - an advisory lock file guarding the cache directory

pub mod error;
pub mod lock;
pub mod manifest;
pub mod processed;
pub mod version;

use std::path::{Path, PathBuf};

pub use error::StateError;
pub use lock::CacheLock;
pub use manifest::{read_manifest, write_manifest, Manifest, ManifestEntry, MANIFEST_FILE};
pub use processed::{ProcessedSet, PROCESSED_FILE};
pub use version::{read_version_marker, version_token, write_version_marker, VERSION_FILE};

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a truncated one.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| StateError::write(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StateError::write(path, e));
    }
    Ok(())
}
