use std::path::{Path, PathBuf};

use tokio::fs;

use crate::remote::{RemoteSession, TransportError};

/// `<name>.part` next to the destination.
pub(crate) fn part_path(download_path: &Path) -> PathBuf {
    let mut name = download_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    download_path.with_file_name(name)
}

/// Fetch a remote file through a `.part` temp file.
///
/// Any stale `.part` is discarded first so every attempt starts from
/// scratch. The destination only ever holds a complete transfer.
pub(crate) async fn fetch_into_place(
    session: &mut dyn RemoteSession,
    remote_path: &str,
    download_path: &Path,
) -> Result<(), TransportError> {
    let part = part_path(download_path);
    let _ = fs::remove_file(&part).await;

    tracing::debug!(remote = remote_path, path = %download_path.display(), "fetching");

    if let Err(e) = session.fetch_to(remote_path, &part).await {
        let _ = fs::remove_file(&part).await;
        return Err(e);
    }

    fs::rename(&part, download_path)
        .await
        .map_err(|e| TransportError::LocalWrite {
            path: download_path.display().to_string(),
            source: e,
        })
}
