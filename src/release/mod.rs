//! Release-notes gate.
//!
//! Decides whether the remote catalogue changed since the last run by
//! comparing checksums of the tracked release files, refreshes them, and
//! records the remote version.

pub mod archive;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::checksum::{checksum_bytes, checksum_file};
use crate::remote::{RemoteSession, RemoteSource, TransportError};
use crate::state::{
    self, version_token, Manifest, ManifestEntry, StateError, MANIFEST_FILE, VERSION_FILE,
};
use crate::sync::file::part_path;

pub const RELEASE_DIR: &str = "RELEASE_NOTES";
pub const SUMMARY_FILE: &str = "genome_summary";
pub const TRACKED_FILES: [&str; 4] = [
    "genome_summary",
    "genome_metadata",
    "genome_lineage",
    "PATRIC_genomes_AMR.txt",
];
/// Archive name component when no local version can be determined.
pub const UNKNOWN_VERSION: &str = "unknown_version";

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Remote release directory does not list {0}")]
    MissingRemoteFile(String),

    #[error("Timestamp {timestamp:?} of {file} does not start with a YYYYMM version")]
    BadTimestamp { file: String, timestamp: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Local I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to archive release notes to {path}: {source}")]
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ReleaseError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    /// Local release directory, `<db_dir>/RELEASE_NOTES`.
    pub release_dir: PathBuf,
    pub remote_dir: String,
    pub tracked: Vec<String>,
    /// File whose timestamp carries the release version.
    pub distinguished: String,
    pub archive_previous: bool,
    /// Where backup archives go, normally `db_dir`.
    pub archive_dir: PathBuf,
}

impl ReleaseConfig {
    pub fn new(db_dir: &Path) -> Self {
        Self {
            release_dir: db_dir.join(RELEASE_DIR),
            remote_dir: RELEASE_DIR.to_string(),
            tracked: TRACKED_FILES.iter().map(|s| s.to_string()).collect(),
            distinguished: SUMMARY_FILE.to_string(),
            archive_previous: false,
            archive_dir: db_dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// At least one tracked file was missing or changed.
    pub resync_required: bool,
    pub remote_version: String,
    pub local_version: Option<String>,
    /// Tracked files that were (re)written, in tracked order.
    pub updated: Vec<String>,
    pub archive: Option<PathBuf>,
}

struct Versions {
    remote: String,
    local: Option<String>,
}

/// A tracked file downloaded next to its destination.
struct Staged {
    name: String,
    part: PathBuf,
    dest: PathBuf,
    checksum: String,
    modify_timestamp: String,
    changed: bool,
    existed: bool,
}

pub struct ReleaseGate {
    source: Arc<dyn RemoteSource>,
    config: ReleaseConfig,
}

impl ReleaseGate {
    pub fn new(source: Arc<dyn RemoteSource>, config: ReleaseConfig) -> Self {
        Self { source, config }
    }

    /// Run the gate once. Transport failures abort without touching the
    /// local release directory or its version marker.
    pub async fn check(&self) -> Result<ReleaseOutcome, ReleaseError> {
        let dir = &self.config.release_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ReleaseError::io(dir, e))?;

        let mut session = self.source.connect().await?;
        let mut staged = Vec::with_capacity(self.config.tracked.len());
        let result = self.stage(session.as_mut(), &mut staged).await;
        session.close().await;

        let outcome = match result {
            Ok(versions) => self.commit(versions, &staged).await,
            Err(e) => Err(e),
        };
        for s in &staged {
            let _ = tokio::fs::remove_file(&s.part).await;
        }
        outcome
    }

    /// List, resolve versions and download every tracked file to `.part`.
    async fn stage(
        &self,
        session: &mut dyn RemoteSession,
        staged: &mut Vec<Staged>,
    ) -> Result<Versions, ReleaseError> {
        let dir = &self.config.release_dir;
        let listing = session.list(&self.config.remote_dir).await?;

        let distinguished = &self.config.distinguished;
        let record = listing
            .get(distinguished)
            .ok_or_else(|| ReleaseError::MissingRemoteFile(distinguished.clone()))?;
        let remote_version =
            version_token(&record.modify_timestamp).ok_or_else(|| ReleaseError::BadTimestamp {
                file: distinguished.clone(),
                timestamp: record.modify_timestamp.clone(),
            })?;
        tracing::debug!(remote_version = %remote_version, "Resolved remote release version");

        let local_version = self.local_version().await?;
        tracing::debug!(local_version = ?local_version, "Resolved local release version");

        for name in &self.config.tracked {
            let record = listing
                .get(name)
                .ok_or_else(|| ReleaseError::MissingRemoteFile(name.clone()))?;
            let dest = dir.join(name);
            let part = part_path(&dest);
            let remote_path = format!("{}/{}", self.config.remote_dir, name);

            let bytes = session.fetch(&remote_path).await?;
            let checksum = checksum_bytes(&bytes);
            tokio::fs::write(&part, &bytes)
                .await
                .map_err(|e| ReleaseError::io(&part, e))?;

            let (existed, changed) = match checksum_file(&dest).await {
                Ok(local) if local == checksum => {
                    tracing::info!(file = %name, "Release file is up to date");
                    (true, false)
                }
                Ok(_) => {
                    tracing::info!(file = %name, "Release file checksum changed, updating");
                    (true, true)
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!(file = %name, "Release file missing locally, fetching");
                    (false, true)
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(ReleaseError::io(&dest, e));
                }
            };

            staged.push(Staged {
                name: name.clone(),
                part,
                dest,
                checksum,
                modify_timestamp: record.modify_timestamp.clone(),
                changed,
                existed,
            });
        }
        Ok(Versions {
            remote: remote_version,
            local: local_version,
        })
    }

    async fn commit(
        &self,
        versions: Versions,
        staged: &[Staged],
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let dir = &self.config.release_dir;
        let Versions {
            remote: remote_version,
            local: local_version,
        } = versions;

        if local_version.as_deref() == Some(remote_version.as_str()) {
            tracing::info!(version = %remote_version, "Local and remote release versions match");
        } else {
            tracing::info!(
                local = local_version.as_deref().unwrap_or(UNKNOWN_VERSION),
                remote = %remote_version,
                "Release version differs"
            );
        }

        let updated: Vec<String> = staged
            .iter()
            .filter(|s| s.changed)
            .map(|s| s.name.clone())
            .collect();
        let resync_required = !updated.is_empty();

        let archive = if resync_required
            && self.config.archive_previous
            && staged.iter().any(|s| s.existed)
        {
            let token = local_version.as_deref().unwrap_or(UNKNOWN_VERSION);
            let path = archive::archive_path(&self.config.archive_dir, token);
            let mut files = self.config.tracked.clone();
            files.push(VERSION_FILE.to_string());
            files.push(MANIFEST_FILE.to_string());
            let added = archive::write_archive(dir, files, &path)
                .await
                .map_err(|source| ReleaseError::Archive {
                    path: path.clone(),
                    source,
                })?;
            tracing::info!(archive = %path.display(), files = added, "Archived previous release notes");
            Some(path)
        } else {
            None
        };

        for s in staged.iter().filter(|s| s.changed) {
            tokio::fs::rename(&s.part, &s.dest)
                .await
                .map_err(|e| ReleaseError::io(&s.dest, e))?;
        }

        let mut manifest = Manifest::new();
        for s in staged {
            manifest.insert(
                s.name.clone(),
                ManifestEntry {
                    modify_timestamp: s.modify_timestamp.clone(),
                    checksum: Some(s.checksum.clone()),
                },
            );
        }
        let previous = state::read_manifest(dir).await.unwrap_or(None);
        if previous.as_ref() != Some(&manifest) {
            state::write_manifest(dir, &manifest).await?;
        }

        state::write_version_marker(dir, &remote_version).await?;

        Ok(ReleaseOutcome {
            resync_required,
            remote_version,
            local_version,
            updated,
            archive,
        })
    }

    /// Version marker if present, else the version recorded for the
    /// distinguished file in the local manifest.
    async fn local_version(&self) -> Result<Option<String>, ReleaseError> {
        let dir = &self.config.release_dir;
        if let Some(v) = state::read_version_marker(dir).await? {
            return Ok(Some(v));
        }
        let manifest = match state::read_manifest(dir).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable release manifest");
                None
            }
        };
        Ok(manifest
            .as_ref()
            .and_then(|m| m.get(&self.config.distinguished))
            .and_then(|e| version_token(&e.modify_timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRemote;

    const TS: &str = "20200105101010";

    fn seed_release(remote: &FakeRemote, ts: &str, summary: &[u8]) {
        remote.put(RELEASE_DIR, "genome_summary", ts, summary);
        remote.put(RELEASE_DIR, "genome_metadata", ts, b"genome_id\tname\n10.1\tx\n");
        remote.put(RELEASE_DIR, "genome_lineage", ts, b"genome_id\tkingdom\n10.1\tBacteria\n");
        remote.put(RELEASE_DIR, "PATRIC_genomes_AMR.txt", ts, b"genome_id\tantibiotic\n");
    }

    fn gate(remote: &FakeRemote, db: &Path, archive_previous: bool) -> ReleaseGate {
        let mut config = ReleaseConfig::new(db);
        config.archive_previous = archive_previous;
        ReleaseGate::new(Arc::new(remote.clone()), config)
    }

    fn no_part_files(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .all(|e| !e.file_name().to_string_lossy().ends_with(".part"))
    }

    #[tokio::test]
    async fn test_first_run_fetches_everything() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");

        let outcome = gate(&remote, db.path(), true).check().await.unwrap();
        assert!(outcome.resync_required);
        assert_eq!(outcome.remote_version, "202001");
        assert_eq!(outcome.local_version, None);
        assert_eq!(outcome.updated.len(), 4);
        assert_eq!(outcome.archive, None);

        let release = db.path().join(RELEASE_DIR);
        assert_eq!(std::fs::read_to_string(release.join(VERSION_FILE)).unwrap(), "202001");
        let manifest = state::read_manifest(&release).await.unwrap().unwrap();
        assert_eq!(
            manifest.get("genome_summary").unwrap().checksum.as_deref(),
            Some(checksum_bytes(b"genome_id\n10.1\n").as_str())
        );
        assert!(no_part_files(&release));
    }

    #[tokio::test]
    async fn test_unchanged_release_is_a_no_op() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");
        gate(&remote, db.path(), true).check().await.unwrap();

        let release = db.path().join(RELEASE_DIR);
        std::fs::remove_file(release.join(VERSION_FILE)).unwrap();
        let manifest_before = std::fs::read(release.join(MANIFEST_FILE)).unwrap();
        let summary_mtime = std::fs::metadata(release.join("genome_summary"))
            .unwrap()
            .modified()
            .unwrap();

        let outcome = gate(&remote, db.path(), true).check().await.unwrap();
        assert!(!outcome.resync_required);
        assert!(outcome.updated.is_empty());
        assert_eq!(outcome.archive, None);
        assert_eq!(outcome.local_version.as_deref(), Some("202001"));
        assert_eq!(std::fs::read(release.join(MANIFEST_FILE)).unwrap(), manifest_before);
        assert_eq!(
            std::fs::metadata(release.join("genome_summary"))
                .unwrap()
                .modified()
                .unwrap(),
            summary_mtime
        );
        assert_eq!(std::fs::read_to_string(release.join(VERSION_FILE)).unwrap(), "202001");
        assert!(no_part_files(&release));
    }

    #[tokio::test]
    async fn test_changed_file_is_archived_and_replaced() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");
        gate(&remote, db.path(), true).check().await.unwrap();

        seed_release(&remote, "20200201000000", b"genome_id\n10.1\n10.2\n");
        let outcome = gate(&remote, db.path(), true).check().await.unwrap();

        assert!(outcome.resync_required);
        assert_eq!(outcome.updated, vec!["genome_summary".to_string()]);
        assert_eq!(outcome.local_version.as_deref(), Some("202001"));
        assert_eq!(outcome.remote_version, "202002");
        let archive = outcome.archive.unwrap();
        assert_eq!(archive, db.path().join("202001.RELEASE_NOTES.bkp.tar.gz"));
        assert!(archive.exists());

        let release = db.path().join(RELEASE_DIR);
        assert_eq!(
            std::fs::read(release.join("genome_summary")).unwrap(),
            b"genome_id\n10.1\n10.2\n"
        );
        assert_eq!(std::fs::read_to_string(release.join(VERSION_FILE)).unwrap(), "202002");
    }

    #[tokio::test]
    async fn test_missing_file_fetched_without_archive_when_disabled() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");
        gate(&remote, db.path(), false).check().await.unwrap();

        let release = db.path().join(RELEASE_DIR);
        std::fs::remove_file(release.join("genome_lineage")).unwrap();
        let outcome = gate(&remote, db.path(), false).check().await.unwrap();
        assert!(outcome.resync_required);
        assert_eq!(outcome.updated, vec!["genome_lineage".to_string()]);
        assert_eq!(outcome.archive, None);
        assert!(release.join("genome_lineage").exists());
    }

    #[tokio::test]
    async fn test_corrupted_local_file_restored_at_same_version() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");
        gate(&remote, db.path(), true).check().await.unwrap();

        let release = db.path().join(RELEASE_DIR);
        std::fs::write(release.join("genome_lineage"), b"garbage").unwrap();

        let outcome = gate(&remote, db.path(), true).check().await.unwrap();
        assert!(outcome.resync_required);
        assert_eq!(outcome.updated, vec!["genome_lineage".to_string()]);
        assert_eq!(outcome.local_version.as_deref(), Some("202001"));
        assert_eq!(outcome.remote_version, "202001");
        assert_eq!(
            std::fs::read(release.join("genome_lineage")).unwrap(),
            b"genome_id\tkingdom\n10.1\tBacteria\n"
        );
        assert_eq!(
            std::fs::read(release.join("genome_summary")).unwrap(),
            b"genome_id\n10.1\n"
        );
        assert!(no_part_files(&release));
    }

    #[tokio::test]
    async fn test_unknown_local_version_names_archive() {
        let db = tempfile::tempdir().unwrap();
        let release = db.path().join(RELEASE_DIR);
        std::fs::create_dir_all(&release).unwrap();
        std::fs::write(release.join("genome_summary"), b"stale").unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");

        let outcome = gate(&remote, db.path(), true).check().await.unwrap();
        assert_eq!(
            outcome.archive,
            Some(db.path().join("unknown_version.RELEASE_NOTES.bkp.tar.gz"))
        );
    }

    #[tokio::test]
    async fn test_transport_error_leaves_state_untouched() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n10.1\n");
        gate(&remote, db.path(), false).check().await.unwrap();

        remote.put(RELEASE_DIR, "genome_summary", "20200301000000", b"new");
        remote.fail_fetch_of("RELEASE_NOTES/genome_lineage");
        let err = gate(&remote, db.path(), false).check().await.unwrap_err();
        assert!(matches!(err, ReleaseError::Transport(_)));

        let release = db.path().join(RELEASE_DIR);
        assert_eq!(std::fs::read_to_string(release.join(VERSION_FILE)).unwrap(), "202001");
        assert_eq!(
            std::fs::read(release.join("genome_summary")).unwrap(),
            b"genome_id\n10.1\n"
        );
        assert!(no_part_files(&release));
    }

    #[tokio::test]
    async fn test_missing_distinguished_file_errors() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, TS, b"genome_id\n");
        remote.remove(RELEASE_DIR, "genome_summary");
        let err = gate(&remote, db.path(), false).check().await.unwrap_err();
        assert!(matches!(err, ReleaseError::MissingRemoteFile(f) if f == "genome_summary"));
    }

    #[tokio::test]
    async fn test_bad_timestamp_errors() {
        let db = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed_release(&remote, "2020", b"genome_id\n");
        let err = gate(&remote, db.path(), false).check().await.unwrap_err();
        assert!(matches!(err, ReleaseError::BadTimestamp { .. }));
    }
}
