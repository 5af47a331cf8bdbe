//! Per-entity incremental sync.
//!
//! One [`EntitySyncWorker::sync`] call brings one remote directory up to date
//! on disk: list, diff against the stored manifest, fetch what changed, then
//! record the listing as the new manifest. Transport failures are retried
//! with linear backoff; a pass that cannot complete leaves no directory
//! behind.

pub mod error;
pub mod file;
pub mod workdir;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::diff;
use crate::remote::{RemoteListing, RemoteSession, RemoteSource, TransportError};
use crate::retry::{RetryPolicy, Sleeper};
use crate::state::{self, Manifest, MANIFEST_FILE};

pub use error::SyncError;
use workdir::EntityDir;

/// Remote root that holds one directory per entity.
pub const DEFAULT_REMOTE_ROOT: &str = "genomes";

/// Worker phases, reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Start,
    ListRemote,
    Diff,
    Fetch,
    PersistManifest,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local parent of all entity directories.
    pub entities_root: PathBuf,
    pub remote_root: String,
    pub retry: RetryPolicy,
    pub write_manifest: bool,
}

impl SyncConfig {
    pub fn new(entities_root: PathBuf) -> Self {
        Self {
            entities_root,
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            retry: RetryPolicy::default(),
            write_manifest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { fetched: usize, attempts: u32 },
    Cancelled,
}

/// How a single attempt ended when it did not succeed.
enum AttemptError {
    Transport(TransportError),
    Cancelled,
    Fatal(SyncError),
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::LocalWrite { path, source } => {
                AttemptError::Fatal(SyncError::io(path, source))
            }
            other => AttemptError::Transport(other),
        }
    }
}

/// Reject IDs that could escape the entities root.
pub fn validate_entity_id(entity: &str) -> Result<(), SyncError> {
    let bad = entity.is_empty()
        || entity == "."
        || entity.contains('/')
        || entity.contains('\\')
        || entity.contains("..")
        || entity.chars().any(char::is_control);
    if bad {
        return Err(SyncError::InvalidEntity(entity.to_string()));
    }
    Ok(())
}

/// Remote names we are willing to write inside an entity directory.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && name != MANIFEST_FILE
        && !name.ends_with(".part")
}

pub struct EntitySyncWorker {
    source: Arc<dyn RemoteSource>,
    sleeper: Arc<dyn Sleeper>,
    config: SyncConfig,
}

impl EntitySyncWorker {
    pub fn new(source: Arc<dyn RemoteSource>, sleeper: Arc<dyn Sleeper>, config: SyncConfig) -> Self {
        Self {
            source,
            sleeper,
            config,
        }
    }

    pub fn entity_dir(&self, entity: &str) -> PathBuf {
        self.config.entities_root.join(entity)
    }

    /// Run one full pass for `entity`.
    ///
    /// Cancellation is reported as [`SyncOutcome::Cancelled`], not an error.
    pub async fn sync(
        &self,
        entity: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        validate_entity_id(entity)?;
        tracing::debug!(entity, state = ?SyncState::Start, "Starting entity pass");

        let dir_path = self.entity_dir(entity);
        let workdir = EntityDir::acquire(dir_path.clone())
            .await
            .map_err(|e| SyncError::io(&dir_path, e))?;

        let local = match state::read_manifest(workdir.path()).await {
            Ok(m) => m.map(|m| m.timestamps()),
            Err(e) => {
                tracing::warn!(entity, error = %e, "Unreadable manifest, treating as never synced");
                None
            }
        };

        let remote_dir = format!("{}/{}", self.config.remote_root, entity);
        let retry = self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = self
                .attempt(entity, &remote_dir, workdir.path(), local.as_ref(), cancel)
                .await;

            let err = match result {
                Ok(fetched) => {
                    workdir.keep();
                    tracing::debug!(entity, state = ?SyncState::Done, attempt, fetched, "Entity pass complete");
                    return Ok(SyncOutcome::Synced {
                        fetched,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Cancelled) => {
                    purge(workdir, entity).await;
                    return Ok(SyncOutcome::Cancelled);
                }
                Err(AttemptError::Fatal(e)) => {
                    workdir.keep();
                    tracing::error!(entity, error = %e, "Entity pass failed on local error");
                    return Err(e);
                }
                Err(AttemptError::Transport(e)) => e,
            };

            tracing::debug!(entity, state = ?SyncState::Failed, attempt, error = %err, "Attempt failed");

            if !err.is_retryable() {
                purge(workdir, entity).await;
                return Err(SyncError::Transport {
                    entity: entity.to_string(),
                    source: err,
                });
            }
            if !retry.has_attempt_after(attempt) {
                purge(workdir, entity).await;
                return Err(SyncError::RetriesExhausted {
                    entity: entity.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = retry.delay_after(attempt);
            tracing::warn!(
                entity,
                attempt,
                max_attempts = retry.max_attempts,
                delay_secs = delay.as_secs(),
                error = %err,
                "Transport error, retrying"
            );
            tokio::select! {
                () = self.sleeper.sleep(delay) => {}
                () = cancel.cancelled() => {
                    purge(workdir, entity).await;
                    return Ok(SyncOutcome::Cancelled);
                }
            }
        }
    }

    async fn attempt(
        &self,
        entity: &str,
        remote_dir: &str,
        dir: &Path,
        local: Option<&BTreeMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<usize, AttemptError> {
        if cancel.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }
        let mut session = tokio::select! {
            r = self.source.connect() => r?,
            () = cancel.cancelled() => return Err(AttemptError::Cancelled),
        };
        let result = self
            .run_pass(session.as_mut(), entity, remote_dir, dir, local, cancel)
            .await;
        session.close().await;
        let listing = result?;

        if self.config.write_manifest {
            tracing::debug!(entity, state = ?SyncState::PersistManifest, "Writing manifest");
            state::write_manifest(dir, &Manifest::from_listing(&listing.listing))
                .await
                .map_err(|e| AttemptError::Fatal(SyncError::State(e)))?;
        }
        Ok(listing.fetched)
    }

    async fn run_pass(
        &self,
        session: &mut dyn RemoteSession,
        entity: &str,
        remote_dir: &str,
        dir: &Path,
        local: Option<&BTreeMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<PassResult, AttemptError> {
        tracing::debug!(entity, state = ?SyncState::ListRemote, remote_dir, "Listing");
        let raw = tokio::select! {
            r = session.list(remote_dir) => r?,
            () = cancel.cancelled() => return Err(AttemptError::Cancelled),
        };
        let listing: RemoteListing = raw
            .records()
            .filter(|rec| {
                let ok = is_safe_filename(&rec.filename);
                if !ok {
                    tracing::warn!(entity, filename = %rec.filename, "Skipping unsafe remote filename");
                }
                ok
            })
            .map(|rec| (rec.filename.clone(), rec.modify_timestamp.clone()))
            .collect();

        if listing.is_empty() {
            tracing::warn!(entity, remote_dir, "Remote directory lists no files");
        }
        tracing::debug!(entity, state = ?SyncState::Diff, files = listing.len(), "Diffing");
        let remote_ts = listing.timestamps();
        let mut targets = diff::compute_targets(&remote_ts, local);
        targets.extend(diff::missing_on_disk(dir, listing.filenames()));

        let removed = diff::removed_remotely(&remote_ts, local);
        if !removed.is_empty() {
            tracing::info!(
                entity,
                count = removed.len(),
                "Files no longer on remote, keeping local copies"
            );
        }

        tracing::debug!(entity, state = ?SyncState::Fetch, targets = targets.len(), "Fetching");
        for name in &targets {
            let remote_path = format!("{}/{}", remote_dir, name);
            let local_path = dir.join(name);
            tokio::select! {
                r = file::fetch_into_place(session, &remote_path, &local_path) => r?,
                () = cancel.cancelled() => return Err(AttemptError::Cancelled),
            }
        }

        Ok(PassResult {
            listing,
            fetched: targets.len(),
        })
    }
}

struct PassResult {
    listing: RemoteListing,
    fetched: usize,
}

async fn purge(workdir: EntityDir, entity: &str) {
    let path = workdir.path().to_path_buf();
    if let Err(e) = workdir.purge().await {
        tracing::error!(entity, path = %path.display(), error = %e, "Failed to remove entity directory");
    } else {
        tracing::debug!(entity, "Removed entity directory");
    }
}
