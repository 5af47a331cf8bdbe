//! Top-level mirror run: release gate, job planning, entity sync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::ConfigError;
use crate::release::{ReleaseConfig, ReleaseError, ReleaseGate, ReleaseOutcome, RELEASE_DIR, SUMMARY_FILE};
use crate::remote::RemoteSource;
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::scheduler::{self, JobReport, SchedulerConfig, SchedulerError};
use crate::shutdown::Interrupts;
use crate::state::{CacheLock, ProcessedSet, StateError, PROCESSED_FILE};
use crate::sync::{EntitySyncWorker, SyncConfig, DEFAULT_REMOTE_ROOT};

pub const ENTITIES_DIR: &str = "genomes";
pub const DEFAULT_CACHE_DIR: &str = ".cache";
pub const DEFAULT_CHECKPOINT_EVERY: usize = 100;

/// Everything a run needs to know. Built once from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct MirrorContext {
    pub db_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub checkpoint_every: usize,
    pub skip_release_check: bool,
    pub skip_processed: bool,
    pub force_check: bool,
    /// Implies both skip flags.
    pub resume: bool,
    pub archive_notes: bool,
    pub no_progress_bar: bool,
}

impl MirrorContext {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        let db_dir = db_dir.into();
        Self {
            cache_dir: db_dir.join(DEFAULT_CACHE_DIR),
            db_dir,
            concurrency: 1,
            retry: RetryPolicy::default(),
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            skip_release_check: false,
            skip_processed: false,
            force_check: false,
            resume: false,
            archive_notes: false,
            no_progress_bar: false,
        }
    }

    pub fn release_dir(&self) -> PathBuf {
        self.db_dir.join(RELEASE_DIR)
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.db_dir.join(ENTITIES_DIR)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.release_dir().join(SUMMARY_FILE)
    }

    pub fn processed_path(&self) -> PathBuf {
        self.cache_dir.join(PROCESSED_FILE)
    }

    pub fn skips_release_check(&self) -> bool {
        self.skip_release_check || self.resume
    }

    pub fn skips_processed(&self) -> bool {
        self.skip_processed || self.resume
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.db_dir.exists() && !self.db_dir.is_dir() {
            return Err(ConfigError::NotADirectory(self.db_dir.clone()));
        }
        if self.cache_dir.exists() && !self.cache_dir.is_dir() {
            return Err(ConfigError::NotADirectory(self.cache_dir.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct MirrorReport {
    /// `None` when the release check was skipped.
    pub release: Option<ReleaseOutcome>,
    /// `None` when no entity work was warranted.
    pub jobs: Option<JobReport>,
    /// Every entity known to be fully mirrored after this run.
    pub processed: ProcessedSet,
    pub elapsed: Duration,
}

impl MirrorReport {
    pub fn log_summary(&self) {
        tracing::info!("── Summary ──");
        if let Some(release) = &self.release {
            tracing::info!(
                "  release {} ({} file(s) updated)",
                release.remote_version,
                release.updated.len()
            );
        }
        match &self.jobs {
            Some(jobs) => {
                tracing::info!(
                    "  {} synced, {} failed, {} cancelled, {} not started, {} total",
                    jobs.synced.len(),
                    jobs.failed.len(),
                    jobs.cancelled.len(),
                    jobs.not_started(),
                    jobs.jobs
                );
                tracing::info!("  {} files fetched", jobs.files_fetched);
            }
            None => tracing::info!("  no entity sync needed"),
        }
        tracing::info!("  {} entities processed", self.processed.len());
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
    }
}

async fn ensure_dir(path: &Path) -> Result<(), MirrorError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| MirrorError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

/// Run one mirror pass against `source`.
///
/// `interrupts` reaches individual genome passes; stopping it ends the run.
pub async fn mirror(
    ctx: &MirrorContext,
    source: Arc<dyn RemoteSource>,
    interrupts: Interrupts,
) -> Result<MirrorReport, MirrorError> {
    mirror_with_sleeper(ctx, source, Arc::new(TokioSleeper), interrupts).await
}

pub(crate) async fn mirror_with_sleeper(
    ctx: &MirrorContext,
    source: Arc<dyn RemoteSource>,
    sleeper: Arc<dyn Sleeper>,
    interrupts: Interrupts,
) -> Result<MirrorReport, MirrorError> {
    let started = Instant::now();
    ctx.validate()?;

    if !ctx.db_dir.exists() {
        tracing::info!(db_dir = %ctx.db_dir.display(), "Fresh mirror");
    }
    ensure_dir(&ctx.release_dir()).await?;
    ensure_dir(&ctx.entities_dir()).await?;
    ensure_dir(&ctx.cache_dir).await?;

    let _lock = CacheLock::acquire(&ctx.cache_dir).await.map_err(|e| match e {
        StateError::Locked { path } => MirrorError::Config(ConfigError::CacheLocked(path)),
        other => MirrorError::State(other),
    })?;

    let processed = ProcessedSet::load(&ctx.processed_path()).await?;
    tracing::debug!(processed = processed.len(), "Loaded processed set");

    let release = if ctx.skips_release_check() {
        tracing::info!("Skipping release check");
        None
    } else {
        tracing::info!(remote = %source.describe(), "Checking release notes");
        let mut config = ReleaseConfig::new(&ctx.db_dir);
        config.archive_previous = ctx.archive_notes;
        Some(ReleaseGate::new(Arc::clone(&source), config).check().await?)
    };
    let check_entities = release.as_ref().map_or(true, |r| r.resync_required);

    let summary = ctx.summary_path();
    if !summary.is_file() {
        return Err(ConfigError::MissingSummary(summary).into());
    }
    let ids = scheduler::read_entity_ids(&summary).await?;
    let jobs = scheduler::build_jobs(ids, &processed, ctx.skips_processed());

    if !((check_entities && !jobs.is_empty()) || ctx.force_check) {
        tracing::info!("All entities for this release appear to be mirrored");
        return Ok(MirrorReport {
            release,
            jobs: None,
            processed,
            elapsed: started.elapsed(),
        });
    }

    tracing::info!(jobs = jobs.len(), concurrency = ctx.concurrency, "Syncing entities");
    let worker = Arc::new(EntitySyncWorker::new(
        source,
        sleeper,
        SyncConfig {
            entities_root: ctx.entities_dir(),
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            retry: ctx.retry,
            write_manifest: true,
        },
    ));
    let sched = SchedulerConfig {
        concurrency: ctx.concurrency,
        checkpoint_every: ctx.checkpoint_every,
        no_progress_bar: ctx.no_progress_bar,
        processed_path: ctx.processed_path(),
    };
    let report = scheduler::run_jobs(worker, jobs, processed, &sched, interrupts).await?;

    Ok(MirrorReport {
        release,
        processed: report.processed.clone(),
        jobs: Some(report),
        elapsed: started.elapsed(),
    })
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingSleeper;
    use crate::test_support::FakeRemote;

    const TS: &str = "20200105101010";

    fn seed(remote: &FakeRemote, summary_ts: &str, ids: &[&str]) {
        let mut summary = String::from("genome_id\tgenome_name\n");
        for id in ids {
            summary.push_str(&format!("{id}\tname {id}\n"));
            remote.put(&format!("genomes/{id}"), &format!("{id}.fna"), TS, b">x\nACGT\n");
        }
        remote.put(RELEASE_DIR, "genome_summary", summary_ts, summary.as_bytes());
        remote.put(RELEASE_DIR, "genome_metadata", summary_ts, b"genome_id\n");
        remote.put(RELEASE_DIR, "genome_lineage", summary_ts, b"genome_id\n");
        remote.put(RELEASE_DIR, "PATRIC_genomes_AMR.txt", summary_ts, b"genome_id\n");
    }

    async fn run(ctx: &MirrorContext, remote: &FakeRemote) -> Result<MirrorReport, MirrorError> {
        mirror_with_sleeper(
            ctx,
            Arc::new(remote.clone()),
            Arc::new(RecordingSleeper::default()),
            Interrupts::new(),
        )
        .await
    }

    fn context(root: &Path) -> MirrorContext {
        let mut ctx = MirrorContext::new(root.join("db"));
        ctx.concurrency = 2;
        ctx.no_progress_bar = true;
        ctx
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }

    #[test]
    fn test_resume_implies_both_skips() {
        let mut ctx = MirrorContext::new("/db");
        assert!(!ctx.skips_release_check());
        ctx.resume = true;
        assert!(ctx.skips_release_check());
        assert!(ctx.skips_processed());
        assert_eq!(ctx.cache_dir, PathBuf::from("/db/.cache"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut ctx = MirrorContext::new("/db");
        ctx.concurrency = 0;
        assert!(matches!(ctx.validate(), Err(ConfigError::ZeroConcurrency)));

        let mut ctx = MirrorContext::new("/db");
        ctx.retry.max_attempts = 0;
        assert!(matches!(ctx.validate(), Err(ConfigError::ZeroAttempts)));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("db");
        std::fs::write(&file, b"").unwrap();
        let ctx = MirrorContext::new(&file);
        assert!(matches!(ctx.validate(), Err(ConfigError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_fresh_mirror_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &["10.1", "10.2"]);
        let ctx = context(root.path());

        let report = run(&ctx, &remote).await.unwrap();
        let release = report.release.as_ref().unwrap();
        assert!(release.resync_required);
        assert_eq!(release.remote_version, "202001");
        let jobs = report.jobs.as_ref().unwrap();
        assert_eq!(jobs.synced.len(), 2);
        assert_eq!(report.processed.len(), 2);

        assert!(ctx.entities_dir().join("10.1/10.1.fna").exists());
        assert_eq!(
            std::fs::read_to_string(ctx.processed_path()).unwrap(),
            "10.1\n10.2\n"
        );
    }

    #[tokio::test]
    async fn test_unchanged_release_skips_entity_work() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &["10.1"]);
        let ctx = context(root.path());
        run(&ctx, &remote).await.unwrap();
        remote.reset_counters();

        let report = run(&ctx, &remote).await.unwrap();
        assert!(!report.release.unwrap().resync_required);
        assert!(report.jobs.is_none());
        assert!(!remote.fetches().iter().any(|p| p.starts_with("genomes/")));
        assert_eq!(report.processed.len(), 1);
    }

    #[tokio::test]
    async fn test_force_check_runs_entities_anyway() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &["10.1"]);
        let mut ctx = context(root.path());
        run(&ctx, &remote).await.unwrap();
        remote.reset_counters();

        ctx.force_check = true;
        let report = run(&ctx, &remote).await.unwrap();
        let jobs = report.jobs.unwrap();
        assert_eq!(jobs.synced, vec!["10.1".to_string()]);
        assert_eq!(jobs.files_fetched, 0);
    }

    #[tokio::test]
    async fn test_resume_skips_gate_and_processed() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &["10.1", "10.2"]);
        let mut ctx = context(root.path());
        run(&ctx, &remote).await.unwrap();

        std::fs::write(ctx.processed_path(), "10.1\n").unwrap();
        remote.reset_counters();
        ctx.resume = true;
        let report = run(&ctx, &remote).await.unwrap();

        assert!(report.release.is_none());
        assert_eq!(report.jobs.unwrap().synced, vec!["10.2".to_string()]);
        assert!(!remote.fetches().iter().any(|p| p.starts_with("RELEASE_NOTES/")));
    }

    #[tokio::test]
    async fn test_skip_release_check_requires_summary() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        let mut ctx = context(root.path());
        ctx.skip_release_check = true;
        let err = run(&ctx, &remote).await.unwrap_err();
        assert!(matches!(err, MirrorError::Config(ConfigError::MissingSummary(_))));
    }

    #[tokio::test]
    async fn test_locked_cache_is_a_config_error() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &["10.1"]);
        let ctx = context(root.path());
        std::fs::create_dir_all(&ctx.cache_dir).unwrap();
        let _held = CacheLock::acquire(&ctx.cache_dir).await.unwrap();

        let err = run(&ctx, &remote).await.unwrap_err();
        assert!(matches!(err, MirrorError::Config(ConfigError::CacheLocked(_))));
    }

    #[tokio::test]
    async fn test_all_entities_failing_fails_the_run() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &[]);
        // Listed in the summary but absent remotely.
        remote.put(RELEASE_DIR, "genome_summary", TS, b"genome_id\n10.404\n");
        let ctx = context(root.path());

        let err = run(&ctx, &remote).await.unwrap_err();
        assert!(matches!(
            err,
            MirrorError::Scheduler(SchedulerError::AllJobsFailed(1))
        ));
        assert!(!ctx.entities_dir().join("10.404").exists());
    }

    #[tokio::test]
    async fn test_partial_failure_still_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let remote = FakeRemote::new();
        seed(&remote, TS, &["10.1"]);
        remote.put(RELEASE_DIR, "genome_summary", TS, b"genome_id\n10.1\n10.404\n");
        let ctx = context(root.path());

        let report = run(&ctx, &remote).await.unwrap();
        let jobs = report.jobs.unwrap();
        assert_eq!(jobs.synced, vec!["10.1".to_string()]);
        assert_eq!(jobs.failed.len(), 1);
        assert!(!report.processed.contains("10.404"));
    }
}
