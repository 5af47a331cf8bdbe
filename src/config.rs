use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cli::MirrorArgs;
use crate::mirror::{MirrorContext, DEFAULT_CACHE_DIR};
use crate::remote::FtpSettings;
use crate::retry::RetryPolicy;

/// Password sent for anonymous FTP logins.
const ANONYMOUS_PASSWORD: &str = "anonymous@";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),

    #[error("--jobs must be at least 1")]
    ZeroConcurrency,

    #[error("--max-attempts must be at least 1")]
    ZeroAttempts,

    #[error("--timeout must be at least 1 second")]
    ZeroTimeout,

    #[error("--host must not be empty")]
    EmptyHost,

    #[error("Cache directory is in use by another run (lock: {0})")]
    CacheLocked(PathBuf),

    #[error("{0} not found; run once without --skip-release-check/--resume")]
    MissingSummary(PathBuf),
}

/// Validated settings for a mirror run.
#[derive(Debug)]
pub struct Config {
    pub db_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub ftp: FtpSettings,

    pub jobs: usize,
    pub checkpoint_every: usize,
    pub retry_delay_secs: u64,
    pub max_attempts: u32,

    pub skip_release_check: bool,
    pub skip_processed: bool,
    pub force_check: bool,
    pub resume: bool,
    pub archive_notes: bool,
    pub no_progress_bar: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// `(db_dir, cache_dir)` with the cache defaulting to `<db_dir>/.cache`.
pub fn resolve_dirs(db_dir: &str, cache_dir: Option<&str>) -> (PathBuf, PathBuf) {
    let db_dir = expand_tilde(db_dir);
    let cache_dir = cache_dir
        .map(expand_tilde)
        .unwrap_or_else(|| db_dir.join(DEFAULT_CACHE_DIR));
    (db_dir, cache_dir)
}

fn ensure_dir_or_absent(path: &Path) -> Result<(), ConfigError> {
    if path.exists() && !path.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }
    Ok(())
}

impl Config {
    pub fn from_cli(args: MirrorArgs) -> Result<Self, ConfigError> {
        if args.jobs == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if args.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if args.timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if args.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        let (db_dir, cache_dir) = resolve_dirs(&args.db_dir, args.cache_dir.as_deref());
        ensure_dir_or_absent(&db_dir)?;
        ensure_dir_or_absent(&cache_dir)?;

        let password = args
            .password
            .unwrap_or_else(|| ANONYMOUS_PASSWORD.to_string());

        Ok(Self {
            db_dir,
            cache_dir,
            ftp: FtpSettings {
                host: args.host.trim().to_string(),
                port: args.port,
                user: args.user,
                password,
                timeout: Duration::from_secs(args.timeout),
            },
            jobs: args.jobs,
            checkpoint_every: args.checkpoint_every,
            retry_delay_secs: args.retry_delay,
            max_attempts: args.max_attempts,
            skip_release_check: args.skip_release_check,
            skip_processed: args.skip_processed_genomes,
            force_check: args.force_check,
            resume: args.resume,
            archive_notes: args.archive_notes,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn mirror_context(&self) -> MirrorContext {
        MirrorContext {
            db_dir: self.db_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            concurrency: self.jobs,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_secs(self.retry_delay_secs),
            },
            checkpoint_every: self.checkpoint_every,
            skip_release_check: self.skip_release_check,
            skip_processed: self.skip_processed,
            force_check: self.force_check,
            resume: self.resume,
            archive_notes: self.archive_notes,
            no_progress_bar: self.no_progress_bar,
        }
    }
}
