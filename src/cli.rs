use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "cirtap-rs",
    version,
    about = "Incrementally mirror the PATRIC genomes FTP site"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Also append logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sync release notes and genome directories
    Mirror(MirrorArgs),
    /// Show the local release version and processed-genome count
    Status(StatusArgs),
    /// Check that every processed genome still has its manifest and files
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
pub struct MirrorArgs {
    /// Root of the local mirror
    pub db_dir: String,

    /// Cache directory (default: DB_DIR/.cache)
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Number of genomes synced concurrently
    #[arg(short = 'j', long, default_value_t = 1)]
    pub jobs: usize,

    /// Do not check RELEASE_NOTES for updates
    #[arg(long)]
    pub skip_release_check: bool,

    /// Skip genomes already listed in the cache
    #[arg(long)]
    pub skip_processed_genomes: bool,

    /// Sync genomes even if the release did not change
    #[arg(long)]
    pub force_check: bool,

    /// Shorthand for --skip-release-check --skip-processed-genomes
    #[arg(short = 'r', long)]
    pub resume: bool,

    /// Archive RELEASE_NOTES before overwriting them
    #[arg(long)]
    pub archive_notes: bool,

    /// FTP server host
    #[arg(long, default_value = "ftp.patricbrc.org")]
    pub host: String,

    /// FTP server port
    #[arg(long, default_value_t = 21)]
    pub port: u16,

    /// FTP user
    #[arg(long, default_value = "anonymous")]
    pub user: String,

    /// FTP password.
    /// WARNING: passing via --password is visible in process listings.
    /// Prefer the CIRTAP_FTP_PASSWORD environment variable instead.
    #[arg(long, env = "CIRTAP_FTP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Attempts per genome before giving up
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Base delay in seconds between attempts (grows linearly)
    #[arg(long, default_value_t = 60)]
    pub retry_delay: u64,

    /// Persist the processed list every N synced genomes (0 = only at the end)
    #[arg(long, default_value_t = 100)]
    pub checkpoint_every: usize,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Root of the local mirror
    pub db_dir: String,

    /// Cache directory (default: DB_DIR/.cache)
    #[arg(long)]
    pub cache_dir: Option<String>,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Root of the local mirror
    pub db_dir: String,

    /// Cache directory (default: DB_DIR/.cache)
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Drop broken genomes from the processed list so the next run retries them
    #[arg(long)]
    pub prune: bool,
}
