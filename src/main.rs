//! cirtap-rs: incremental mirror of the PATRIC genomes FTP site.
//!
//! A run checks the release notes for changes, then brings every genome
//! directory listed in the release summary up to date, re-fetching only
//! files whose remote timestamps moved. Progress is remembered in plain
//! files so interrupted runs can resume.

#![warn(clippy::all)]

mod checksum;
mod cli;
mod config;
mod diff;
mod mirror;
mod release;
mod remote;
pub mod retry;
mod scheduler;
mod shutdown;
mod state;
mod sync;
mod types;
mod verify;

#[cfg(test)]
mod test_support;

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cli::Command;
use remote::FtpSource;
use state::{CacheLock, ProcessedSet};

fn init_logging(cli: &cli::Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));

    let file_layer = match &cli.log_file {
        Some(path) => {
            let path = config::expand_tilde(path);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Run the mirror command.
async fn run_mirror(args: cli::MirrorArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::info!(
        db_dir = %config.db_dir.display(),
        concurrency = config.jobs,
        "Starting cirtap-rs"
    );
    tracing::debug!(?config, "Resolved configuration");

    let ctx = config.mirror_context();
    let source = Arc::new(FtpSource::new(config.ftp.clone()));
    let interrupts = shutdown::install_signal_handler()?;

    let report = mirror::mirror(&ctx, source, interrupts.clone())
        .await
        .context("Mirror run failed")?;
    report.log_summary();

    if let Some(jobs) = &report.jobs {
        for (entity, error) in &jobs.failed {
            tracing::error!(entity = %entity, "Sync failed: {}", error);
        }
        for entity in &jobs.cancelled {
            tracing::warn!(entity = %entity, "Interrupted, will be retried on the next run");
        }
    }
    if interrupts.is_stopped() {
        tracing::info!("Stopped early on request; rerun to continue");
    }
    Ok(())
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let (db_dir, cache_dir) = config::resolve_dirs(&args.db_dir, args.cache_dir.as_deref());
    let ctx = mirror::MirrorContext {
        cache_dir,
        ..mirror::MirrorContext::new(db_dir)
    };

    if !ctx.db_dir.is_dir() {
        println!("No mirror found at {}", ctx.db_dir.display());
        println!("Run `cirtap-rs mirror` first.");
        return Ok(());
    }

    let release_dir = ctx.release_dir();
    let version = state::read_version_marker(&release_dir).await?;
    let manifest = state::read_manifest(&release_dir).await?;
    let processed = ProcessedSet::load(&ctx.processed_path()).await?;

    println!("Mirror: {}", ctx.db_dir.display());
    println!();
    println!(
        "Release version: {}",
        version.as_deref().unwrap_or(release::UNKNOWN_VERSION)
    );
    match manifest.filter(|m| !m.is_empty()) {
        Some(m) => {
            println!("Release files:");
            for (name, entry) in m.iter() {
                println!(
                    "  {:<24} {}  {}",
                    name,
                    entry.modify_timestamp,
                    entry.checksum.as_deref().unwrap_or("-")
                );
            }
        }
        None => println!("Release files: none recorded"),
    }
    println!();
    println!("Processed genomes: {}", processed.len());
    println!("Cache: {}", ctx.cache_dir.display());

    Ok(())
}

/// Run the verify command.
async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let (db_dir, cache_dir) = config::resolve_dirs(&args.db_dir, args.cache_dir.as_deref());
    let ctx = mirror::MirrorContext {
        cache_dir,
        ..mirror::MirrorContext::new(db_dir)
    };
    let processed_path = ctx.processed_path();

    if !processed_path.exists() {
        println!("No processed list found at {}", processed_path.display());
        return Ok(());
    }

    let _lock = if args.prune {
        Some(CacheLock::acquire(&ctx.cache_dir).await?)
    } else {
        None
    };

    let mut processed = ProcessedSet::load(&processed_path).await?;
    println!("Verifying {} processed genomes...", processed.len());

    let report = verify::verify_processed(&ctx.entities_dir(), &processed).await;
    for (id, problem) in &report.broken {
        println!("BROKEN: {} - {}", id, problem);
    }

    println!();
    println!("Results:");
    println!("  Checked: {}", report.checked);
    println!("  Broken:  {}", report.broken.len());

    if report.is_clean() {
        return Ok(());
    }

    if args.prune {
        let removed = verify::prune(&mut processed, &report);
        processed.persist(&processed_path).await?;
        println!("  Pruned:  {} (will be retried on the next run)", removed);
        return Ok(());
    }

    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Command::Mirror(args) => run_mirror(args).await,
        Command::Status(args) => run_status(args).await,
        Command::Verify(args) => run_verify(args).await,
    }
}
