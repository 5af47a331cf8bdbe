//! Job planning and bounded-concurrency dispatch of entity passes.
//!
//! A single dispatcher task drives at most `concurrency` passes at once and
//! sends each result over a channel. The receiving loop is the only writer
//! of the processed set.

use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::shutdown::Interrupts;
use crate::state::{ProcessedSet, StateError};
use crate::sync::{EntitySyncWorker, SyncError, SyncOutcome};

/// ID column of the summary TSV.
pub const ID_COLUMN: &str = "genome_id";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to read summary {path}: {source}")]
    Summary { path: PathBuf, source: csv::Error },

    #[error("Summary {path} has no {column} column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("All {0} entity jobs failed")]
    AllJobsFailed(usize),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Dispatcher task failed: {0}")]
    Dispatcher(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Persist the processed set after this many successes; 0 disables.
    pub checkpoint_every: usize,
    pub no_progress_bar: bool,
    pub processed_path: PathBuf,
}

/// Result of one entity pass as seen by the coordinating loop.
#[derive(Debug)]
pub struct JobResult {
    pub entity: String,
    pub result: Result<SyncOutcome, SyncError>,
}

#[derive(Debug, Default)]
pub struct JobReport {
    pub jobs: usize,
    pub synced: Vec<String>,
    pub cancelled: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub files_fetched: usize,
    /// Prior processed set plus every entity synced in this run.
    pub processed: ProcessedSet,
}

impl JobReport {
    /// Jobs that never started because the run was stopped.
    pub fn not_started(&self) -> usize {
        self.jobs - self.synced.len() - self.cancelled.len() - self.failed.len()
    }
}

/// Distinct entity IDs from the `genome_id` column of a tab-separated
/// summary, sorted.
pub async fn read_entity_ids(summary: &Path) -> Result<Vec<String>, SchedulerError> {
    let path = summary.to_path_buf();
    let ids = tokio::task::spawn_blocking(move || read_entity_ids_blocking(&path)).await??;
    tracing::info!(count = ids.len(), summary = %summary.display(), "Loaded entity ids");
    Ok(ids)
}

fn read_entity_ids_blocking(path: &Path) -> Result<Vec<String>, SchedulerError> {
    let summary_err = |source: csv::Error| SchedulerError::Summary {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_path(path)
        .map_err(summary_err)?;
    let column = rdr
        .headers()
        .map_err(summary_err)?
        .iter()
        .position(|h| h.trim() == ID_COLUMN)
        .ok_or_else(|| SchedulerError::MissingColumn {
            path: path.to_path_buf(),
            column: ID_COLUMN.to_string(),
        })?;

    let mut ids = BTreeSet::new();
    for record in rdr.records() {
        let record = record.map_err(summary_err)?;
        if let Some(id) = record.get(column).map(str::trim).filter(|id| !id.is_empty()) {
            ids.insert(id.to_string());
        }
    }
    Ok(ids.into_iter().collect())
}

/// Sorted, deduplicated job list. With `skip_processed` every ID already in
/// `processed` is left out.
pub fn build_jobs(
    ids: impl IntoIterator<Item = String>,
    processed: &ProcessedSet,
    skip_processed: bool,
) -> Vec<String> {
    let ids: BTreeSet<String> = ids.into_iter().collect();
    let total = ids.len();
    let jobs: Vec<String> = ids
        .into_iter()
        .filter(|id| !(skip_processed && processed.contains(id)))
        .collect();
    if skip_processed {
        tracing::debug!(
            skipped = total - jobs.len(),
            remaining = jobs.len(),
            "Skipping already processed entities"
        );
    }
    jobs
}

/// Hidden when disabled or when stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

fn should_checkpoint(succeeded: usize, every: usize) -> bool {
    every > 0 && succeeded > 0 && succeeded % every == 0
}

/// Run every job through `worker` and persist the grown processed set.
///
/// A failing or interrupted job never stops the others. Each pass gets its
/// own token from `interrupts`, so interrupting one purges only that entity.
/// Once the run is stopped no new job starts and in-flight ones clean up.
pub async fn run_jobs(
    worker: Arc<EntitySyncWorker>,
    jobs: Vec<String>,
    processed: ProcessedSet,
    config: &SchedulerConfig,
    interrupts: Interrupts,
) -> Result<JobReport, SchedulerError> {
    let mut report = JobReport {
        jobs: jobs.len(),
        processed,
        ..JobReport::default()
    };
    let pb = create_progress_bar(config.no_progress_bar, jobs.len() as u64);
    let concurrency = config.concurrency.max(1);

    let (tx, mut rx) = mpsc::channel::<JobResult>(concurrency * 2);
    let dispatch = interrupts.clone();
    let dispatcher = tokio::spawn(async move {
        let stop = dispatch.clone();
        stream::iter(jobs)
            .take_while(move |_| std::future::ready(!stop.is_stopped()))
            .map(|entity| {
                let worker = Arc::clone(&worker);
                let interrupts = dispatch.clone();
                async move {
                    let job = interrupts.register(&entity);
                    let result = worker.sync(&entity, job.token()).await;
                    JobResult { entity, result }
                }
            })
            .buffer_unordered(concurrency)
            .for_each(|job| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(job).await;
                }
            })
            .await;
    });

    let mut announced_stop = false;
    while let Some(job) = rx.recv().await {
        if interrupts.is_stopped() && !announced_stop {
            pb.suspend(|| tracing::info!("Run stopped, not starting new entities"));
            announced_stop = true;
        }
        pb.set_message(job.entity.clone());
        match job.result {
            Ok(SyncOutcome::Synced { fetched, .. }) => {
                report.files_fetched += fetched;
                report.processed.insert(job.entity.clone());
                report.synced.push(job.entity);
                if should_checkpoint(report.synced.len(), config.checkpoint_every) {
                    if let Err(e) = report.processed.persist(&config.processed_path).await {
                        pb.suspend(|| tracing::warn!(error = %e, "Processed-set checkpoint failed"));
                    } else {
                        tracing::debug!(processed = report.processed.len(), "Checkpointed processed set");
                    }
                }
            }
            Ok(SyncOutcome::Cancelled) => {
                pb.suspend(|| tracing::info!(entity = %job.entity, "Entity pass interrupted, directory removed"));
                report.cancelled.push(job.entity);
            }
            Err(e) => {
                pb.suspend(|| tracing::error!(entity = %job.entity, error = %e, "Entity sync failed"));
                report.failed.push((job.entity, e.to_string()));
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    let dispatched = dispatcher.await;

    report.processed.persist(&config.processed_path).await?;
    dispatched?;

    if report.jobs > 0 && report.failed.len() == report.jobs {
        return Err(SchedulerError::AllJobsFailed(report.jobs));
    }
    Ok(report)
}
