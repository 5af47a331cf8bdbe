//! Consistency check of the processed list against what is on disk.
//!
//! An ID belongs in the processed list only if its directory holds a
//! readable manifest and every file that manifest names.

use std::path::Path;

use crate::state::{self, ProcessedSet};
use crate::sync::validate_entity_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    InvalidId,
    MissingManifest,
    UnreadableManifest(String),
    MissingFiles(Vec<String>),
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Problem::InvalidId => write!(f, "invalid id"),
            Problem::MissingManifest => write!(f, "no manifest"),
            Problem::UnreadableManifest(e) => write!(f, "unreadable manifest: {e}"),
            Problem::MissingFiles(files) => {
                write!(f, "{} file(s) missing: {}", files.len(), files.join(", "))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub broken: Vec<(String, Problem)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

async fn check_entity(entities_dir: &Path, id: &str) -> Option<Problem> {
    if validate_entity_id(id).is_err() {
        return Some(Problem::InvalidId);
    }
    let dir = entities_dir.join(id);
    let manifest = match state::read_manifest(&dir).await {
        Ok(Some(m)) => m,
        Ok(None) => return Some(Problem::MissingManifest),
        Err(e) => return Some(Problem::UnreadableManifest(e.to_string())),
    };
    let missing: Vec<String> = manifest
        .filenames()
        .filter(|name| !dir.join(name).is_file())
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(Problem::MissingFiles(missing))
    }
}

/// Check every processed ID.
pub async fn verify_processed(entities_dir: &Path, processed: &ProcessedSet) -> VerifyReport {
    let mut report = VerifyReport::default();
    for id in processed.iter() {
        report.checked += 1;
        if let Some(problem) = check_entity(entities_dir, id).await {
            tracing::debug!(entity = id, %problem, "Processed entity failed verification");
            report.broken.push((id.to_string(), problem));
        }
    }
    report
}

/// Drop every broken ID from `processed`. Returns how many were removed.
pub fn prune(processed: &mut ProcessedSet, report: &VerifyReport) -> usize {
    report
        .broken
        .iter()
        .filter(|(id, _)| processed.remove(id))
        .count()
}
