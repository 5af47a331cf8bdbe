//! Per-directory TSV manifest: what the remote looked like at the last
//! successful sync of that directory.
//!
//! Format: a header row `fname\tmodify_timestamp`, plus a `checksum` column
//! when any entry carries one (release notes). Rows are sorted by filename,
//! so the same manifest always serializes to the same bytes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::error::StateError;
use super::write_atomic;
use crate::remote::RemoteListing;

pub const MANIFEST_FILE: &str = ".manifest.tsv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub modify_timestamp: String,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    fname: String,
    modify_timestamp: String,
    #[serde(default)]
    checksum: Option<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a remote listing, timestamps only.
    pub fn from_listing(listing: &RemoteListing) -> Self {
        let entries = listing
            .records()
            .map(|rec| {
                (
                    rec.filename.clone(),
                    ManifestEntry {
                        modify_timestamp: rec.modify_timestamp.clone(),
                        checksum: None,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, filename: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(filename.into(), entry);
    }

    pub fn get(&self, filename: &str) -> Option<&ManifestEntry> {
        self.entries.get(filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn timestamps(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, e)| (name.clone(), e.modify_timestamp.clone()))
            .collect()
    }

    fn encode(&self) -> Result<Vec<u8>, csv::Error> {
        let with_checksum = self.entries.values().any(|e| e.checksum.is_some());
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());
        if with_checksum {
            wtr.write_record(["fname", "modify_timestamp", "checksum"])?;
        } else {
            wtr.write_record(["fname", "modify_timestamp"])?;
        }
        for (name, entry) in &self.entries {
            if with_checksum {
                wtr.write_record([
                    name.as_str(),
                    entry.modify_timestamp.as_str(),
                    entry.checksum.as_deref().unwrap_or(""),
                ])?;
            } else {
                wtr.write_record([name.as_str(), entry.modify_timestamp.as_str()])?;
            }
        }
        wtr.into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(bytes);
        let mut manifest = Manifest::new();
        for row in rdr.deserialize() {
            let row: ManifestRow = row?;
            manifest.insert(
                row.fname,
                ManifestEntry {
                    modify_timestamp: row.modify_timestamp,
                    checksum: row.checksum.filter(|c| !c.is_empty()),
                },
            );
        }
        Ok(manifest)
    }
}

/// Read the manifest stored in `dir`.
///
/// `Ok(None)` means the directory has never completed a sync.
pub async fn read_manifest(dir: &Path) -> Result<Option<Manifest>, StateError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "No manifest found");
            return Ok(None);
        }
        Err(e) => return Err(StateError::read(path, e)),
    };
    Manifest::decode(&bytes)
        .map(Some)
        .map_err(|source| StateError::Manifest { path, source })
}

/// Overwrite the manifest stored in `dir`.
pub async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), StateError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = manifest
        .encode()
        .map_err(|source| StateError::Manifest {
            path: path.clone(),
            source,
        })?;
    write_atomic(&path, &bytes).await
}
