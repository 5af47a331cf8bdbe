//! Remote file-transfer access.
//!
//! [`RemoteSource`] opens connections; each [`RemoteSession`] is owned by a
//! single caller for its whole lifetime and is never shared between sync
//! workers. Nothing in here retries: that is the sync worker's job.

pub mod error;
pub mod ftp;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

pub use error::TransportError;
pub use ftp::{FtpSettings, FtpSource};

/// A single file in a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRecord {
    pub filename: String,
    /// `YYYYMMDDHHMMSS`, lexicographically sortable.
    pub modify_timestamp: String,
}

/// Files of one remote directory keyed by filename.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    records: BTreeMap<String, RemoteFileRecord>,
}

impl RemoteListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filename: impl Into<String>, modify_timestamp: impl Into<String>) {
        let filename = filename.into();
        self.records.insert(
            filename.clone(),
            RemoteFileRecord {
                filename,
                modify_timestamp: modify_timestamp.into(),
            },
        );
    }

    pub fn get(&self, filename: &str) -> Option<&RemoteFileRecord> {
        self.records.get(filename)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &RemoteFileRecord> {
        self.records.values()
    }

    /// Flatten to `filename -> timestamp`, the shape the change detector
    /// compares against local manifests.
    pub fn timestamps(&self) -> BTreeMap<String, String> {
        self.records
            .iter()
            .map(|(name, rec)| (name.clone(), rec.modify_timestamp.clone()))
            .collect()
    }
}

impl FromIterator<(String, String)> for RemoteListing {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut listing = RemoteListing::new();
        for (name, ts) in iter {
            listing.insert(name, ts);
        }
        listing
    }
}

/// Opens authenticated connections to the remote server.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, TransportError>;

    /// Human-readable endpoint for log lines.
    fn describe(&self) -> String;
}

/// One open connection.
#[async_trait]
pub trait RemoteSession: Send {
    /// List regular files in `remote_dir`. Sub-directories are skipped.
    async fn list(&mut self, remote_dir: &str) -> Result<RemoteListing, TransportError>;

    /// Retrieve a whole file into memory.
    async fn fetch(&mut self, remote_path: &str) -> Result<Vec<u8>, TransportError>;

    /// Stream a file to `local_path`, creating or truncating it.
    async fn fetch_to(&mut self, remote_path: &str, local_path: &Path)
        -> Result<(), TransportError>;

    /// Politely end the session. Failures here are not interesting.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_timestamps_sorted_by_name() {
        let listing: RemoteListing = [
            ("b.faa".to_string(), "20200102000000".to_string()),
            ("a.fna".to_string(), "20200101000000".to_string()),
        ]
        .into_iter()
        .collect();
        let ts = listing.timestamps();
        let names: Vec<_> = ts.keys().cloned().collect();
        assert_eq!(names, vec!["a.fna", "b.faa"]);
        assert_eq!(ts["a.fna"], "20200101000000");
    }

    #[test]
    fn test_listing_insert_overwrites() {
        let mut listing = RemoteListing::new();
        listing.insert("a.fna", "1");
        listing.insert("a.fna", "2");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing.get("a.fna").unwrap().modify_timestamp, "2");
    }
}
