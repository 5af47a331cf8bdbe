//! The set of entity IDs known to be fully mirrored.

use std::collections::BTreeSet;
use std::path::Path;

use super::error::StateError;
use super::write_atomic;

pub const PROCESSED_FILE: &str = "processed_genomes.txt";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedSet {
    ids: BTreeSet<String>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns whether the ID was newly added.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    /// Only `verify --prune` removes members; sync failures never do.
    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Load from disk. A missing file is an empty set.
    pub async fn load(path: &Path) -> Result<Self, StateError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No processed list found");
                return Ok(Self::new());
            }
            Err(e) => return Err(StateError::read(path, e)),
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Rewrite the whole file, one ID per line, sorted.
    pub async fn persist(&self, path: &Path) -> Result<(), StateError> {
        let mut out = String::with_capacity(self.ids.len() * 12);
        for id in &self.ids {
            out.push_str(id);
            out.push('\n');
        }
        write_atomic(path, out.as_bytes()).await
    }
}

impl FromIterator<String> for ProcessedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl Extend<String> for ProcessedSet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.ids.extend(iter);
    }
}
