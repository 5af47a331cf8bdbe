//! Release version marker: a `YYYYMM` token in a plain-text file.

use std::path::Path;

use super::error::StateError;
use super::write_atomic;

pub const VERSION_FILE: &str = "VERSION";

/// Derive the `YYYYMM` token from a `YYYYMMDDHHMMSS` timestamp.
pub fn version_token(timestamp: &str) -> Option<String> {
    let token = timestamp.get(..6)?;
    token
        .bytes()
        .all(|b| b.is_ascii_digit())
        .then(|| token.to_string())
}

pub async fn read_version_marker(dir: &Path) -> Result<Option<String>, StateError> {
    let path = dir.join(VERSION_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(version_token(text.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StateError::read(path, e)),
    }
}

pub async fn write_version_marker(dir: &Path, token: &str) -> Result<(), StateError> {
    write_atomic(&dir.join(VERSION_FILE), token.as_bytes()).await
}
