//! SHA-256 content digests, hex encoded.

use std::path::Path;

use sha2::{Digest, Sha256};

fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Digest an in-memory buffer.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

/// Digest a local file without loading it into memory.
pub async fn checksum_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(to_hex(&hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            checksum_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_empty_digest() {
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("genome_summary");
        std::fs::write(&p, b"genome_id\tgenome_name\n10.1\tfoo\n").unwrap();
        let from_file = checksum_file(&p).await.unwrap();
        assert_eq!(from_file, checksum_bytes(b"genome_id\tgenome_name\n10.1\tfoo\n"));
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = checksum_file(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
