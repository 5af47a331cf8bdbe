//! Snapshot of the release directory taken before it is overwritten.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// `<db_dir>/<version>.RELEASE_NOTES.bkp.tar.gz`
pub fn archive_path(db_dir: &Path, version: &str) -> PathBuf {
    db_dir.join(format!("{version}.RELEASE_NOTES.bkp.tar.gz"))
}

/// Write a gzipped tarball of `files` (names inside `release_dir`) to
/// `dest`. Entries are stored as `<release_dir name>/<file>`; names that do
/// not exist are skipped.
pub async fn write_archive(
    release_dir: &Path,
    files: Vec<String>,
    dest: &Path,
) -> std::io::Result<usize> {
    let release_dir = release_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_archive_blocking(&release_dir, &files, &dest))
        .await
        .map_err(std::io::Error::other)?
}

fn write_archive_blocking(release_dir: &Path, files: &[String], dest: &Path) -> std::io::Result<usize> {
    let prefix = release_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("RELEASE_NOTES"));

    let mut part_name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    part_name.push(".part");
    let part = dest.with_file_name(part_name);

    let result = (|| -> std::io::Result<usize> {
        let encoder = GzEncoder::new(File::create(&part)?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut added = 0;
        for name in files {
            let path = release_dir.join(name);
            if !path.is_file() {
                continue;
            }
            builder.append_path_with_name(&path, prefix.join(name))?;
            added += 1;
        }
        builder.into_inner()?.finish()?;
        Ok(added)
    })();

    match result {
        Ok(added) => {
            std::fs::rename(&part, dest)?;
            Ok(added)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&part);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn entry_names(archive: &Path) -> Vec<String> {
        let mut ar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        let mut names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_archive_path() {
        assert_eq!(
            archive_path(Path::new("/db"), "202001"),
            PathBuf::from("/db/202001.RELEASE_NOTES.bkp.tar.gz")
        );
    }

    #[tokio::test]
    async fn test_archive_contains_present_files_only() {
        let db = tempfile::tempdir().unwrap();
        let release = db.path().join("RELEASE_NOTES");
        std::fs::create_dir(&release).unwrap();
        std::fs::write(release.join("genome_summary"), b"genome_id\n10.1\n").unwrap();
        std::fs::write(release.join("VERSION"), b"202001").unwrap();

        let dest = archive_path(db.path(), "202001");
        let added = write_archive(
            &release,
            vec!["genome_summary".into(), "genome_lineage".into(), "VERSION".into()],
            &dest,
        )
        .await
        .unwrap();

        assert_eq!(added, 2);
        assert_eq!(
            entry_names(&dest),
            vec!["RELEASE_NOTES/VERSION", "RELEASE_NOTES/genome_summary"]
        );
        assert!(!db.path().join("202001.RELEASE_NOTES.bkp.tar.gz.part").exists());
    }
}
