use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::IngestError;

/// Writes `content` next to `path` and renames it into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), IngestError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".pubmed-ingest")
        .tempfile_in(parent)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn extract_tgz(archive_path: &Path, target_dir: &Path) -> Result<(), IngestError> {
    let file = fs::File::open(archive_path).map_err(|err| {
        IngestError::Filesystem(format!("open archive {}: {err}", archive_path.display()))
    })?;
    fs::create_dir_all(target_dir).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|err| IngestError::Archive(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| IngestError::Archive(err.to_string()))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| IngestError::Archive(err.to_string()))?;
        if !unpacked {
            return Err(IngestError::Archive(
                "archive entry path traversal detected".to_string(),
            ));
        }
    }
    Ok(())
}

/// First `.pdf` file under `root`, visiting entries in name order so the
/// choice is stable across runs.
pub fn find_first_pdf(root: &Path) -> Result<Option<PathBuf>, IngestError> {
    let mut entries = fs::read_dir(root)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    entries.sort();

    for path in &entries {
        if path.is_file() && has_pdf_extension(path) {
            return Ok(Some(path.clone()));
        }
    }
    for path in &entries {
        if path.is_dir() {
            if let Some(found) = find_first_pdf(path)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn build_tgz(path: &Path, files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn extract_and_find_nested_pdf() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("PMC1.tar.gz");
        build_tgz(
            &archive,
            &[
                ("PMC1/article.nxml", b"<article/>"),
                ("PMC1/figures/fig1.jpg", b"jpg"),
                ("PMC1/main.PDF", b"%PDF-1.4"),
            ],
        );
        let target = temp.path().join("out");
        extract_tgz(&archive, &target).unwrap();

        let found = find_first_pdf(&target).unwrap().unwrap();
        assert!(found.ends_with("PMC1/main.PDF"));
    }

    #[test]
    fn archive_without_pdf() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("PMC2.tar.gz");
        build_tgz(&archive, &[("PMC2/article.nxml", b"<article/>")]);
        let target = temp.path().join("out");
        extract_tgz(&archive, &target).unwrap();
        assert_eq!(find_first_pdf(&target).unwrap(), None);
    }

    #[test]
    fn malformed_archive_is_an_archive_error() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("broken.tar.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();
        let err = extract_tgz(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, IngestError::Archive(_)));
    }

    #[test]
    fn write_atomic_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("doc.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
