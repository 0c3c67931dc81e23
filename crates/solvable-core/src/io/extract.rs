//! Reading package metadata out of conda artifacts.
//!
//! Handles `.tar.bz2` and `.conda` (a zip holding zstd compressed
//! `info-*.tar.zst` and `pkg-*.tar.zst` tarballs). Only `info/` is unpacked.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use serde_json::Value;
use solvable_schema::{ArchiveType, archive_stem};
use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

use super::http::MetadataFetchError;

/// Unpack `info/` entries of a tar stream into `dest_dir`.
fn extract_info_entries<R: Read>(reader: R, dest_dir: &Path) -> Result<usize, MetadataFetchError> {
    fs::create_dir_all(dest_dir)?;

    let mut archive = tar::Archive::new(reader);
    let mut extracted = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let relative_path: PathBuf = entry.path()?.components().collect();
        if !relative_path.starts_with("info") {
            continue;
        }

        let absolute_path = dest_dir.join(&relative_path);
        // Zip Slip
        if !absolute_path.starts_with(dest_dir)
            || relative_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(MetadataFetchError::Archive(format!(
                "Invalid path in archive: {}",
                relative_path.display()
            )));
        }

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&absolute_path)?;
        extracted += 1;
    }

    Ok(extracted)
}

fn extract_conda(archive_path: &Path, dest_dir: &Path) -> Result<usize, MetadataFetchError> {
    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| MetadataFetchError::Archive(e.to_string()))?;

    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let expected = format!("info-{}.tar.zst", archive_stem(&file_name));
    let member = archive
        .file_names()
        .find(|name| *name == expected)
        .or_else(|| {
            archive
                .file_names()
                .find(|name| name.starts_with("info-") && name.ends_with(".tar.zst"))
        })
        .map(str::to_string)
        .ok_or_else(|| {
            MetadataFetchError::Archive(format!("no info tarball in {file_name}"))
        })?;

    let entry = archive
        .by_name(&member)
        .map_err(|e| MetadataFetchError::Archive(e.to_string()))?;
    extract_info_entries(ZstdDecoder::new(entry)?, dest_dir)
}

/// Unpack the `info/` directory of an artifact into `dest_dir`.
///
/// Returns the path of the unpacked `info` directory.
pub fn extract_info(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf, MetadataFetchError> {
    let name = archive_path.to_string_lossy();
    let count = match ArchiveType::from_filename(&name) {
        Some(ArchiveType::TarBz2) => {
            let reader = BufReader::new(File::open(archive_path)?);
            extract_info_entries(BzDecoder::new(reader), dest_dir)?
        }
        Some(ArchiveType::Conda) => extract_conda(archive_path, dest_dir)?,
        None => {
            return Err(MetadataFetchError::Archive(format!(
                "Unsupported archive format: {name}"
            )));
        }
    };
    tracing::debug!("extracted {count} info files from {name}");
    Ok(dest_dir.join("info"))
}

/// Read `info/run_exports.json` from an artifact. `None` when it has none.
pub fn read_run_exports(
    archive_path: &Path,
    dest_dir: &Path,
) -> Result<Option<Value>, MetadataFetchError> {
    let path = extract_info(archive_path, dest_dir)?.join("run_exports.json");
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| MetadataFetchError::Json {
            url: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Write a `.tar.bz2` artifact holding `files`.
    pub(crate) fn write_tar_bz2(path: &Path, files: &[(&str, &[u8])]) {
        let tar = tar_bytes(files);
        let mut encoder =
            bzip2::write::BzEncoder::new(File::create(path).unwrap(), bzip2::Compression::fast());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap();
    }

    /// Write a `.conda` artifact whose info tarball holds `files`.
    pub(crate) fn write_conda(path: &Path, files: &[(&str, &[u8])]) {
        let stem = archive_stem(&path.file_name().unwrap().to_string_lossy()).to_string();
        let info = zstd::encode_all(tar_bytes(files).as_slice(), 3).unwrap();
        let pkg = zstd::encode_all(tar_bytes(&[("lib/libfoo.so", b"\x7fELF")]).as_slice(), 3).unwrap();

        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("metadata.json", options).unwrap();
        zip.write_all(br#"{"conda_pkg_format_version": 2}"#).unwrap();
        zip.start_file(format!("pkg-{stem}.tar.zst"), options).unwrap();
        zip.write_all(&pkg).unwrap();
        zip.start_file(format!("info-{stem}.tar.zst"), options).unwrap();
        zip.write_all(&info).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_read_run_exports_tar_bz2() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("libfoo-1.2.3-h0_0.tar.bz2");
        write_tar_bz2(
            &archive,
            &[
                ("info/index.json", br#"{"name": "libfoo"}"#),
                ("info/run_exports.json", br#"{"weak": ["libfoo >=1.2.3,<2.0a0"]}"#),
                ("lib/libfoo.so", b"\x7fELF"),
            ],
        );

        let out = dir.path().join("out");
        let value = read_run_exports(&archive, &out).unwrap().unwrap();
        assert_eq!(value["weak"][0], "libfoo >=1.2.3,<2.0a0");
        assert!(!out.join("lib").exists());
    }

    #[test]
    fn test_read_run_exports_conda() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("libfoo-1.2.3-h0_0.conda");
        write_conda(
            &archive,
            &[("info/run_exports.json", br#"{"strong": ["libfoo"]}"#)],
        );

        let value = read_run_exports(&archive, &dir.path().join("out")).unwrap().unwrap();
        assert_eq!(value["strong"][0], "libfoo");
    }

    #[test]
    fn test_missing_run_exports() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bar-1.0-0.tar.bz2");
        write_tar_bz2(&archive, &[("info/index.json", b"{}")]);

        assert!(read_run_exports(&archive, &dir.path().join("out")).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_info(&dir.path().join("foo.zip"), dir.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported archive format"));
    }
}
