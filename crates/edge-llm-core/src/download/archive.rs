//! Archive extraction, selected by a factory keyed on file extension (C4).
//!
//! Extraction happens in-process (`zip`, `flate2`+`tar`, `bzip2`+`tar`,
//! `xz2`+`tar`) rather than via a subprocess, since spawning a child process
//! is frequently unavailable or sandboxed on mobile targets.

use crate::error::{Result, RuntimeError};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Archive extensions accepted by the download engine (§6).
pub fn is_archive_extension(ext: &str) -> bool {
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "zip" | "gz" | "tgz" | "tar" | "bz2" | "tbz2" | "xz" | "txz"
    )
}

/// Extract `archive` into `dest_dir`, selecting the extractor by the
/// archive's extension. A partially extracted directory from a prior failed
/// attempt is not resumable: callers should remove `dest_dir`'s contents
/// before retrying extraction, since none of `zip`/`tar`/`gzip` expose a
/// portable "offset" concept for partial extraction.
pub fn extract(archive: &Path, dest_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir).map_err(|e| RuntimeError::io_with_path(e, dest_dir))?;

    let ext = archive
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let lower_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let result = if ext == "zip" {
        extract_zip(archive, dest_dir)
    } else if lower_name.ends_with(".tar.gz") || ext == "tgz" {
        extract_tar_gz(archive, dest_dir)
    } else if lower_name.ends_with(".tar.bz2") || ext == "tbz2" {
        extract_tar_bz2(archive, dest_dir)
    } else if lower_name.ends_with(".tar.xz") || ext == "txz" {
        extract_tar_xz(archive, dest_dir)
    } else if ext == "tar" {
        extract_tar(archive, dest_dir)
    } else if ext == "gz" {
        extract_gz(archive, dest_dir)
    } else {
        return Err(RuntimeError::UnsupportedArchive { extension: ext });
    };

    result.map_err(|reason| RuntimeError::ExtractionFailed {
        reason: reason.to_string(),
    })?;

    Ok(dest_dir.to_path_buf())
}

fn extract_zip(archive: &Path, dest_dir: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;
    zip.extract(dest_dir).map_err(|e| e.to_string())
}

fn extract_tar(archive: &Path, dest_dir: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let mut tar = tar::Archive::new(BufReader::new(file));
    tar.unpack(dest_dir).map_err(|e| e.to_string())
}

fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest_dir).map_err(|e| e.to_string())
}

fn extract_gz(archive: &Path, dest_dir: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let out_name = archive
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("extracted");
    let out_path = dest_dir.join(out_name);
    let mut out = File::create(&out_path).map_err(|e| e.to_string())?;
    std::io::copy(&mut decoder, &mut out).map_err(|e| e.to_string())?;
    Ok(())
}

fn extract_tar_bz2(archive: &Path, dest_dir: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let decoder = bzip2::read::BzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest_dir).map_err(|e| e.to_string())
}

fn extract_tar_xz(archive: &Path, dest_dir: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    let decoder = xz2::read::XzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest_dir).map_err(|e| e.to_string())
}
