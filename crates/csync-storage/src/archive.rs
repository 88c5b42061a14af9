//! Extraction of freshly downloaded archives into sibling directories.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    SevenZip,
}

/// Recognized suffixes, matched case-insensitively; the longest match wins.
const ARCHIVE_SUFFIXES: &[(&str, ArchiveKind)] = &[
    (".tar.gz", ArchiveKind::TarGz),
    (".tar.bz2", ArchiveKind::TarBz2),
    (".tgz", ArchiveKind::TarGz),
    (".tbz2", ArchiveKind::TarBz2),
    (".tbz", ArchiveKind::TarBz2),
    (".zip", ArchiveKind::Zip),
    (".tar", ArchiveKind::Tar),
    (".7z", ArchiveKind::SevenZip),
];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reading zip archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("extracting 7z archive {path}: {message}")]
    SevenZip { path: PathBuf, message: String },
    #[error("extraction target {0} exists and is not a directory")]
    TargetNotDirectory(PathBuf),
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ArchiveError {
    let context = context.into();
    move |source| ArchiveError::Io { context, source }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    NotArchive,
    /// The sibling directory already holds at least one entry.
    AlreadyExtracted(PathBuf),
    /// The format needs a codec this build does not carry.
    CodecUnavailable,
    Extracted(PathBuf),
}

/// Returns the archive kind and the file name with its archive suffix removed.
pub fn detect_archive(path: &Path) -> Option<(ArchiveKind, String)> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let lower = name.to_ascii_lowercase();
    let (suffix, kind) = ARCHIVE_SUFFIXES
        .iter()
        .filter(|(suffix, _)| lower.ends_with(suffix))
        .max_by_key(|(suffix, _)| suffix.len())?;
    let stem = name[..name.len() - suffix.len()].trim().to_string();
    if stem.is_empty() {
        return None;
    }
    Some((*kind, stem))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveMaterializer;

impl ArchiveMaterializer {
    pub fn new() -> Self {
        Self
    }

    /// Did extraction happen? Errors are logged, never propagated.
    pub fn extract_if_archive(&self, path: &Path) -> bool {
        match self.try_extract(path) {
            Ok(ExtractOutcome::Extracted(_)) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "archive extraction failed");
                false
            }
        }
    }

    /// Extracts each archive among `files`; returns how many were extracted.
    pub fn extract_new(&self, files: &[PathBuf]) -> usize {
        files
            .iter()
            .filter(|path| self.extract_if_archive(path))
            .count()
    }

    pub fn try_extract(&self, path: &Path) -> Result<ExtractOutcome, ArchiveError> {
        let Some((kind, stem)) = detect_archive(path) else {
            return Ok(ExtractOutcome::NotArchive);
        };
        let target = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&stem);

        if target.exists() {
            if !target.is_dir() {
                return Err(ArchiveError::TargetNotDirectory(target));
            }
            let mut entries =
                fs::read_dir(&target).map_err(io_err(format!("listing {}", target.display())))?;
            if entries.next().is_some() {
                return Ok(ExtractOutcome::AlreadyExtracted(target));
            }
        }

        if kind == ArchiveKind::SevenZip && !cfg!(feature = "sevenz") {
            warn!(
                path = %path.display(),
                "skipping 7z archive: built without the `sevenz` feature"
            );
            return Ok(ExtractOutcome::CodecUnavailable);
        }

        fs::create_dir_all(&target).map_err(io_err(format!("creating {}", target.display())))?;
        info!(archive = %path.display(), target = %target.display(), ?kind, "extracting");

        if let Err(err) = unpack(kind, path, &target) {
            // Leave no half-filled directory: it would suppress every later attempt.
            let _ = fs::remove_dir_all(&target);
            return Err(err);
        }
        Ok(ExtractOutcome::Extracted(target))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ArchiveError> {
    let file = File::open(path).map_err(io_err(format!("opening {}", path.display())))?;
    Ok(BufReader::new(file))
}

fn unpack_tar(reader: impl Read, path: &Path, target: &Path) -> Result<(), ArchiveError> {
    tar::Archive::new(reader)
        .unpack(target)
        .map_err(io_err(format!("unpacking {}", path.display())))
}

fn unpack(kind: ArchiveKind, path: &Path, target: &Path) -> Result<(), ArchiveError> {
    match kind {
        ArchiveKind::Zip => {
            let zip_err = |source| ArchiveError::Zip {
                path: path.to_path_buf(),
                source,
            };
            let mut archive = zip::ZipArchive::new(open(path)?).map_err(zip_err)?;
            archive.extract(target).map_err(zip_err)
        }
        ArchiveKind::Tar => unpack_tar(open(path)?, path, target),
        ArchiveKind::TarGz => unpack_tar(flate2::read::GzDecoder::new(open(path)?), path, target),
        ArchiveKind::TarBz2 => unpack_tar(bzip2::read::BzDecoder::new(open(path)?), path, target),
        ArchiveKind::SevenZip => unpack_seven_zip(path, target),
    }
}

#[cfg(feature = "sevenz")]
fn unpack_seven_zip(path: &Path, target: &Path) -> Result<(), ArchiveError> {
    sevenz_rust::decompress_file(path, target).map_err(|err| ArchiveError::SevenZip {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(not(feature = "sevenz"))]
fn unpack_seven_zip(path: &Path, _target: &Path) -> Result<(), ArchiveError> {
    Err(ArchiveError::SevenZip {
        path: path.to_path_buf(),
        message: "codec not compiled in".to_string(),
    })
}
