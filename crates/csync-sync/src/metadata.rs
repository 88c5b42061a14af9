//! Per-course `METADATA.md`: authoritative YAML front matter followed by a
//! human-readable view regenerated on every save.
//!
//! Older documents carry only the human view (`Course:`, `Source:` and
//! `Last fetched:` lines plus a history table). They are decoded from that view
//! and rewritten in the current form on the next save.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csync_core::{
    format_file_size, sort_newest_first, CourseMetadata, FileRecord, UNKNOWN_COURSE,
};
use csync_storage::sweep_partial_files;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::document::{
    anchor_path, escape_html, front_matter, human_timestamp, parse_timestamp, relative_path,
    split_front_matter, table_row, write_atomic,
};

pub const METADATA_FILE: &str = "METADATA.md";
pub const REDIRECT_FILE: &str = "SOURCE.html";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding metadata header: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("malformed metadata document {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("scanning {root} for courses: {message}")]
    Scan { root: PathBuf, message: String },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> MetadataError {
    let context = context.into();
    move |source| MetadataError::Io { context, source }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Relative to the course directory, `/`-separated.
    pub path: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataHeader {
    pub course_title: String,
    pub source_url: String,
    pub last_fetched: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<HistoryEntry>,
}

/// What could be recovered from a document without front matter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyDocument {
    pub course_title: Option<String>,
    pub source_url: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    /// `(timestamp, relative path)`; the old format never recorded sizes.
    pub rows: Vec<(DateTime<Utc>, String)>,
}

impl LegacyDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("Course:") {
                doc.course_title.get_or_insert_with(|| value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Source:") {
                doc.source_url.get_or_insert_with(|| value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Last fetched:") {
                doc.last_fetched = doc.last_fetched.or_else(|| parse_timestamp(value));
            } else if let Some(cells) = table_row(line) {
                let (Some(ts), Some(path)) = (cells.first(), cells.get(1)) else {
                    continue;
                };
                match parse_timestamp(ts) {
                    Some(ts) if !path.is_empty() => doc.rows.push((ts, path.to_string())),
                    _ => debug!(line, "ignoring unreadable history row"),
                }
            }
        }
        doc
    }
}

/// A decoded `METADATA.md`, tagged by format generation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataDocument {
    Current(MetadataHeader),
    Legacy(LegacyDocument),
}

impl MetadataDocument {
    /// Never fails: an unreadable header degrades to the human view.
    pub fn decode(text: &str) -> Self {
        if let Some((yaml, _)) = split_front_matter(text) {
            match serde_yaml::from_str::<MetadataHeader>(yaml) {
                Ok(header) => return Self::Current(header),
                Err(err) => {
                    warn!(error = %err, "metadata header unreadable, reading the table view instead")
                }
            }
        }
        Self::Legacy(LegacyDocument::parse(text))
    }

    /// Maps either generation onto the in-memory model, anchoring history paths
    /// at `course_dir`.
    pub fn normalize(self, course_dir: &Path) -> Result<CourseMetadata, MetadataError> {
        let mut metadata = match self {
            Self::Current(header) => {
                let title = header.course_title;
                let file_history = header
                    .files
                    .into_iter()
                    .map(|entry| FileRecord {
                        file_path: anchor_path(course_dir, &entry.path),
                        timestamp: entry.timestamp,
                        course_name: title.clone(),
                        size_bytes: entry.size_bytes,
                        source_url: entry.source_url,
                    })
                    .collect();
                CourseMetadata {
                    course_title: title,
                    source_url: header.source_url,
                    last_fetched: header.last_fetched,
                    file_history,
                }
            }
            Self::Legacy(doc) => {
                let source_url = doc.source_url.filter(|url| !url.is_empty()).ok_or_else(|| {
                    MetadataError::Malformed {
                        path: course_dir.join(METADATA_FILE),
                        reason: "no `Source:` line".to_string(),
                    }
                })?;
                let title = doc
                    .course_title
                    .filter(|t| !t.is_empty())
                    .or_else(|| directory_name(course_dir))
                    .unwrap_or_else(|| UNKNOWN_COURSE.to_string());
                let file_history = doc
                    .rows
                    .into_iter()
                    .map(|(timestamp, path)| FileRecord {
                        file_path: anchor_path(course_dir, &path),
                        timestamp,
                        course_name: title.clone(),
                        size_bytes: 0,
                        source_url: None,
                    })
                    .collect::<Vec<_>>();
                let last_fetched = doc
                    .last_fetched
                    .or_else(|| file_history.iter().map(|r| r.timestamp).max())
                    .unwrap_or_default();
                CourseMetadata {
                    course_title: title,
                    source_url,
                    last_fetched,
                    file_history,
                }
            }
        };
        sort_newest_first(&mut metadata.file_history);
        Ok(metadata)
    }
}

pub(crate) fn directory_name(dir: &Path) -> Option<String> {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// A course directory found under a storage root.
#[derive(Debug, Clone)]
pub struct KnownCourse {
    pub dir: PathBuf,
    pub metadata: CourseMetadata,
}

#[derive(Debug, Default)]
pub struct CourseScan {
    pub courses: Vec<KnownCourse>,
    pub unreadable: Vec<(PathBuf, MetadataError)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataStore;

impl MetadataStore {
    pub fn new() -> Self {
        Self
    }

    pub fn document_path(course_dir: &Path) -> PathBuf {
        course_dir.join(METADATA_FILE)
    }

    /// `Ok(None)` when the course has never been synced.
    pub async fn load(&self, course_dir: &Path) -> Result<Option<CourseMetadata>, MetadataError> {
        let path = Self::document_path(course_dir);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(MetadataError::Io {
                    context: format!("reading {}", path.display()),
                    source,
                })
            }
        };
        MetadataDocument::decode(&text)
            .normalize(course_dir)
            .map(Some)
    }

    /// Merges `update` into whatever is already persisted and rewrites the
    /// document and its redirect page. Returns the merged state.
    ///
    /// `last_fetched` always ends up strictly later than the persisted value.
    pub async fn save(
        &self,
        course_dir: &Path,
        update: &CourseMetadata,
    ) -> Result<CourseMetadata, MetadataError> {
        let previous = match self.load(course_dir).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(dir = %course_dir.display(), error = %err, "previous metadata unreadable, starting a fresh history");
                None
            }
        };

        let mut merged = update.clone();
        let previous_fetch = previous.as_ref().map(|p| p.last_fetched);
        merged.merge_history(previous.map(|p| p.file_history).unwrap_or_default());
        merged.touch(previous_fetch, update.last_fetched);

        fs::create_dir_all(course_dir)
            .await
            .map_err(io_err(format!("creating {}", course_dir.display())))?;
        sweep_partial_files(course_dir).await;
        let path = Self::document_path(course_dir);
        write_atomic(&path, render(&merged, course_dir)?.as_bytes())
            .await
            .map_err(io_err(format!("writing {}", path.display())))?;

        let redirect = course_dir.join(REDIRECT_FILE);
        write_atomic(&redirect, redirect_page(&merged).as_bytes())
            .await
            .map_err(io_err(format!("writing {}", redirect.display())))?;

        Ok(merged)
    }

    /// Every directory under `root` holding a metadata document.
    pub async fn scan(&self, root: &Path) -> Result<CourseScan, MetadataError> {
        let walk_root = root.to_path_buf();
        let dirs = tokio::task::spawn_blocking(move || metadata_dirs(&walk_root))
            .await
            .map_err(|err| MetadataError::Scan {
                root: root.to_path_buf(),
                message: err.to_string(),
            })?;

        let mut scan = CourseScan::default();
        for dir in dirs {
            match self.load(&dir).await {
                Ok(Some(metadata)) => scan.courses.push(KnownCourse { dir, metadata }),
                Ok(None) => {}
                Err(err) => scan.unreadable.push((dir, err)),
            }
        }
        Ok(scan)
    }

    /// The course previously synced from `source_url`, if any.
    pub async fn find_by_source(
        &self,
        root: &Path,
        source_url: &str,
    ) -> Result<Option<KnownCourse>, MetadataError> {
        let scan = self.scan(root).await?;
        Ok(scan
            .courses
            .into_iter()
            .filter(|course| course.metadata.source_url == source_url)
            .max_by_key(|course| course.metadata.last_fetched))
    }
}

fn metadata_dirs(root: &Path) -> Vec<PathBuf> {
    jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .sort(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(error = %err, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| {
            entry.file_type().is_file() && entry.file_name().to_str() == Some(METADATA_FILE)
        })
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect()
}

fn render(metadata: &CourseMetadata, course_dir: &Path) -> Result<String, MetadataError> {
    let header = MetadataHeader {
        course_title: metadata.course_title.clone(),
        source_url: metadata.source_url.clone(),
        last_fetched: metadata.last_fetched,
        files: metadata
            .file_history
            .iter()
            .map(|record| HistoryEntry {
                path: relative_path(&record.file_path, course_dir),
                timestamp: record.timestamp,
                size_bytes: record.size_bytes,
                source_url: record.source_url.clone(),
            })
            .collect(),
    };
    let yaml = serde_yaml::to_string(&header)?;

    let mut body = format!(
        "# {title}\n\nCourse: {title}\nSource: {source}\nLast fetched: {fetched}\n\n## Downloaded files\n\n",
        title = metadata.course_title,
        source = metadata.source_url,
        fetched = human_timestamp(metadata.last_fetched),
    );
    if header.files.is_empty() {
        body.push_str("No files downloaded yet.\n");
    } else {
        body.push_str("| Date/Time | File | Size |\n|-----------|------|------|\n");
        for entry in &header.files {
            body.push_str(&format!(
                "| {} | {} | {} |\n",
                human_timestamp(entry.timestamp),
                entry.path,
                format_file_size(entry.size_bytes)
            ));
        }
    }
    Ok(front_matter(&yaml, &body))
}

fn redirect_page(metadata: &CourseMetadata) -> String {
    let url = escape_html(&metadata.source_url);
    let title = escape_html(&metadata.course_title);
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta http-equiv=\"refresh\" content=\"0; url={url}\">\n\
         <title>{title}</title>\n</head>\n<body>\n<a href=\"{url}\">{title}</a>\n</body>\n</html>\n"
    )
}
