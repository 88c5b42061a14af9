//! Core domain model for mirroring portal courses onto local storage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Title used when a course page yields nothing usable.
pub const UNKNOWN_COURSE: &str = "Unknown Course";

/// One rendered entry found while walking a portal page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    pub url: String,
    pub logical_path: PathBuf,
    pub name: String,
    pub is_folder: bool,
}

/// A file leaf that the downloader should materialize under `target_directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub target_directory: PathBuf,
    pub suggested_name: String,
    pub course_title: String,
}

/// A file fetched during some sync pass. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub course_name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl FileRecord {
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Durable per-course record, one per course directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseMetadata {
    pub course_title: String,
    pub source_url: String,
    pub last_fetched: DateTime<Utc>,
    /// Newest first.
    pub file_history: Vec<FileRecord>,
}

impl CourseMetadata {
    pub fn new(course_title: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            course_title: course_title.into(),
            source_url: source_url.into(),
            last_fetched: Utc::now(),
            file_history: Vec::new(),
        }
    }

    /// Folds `records` into the history, drops exact repeats and re-sorts newest first.
    pub fn merge_history(&mut self, records: impl IntoIterator<Item = FileRecord>) {
        for record in records {
            let already_known = self.file_history.iter().any(|existing| {
                existing.file_path == record.file_path && existing.timestamp == record.timestamp
            });
            if !already_known {
                self.file_history.push(record);
            }
        }
        sort_newest_first(&mut self.file_history);
    }

    /// Moves `last_fetched` to `now`, or just past the previous value when the clock
    /// has not advanced.
    pub fn touch(&mut self, previous: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.last_fetched = match previous {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
    }
}

pub fn sort_newest_first(records: &mut [FileRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Process-wide sync state derived from the global update log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub last_update: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
}

impl SyncState {
    pub fn is_due(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        match self.last_update {
            Some(last) => now - last >= min_interval,
            None => true,
        }
    }

    pub fn updated_on(&self, date: NaiveDate) -> bool {
        self.last_update
            .map(|last| last.date_naive() == date)
            .unwrap_or(false)
    }
}

/// Lower-case phrases that mark a page title as an access-denied placeholder.
/// Matched as substrings.
pub const ACCESS_DENIED_MARKERS: &[&str] = &[
    // German
    "kein zugriffsrecht",
    "keine berechtigung",
    "zugriff verweigert",
    "nicht angemeldet",
    "sitzung abgelaufen",
    "anmeldung erforderlich",
    // English
    "access denied",
    "permission denied",
    "no permission",
    "not permitted",
    "you do not have",
    "session expired",
    "session has expired",
    // placeholders
    "unknown course",
];

/// Login page words. These also occur inside real titles ("Dialog", "Biologie"),
/// so they only count as whole words.
pub const LOGIN_PAGE_WORDS: &[&str] = &["anmelden", "login", "log in", "sign in", "unauthorized"];

/// Case-insensitive match against [`ACCESS_DENIED_MARKERS`] and [`LOGIN_PAGE_WORDS`].
pub fn is_access_denied_title(title: &str) -> bool {
    let lower = title.to_lowercase();
    let trimmed = lower.trim();
    if trimmed.is_empty() {
        return true;
    }
    if ACCESS_DENIED_MARKERS
        .iter()
        .any(|marker| trimmed.contains(marker))
    {
        return true;
    }
    let words = trimmed
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    LOGIN_PAGE_WORDS.iter().any(|marker| {
        let needle = marker.split(' ').collect::<Vec<_>>();
        words.windows(needle.len()).any(|window| window == needle.as_slice())
    })
}

const ILLEGAL_PATH_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Turns page text into a single filesystem-safe path segment.
///
/// Returns an empty string when nothing usable is left; callers treat that as
/// "no name".
pub fn sanitize_path_segment(name: &str) -> String {
    let cleaned = name
        .chars()
        .filter(|c| !ILLEGAL_PATH_CHARS.contains(c) && !c.is_control())
        .collect::<String>();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    match cleaned.as_str() {
        "." | ".." => String::new(),
        _ => cleaned,
    }
}

pub fn has_extension(name: &str) -> bool {
    Path::new(name).extension().is_some()
}

/// `1536` -> `"1.5 KB"`.
pub fn format_file_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
