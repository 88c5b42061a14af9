//! `RECENT_UPDATES.md` at the storage root: every course's newest file events in
//! one reverse-chronological table. Its front matter is also the only place the
//! process-wide [`SyncState`] lives.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use csync_core::{format_file_size, FileRecord, SyncState};
use csync_storage::sweep_partial_files;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::document::{
    front_matter, human_timestamp, parse_timestamp, relative_path, split_front_matter, table_row,
    write_atomic,
};
use crate::metadata::MetadataError;

pub const UPDATE_LOG_FILE: &str = "RECENT_UPDATES.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub course: String,
    /// Relative to the storage root, `/`-separated.
    pub path: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl LogEntry {
    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogDocument {
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<bool>,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

impl UpdateLogDocument {
    pub fn sync_state(&self) -> SyncState {
        SyncState {
            last_update: self.last_update,
            last_success: self.last_success,
        }
    }

    fn decode(text: &str) -> Self {
        if let Some((yaml, _)) = split_front_matter(text) {
            match serde_yaml::from_str(yaml) {
                Ok(doc) => return doc,
                Err(err) => warn!(error = %err, "update log header unreadable, reading the table instead"),
            }
        }
        Self::decode_table(text)
    }

    /// Table-only logs: `| Date/Time | Course | Filename | Relative Path | Size |`.
    fn decode_table(text: &str) -> Self {
        let mut doc = Self::default();
        for line in text.lines() {
            if let Some(value) = line.trim().strip_prefix("Last updated:") {
                doc.last_update = doc.last_update.or_else(|| parse_timestamp(value));
                continue;
            }
            let Some(cells) = table_row(line) else {
                continue;
            };
            let (Some(ts), Some(course), Some(path)) = (cells.first(), cells.get(1), cells.get(3))
            else {
                continue;
            };
            match parse_timestamp(ts) {
                Some(timestamp) => doc.entries.push(LogEntry {
                    timestamp,
                    course: course.to_string(),
                    path: path.to_string(),
                    size_bytes: 0,
                }),
                None => debug!(line, "ignoring unreadable update log row"),
            }
        }
        doc
    }

    fn render(&self) -> Result<String, MetadataError> {
        let yaml = serde_yaml::to_string(self)?;
        let last = self
            .last_update
            .map(human_timestamp)
            .unwrap_or_else(|| "never".to_string());
        let mut body = format!(
            "# Recent Updates\n\nLast updated: {last}\n\n\
             | Date/Time | Course | Filename | Relative Path | Size |\n\
             |-----------|--------|----------|---------------|------|\n"
        );
        for entry in &self.entries {
            body.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                human_timestamp(entry.timestamp),
                entry.course,
                entry.file_name(),
                entry.path,
                format_file_size(entry.size_bytes)
            ));
        }
        Ok(front_matter(&yaml, &body))
    }
}

/// Reader and merge-writer for the storage root's update log.
///
/// Courses run one after another, so writes need no locking.
#[derive(Debug, Clone)]
pub struct UpdateLog {
    root: PathBuf,
}

impl UpdateLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(UPDATE_LOG_FILE)
    }

    /// Missing or unreadable logs read as empty.
    pub async fn read(&self) -> UpdateLogDocument {
        let path = self.path();
        match fs::read_to_string(&path).await {
            Ok(text) => UpdateLogDocument::decode(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => UpdateLogDocument::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "update log unreadable");
                UpdateLogDocument::default()
            }
        }
    }

    pub async fn sync_state(&self) -> SyncState {
        self.read().await.sync_state()
    }

    /// Merges one course pass. `checked_at` is the course's new `last_fetched`;
    /// `last_update` never moves backwards.
    pub async fn record_pass(
        &self,
        course_title: &str,
        records: &[FileRecord],
        checked_at: DateTime<Utc>,
    ) -> Result<SyncState, MetadataError> {
        let mut doc = self.read().await;
        for record in records {
            let entry = LogEntry {
                timestamp: record.timestamp,
                course: course_title.to_string(),
                path: relative_path(&record.file_path, &self.root),
                size_bytes: record.size_bytes,
            };
            if !doc.entries.contains(&entry) {
                doc.entries.push(entry);
            }
        }
        doc.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        doc.last_update = Some(match doc.last_update {
            Some(previous) if previous > checked_at => previous,
            _ => checked_at,
        });
        self.write(&doc).await?;
        Ok(doc.sync_state())
    }

    pub async fn record_run_outcome(&self, success: bool) -> Result<SyncState, MetadataError> {
        let mut doc = self.read().await;
        doc.last_success = Some(success);
        self.write(&doc).await?;
        Ok(doc.sync_state())
    }

    async fn write(&self, doc: &UpdateLogDocument) -> Result<(), MetadataError> {
        let path = self.path();
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| MetadataError::Io {
                context: format!("creating {}", self.root.display()),
                source,
            })?;
        sweep_partial_files(&self.root).await;
        write_atomic(&path, doc.render()?.as_bytes())
            .await
            .map_err(|source| MetadataError::Io {
                context: format!("writing {}", path.display()),
                source,
            })
    }
}
