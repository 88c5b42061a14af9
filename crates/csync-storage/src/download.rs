//! Path-keyed, at-most-once file downloads.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csync_core::{has_extension, sanitize_path_segment, DownloadTask, FileRecord};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{FetchError, PortalSession};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> DownloadError {
    let context = context.into();
    move |source| DownloadError::Io { context, source }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Appended to names that carry no extension; portal content is mostly documents.
    pub default_extension: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            default_extension: "pdf".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadSummary {
    /// Files written during this call, in task order.
    pub records: Vec<FileRecord>,
    pub skipped: usize,
    pub failed: usize,
}

impl DownloadSummary {
    pub fn downloaded(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug)]
enum TaskOutcome {
    Downloaded(FileRecord),
    AlreadyPresent(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct Downloader {
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }

    fn with_default_extension(&self, name: &str) -> String {
        let ext = self.config.default_extension.trim_start_matches('.');
        format!("{name}.{ext}")
    }

    /// Paths whose existence means the task was already satisfied by an earlier pass.
    pub fn candidate_paths(&self, task: &DownloadTask) -> Vec<PathBuf> {
        let name = sanitized_or_default(&task.suggested_name);
        let mut candidates = vec![task.target_directory.join(&name)];
        if !has_extension(&name) {
            candidates.push(task.target_directory.join(self.with_default_extension(&name)));
        }
        candidates
    }

    /// Final filename once the server hint is known.
    pub fn resolve_filename(&self, task: &DownloadTask, filename_hint: Option<&str>) -> String {
        let from_hint = filename_hint
            .map(sanitize_path_segment)
            .filter(|name| !name.is_empty());
        let name = from_hint.unwrap_or_else(|| sanitized_or_default(&task.suggested_name));
        if has_extension(&name) {
            name
        } else {
            self.with_default_extension(&name)
        }
    }

    /// Runs every task in order. A failing task is logged and counted; it never
    /// stops the remaining tasks.
    pub async fn download_all(
        &self,
        tasks: &[DownloadTask],
        session: &dyn PortalSession,
    ) -> DownloadSummary {
        self.download_all_with_history(tasks, session, &[]).await
    }

    /// Like [`Downloader::download_all`], but a file an earlier pass saved from the
    /// same URL into the same directory also counts as present. A server-side
    /// filename that differs from the link text is then not requested again.
    pub async fn download_all_with_history(
        &self,
        tasks: &[DownloadTask],
        session: &dyn PortalSession,
        history: &[FileRecord],
    ) -> DownloadSummary {
        let mut summary = DownloadSummary::default();
        let mut swept = HashSet::new();
        let total = tasks.len();
        for (index, task) in tasks.iter().enumerate() {
            if swept.insert(task.target_directory.clone()) {
                let removed = sweep_partial_files(&task.target_directory).await;
                if removed > 0 {
                    info!(dir = %task.target_directory.display(), removed, "removed leftovers of interrupted writes");
                }
            }
            let span = info_span!("download", url = %task.url, n = index + 1, total);
            match self.download_one(task, session, history).instrument(span).await {
                Ok(TaskOutcome::Downloaded(record)) => summary.records.push(record),
                Ok(TaskOutcome::AlreadyPresent(path)) => {
                    debug!(path = %path.display(), "skipped, already present");
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(url = %task.url, name = %task.suggested_name, error = %err, "download failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn download_one(
        &self,
        task: &DownloadTask,
        session: &dyn PortalSession,
        history: &[FileRecord],
    ) -> Result<TaskOutcome, DownloadError> {
        fs::create_dir_all(&task.target_directory)
            .await
            .map_err(io_err(format!(
                "creating directory {}",
                task.target_directory.display()
            )))?;

        let saved_earlier = history
            .iter()
            .filter(|record| {
                record.source_url.as_deref() == Some(task.url.as_str())
                    && record.file_path.parent() == Some(task.target_directory.as_path())
            })
            .map(|record| record.file_path.clone());
        for candidate in self.candidate_paths(task).into_iter().chain(saved_earlier) {
            if path_exists(&candidate).await? {
                return Ok(TaskOutcome::AlreadyPresent(candidate));
            }
        }

        let mut response = session.open_download(&task.url).await?;
        let filename = self.resolve_filename(task, response.filename_hint.as_deref());
        let final_path = task.target_directory.join(&filename);

        // A server-side name can land on a file an earlier task or pass already wrote.
        if path_exists(&final_path).await? {
            return Ok(TaskOutcome::AlreadyPresent(final_path));
        }

        let temp_path = task
            .target_directory
            .join(format!(".{}.part", Uuid::new_v4()));
        let written = match stream_to_file(&mut *response.body, &temp_path).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(source) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DownloadError::Io {
                context: format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    final_path.display()
                ),
                source,
            });
        }

        info!(path = %final_path.display(), bytes = written, "saved");
        Ok(TaskOutcome::Downloaded(FileRecord {
            file_path: final_path,
            timestamp: Utc::now(),
            course_name: task.course_title.clone(),
            size_bytes: written,
            source_url: Some(task.url.clone()),
        }))
    }
}

fn sanitized_or_default(name: &str) -> String {
    let name = sanitize_path_segment(name);
    if name.is_empty() {
        "download".to_string()
    } else {
        name
    }
}

/// `.<uuid>.part` and `.<uuid>.tmp`: temp files of an atomic write.
pub fn is_partial_file_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('.') else {
        return false;
    };
    rest.strip_suffix(".part")
        .or_else(|| rest.strip_suffix(".tmp"))
        .is_some_and(|stem| Uuid::parse_str(stem).is_ok())
}

/// Deletes temp files that an interrupted write left in `dir`. Writes run one at
/// a time, so nothing else can own them. Returns how many were removed.
pub async fn sweep_partial_files(dir: &Path) -> usize {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(dir = %dir.display(), error = %err, "cannot list directory for leftovers");
            }
            return 0;
        }
    };
    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "stopped listing directory");
                break;
            }
        };
        if !entry.file_name().to_str().is_some_and(is_partial_file_name) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove leftover temp file"),
        }
    }
    removed
}

async fn path_exists(path: &Path) -> Result<bool, DownloadError> {
    fs::try_exists(path)
        .await
        .map_err(io_err(format!("checking {}", path.display())))
}

async fn stream_to_file(
    body: &mut dyn crate::ChunkSource,
    path: &Path,
) -> Result<u64, DownloadError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(io_err(format!("opening {}", path.display())))?;

    let mut written = 0u64;
    while let Some(chunk) = body.next_chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(io_err(format!("writing {}", path.display())))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(io_err(format!("flushing {}", path.display())))?;
    Ok(written)
}
