//! One course pass: title -> access check -> discover -> download -> extract ->
//! persist, for a single URL or for every course under the storage root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use csync_adapters::{extract_course_title, TreeDiscoverer};
use csync_core::{is_access_denied_title, CourseMetadata, FileRecord, SyncState, UNKNOWN_COURSE};
use csync_storage::{ArchiveMaterializer, Downloader, PortalSession};
use tracing::{info, info_span, warn, Instrument};

use crate::access::{AccessGate, ProbeOutcome};
use crate::metadata::{directory_name, KnownCourse, MetadataStore};
use crate::update_log::UpdateLog;
use crate::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourseOutcome {
    Success,
    NoFilesFound,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct CourseReport {
    pub source_url: String,
    pub course_title: String,
    pub course_dir: Option<PathBuf>,
    pub outcome: CourseOutcome,
    /// The stored title is still an access-denied placeholder.
    pub placeholder_title: bool,
    pub files_found: usize,
    /// Files written during this pass.
    pub downloaded: Vec<PathBuf>,
    pub skipped: usize,
    pub failed: usize,
    pub extracted: usize,
}

impl CourseReport {
    fn failed(
        source_url: impl Into<String>,
        course_title: impl Into<String>,
        course_dir: Option<PathBuf>,
        reason: String,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            course_title: course_title.into(),
            course_dir,
            outcome: CourseOutcome::Error(reason),
            placeholder_title: false,
            files_found: 0,
            downloaded: Vec::new(),
            skipped: 0,
            failed: 0,
            extracted: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, CourseOutcome::Error(_))
    }

    /// Downloaded files relative to the course directory.
    pub fn downloaded_relative(&self) -> Vec<String> {
        let Some(dir) = &self.course_dir else {
            return Vec::new();
        };
        self.downloaded
            .iter()
            .map(|path| path.strip_prefix(dir).unwrap_or(path).display().to_string())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub courses: Vec<CourseReport>,
    pub sync_state: SyncState,
}

impl RunSummary {
    pub fn files_found(&self) -> usize {
        self.courses.iter().map(|c| c.files_found).sum()
    }

    pub fn downloaded(&self) -> usize {
        self.courses.iter().map(|c| c.downloaded.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.courses.iter().map(|c| c.skipped).sum()
    }

    pub fn extracted(&self) -> usize {
        self.courses.iter().map(|c| c.extracted).sum()
    }

    pub fn failed_courses(&self) -> usize {
        self.courses.iter().filter(|c| c.is_error()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_courses() == 0
    }
}

struct ResolvedTitle {
    title: String,
    dir: Option<PathBuf>,
    placeholder: bool,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    discoverer: TreeDiscoverer,
    downloader: Downloader,
    materializer: ArchiveMaterializer,
    metadata: MetadataStore,
    update_log: UpdateLog,
    gate: AccessGate,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let discoverer = TreeDiscoverer::new(config.discovery.clone())
            .context("building page classifier")?;
        Ok(Self {
            discoverer,
            downloader: Downloader::new(config.download.clone()),
            materializer: ArchiveMaterializer::new(),
            metadata: MetadataStore::new(),
            update_log: UpdateLog::new(config.storage_root.clone()),
            gate: AccessGate::new(config.probe_sample),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn sync_state(&self) -> SyncState {
        self.update_log.sync_state().await
    }

    pub async fn known_courses(&self) -> Result<Vec<KnownCourse>> {
        let root = &self.config.storage_root;
        let scan = self
            .metadata
            .scan(root)
            .await
            .with_context(|| format!("scanning {}", root.display()))?;
        for (dir, err) in &scan.unreadable {
            warn!(dir = %dir.display(), error = %err, "ignoring unreadable course metadata");
        }
        Ok(scan.courses)
    }

    pub async fn probe(&self, session: &dyn PortalSession) -> Result<ProbeOutcome> {
        let courses = self.known_courses().await?;
        Ok(self.gate.probe(&courses, session).await)
    }

    /// Single-course mode: the course directory is derived from its title.
    pub async fn sync_course(&self, url: &str, session: &dyn PortalSession) -> Result<CourseReport> {
        tokio::fs::create_dir_all(&self.config.storage_root)
            .await
            .with_context(|| format!("creating {}", self.config.storage_root.display()))?;
        self.run_course(url, None, session)
            .instrument(info_span!("course", url))
            .await
    }

    /// Fleet mode: every course with a metadata document under the storage root.
    /// A failing course is reported and the rest continue.
    pub async fn update_all(&self, session: &dyn PortalSession) -> Result<RunSummary> {
        let root = &self.config.storage_root;
        let scan = self
            .metadata
            .scan(root)
            .await
            .with_context(|| format!("scanning {}", root.display()))?;
        info!(courses = scan.courses.len(), root = %root.display(), "updating all known courses");

        let mut reports = Vec::new();
        for (dir, err) in scan.unreadable {
            warn!(dir = %dir.display(), error = %err, "course metadata unreadable, skipping");
            let title = directory_name(&dir).unwrap_or_default();
            reports.push(CourseReport::failed("", title, Some(dir), err.to_string()));
        }

        let total = scan.courses.len();
        for (index, course) in scan.courses.iter().enumerate() {
            let url = course.metadata.source_url.clone();
            let span = info_span!("course", url = %url, n = index + 1, total);
            match self.run_course(&url, Some(course), session).instrument(span).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(url = %url, error = %reason, "course failed, continuing with the next");
                    reports.push(CourseReport::failed(
                        url,
                        course.metadata.course_title.clone(),
                        Some(course.dir.clone()),
                        reason,
                    ));
                }
            }
        }

        let success = reports.iter().all(|r| !r.is_error());
        let sync_state = match self.update_log.record_run_outcome(success).await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "could not record run outcome");
                self.update_log.sync_state().await
            }
        };
        Ok(RunSummary {
            courses: reports,
            sync_state,
        })
    }

    async fn run_course(
        &self,
        url: &str,
        known: Option<&KnownCourse>,
        session: &dyn PortalSession,
    ) -> Result<CourseReport> {
        let page = session
            .get_page(url)
            .await
            .with_context(|| format!("fetching course page {url}"))?;
        let extracted = extract_course_title(&page.body).context("reading course title")?;
        let resolved = self.resolve_title(url, extracted, known).await;
        let title = resolved.title;
        info!(course = %title, "course");

        let course_dir = resolved
            .dir
            .unwrap_or_else(|| self.config.storage_root.join(&title));
        tokio::fs::create_dir_all(&course_dir)
            .await
            .with_context(|| format!("creating {}", course_dir.display()))?;

        let tasks = self
            .discoverer
            .discover(url, &course_dir, session, &title)
            .await;

        let mut report = CourseReport {
            source_url: url.to_string(),
            course_title: title.clone(),
            course_dir: Some(course_dir.clone()),
            outcome: CourseOutcome::NoFilesFound,
            placeholder_title: resolved.placeholder,
            files_found: tasks.len(),
            downloaded: Vec::new(),
            skipped: 0,
            failed: 0,
            extracted: 0,
        };

        if tasks.is_empty() {
            warn!(course = %title, "no downloadable files found");
            self.persist(url, &title, &course_dir, Vec::new()).await?;
            return Ok(report);
        }

        let history = match self.metadata.load(&course_dir).await {
            Ok(previous) => previous.map(|m| m.file_history).unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "could not read earlier downloads, relying on file names only");
                Vec::new()
            }
        };
        let summary = self
            .downloader
            .download_all_with_history(&tasks, session, &history)
            .await;
        report.downloaded = summary.records.iter().map(|r| r.file_path.clone()).collect();
        report.skipped = summary.skipped;
        report.failed = summary.failed;
        info!(
            downloaded = summary.downloaded(),
            skipped = summary.skipped,
            failed = summary.failed,
            total = tasks.len(),
            "downloads finished"
        );

        report.extracted = self.extract_new(report.downloaded.clone()).await;
        self.persist(url, &title, &course_dir, summary.records).await?;
        report.outcome = CourseOutcome::Success;
        Ok(report)
    }

    async fn resolve_title(
        &self,
        url: &str,
        extracted: Option<String>,
        known: Option<&KnownCourse>,
    ) -> ResolvedTitle {
        if !AccessGate::is_placeholder_title(extracted.as_deref()) {
            return ResolvedTitle {
                title: extracted.unwrap_or_else(|| UNKNOWN_COURSE.to_string()),
                dir: known.map(|k| k.dir.clone()),
                placeholder: false,
            };
        }
        let placeholder = extracted.unwrap_or_else(|| UNKNOWN_COURSE.to_string());
        warn!(url, title = %placeholder, "course title looks like an access-denied placeholder");

        let prior = match known {
            Some(course) => Some(course.clone()),
            None => self
                .metadata
                .find_by_source(&self.config.storage_root, url)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "could not look up earlier syncs of this course");
                    None
                }),
        };

        if let Some(prior) = &prior {
            if !is_access_denied_title(&prior.metadata.course_title) {
                info!(title = %prior.metadata.course_title, "using previously stored course title");
                return ResolvedTitle {
                    title: prior.metadata.course_title.clone(),
                    dir: Some(prior.dir.clone()),
                    placeholder: false,
                };
            }
            if let Some(name) = directory_name(&prior.dir).filter(|n| !is_access_denied_title(n)) {
                info!(title = %name, "using course directory name as title");
                return ResolvedTitle {
                    title: name,
                    dir: Some(prior.dir.clone()),
                    placeholder: false,
                };
            }
        }

        warn!(
            "course {url} returned {placeholder:?} instead of its title.\n\
             The portal session has probably expired or lacks access to this course.\n\
             Log in to the portal in your browser again, refresh the exported cookie, then re-run."
        );
        ResolvedTitle {
            title: placeholder,
            dir: prior.map(|p| p.dir),
            placeholder: true,
        }
    }

    async fn extract_new(&self, files: Vec<PathBuf>) -> usize {
        if files.is_empty() {
            return 0;
        }
        let materializer = self.materializer;
        match tokio::task::spawn_blocking(move || materializer.extract_new(&files)).await {
            Ok(count) => {
                if count > 0 {
                    info!(archives = count, "archives extracted");
                }
                count
            }
            Err(err) => {
                warn!(error = %err, "archive extraction task failed");
                0
            }
        }
    }

    /// Saves course metadata, even for an empty pass, then merges the update log.
    async fn persist(
        &self,
        url: &str,
        title: &str,
        course_dir: &Path,
        records: Vec<FileRecord>,
    ) -> Result<CourseMetadata> {
        let update = CourseMetadata {
            course_title: title.to_string(),
            source_url: url.to_string(),
            last_fetched: Utc::now(),
            file_history: records.clone(),
        };
        let merged = self
            .metadata
            .save(course_dir, &update)
            .await
            .with_context(|| format!("saving metadata for {title}"))?;
        self.update_log
            .record_pass(title, &records, merged.last_fetched)
            .await
            .context("updating recent updates log")?;
        Ok(merged)
    }
}
