//! Course sync orchestration: metadata persistence, the global update log,
//! the access gate and the per-course pipeline.

use std::path::PathBuf;
use std::time::Duration;

use csync_adapters::DiscoveryConfig;
use csync_storage::{DownloadConfig, HttpClientConfig};

pub mod access;
mod document;
pub mod metadata;
pub mod orchestrator;
pub mod update_log;

pub use access::{AccessGate, ProbeOutcome};
pub use metadata::{
    CourseScan, KnownCourse, LegacyDocument, MetadataDocument, MetadataError, MetadataHeader,
    MetadataStore, METADATA_FILE, REDIRECT_FILE,
};
pub use orchestrator::{CourseOutcome, CourseReport, RunSummary, SyncOrchestrator};
pub use update_log::{UpdateLog, UpdateLogDocument, UPDATE_LOG_FILE};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub storage_root: PathBuf,
    pub http: HttpClientConfig,
    pub download: DownloadConfig,
    pub discovery: DiscoveryConfig,
    /// How many recently synced courses the access probe tries.
    pub probe_sample: usize,
    pub min_update_interval: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./course_downloads"),
            http: HttpClientConfig::default(),
            download: DownloadConfig::default(),
            discovery: DiscoveryConfig::default(),
            probe_sample: 3,
            min_update_interval: chrono::Duration::hours(6),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_root: std::env::var("CSYNC_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            http: HttpClientConfig {
                timeout: Duration::from_secs(env_number("CSYNC_HTTP_TIMEOUT_SECS").unwrap_or(60)),
                user_agent: std::env::var("CSYNC_USER_AGENT")
                    .ok()
                    .or(defaults.http.user_agent),
                cookie: std::env::var("CSYNC_COOKIE").ok(),
                cookie_file: std::env::var("CSYNC_COOKIE_FILE").ok().map(PathBuf::from),
            },
            download: defaults.download,
            discovery: DiscoveryConfig {
                max_depth: env_number("CSYNC_MAX_DEPTH")
                    .map(|depth| depth as usize)
                    .unwrap_or(defaults.discovery.max_depth),
                ..defaults.discovery
            },
            probe_sample: env_number("CSYNC_PROBE_SAMPLE")
                .map(|n| n as usize)
                .unwrap_or(defaults.probe_sample),
            min_update_interval: env_number("CSYNC_MIN_UPDATE_HOURS")
                .map(|hours| chrono::Duration::hours(hours as i64))
                .unwrap_or(defaults.min_update_interval),
        }
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
