//! Is the current session still authenticated?

use csync_core::is_access_denied_title;
use csync_storage::PortalSession;
use tracing::{debug, info, warn};

use crate::metadata::KnownCourse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Authenticated { url: String },
    Denied { tried: Vec<String> },
    NoKnownCourses,
}

impl ProbeOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccessGate {
    sample_size: usize,
}

impl AccessGate {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }

    /// A missing title counts as a placeholder.
    pub fn is_placeholder_title(title: Option<&str>) -> bool {
        title.map_or(true, is_access_denied_title)
    }

    /// Requests the most recently synced courses; one successful response is
    /// enough.
    pub async fn probe(&self, courses: &[KnownCourse], session: &dyn PortalSession) -> ProbeOutcome {
        if courses.is_empty() {
            return ProbeOutcome::NoKnownCourses;
        }
        let mut recent = courses.iter().collect::<Vec<_>>();
        recent.sort_by(|a, b| b.metadata.last_fetched.cmp(&a.metadata.last_fetched));

        let mut tried = Vec::new();
        for course in recent.into_iter().take(self.sample_size) {
            let url = &course.metadata.source_url;
            match session.get_page(url).await {
                Ok(page) => {
                    info!(url = %url, status = page.status, "session is authenticated");
                    return ProbeOutcome::Authenticated { url: url.clone() };
                }
                Err(err) => {
                    debug!(url = %url, error = %err, "probe request failed");
                    tried.push(url.clone());
                }
            }
        }
        warn!(tried = tried.len(), "no probed course was reachable");
        ProbeOutcome::Denied { tried }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use csync_core::CourseMetadata;
    use csync_storage::StaticSession;
    use std::path::PathBuf;

    fn course(url: &str, hour: u32) -> KnownCourse {
        let mut metadata = CourseMetadata::new("c", url);
        metadata.last_fetched = Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap();
        KnownCourse {
            dir: PathBuf::from("/data").join(url.rsplit('/').next().unwrap()),
            metadata,
        }
    }

    #[tokio::test]
    async fn one_reachable_course_is_enough() {
        let courses = vec![course("https://p/old", 1), course("https://p/new", 9), course("https://p/mid", 5)];
        let session = StaticSession::new()
            .with_status("https://p/new", 403)
            .with_page("https://p/mid", "<html></html>");

        let outcome = AccessGate::new(3).probe(&courses, &session).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Authenticated {
                url: "https://p/mid".to_string()
            }
        );
        assert_eq!(session.requests(), vec!["https://p/new", "https://p/mid"]);
    }

    #[tokio::test]
    async fn sample_is_limited_to_most_recent_courses() {
        let courses = vec![course("https://p/a", 1), course("https://p/b", 2), course("https://p/c", 3)];
        let session = StaticSession::new().with_page("https://p/a", "<html></html>");

        let outcome = AccessGate::new(2).probe(&courses, &session).await;
        assert!(!outcome.is_authenticated());
        assert_eq!(session.request_count("https://p/a"), 0);
    }

    #[tokio::test]
    async fn no_courses_is_reported_separately() {
        let outcome = AccessGate::new(3).probe(&[], &StaticSession::new()).await;
        assert_eq!(outcome, ProbeOutcome::NoKnownCourses);
    }

    #[test]
    fn missing_titles_are_placeholders() {
        assert!(AccessGate::is_placeholder_title(None));
        assert!(AccessGate::is_placeholder_title(Some("Kein Zugriffsrecht")));
        assert!(!AccessGate::is_placeholder_title(Some("Numerical Methods")));
    }
}
