use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use csync_core::CourseMetadata;
use csync_storage::StaticSession;
use csync_sync::{
    CourseOutcome, MetadataDocument, MetadataStore, SyncConfig, SyncOrchestrator, METADATA_FILE,
    REDIRECT_FILE, UPDATE_LOG_FILE,
};
use tempfile::tempdir;

const ROOT: &str = "https://portal.example/ilias.php?ref_id=100&cmd=view";
const WEEK: &str = "https://portal.example/ilias.php?ref_id=201&cmd=view";
const SOLUTIONS: &str = "https://portal.example/ilias.php?ref_id=202&cmd=view";
const SYLLABUS: &str = "https://portal.example/ilias.php?ref_id=301&cmd=sendfile";
const EXERCISES: &str = "https://portal.example/ilias.php?ref_id=302&cmd=sendfile";
const LECTURE: &str = "https://portal.example/ilias.php?ref_id=401&cmd=sendfile";
const SOLUTION: &str = "https://portal.example/ilias.php?ref_id=501&cmd=sendfile";
const BROKEN: &str = "https://portal.example/ilias.php?ref_id=900&cmd=view";
const EMPTY: &str = "https://portal.example/ilias.php?ref_id=910&cmd=view";

fn fixture(name: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read_to_string(root.join("fixtures/portal").join(name))
        .unwrap_or_else(|err| panic!("reading fixture {name}: {err}"))
}

fn zip_with(name: &str, body: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file(name, zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(body).unwrap();
    writer.finish().unwrap().into_inner()
}

fn exercises_zip() -> Vec<u8> {
    zip_with("task1.txt", b"Compute the machine epsilon.")
}

fn files(session: StaticSession) -> StaticSession {
    session
        .with_file(SYLLABUS, b"%PDF-1.7 syllabus".to_vec(), None)
        .with_file(EXERCISES, exercises_zip(), Some("Exercises.zip"))
        .with_file(LECTURE, b"%PDF-1.7 lecture".to_vec(), Some("Lecture01.pdf"))
        .with_file(SOLUTION, b"%PDF-1.7 solution".to_vec(), None)
}

fn portal() -> StaticSession {
    files(
        StaticSession::new()
            .with_page(ROOT, fixture("course_root.html"))
            .with_page(WEEK, fixture("week_folder.html"))
            .with_page(SOLUTIONS, fixture("solutions_fallback.html")),
    )
}

fn orchestrator(root: &Path) -> SyncOrchestrator {
    SyncOrchestrator::new(SyncConfig::default().with_storage_root(root)).unwrap()
}

async fn seed(root: &Path, dir: &str, title: &str, url: &str) -> PathBuf {
    let course_dir = root.join(dir);
    let mut metadata = CourseMetadata::new(title, url);
    metadata.last_fetched = Utc::now() - Duration::days(1);
    MetadataStore::new().save(&course_dir, &metadata).await.unwrap();
    course_dir
}

#[tokio::test]
async fn first_pass_mirrors_the_tree_and_second_pass_is_idempotent() {
    let root = tempdir().unwrap();
    let sync = orchestrator(root.path());
    let session = portal();

    let first = sync.sync_course(ROOT, &session).await.unwrap();
    let course_dir = root.path().join("Numerical Methods");
    assert_eq!(first.outcome, CourseOutcome::Success);
    assert_eq!(first.course_dir.as_deref(), Some(course_dir.as_path()));
    assert_eq!(first.files_found, 4);
    assert_eq!(first.downloaded.len(), 4);
    assert_eq!(first.extracted, 1);
    assert!(course_dir.join("Syllabus.pdf").is_file());
    assert!(course_dir.join("Week 1/Lecture01.pdf").is_file());
    assert!(course_dir.join("Week 1/Solutions/Solution01.pdf").is_file());
    assert_eq!(
        std::fs::read_to_string(course_dir.join("Exercises/task1.txt")).unwrap(),
        "Compute the machine epsilon."
    );
    assert!(course_dir.join(REDIRECT_FILE).is_file());
    assert!(root.path().join(UPDATE_LOG_FILE).is_file());

    let store = MetadataStore::new();
    let after_first = store.load(&course_dir).await.unwrap().unwrap();
    assert_eq!(after_first.course_title, "Numerical Methods");
    assert_eq!(after_first.source_url, ROOT);
    assert_eq!(after_first.file_history.len(), 4);

    let second = sync.sync_course(ROOT, &session).await.unwrap();
    assert_eq!(second.outcome, CourseOutcome::Success);
    assert_eq!(second.files_found, 4);
    assert!(second.downloaded.is_empty());
    assert_eq!(second.extracted, 0);
    assert_eq!(second.skipped, 4);
    assert_eq!(session.request_count(SYLLABUS), 1);
    assert_eq!(session.request_count(SOLUTION), 1);
    assert_eq!(session.request_count(EXERCISES), 1);
    // Saved under the server's name, not the link text.
    assert_eq!(session.request_count(LECTURE), 1);

    let after_second = store.load(&course_dir).await.unwrap().unwrap();
    assert!(after_second.last_fetched > after_first.last_fetched);
    assert_eq!(after_second.file_history, after_first.file_history);
}

#[tokio::test]
async fn archives_already_in_the_course_are_not_extracted() {
    let root = tempdir().unwrap();
    let course_dir = root.path().join("Numerical Methods");
    std::fs::create_dir_all(&course_dir).unwrap();
    std::fs::write(course_dir.join("Old.zip"), zip_with("old.txt", b"from last term")).unwrap();

    let report = orchestrator(root.path())
        .sync_course(ROOT, &portal())
        .await
        .unwrap();

    assert_eq!(report.course_dir.as_deref(), Some(course_dir.as_path()));
    assert_eq!(report.extracted, 1);
    assert!(course_dir.join("Exercises/task1.txt").is_file());
    assert!(!course_dir.join("Old").exists());
    assert!(course_dir.join("Old.zip").is_file());
}

#[tokio::test]
async fn report_lists_new_files_relative_to_the_course() {
    let root = tempdir().unwrap();
    let report = orchestrator(root.path())
        .sync_course(ROOT, &portal())
        .await
        .unwrap();

    let mut relative = report
        .downloaded_relative()
        .into_iter()
        .map(|p| p.replace('\\', "/"))
        .collect::<Vec<_>>();
    relative.sort();
    assert_eq!(
        relative,
        vec![
            "Exercises.zip",
            "Syllabus.pdf",
            "Week 1/Lecture01.pdf",
            "Week 1/Solutions/Solution01.pdf",
        ]
    );
}

#[tokio::test]
async fn update_log_tracks_the_newest_course_fetch() {
    let root = tempdir().unwrap();
    let sync = orchestrator(root.path());
    let session = portal();

    sync.sync_course(ROOT, &session).await.unwrap();
    let store = MetadataStore::new();
    let course = store
        .load(&root.path().join("Numerical Methods"))
        .await
        .unwrap()
        .unwrap();
    let state = sync.sync_state().await;
    assert_eq!(state.last_update, Some(course.last_fetched));

    let log = std::fs::read_to_string(root.path().join(UPDATE_LOG_FILE)).unwrap();
    assert!(log.contains("| Numerical Methods | Syllabus.pdf | Numerical Methods/Syllabus.pdf |"));
}

#[tokio::test]
async fn access_denied_title_is_replaced_by_the_stored_one() {
    let root = tempdir().unwrap();
    let course_dir = seed(root.path(), "Numerical Methods", "Numerical Methods", ROOT).await;
    let session = StaticSession::new().with_page(ROOT, fixture("access_denied.html"));

    let report = orchestrator(root.path())
        .sync_course(ROOT, &session)
        .await
        .unwrap();

    assert_eq!(report.course_title, "Numerical Methods");
    assert!(!report.placeholder_title);
    assert_eq!(report.outcome, CourseOutcome::NoFilesFound);
    assert_eq!(report.course_dir.as_deref(), Some(course_dir.as_path()));
    let stored = MetadataStore::new().load(&course_dir).await.unwrap().unwrap();
    assert_eq!(stored.course_title, "Numerical Methods");
    assert!(!root.path().join("Kein Zugriffsrecht").exists());
}

#[tokio::test]
async fn placeholder_title_in_stored_metadata_falls_back_to_directory_name() {
    let root = tempdir().unwrap();
    let course_dir = seed(root.path(), "Linear Algebra", "Access denied", ROOT).await;
    let session = StaticSession::new().with_page(ROOT, fixture("access_denied.html"));

    let report = orchestrator(root.path())
        .sync_course(ROOT, &session)
        .await
        .unwrap();

    assert_eq!(report.course_title, "Linear Algebra");
    let stored = MetadataStore::new().load(&course_dir).await.unwrap().unwrap();
    assert_eq!(stored.course_title, "Linear Algebra");
}

#[tokio::test]
async fn unknown_course_without_access_keeps_the_placeholder() {
    let root = tempdir().unwrap();
    let session = StaticSession::new().with_page(ROOT, fixture("access_denied.html"));

    let report = orchestrator(root.path())
        .sync_course(ROOT, &session)
        .await
        .unwrap();

    assert!(report.placeholder_title);
    assert_eq!(report.course_title, "Kein Zugriffsrecht");
    assert_eq!(report.outcome, CourseOutcome::NoFilesFound);
}

#[tokio::test]
async fn course_without_files_still_advances_last_fetched() {
    let root = tempdir().unwrap();
    let sync = orchestrator(root.path());
    let session = StaticSession::new().with_page(
        EMPTY,
        "<html><head><title>StudOn - Empty Seminar</title></head><body><p>Nothing yet</p></body></html>",
    );

    let first = sync.sync_course(EMPTY, &session).await.unwrap();
    assert_eq!(first.outcome, CourseOutcome::NoFilesFound);
    let course_dir = root.path().join("Empty Seminar");
    let store = MetadataStore::new();
    let before = store.load(&course_dir).await.unwrap().unwrap();

    sync.sync_course(EMPTY, &session).await.unwrap();
    let after = store.load(&course_dir).await.unwrap().unwrap();
    assert!(after.last_fetched > before.last_fetched);
    assert!(after.file_history.is_empty());
    assert_eq!(sync.sync_state().await.last_update, Some(after.last_fetched));
}

#[tokio::test]
async fn fleet_update_isolates_failing_courses() {
    let root = tempdir().unwrap();
    seed(root.path(), "Numerical Methods", "Numerical Methods", ROOT).await;
    seed(root.path(), "Broken Course", "Broken Course", BROKEN).await;
    let session = portal().with_status(BROKEN, 500);

    let sync = orchestrator(root.path());
    let summary = sync.update_all(&session).await.unwrap();

    assert_eq!(summary.courses.len(), 2);
    assert_eq!(summary.failed_courses(), 1);
    assert_eq!(summary.downloaded(), 4);
    assert_eq!(summary.extracted(), 1);
    assert!(!summary.is_success());
    assert_eq!(summary.sync_state.last_success, Some(false));

    let good = summary
        .courses
        .iter()
        .find(|c| c.source_url == ROOT)
        .unwrap();
    assert_eq!(good.outcome, CourseOutcome::Success);
    let broken = summary
        .courses
        .iter()
        .find(|c| c.source_url == BROKEN)
        .unwrap();
    assert!(broken.is_error());
    assert_eq!(broken.course_title, "Broken Course");

    let newest = MetadataStore::new()
        .load(&root.path().join("Numerical Methods"))
        .await
        .unwrap()
        .unwrap()
        .last_fetched;
    assert_eq!(summary.sync_state.last_update, Some(newest));
}

#[tokio::test]
async fn fleet_update_migrates_legacy_metadata() {
    let root = tempdir().unwrap();
    let course_dir = root.path().join("Numerical Methods");
    std::fs::create_dir_all(&course_dir).unwrap();
    std::fs::write(
        course_dir.join(METADATA_FILE),
        format!(
            "Course: Numerical Methods\n\
             Source: {ROOT}\n\
             Last fetched: 2025-10-20 17:05:00\n\
             \n\
             | Date/Time | File |\n\
             |-----------|------|\n\
             | 2025-10-20 17:01:00 | Old/Intro.pdf |\n\
             | 2025-10-13 09:00:00 | Old/Organisation.pdf |\n"
        ),
    )
    .unwrap();

    let summary = orchestrator(root.path())
        .update_all(&portal())
        .await
        .unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.sync_state.last_success, Some(true));

    let text = std::fs::read_to_string(course_dir.join(METADATA_FILE)).unwrap();
    assert!(matches!(
        MetadataDocument::decode(&text),
        MetadataDocument::Current(_)
    ));
    let stored = MetadataStore::new().load(&course_dir).await.unwrap().unwrap();
    assert_eq!(stored.file_history.len(), 6);
    let legacy = stored
        .file_history
        .iter()
        .filter(|r| r.file_path.starts_with(course_dir.join("Old")))
        .collect::<Vec<_>>();
    assert_eq!(legacy.len(), 2);
    assert!(legacy.iter().all(|r| r.size_bytes == 0));
    // Legacy rows are the oldest entries.
    assert!(stored.file_history[4..]
        .iter()
        .all(|r| r.file_path.starts_with(course_dir.join("Old"))));
}

#[tokio::test]
async fn probe_succeeds_when_a_recent_course_answers() {
    let root = tempdir().unwrap();
    seed(root.path(), "Numerical Methods", "Numerical Methods", ROOT).await;
    let sync = orchestrator(root.path());

    assert!(sync.probe(&portal()).await.unwrap().is_authenticated());
    assert!(!sync
        .probe(&StaticSession::new().with_status(ROOT, 403))
        .await
        .unwrap()
        .is_authenticated());
}
