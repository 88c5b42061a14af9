use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use csync_core::format_file_size;
use csync_storage::HttpSession;
use csync_sync::{CourseOutcome, CourseReport, ProbeOutcome, RunSummary, SyncConfig, SyncOrchestrator};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "csync")]
#[command(about = "Mirror course portal content into local folders")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Course URL to sync (same as `csync sync <URL>`)
    url: Option<String>,
    /// Storage root (overrides CSYNC_STORAGE_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync a single course
    Sync { url: String },
    /// Sync every course that already has metadata under the storage root
    UpdateAll {
        /// Run even if the last update is more recent than the minimum interval
        #[arg(long)]
        force: bool,
    },
    /// Show known courses and the last update
    Status,
    /// Check whether the configured session can still reach recent courses
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.root {
        config = config.with_storage_root(root);
    }
    tracing::info!(root = %config.storage_root.display(), "csync starting");

    let command = match (cli.command, cli.url) {
        (Some(command), _) => command,
        (None, Some(url)) => Commands::Sync { url },
        (None, None) => bail!("pass a course URL or a subcommand (see --help)"),
    };

    match command {
        Commands::Sync { url } => {
            let session = open_session(&config)?;
            let sync = SyncOrchestrator::new(config)?;
            let report = sync.sync_course(&url, &session).await?;
            print_course(&report);
            if report.files_found == 0 {
                print_no_files_warning();
            }
        }
        Commands::UpdateAll { force } => {
            let sync = SyncOrchestrator::new(config)?;
            let state = sync.sync_state().await;
            if !force && !state.is_due(Utc::now(), sync.config().min_update_interval) {
                println!(
                    "updated recently (last: {}), skipping; pass --force to run anyway",
                    state
                        .last_update
                        .map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default()
                );
                return Ok(());
            }

            let session = open_session(sync.config())?;
            match sync.probe(&session).await? {
                ProbeOutcome::Authenticated { .. } => {}
                ProbeOutcome::NoKnownCourses => {
                    println!(
                        "no courses found under {}; sync one with `csync <URL>` first",
                        sync.config().storage_root.display()
                    );
                    return Ok(());
                }
                ProbeOutcome::Denied { tried } => {
                    bail!(
                        "could not authenticate: none of the {} most recently synced courses answered",
                        tried.len()
                    );
                }
            }

            let summary = sync.update_all(&session).await?;
            print_summary(&summary);
        }
        Commands::Status => {
            let sync = SyncOrchestrator::new(config)?;
            let state = sync.sync_state().await;
            let mut courses = sync.known_courses().await?;
            courses.sort_by(|a, b| a.metadata.course_title.cmp(&b.metadata.course_title));

            match state.last_update {
                Some(ts) => println!(
                    "last update: {} ({})",
                    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    match state.last_success {
                        Some(true) => "succeeded",
                        Some(false) => "had failures",
                        None => "outcome unknown",
                    }
                ),
                None => println!("last update: never"),
            }
            for course in courses {
                let total: u64 = course.metadata.file_history.iter().map(|r| r.size_bytes).sum();
                println!(
                    "{}  files={} size={} fetched={}  {}",
                    course.metadata.course_title,
                    course.metadata.file_history.len(),
                    format_file_size(total),
                    course
                        .metadata
                        .last_fetched
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M"),
                    course.metadata.source_url
                );
            }
        }
        Commands::Probe => {
            let session = open_session(&config)?;
            let sync = SyncOrchestrator::new(config)?;
            match sync.probe(&session).await? {
                ProbeOutcome::Authenticated { url } => println!("authenticated (reached {url})"),
                ProbeOutcome::NoKnownCourses => println!("no known courses to probe"),
                ProbeOutcome::Denied { tried } => {
                    bail!("could not authenticate: tried {}", tried.join(", "))
                }
            }
        }
    }

    Ok(())
}

fn open_session(config: &SyncConfig) -> Result<HttpSession> {
    HttpSession::new(&config.http).context("could not authenticate")
}

fn print_course(report: &CourseReport) {
    let status = match &report.outcome {
        CourseOutcome::Success => "ok".to_string(),
        CourseOutcome::NoFilesFound => "no files found".to_string(),
        CourseOutcome::Error(reason) => format!("error: {reason}"),
    };
    println!(
        "{}: {} (found={} downloaded={} skipped={} failed={} extracted={})",
        report.course_title,
        status,
        report.files_found,
        report.downloaded.len(),
        report.skipped,
        report.failed,
        report.extracted
    );
    for path in report.downloaded_relative() {
        println!("  + {path}");
    }
    if report.placeholder_title {
        eprintln!("  ! stored under an access-denied title; log in again and re-run");
    }
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.courses {
        print_course(report);
    }
    println!(
        "courses={} failed={} found={} downloaded={} skipped={} extracted={}",
        summary.courses.len(),
        summary.failed_courses(),
        summary.files_found(),
        summary.downloaded(),
        summary.skipped(),
        summary.extracted()
    );
    if summary.files_found() == 0 {
        print_no_files_warning();
    }
}

fn print_no_files_warning() {
    eprintln!("WARNING: no files were found. The portal session has probably expired;");
    eprintln!("log in again in the browser, refresh the cookie and re-run.");
}
