//! Helpers shared by the markdown documents kept next to downloaded content.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use tokio::fs;
use uuid::Uuid;

const HUMAN_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

/// Splits `---` delimited YAML front matter from the rest of the document.
pub(crate) fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

pub(crate) fn front_matter(yaml: &str, body: &str) -> String {
    let mut out = String::from("---\n");
    out.push_str(yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n\n");
    out.push_str(body);
    out
}

/// Cells of a markdown table data row. Header and separator rows yield `None`.
pub(crate) fn table_row(line: &str) -> Option<Vec<&str>> {
    let inner = line.trim().strip_prefix('|')?.strip_suffix('|')?;
    let cells = inner.split('|').map(str::trim).collect::<Vec<_>>();
    if cells.first() == Some(&"Date/Time") {
        return None;
    }
    if cells
        .iter()
        .all(|cell| cell.chars().all(|c| c == '-' || c == ':'))
    {
        return None;
    }
    Some(cells)
}

pub(crate) fn human_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format(HUMAN_TIMESTAMP).to_string()
}

/// Accepts RFC 3339 or the local `YYYY-MM-DD HH:MM:SS` form used in the table views.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(text, HUMAN_TIMESTAMP).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}

/// `/`-separated path of `path` below `base`; falls back to the full path.
pub(crate) fn relative_path(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Inverse of [`relative_path`]. Parent and root components are dropped.
pub(crate) fn anchor_path(base: &Path, relative: &str) -> PathBuf {
    relative
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(base.to_path_buf(), |acc, part| acc.join(part))
}

/// Writes to a sibling temp file and renames it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp, contents).await?;
    if let Err(err) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err);
    }
    Ok(())
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
