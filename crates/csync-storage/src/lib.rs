//! Authenticated portal session + download and archive materialization for course sync.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, COOKIE};
use thiserror::Error;
use tracing::{debug, Instrument};

pub mod archive;
pub mod download;

pub use archive::{detect_archive, ArchiveError, ArchiveKind, ArchiveMaterializer, ExtractOutcome};
pub use download::{
    is_partial_file_name, sweep_partial_files, DownloadConfig, DownloadError, DownloadSummary,
    Downloader,
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no portal credentials configured (set a cookie header or cookie file)")]
    MissingCredentials,
    #[error("reading cookie file {path}: {source}")]
    CookieFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cookie value is not a valid header value")]
    InvalidCookie,
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A rendered page as returned by the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
}

/// Streaming body of a file download.
#[async_trait]
pub trait ChunkSource: Send {
    /// `Ok(None)` once the body is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError>;
}

pub struct DownloadResponse {
    pub final_url: String,
    /// Raw filename from `Content-Disposition`, not yet sanitized.
    pub filename_hint: Option<String>,
    pub body: Box<dyn ChunkSource>,
}

/// A session able to GET arbitrary portal URLs with valid credentials attached.
#[async_trait]
pub trait PortalSession: Send + Sync {
    async fn get_page(&self, url: &str) -> Result<FetchedPage, FetchError>;

    async fn open_download(&self, url: &str) -> Result<DownloadResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Raw `Cookie` header value.
    pub cookie: Option<String>,
    /// Either a plain header value or a Netscape `cookies.txt` export.
    pub cookie_file: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some("Mozilla/5.0".to_string()),
            cookie: None,
            cookie_file: None,
        }
    }
}

impl HttpClientConfig {
    /// Resolves the configured credentials into a single `Cookie` header value.
    pub fn resolve_cookie(&self) -> Result<String, SessionError> {
        if let Some(cookie) = self.cookie.as_deref().map(str::trim) {
            if !cookie.is_empty() {
                return Ok(cookie.to_string());
            }
        }
        let Some(path) = &self.cookie_file else {
            return Err(SessionError::MissingCredentials);
        };
        let text = std::fs::read_to_string(path).map_err(|source| SessionError::CookieFile {
            path: path.clone(),
            source,
        })?;
        let header = cookie_header_from_file_contents(&text);
        if header.is_empty() {
            return Err(SessionError::MissingCredentials);
        }
        Ok(header)
    }
}

/// Accepts either a Netscape cookie export (tab separated, seven columns) or a
/// ready-made `name=value; name2=value2` line.
pub fn cookie_header_from_file_contents(text: &str) -> String {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.len() == 7 {
            pairs.push(format!("{}={}", fields[5], fields[6]));
        } else {
            pairs.push(line.to_string());
        }
    }
    pairs.join("; ")
}

/// Extracts the filename from a `Content-Disposition` value, preferring the
/// RFC 5987 `filename*` form.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.trim().trim_matches('"');
                let encoded = encoded
                    .split_once("''")
                    .map(|(_, rest)| rest)
                    .unwrap_or(encoded);
                extended = Some(percent_decode_str(encoded).decode_utf8_lossy().into_owned());
            }
            "filename" => {
                plain = Some(raw.trim().trim_matches('"').to_string());
            }
            _ => {}
        }
    }
    extended.or(plain).filter(|name| !name.trim().is_empty())
}

/// Portal session over `reqwest` with the operator's cookie attached to every request.
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
}

impl HttpSession {
    pub fn new(config: &HttpClientConfig) -> Result<Self, SessionError> {
        let cookie = config.resolve_cookie()?;
        let mut cookie_value =
            HeaderValue::from_str(&cookie).map_err(|_| SessionError::InvalidCookie)?;
        cookie_value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, cookie_value);

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }
}

struct ReqwestChunks(reqwest::Response);

#[async_trait]
impl ChunkSource for ReqwestChunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self.0.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}

#[async_trait]
impl PortalSession for HttpSession {
    async fn get_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = tracing::info_span!("http_get_page", url);
        async {
            let resp = self.send(url).await?;
            let status = resp.status().as_u16();
            let final_url = resp.url().to_string();
            let body = resp.text().await?;
            debug!(status, bytes = body.len(), "page fetched");
            Ok(FetchedPage {
                url: url.to_string(),
                final_url,
                status,
                body,
            })
        }
        .instrument(span)
        .await
    }

    async fn open_download(&self, url: &str) -> Result<DownloadResponse, FetchError> {
        let resp = self.send(url).await?;
        let filename_hint = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_content_disposition);
        Ok(DownloadResponse {
            final_url: resp.url().to_string(),
            filename_hint,
            body: Box::new(ReqwestChunks(resp)),
        })
    }
}

#[derive(Debug, Clone)]
enum StaticBody {
    Page(String),
    File {
        body: Vec<u8>,
        filename_hint: Option<String>,
    },
}

#[derive(Debug, Clone)]
enum StaticEntry {
    Body(StaticBody),
    Status(u16),
    Unreachable,
}

/// In-memory session serving canned responses; records every requested URL.
///
/// Unknown URLs answer with 404.
#[derive(Debug, Default)]
pub struct StaticSession {
    entries: HashMap<String, StaticEntry>,
    requests: Mutex<Vec<String>>,
}

impl StaticSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.entries
            .insert(url.into(), StaticEntry::Body(StaticBody::Page(html.into())));
        self
    }

    pub fn with_file(
        mut self,
        url: impl Into<String>,
        body: impl Into<Vec<u8>>,
        filename_hint: Option<&str>,
    ) -> Self {
        self.entries.insert(
            url.into(),
            StaticEntry::Body(StaticBody::File {
                body: body.into(),
                filename_hint: filename_hint.map(ToString::to_string),
            }),
        );
        self
    }

    pub fn with_status(mut self, url: impl Into<String>, status: u16) -> Self {
        self.entries.insert(url.into(), StaticEntry::Status(status));
        self
    }

    pub fn with_unreachable(mut self, url: impl Into<String>) -> Self {
        self.entries.insert(url.into(), StaticEntry::Unreachable);
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests().iter().filter(|u| u.as_str() == url).count()
    }

    fn lookup(&self, url: &str) -> Result<StaticBody, FetchError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(url.to_string());
        }
        match self.entries.get(url) {
            Some(StaticEntry::Status(status)) => Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }),
            Some(StaticEntry::Unreachable) => Err(FetchError::Transport {
                url: url.to_string(),
                message: "connection refused".to_string(),
            }),
            Some(StaticEntry::Body(body)) => Ok(body.clone()),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

struct VecChunks {
    chunks: std::vec::IntoIter<Vec<u8>>,
}

#[async_trait]
impl ChunkSource for VecChunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self.chunks.next())
    }
}

#[async_trait]
impl PortalSession for StaticSession {
    async fn get_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let body = match self.lookup(url)? {
            StaticBody::Page(html) => html,
            StaticBody::File { body, .. } => String::from_utf8_lossy(&body).into_owned(),
        };
        Ok(FetchedPage {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            body,
        })
    }

    async fn open_download(&self, url: &str) -> Result<DownloadResponse, FetchError> {
        let (body, filename_hint) = match self.lookup(url)? {
            StaticBody::File {
                body,
                filename_hint,
            } => (body, filename_hint),
            StaticBody::Page(html) => (html.into_bytes(), None),
        };
        let chunks = body
            .chunks(8192)
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>()
            .into_iter();
        Ok(DownloadResponse {
            final_url: url.to_string(),
            filename_hint,
            body: Box::new(VecChunks { chunks }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_disposition_prefers_extended_filename() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"Blatt 1.pdf\"").as_deref(),
            Some("Blatt 1.pdf")
        );
        assert_eq!(
            filename_from_content_disposition(
                "attachment; filename=\"Bl_tt.pdf\"; filename*=UTF-8''Bl%C3%A4tt%201.pdf"
            )
            .as_deref(),
            Some("Blätt 1.pdf")
        );
        assert_eq!(
            filename_from_content_disposition("inline; filename=notes.txt").as_deref(),
            Some("notes.txt")
        );
        assert_eq!(filename_from_content_disposition("attachment"), None);
        assert_eq!(filename_from_content_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn netscape_cookie_exports_become_a_header() {
        let text = "# Netscape HTTP Cookie File\n\
                    portal.example\tFALSE\t/\tTRUE\t0\tPHPSESSID\tabc123\n\
                    #HttpOnly_portal.example\tFALSE\t/\tTRUE\t0\tauth\txyz\n";
        assert_eq!(cookie_header_from_file_contents(text), "PHPSESSID=abc123; auth=xyz");
        assert_eq!(cookie_header_from_file_contents("a=1; b=2\n"), "a=1; b=2");
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let config = HttpClientConfig::default();
        assert!(matches!(
            HttpSession::new(&config),
            Err(SessionError::MissingCredentials)
        ));
    }

    #[test]
    fn cookie_file_is_read() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, "session=1\n").expect("write cookie");
        let config = HttpClientConfig {
            cookie_file: Some(path),
            ..Default::default()
        };
        assert_eq!(config.resolve_cookie().expect("cookie"), "session=1");
    }

    #[tokio::test]
    async fn static_session_records_requests_and_streams_files() {
        let session = StaticSession::new()
            .with_page("https://portal/a", "<html></html>")
            .with_file("https://portal/f", vec![7u8; 20_000], Some("f.bin"))
            .with_unreachable("https://portal/down");

        session.get_page("https://portal/a").await.expect("page");
        let mut resp = session.open_download("https://portal/f").await.expect("download");
        let mut total = 0;
        while let Some(chunk) = resp.body.next_chunk().await.expect("chunk") {
            total += chunk.len();
        }
        assert_eq!(total, 20_000);
        assert_eq!(resp.filename_hint.as_deref(), Some("f.bin"));

        assert!(matches!(
            session.get_page("https://portal/missing").await,
            Err(FetchError::HttpStatus { status: 404, .. })
        ));
        assert!(matches!(
            session.get_page("https://portal/down").await,
            Err(FetchError::Transport { .. })
        ));
        assert_eq!(session.requests().len(), 4);
        assert_eq!(session.request_count("https://portal/a"), 1);
    }
}
