//! HTTP fetch, working-directory and archive utilities for the registry mirror.

mod archive;
mod workdir;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use archive::{
    chunk_file_name, chunk_index, count_data_rows, extract_archive, merge_chunks,
    sorted_chunk_files, ArtifactError, MergeReport,
};
pub use workdir::WorkDir;

pub const CRATE_NAME: &str = "orgreg-storage";

/// Inclusive byte range of a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Split `0..total_bytes` into consecutive ranges of `chunk_size` bytes; the last may be shorter.
    pub fn split(total_bytes: u64, chunk_size: u64) -> Vec<ByteRange> {
        let chunk_size = chunk_size.max(1);
        let mut ranges = Vec::with_capacity(total_bytes.div_ceil(chunk_size) as usize);
        let mut start = 0;
        while start < total_bytes {
            let end = (start + chunk_size).min(total_bytes) - 1;
            ranges.push(ByteRange { start, end });
            start = end + 1;
        }
        ranges
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential, capped delay between re-attempts of a failed job.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    /// Whether a job that has failed `failures` times may run again.
    pub fn allows_retry(&self, failures: usize) -> bool {
        failures > 0 && failures <= self.max_retries
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Per-request timeouts; each stays below the budget of the job issuing the request.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub probe_timeout: Duration,
    pub chunk_timeout: Duration,
    pub full_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(240),
            full_timeout: Duration::from_secs(1_500),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("expected http status {expected} for {url}, got {status}")]
    UnexpectedStatus {
        expected: u16,
        status: u16,
        url: String,
    },
    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("short body written to {}: expected {expected} bytes, wrote {written}", path.display())]
    ShortBody {
        path: PathBuf,
        expected: u64,
        written: u64,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::HttpStatus { status, .. } | FetchError::UnexpectedStatus { status, .. } => {
                StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable)
            }
            FetchError::Io { .. } | FetchError::ShortBody { .. } => RetryDisposition::Retryable,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        FetchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What a `HEAD` with a one-byte `Range` header says about the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeProbe {
    pub status: u16,
    pub total_bytes: Option<u64>,
    pub accepts_ranges: bool,
}

impl RangeProbe {
    /// Total size when both the size is known and byte ranges are served.
    pub fn ranged_size(&self) -> Option<u64> {
        let ranged = self.status == StatusCode::PARTIAL_CONTENT.as_u16() || self.accepts_ranges;
        self.total_bytes.filter(|bytes| ranged && *bytes > 0)
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.probe_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub async fn probe(&self, url: &str) -> Result<RangeProbe, FetchError> {
        let span = info_span!("http_probe", url);
        async {
            let resp = self
                .client
                .head(url)
                .header(RANGE, "bytes=0-0")
                .timeout(self.config.probe_timeout)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let headers = resp.headers();
            let header_text = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
            let total_bytes = if status == StatusCode::PARTIAL_CONTENT {
                header_text(CONTENT_RANGE).and_then(content_range_total)
            } else {
                header_text(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
            };
            let accepts_ranges = header_text(ACCEPT_RANGES)
                .is_some_and(|v| v.to_ascii_lowercase().contains("bytes"));

            let probe = RangeProbe {
                status: status.as_u16(),
                total_bytes,
                accepts_ranges,
            };
            debug!(?probe, "probed remote dataset");
            Ok(probe)
        }
        .instrument(span)
        .await
    }

    /// Download `range` of `url` into `dest`, requiring `206 Partial Content`.
    pub async fn fetch_range_to_file(
        &self,
        url: &str,
        range: ByteRange,
        dest: &Path,
    ) -> Result<u64, FetchError> {
        let span = info_span!("http_fetch_range", url, range = %range);
        async {
            let resp = self
                .client
                .get(url)
                .header(RANGE, range.header_value())
                .timeout(self.config.chunk_timeout)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            expect_status(&resp, StatusCode::PARTIAL_CONTENT, url)?;

            let written = stream_to_file(resp, url, dest).await?;
            if written != range.len() {
                let _ = fs::remove_file(dest).await;
                return Err(FetchError::ShortBody {
                    path: dest.to_path_buf(),
                    expected: range.len(),
                    written,
                });
            }
            Ok(written)
        }
        .instrument(span)
        .await
    }

    /// Download the whole resource into `dest`, requiring `200 OK`.
    pub async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let span = info_span!("http_fetch_full", url);
        async {
            let resp = self
                .client
                .get(url)
                .timeout(self.config.full_timeout)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            expect_status(&resp, StatusCode::OK, url)?;

            let expected = resp.content_length();
            let written = stream_to_file(resp, url, dest).await?;
            match expected {
                Some(expected) if expected != written => {
                    let _ = fs::remove_file(dest).await;
                    Err(FetchError::ShortBody {
                        path: dest.to_path_buf(),
                        expected,
                        written,
                    })
                }
                _ => Ok(written),
            }
        }
        .instrument(span)
        .await
    }
}

fn expect_status(resp: &reqwest::Response, expected: StatusCode, url: &str) -> Result<(), FetchError> {
    let status = resp.status();
    if status == expected {
        return Ok(());
    }
    if status.is_success() {
        return Err(FetchError::UnexpectedStatus {
            expected: expected.as_u16(),
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Err(FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    })
}

/// `bytes 0-0/1234` -> `1234`. An unknown total (`*`) yields `None`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Stream the body into a temp file beside `dest`, then atomically rename it into place.
async fn stream_to_file(
    mut resp: reqwest::Response,
    url: &str,
    dest: &Path,
) -> Result<u64, FetchError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| FetchError::io(parent, e))?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result: Result<u64, FetchError> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| FetchError::io(&temp_path, e))?;

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(&temp_path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| FetchError::io(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, dest)
            .await
            .map_err(|e| FetchError::io(dest, e))?;
        Ok(written)
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ranges_cover_resource_exactly() {
        let ranges = ByteRange::split(10, 3);
        assert_eq!(
            ranges,
            vec![
                ByteRange { start: 0, end: 2 },
                ByteRange { start: 3, end: 5 },
                ByteRange { start: 6, end: 8 },
                ByteRange { start: 9, end: 9 },
            ]
        );
        assert_eq!(ranges.iter().map(ByteRange::len).sum::<u64>(), 10);
        assert_eq!(ranges[1].header_value(), "bytes=3-5");
        assert_eq!(ByteRange::split(9, 3).len(), 3);
        assert!(ByteRange::split(0, 3).is_empty());
    }

    #[test]
    fn content_range_total_parses_known_sizes_only() {
        assert_eq!(content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn probe_requires_ranges_and_size() {
        let partial = RangeProbe {
            status: 206,
            total_bytes: Some(42),
            accepts_ranges: false,
        };
        assert_eq!(partial.ranged_size(), Some(42));

        let advertised = RangeProbe {
            status: 200,
            total_bytes: Some(42),
            accepts_ranges: true,
        };
        assert_eq!(advertised.ranged_size(), Some(42));

        let plain = RangeProbe {
            status: 200,
            total_bytes: Some(42),
            accepts_ranges: false,
        };
        assert_eq!(plain.ranged_size(), None);

        let unknown = RangeProbe {
            status: 206,
            total_bytes: None,
            accepts_ranges: true,
        };
        assert_eq!(unknown.ranged_size(), None);
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        let err = FetchError::UnexpectedStatus {
            expected: 206,
            status: 200,
            url: "http://x".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn default_backoff_doubles_from_five_seconds_up_to_two_minutes() {
        let policy = BackoffPolicy::default();

        let delays: Vec<u64> = (0..7)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 120, 120]);
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(120));

        assert!(!policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }
}
