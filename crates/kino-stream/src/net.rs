//! Fragment download seam and the HTTP implementation

use crate::{types::FragmentDescriptor, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// A completed download
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub bytes: Bytes,
    pub http_status: u16,
    pub download_time: Duration,
}

/// Failure classes that drive retry/rampdown decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    /// Server answered with an error status
    Http,
    /// Request or body read timed out
    Timeout,
    /// Body ended before the advertised length
    Partial,
    /// Connection-level failure
    Transport,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

/// A failed download
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}{}: {message}", status_suffix(.http_status))]
pub struct DownloadError {
    pub kind: DownloadErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
}

impl DownloadError {
    pub fn new(kind: DownloadErrorKind, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Http, Some(status), message)
    }

    /// Server-side unavailability that a lower profile may not suffer from
    pub fn allows_rampdown(&self) -> bool {
        match self.kind {
            DownloadErrorKind::Http => matches!(self.http_status, Some(403 | 404 | 500 | 503)),
            DownloadErrorKind::Timeout | DownloadErrorKind::Partial => true,
            DownloadErrorKind::Transport => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }
}

/// Fetches fragment bytes
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, descriptor: &FragmentDescriptor) -> std::result::Result<Downloaded, DownloadError>;
}

/// reqwest-backed downloader
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    /// Create a downloader with a per-request timeout
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn classify(err: &reqwest::Error) -> DownloadError {
    let status = err.status().map(|s| s.as_u16());
    let kind = if err.is_timeout() {
        DownloadErrorKind::Timeout
    } else if err.is_body() || err.is_decode() {
        DownloadErrorKind::Partial
    } else if status.is_some() {
        DownloadErrorKind::Http
    } else {
        DownloadErrorKind::Transport
    };
    DownloadError::new(kind, status, err.to_string())
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip(self, descriptor), fields(sequence = descriptor.sequence))]
    async fn fetch(&self, descriptor: &FragmentDescriptor) -> std::result::Result<Downloaded, DownloadError> {
        let start = Instant::now();

        let mut request = self.client.get(descriptor.uri.clone());
        if let Some(range) = descriptor.byte_range {
            match range.end() {
                Some(end) => {
                    request = request.header(header::RANGE, format!("bytes={}-{}", range.start, end));
                }
                None => debug!(url = %descriptor.uri, "Empty byte range, requesting the whole resource"),
            }
        }

        let response = request.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %descriptor.uri, status = status.as_u16(), "Fragment request failed");
            return Err(DownloadError::http(
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }

        let expected = response.content_length();
        let bytes = response.bytes().await.map_err(|e| classify(&e))?;
        if let Some(expected) = expected {
            if (bytes.len() as u64) < expected && status != StatusCode::PARTIAL_CONTENT {
                return Err(DownloadError::new(
                    DownloadErrorKind::Partial,
                    Some(status.as_u16()),
                    format!("received {} of {} bytes", bytes.len(), expected),
                ));
            }
        }

        let download_time = start.elapsed();
        debug!(
            url = %descriptor.uri,
            bytes = bytes.len(),
            duration_ms = download_time.as_millis() as u64,
            "Fragment fetched"
        );

        Ok(Downloaded {
            bytes,
            http_status: status.as_u16(),
            download_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rampdown_eligibility() {
        for status in [403, 404, 500, 503] {
            assert!(DownloadError::http(status, "x").allows_rampdown());
        }
        assert!(!DownloadError::http(400, "x").allows_rampdown());
        assert!(!DownloadError::http(502, "x").allows_rampdown());
        assert!(DownloadError::new(DownloadErrorKind::Timeout, None, "x").allows_rampdown());
        assert!(DownloadError::new(DownloadErrorKind::Partial, Some(200), "x").allows_rampdown());
        assert!(!DownloadError::new(DownloadErrorKind::Transport, None, "x").allows_rampdown());
    }

    #[test]
    fn test_display_includes_status_when_known() {
        assert_eq!(DownloadError::http(404, "Not Found").to_string(), "Http (404): Not Found");
        assert_eq!(
            DownloadError::new(DownloadErrorKind::Timeout, None, "read timed out").to_string(),
            "Timeout: read timed out"
        );
    }
}
