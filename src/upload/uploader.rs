//! Single-chunk upload
//!
//! Sends one byte range against an upload session and classifies the
//! response. Retrying is left to the engine.

use super::retry::{is_transient_error, is_transient_status};
use super::{Chunk, UploadError, UploadSession};
use async_trait::async_trait;
use bytes::Bytes;
use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Default per-request timeout for chunk uploads
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

lazy_static! {
    static ref LOCATION_ATTACHMENT_ID: regex_lite::Regex =
        regex_lite::Regex::new(r"(?i)attachments(?:\('([^']+)'\)|/([^/?]+))")
            .expect("attachment location pattern is valid");
}

/// Outcome of a single chunk upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResult {
    /// Accepted; the server now expects this offset next
    Progress(u64),
    /// Final chunk accepted and the attachment assembled
    Completed(String),
    /// Transient failure; the same chunk may be sent again
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Permanent failure; the upload must stop
    Fatal(String),
}

impl ChunkResult {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

/// Chunk uploader trait
///
/// Implementations issue exactly one exchange per call.
#[async_trait]
pub trait ChunkUploader: Send + Sync {
    /// Upload `data` as `chunk` of `session`
    async fn upload(&self, session: &UploadSession, chunk: Chunk, data: Bytes) -> ChunkResult;
}

#[async_trait]
impl<T: ChunkUploader + ?Sized> ChunkUploader for &T {
    async fn upload(&self, session: &UploadSession, chunk: Chunk, data: Bytes) -> ChunkResult {
        (**self).upload(session, chunk, data).await
    }
}

#[async_trait]
impl<T: ChunkUploader + ?Sized> ChunkUploader for std::sync::Arc<T> {
    async fn upload(&self, session: &UploadSession, chunk: Chunk, data: Bytes) -> ChunkResult {
        (**self).upload(session, chunk, data).await
    }
}

/// Body returned by the upload endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponseBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Chunk uploader over HTTP `PUT` with `Content-Range`.
///
/// The upload URL is pre-authorized by the service, so no bearer token is
/// sent with chunk requests.
pub struct HttpChunkUploader {
    client: reqwest::Client,
}

impl HttpChunkUploader {
    /// Create an uploader with the given per-request timeout
    pub fn new(timeout: Option<Duration>) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| UploadError::Configuration(e.to_string()))?;

        Ok(Self { client })
    }

    /// Create an uploader around an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn classify(
        &self,
        session: &UploadSession,
        chunk: Chunk,
        response: reqwest::Response,
    ) -> ChunkResult {
        let status = response.status();
        let headers = response.headers().clone();
        tracing::Span::current().record("http.status_code", status.as_u16());

        // A truncated body is a transport fault
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return ChunkResult::retryable(format!("failed to read upload response: {}", e))
            }
        };

        if is_transient_status(status) {
            return ChunkResult::Retryable {
                reason: format!("HTTP {}", status.as_u16()),
                retry_after: retry_after(&headers),
            };
        }

        if status == StatusCode::NOT_FOUND {
            return ChunkResult::Fatal("upload session not found or expired".into());
        }

        if !status.is_success() {
            return ChunkResult::Fatal(format!(
                "HTTP {}: {}",
                status.as_u16(),
                error_message(&body)
            ));
        }

        let parsed: UploadResponseBody = if body.trim().is_empty() {
            UploadResponseBody::default()
        } else {
            match serde_json::from_str(&body) {
                Ok(parsed) => parsed,
                Err(e) => return ChunkResult::Fatal(format!("malformed upload response: {}", e)),
            }
        };

        if let Some(range) = parsed.next_expected_ranges.first() {
            return match parse_range_start(range) {
                Some(offset) => ChunkResult::Progress(offset),
                None => ChunkResult::Fatal(format!("malformed nextExpectedRanges entry '{}'", range)),
            };
        }

        if status == StatusCode::ACCEPTED {
            return ChunkResult::Progress(chunk.end());
        }

        if let Some(id) = parsed.id {
            return ChunkResult::Completed(id);
        }

        // Without an attachment id only the last chunk can complete the upload
        if chunk.end() != session.total_size() {
            return ChunkResult::Fatal(format!(
                "HTTP {} for chunk ending at {} of {} carried no completion data",
                status.as_u16(),
                chunk.end(),
                session.total_size()
            ));
        }

        let attachment_id = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(attachment_id_from_location)
            .unwrap_or_else(|| session.id().to_string());

        ChunkResult::Completed(attachment_id)
    }
}

#[async_trait]
impl ChunkUploader for HttpChunkUploader {
    #[tracing::instrument(
        name = "upload.chunk",
        skip(self, session, data),
        fields(
            upload.session_id = %session.id(),
            upload.offset = chunk.offset,
            upload.bytes = chunk.length,
            http.method = "PUT",
            http.status_code = tracing::field::Empty
        )
    )]
    async fn upload(&self, session: &UploadSession, chunk: Chunk, data: Bytes) -> ChunkResult {
        if data.len() != chunk.length as usize {
            return ChunkResult::Fatal(format!(
                "chunk at offset {} expects {} bytes, got {}",
                chunk.offset,
                chunk.length,
                data.len()
            ));
        }

        let content_range = chunk.content_range(session.total_size());
        tracing::debug!(content_range = %content_range, "Uploading chunk");

        let result = self
            .client
            .put(session.upload_url())
            .header(CONTENT_RANGE, &content_range)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await;

        match result {
            Ok(response) => self.classify(session, chunk, response).await,
            Err(e) if is_transient_error(&e) => ChunkResult::retryable(e.to_string()),
            Err(e) => ChunkResult::Fatal(e.to_string()),
        }
    }
}

/// Start offset of a `nextExpectedRanges` entry such as `"327680-"` or
/// `"327680-655359"`
pub fn parse_range_start(range: &str) -> Option<u64> {
    let start = range.split('-').next()?.trim();
    start.parse().ok()
}

/// Attachment id from a `Location` header, either
/// `.../Attachments('<id>')` or `.../attachments/<id>`
pub fn attachment_id_from_location(location: &str) -> Option<String> {
    let caps = LOCATION_ATTACHMENT_ID.captures(location)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull `error.message` out of a Graph error body, falling back to the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}
