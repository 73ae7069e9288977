//! Resumable upload engine
//!
//! Drives one upload session from its current offset to a terminal outcome:
//!
//! ```text
//! Planning -> Uploading -> Completed(attachment_id)
//!                      \-> Failed(UploadError)
//! ```
//!
//! Chunks go out strictly in order. A transient failure re-sends the same
//! chunk bytes after a backoff; everything else ends the run. Terminal states
//! are sticky.

use super::planner::{plan, validate_chunk_size};
use super::{
    AttachmentSource, Chunk, ChunkResult, ChunkUploader, RetryPolicy, UploadError, UploadSession,
    DEFAULT_MAX_CHUNK_SIZE,
};
use crate::metrics;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source of the current time, used for session expiry checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Tunables for one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub max_chunk_size: u32,
    pub retry: RetryPolicy,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadSettings {
    /// Reject settings that could never drive an upload
    pub fn validate(&self) -> Result<(), UploadError> {
        validate_chunk_size(self.max_chunk_size)?;
        if self.retry.max_attempts == 0 {
            return Err(UploadError::Configuration(
                "max attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Terminal result of an engine run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(String),
    Failed(UploadError),
}

impl UploadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Planning,
    Uploading,
    Completed(String),
    Failed(UploadError),
}

/// Cumulative progress, reported after every accepted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub chunks_sent: u32,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_uploaded as f64 * 100.0 / self.total_bytes as f64
    }
}

pub type ProgressCallback = Box<dyn Fn(&UploadProgress) + Send + Sync>;

/// What a chunk exchange settled on after retries
enum Accepted {
    Progress(u64),
    Completed(String),
}

/// Resumable upload engine for a single session
pub struct ResumableUploadEngine<U> {
    uploader: U,
    settings: UploadSettings,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
    state: EngineState,
}

impl<U: ChunkUploader> ResumableUploadEngine<U> {
    /// Create an engine with the wall clock and no cancellation
    pub fn new(uploader: U, settings: UploadSettings) -> Self {
        Self {
            uploader,
            settings,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            on_progress: None,
            state: EngineState::Planning,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stop issuing chunks once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Run the upload to a terminal outcome.
    ///
    /// On an engine that already finished this returns the stored outcome
    /// without touching the session or the source.
    #[tracing::instrument(
        name = "upload.run",
        skip(self, session, source),
        fields(
            upload.session_id = %session.id(),
            upload.total_bytes = session.total_size(),
            upload.start_offset = session.next_expected_offset()
        )
    )]
    pub async fn run<R: Read + Seek>(
        &mut self,
        session: &mut UploadSession,
        source: &mut AttachmentSource<R>,
    ) -> UploadOutcome {
        match &self.state {
            EngineState::Completed(id) => return UploadOutcome::Completed(id.clone()),
            EngineState::Failed(e) => return UploadOutcome::Failed(e.clone()),
            EngineState::Planning | EngineState::Uploading => {}
        }

        let started = Instant::now();
        let outcome = match self.drive(session, source).await {
            Ok(attachment_id) => {
                tracing::info!(
                    attachment_id = %attachment_id,
                    bytes = session.total_size(),
                    "Attachment upload completed"
                );
                self.state = EngineState::Completed(attachment_id.clone());
                UploadOutcome::Completed(attachment_id)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    next_expected_offset = session.next_expected_offset(),
                    "Attachment upload failed"
                );
                self.state = EngineState::Failed(e.clone());
                UploadOutcome::Failed(e)
            }
        };

        metrics::record_upload_outcome(&outcome, started.elapsed().as_secs_f64());
        outcome
    }

    async fn drive<R: Read + Seek>(
        &mut self,
        session: &mut UploadSession,
        source: &mut AttachmentSource<R>,
    ) -> Result<String, UploadError> {
        self.state = EngineState::Planning;
        self.settings.validate()?;

        let total = session.total_size();
        if source.len() != total {
            return Err(UploadError::Configuration(format!(
                "source is {} bytes but the session expects {}",
                source.len(),
                total
            )));
        }

        let max_chunk_size = self.settings.max_chunk_size;
        let mut chunks = plan(total, max_chunk_size, session.next_expected_offset())?;
        self.state = EngineState::Uploading;

        let mut chunks_sent = 0u32;
        while let Some(chunk) = chunks.next() {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if session.is_expired(self.clock.now()) {
                return Err(UploadError::SessionExpired);
            }
            debug_assert_eq!(chunk.offset, session.next_expected_offset());

            let data = source.read_chunk(&chunk).map_err(|e| {
                UploadError::Fatal(format!("failed to read bytes at offset {}: {}", chunk.offset, e))
            })?;

            match self.send_chunk(session, chunk, data).await? {
                Accepted::Completed(attachment_id) => {
                    session.advance(chunk.end())?;
                    metrics::record_chunk_accepted(chunk.length as u64);
                    self.report(UploadProgress {
                        bytes_uploaded: total,
                        total_bytes: total,
                        chunks_sent: chunks_sent + 1,
                    });
                    return Ok(attachment_id);
                }
                Accepted::Progress(next) => {
                    if next > chunk.end() {
                        return Err(UploadError::ProtocolViolation(format!(
                            "server reported offset {} after a chunk ending at {}",
                            next,
                            chunk.end()
                        )));
                    }
                    session.advance(next)?;
                    metrics::record_chunk_accepted(next - chunk.offset);
                    chunks_sent += 1;
                    self.report(UploadProgress {
                        bytes_uploaded: next,
                        total_bytes: total,
                        chunks_sent,
                    });

                    if next != chunk.end() {
                        tracing::debug!(
                            next_expected_offset = next,
                            chunk_end = chunk.end(),
                            "Partial acceptance, re-planning from server offset"
                        );
                        chunks = plan(total, max_chunk_size, next)?;
                    }
                }
            }
        }

        Err(UploadError::ProtocolViolation(
            "every chunk was accepted but the server never reported completion".into(),
        ))
    }

    /// Send one chunk, retrying the same bytes on transient failures
    async fn send_chunk(
        &self,
        session: &UploadSession,
        chunk: Chunk,
        data: Bytes,
    ) -> Result<Accepted, UploadError> {
        let policy = &self.settings.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.uploader.upload(session, chunk, data.clone()).await;

            let (reason, retry_after) = match result {
                ChunkResult::Completed(attachment_id) => return Ok(Accepted::Completed(attachment_id)),
                ChunkResult::Progress(next) if next == chunk.offset && chunk.length > 0 => {
                    ("server accepted no bytes".to_string(), None)
                }
                ChunkResult::Progress(next) => return Ok(Accepted::Progress(next)),
                ChunkResult::Fatal(reason) => {
                    metrics::record_chunk_failure();
                    return Err(UploadError::Fatal(reason));
                }
                ChunkResult::Retryable {
                    reason,
                    retry_after,
                } => (reason, retry_after),
            };

            metrics::record_chunk_retry();
            if attempt >= policy.max_attempts {
                return Err(UploadError::RetriesExhausted {
                    attempts: attempt,
                    last_error: reason,
                });
            }

            let delay = policy.delay_with_hint(attempt - 1, retry_after);
            tracing::warn!(
                offset = chunk.offset,
                attempt = attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Chunk upload failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            if session.is_expired(self.clock.now()) {
                return Err(UploadError::SessionExpired);
            }
        }
    }

    fn report(&self, progress: UploadProgress) {
        tracing::debug!(
            bytes_uploaded = progress.bytes_uploaded,
            total_bytes = progress.total_bytes,
            chunks_sent = progress.chunks_sent,
            "Upload progress"
        );
        if let Some(callback) = &self.on_progress {
            callback(&progress);
        }
    }
}
