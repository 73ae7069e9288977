//! Metrics module
//!
//! Prometheus counters and histograms for attachment uploads.
//!
//! The CLI writes a snapshot with `--metrics-out <PATH>` when a command
//! finishes. Embedders call [`gather_text`] themselves.

use crate::upload::{UploadError, UploadOutcome};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Chunk metrics
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "tsubame_upload_chunks_total",
        "Chunk upload exchanges by result",
        &["result"]  // "accepted", "retried" or "failed"
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "tsubame_upload_bytes_total",
        "Attachment bytes accepted by the server"
    ).unwrap();

    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "tsubame_uploads_total",
        "Attachment uploads by terminal outcome",
        &["outcome"]
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "tsubame_upload_duration_seconds",
        "Attachment upload duration in seconds",
        &["outcome"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]
    ).unwrap();

    // Mail metrics
    pub static ref MESSAGES_SENT: CounterVec = register_counter_vec!(
        "tsubame_messages_sent_total",
        "Messages sent by kind",
        &["kind"]  // "simple" or "attachment"
    ).unwrap();
}

/// Label for a terminal outcome
pub fn outcome_label(outcome: &UploadOutcome) -> &'static str {
    match outcome {
        UploadOutcome::Completed(_) => "completed",
        UploadOutcome::Failed(UploadError::Configuration(_)) => "configuration_error",
        UploadOutcome::Failed(UploadError::SessionExpired) => "session_expired",
        UploadOutcome::Failed(UploadError::ProtocolViolation(_)) => "protocol_violation",
        UploadOutcome::Failed(UploadError::RetriesExhausted { .. }) => "retries_exhausted",
        UploadOutcome::Failed(UploadError::Fatal(_)) => "fatal",
        UploadOutcome::Failed(UploadError::Cancelled) => "cancelled",
    }
}

/// Record a chunk the server accepted
pub fn record_chunk_accepted(bytes: u64) {
    CHUNKS_TOTAL.with_label_values(&["accepted"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a transient chunk failure that will be (or would have been) retried
pub fn record_chunk_retry() {
    CHUNKS_TOTAL.with_label_values(&["retried"]).inc();
}

/// Record a permanent chunk failure
pub fn record_chunk_failure() {
    CHUNKS_TOTAL.with_label_values(&["failed"]).inc();
}

/// Record an upload's terminal outcome and duration
pub fn record_upload_outcome(outcome: &UploadOutcome, duration_secs: f64) {
    let label = outcome_label(outcome);
    UPLOADS_TOTAL.with_label_values(&[label]).inc();
    UPLOAD_DURATION
        .with_label_values(&[label])
        .observe(duration_secs);
}

/// Record a sent message
pub fn record_message_sent(with_attachment: bool) {
    let kind = if with_attachment { "attachment" } else { "simple" };
    MESSAGES_SENT.with_label_values(&[kind]).inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> String {
    lazy_static::initialize(&CHUNKS_TOTAL);
    lazy_static::initialize(&UPLOAD_BYTES_TOTAL);
    lazy_static::initialize(&UPLOADS_TOTAL);
    lazy_static::initialize(&UPLOAD_DURATION);
    lazy_static::initialize(&MESSAGES_SENT);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
