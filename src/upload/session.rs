//! Upload session state
//!
//! A pure state record for a server-allocated upload target. Opening the
//! session is the mail service's job; this type only tracks and advances it.

use super::UploadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Resumable upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    id: String,
    upload_url: String,
    expires_at: DateTime<Utc>,
    total_size: u64,
    next_expected_offset: u64,
}

impl UploadSession {
    /// Create session state from what the service returned
    pub fn new(
        id: impl Into<String>,
        upload_url: impl Into<String>,
        expires_at: DateTime<Utc>,
        total_size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            upload_url: upload_url.into(),
            expires_at,
            total_size,
            next_expected_offset: 0,
        }
    }

    /// Start from an offset the service already reports as received
    pub fn with_next_expected_offset(mut self, offset: u64) -> Self {
        self.next_expected_offset = offset.min(self.total_size);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn next_expected_offset(&self) -> u64 {
        self.next_expected_offset
    }

    /// Record that the server has accepted everything below `accepted_up_to`.
    ///
    /// The offset never moves backwards; a regression is a server/client
    /// desync and fails the whole upload.
    pub fn advance(&mut self, accepted_up_to: u64) -> Result<(), UploadError> {
        if accepted_up_to < self.next_expected_offset {
            return Err(UploadError::ProtocolViolation(format!(
                "server offset regressed from {} to {}",
                self.next_expected_offset, accepted_up_to
            )));
        }
        if accepted_up_to > self.total_size {
            return Err(UploadError::ProtocolViolation(format!(
                "server offset {} is beyond total size {}",
                accepted_up_to, self.total_size
            )));
        }
        self.next_expected_offset = accepted_up_to;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Write a JSON checkpoint so a later run can resume this session
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Load a checkpoint written by [`UploadSession::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read(path)?;
        let session = serde_json::from_slice(&content)?;
        Ok(session)
    }
}
