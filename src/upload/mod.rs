//! Upload module
//!
//! Resumable large-attachment uploads: chunk planning, session state,
//! single-chunk transport and the engine that drives them.

use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

pub mod engine;
pub mod planner;
pub mod retry;
pub mod session;
pub mod uploader;

pub use engine::{
    Clock, EngineState, ResumableUploadEngine, SystemClock, UploadOutcome, UploadProgress,
    UploadSettings,
};
pub use planner::{plan, Chunk, ChunkPlan};
pub use retry::RetryPolicy;
pub use session::UploadSession;
pub use uploader::{ChunkResult, ChunkUploader, HttpChunkUploader};

/// Byte granularity required by the upload service (320 KiB)
pub const ALIGNMENT_UNIT: u32 = 320 * 1024;

/// Default maximum chunk size, one alignment unit
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = ALIGNMENT_UNIT;

/// Upload errors
///
/// Every failed upload ends in exactly one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upload session expired")]
    SessionExpired,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Upload failed: {0}")]
    Fatal(String),

    #[error("Upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Whether the session may still be resumed after this failure
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::RetriesExhausted { .. })
    }
}

/// Seekable byte source with a fixed length.
///
/// Owned exclusively by the engine for the duration of one run.
pub struct AttachmentSource<R> {
    reader: R,
    len: u64,
}

impl AttachmentSource<File> {
    /// Open a file on disk
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { reader: file, len })
    }
}

impl<R: Read + Seek> AttachmentSource<R> {
    /// Wrap a reader, measuring its length by seeking to the end
    pub fn new(mut reader: R) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self { reader, len })
    }

    /// Total length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly the bytes covered by `chunk`
    pub fn read_chunk(&mut self, chunk: &Chunk) -> io::Result<Bytes> {
        if chunk.end() > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "chunk {}..{} is past the end of a {} byte source",
                    chunk.offset,
                    chunk.end(),
                    self.len
                ),
            ));
        }

        let mut buf = vec![0u8; chunk.length as usize];
        self.reader.seek(SeekFrom::Start(chunk.offset))?;
        self.reader.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}
