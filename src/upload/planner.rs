//! Chunk planning
//!
//! Splits `[start_offset, total_size)` into aligned chunks. The plan is a
//! lazy iterator and can be recomputed from any offset the server reports.

use super::{UploadError, ALIGNMENT_UNIT};
use serde::{Deserialize, Serialize};

/// A contiguous byte range uploaded in one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub length: u32,
}

impl Chunk {
    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    /// `Content-Range` header value for this chunk within `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        if self.length == 0 {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", self.offset, self.end() - 1, total)
        }
    }
}

/// Lazy chunk sequence produced by [`plan`]
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_size: u64,
    max_chunk_size: u32,
    next_offset: u64,
    emit_empty: bool,
}

impl Iterator for ChunkPlan {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.emit_empty {
            self.emit_empty = false;
            return Some(Chunk {
                offset: 0,
                length: 0,
            });
        }

        if self.next_offset >= self.total_size {
            return None;
        }

        let remaining = self.total_size - self.next_offset;
        let length = remaining.min(self.max_chunk_size as u64) as u32;
        let chunk = Chunk {
            offset: self.next_offset,
            length,
        };
        self.next_offset += length as u64;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = if self.emit_empty {
            1
        } else {
            let remaining = self.total_size - self.next_offset.min(self.total_size);
            remaining.div_ceil(self.max_chunk_size as u64) as usize
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for ChunkPlan {}

/// Check that a chunk size respects the service alignment
pub fn validate_chunk_size(max_chunk_size: u32) -> Result<(), UploadError> {
    if max_chunk_size == 0 || max_chunk_size % ALIGNMENT_UNIT != 0 {
        return Err(UploadError::Configuration(format!(
            "max chunk size {} must be a positive multiple of {}",
            max_chunk_size, ALIGNMENT_UNIT
        )));
    }
    Ok(())
}

/// Plan the chunks covering `[start_offset, total_size)`.
///
/// An empty file yields a single zero-length chunk so the service can still
/// finalize the attachment.
pub fn plan(
    total_size: u64,
    max_chunk_size: u32,
    start_offset: u64,
) -> Result<ChunkPlan, UploadError> {
    validate_chunk_size(max_chunk_size)?;

    if start_offset > total_size {
        return Err(UploadError::Configuration(format!(
            "start offset {} is beyond total size {}",
            start_offset, total_size
        )));
    }

    Ok(ChunkPlan {
        total_size,
        max_chunk_size,
        next_offset: start_offset,
        emit_empty: total_size == 0,
    })
}
