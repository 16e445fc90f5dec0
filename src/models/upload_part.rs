//! Represents multipart upload sessions and the parts queued for workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A multipart upload session, created before its parts are queued.
///
/// The session outlives its parts so that completion can be retried after
/// every part has been acknowledged.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Upload id returned by the remote service.
    pub upload_id: String,

    /// Vault the object is being uploaded to.
    pub vault_id: Uuid,

    /// Logical path the finished archive will be recorded under.
    pub logical_path: String,

    /// Local temporary object being uploaded.
    pub source_file_path: String,

    /// Total object size in bytes.
    pub full_object_size: i64,

    /// Tree hash of the whole object.
    pub full_object_hash: String,

    /// Part size the session was split with.
    pub part_size: i64,

    /// A worker is currently completing this upload.
    pub finalizing: bool,

    /// Failed completion attempts.
    pub completion_attempts: i64,

    /// Archive id once the remote side confirmed completion. A session with
    /// this set only still needs its archive row written.
    pub remote_id: Option<String>,

    /// Remote location reported alongside `remote_id`.
    pub remote_location: Option<String>,

    /// Timestamp when the upload was initiated.
    pub created_at: DateTime<Utc>,
}

/// One byte range of a multipart upload waiting to be sent.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadPart {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Parent upload session.
    pub upload_id: String,

    /// Vault the session belongs to.
    pub vault_id: Uuid,

    /// First byte of the range.
    pub byte_range_start: i64,

    /// Last byte of the range (inclusive).
    pub byte_range_end: i64,

    /// Local temporary object the bytes are read from.
    pub source_file_path: String,

    /// A worker holds this part.
    pub is_claimed: bool,

    /// Failed upload attempts.
    pub attempts: i64,

    /// Gave up after too many attempts; kept for inspection.
    pub dead_lettered: bool,

    pub full_object_size: i64,
    pub full_object_hash: String,
    pub logical_path: String,

    pub created_at: DateTime<Utc>,
}

impl UploadPart {
    /// Number of bytes covered by this part.
    pub fn len(&self) -> u64 {
        (self.byte_range_end - self.byte_range_start + 1) as u64
    }
}

/// Inclusive byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Split `[0, size)` into contiguous inclusive ranges of `chunk` bytes; the
/// last range is truncated to the remainder.
pub fn split_ranges(size: u64, chunk: u64) -> Vec<ByteRange> {
    if chunk == 0 {
        return Vec::new();
    }
    (0..size)
        .step_by(chunk as usize)
        .map(|start| ByteRange {
            start,
            end: (start + chunk).min(size) - 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn ranges_tile_the_object() {
        let ranges = split_ranges(40 * MIB, 16 * MIB);
        assert_eq!(ranges.len(), 3);
        assert_eq!(
            ranges.iter().map(ByteRange::len).collect::<Vec<_>>(),
            vec![16 * MIB, 16 * MIB, 8 * MIB]
        );

        let mut expected_start = 0;
        for range in &ranges {
            assert_eq!(range.start, expected_start);
            expected_start = range.end + 1;
        }
        assert_eq!(expected_start, 40 * MIB);
    }

    #[test]
    fn part_count_is_ceil_of_size_over_chunk() {
        for (size, chunk) in [(1, 4), (4, 4), (5, 4), (8, 4), (9, 4), (1000, 7)] {
            let ranges = split_ranges(size, chunk);
            assert_eq!(ranges.len() as u64, size.div_ceil(chunk), "size {size}");
            assert_eq!(ranges.iter().map(ByteRange::len).sum::<u64>(), size);
        }
    }

    #[test]
    fn empty_object_has_no_ranges() {
        assert!(split_ranges(0, 16).is_empty());
    }
}
