//! Represents one uploaded version of a logical directory path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single archived version of a directory's packaged contents.
///
/// Several archives may exist for the same `(path, vault_id)`; the newest
/// by `uploaded_at` that is not marked for deletion is the current one.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Archive {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Logical path relative to the backup root (stable across versions).
    pub path: String,

    /// Vault holding this archive.
    pub vault_id: Uuid,

    /// Opaque archive id assigned by the storage service.
    pub remote_id: String,

    /// Hex tree hash of the uploaded bytes.
    pub content_hash: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// When the upload completed.
    pub uploaded_at: DateTime<Utc>,

    /// Remote locator returned on completion.
    pub remote_location: String,

    /// Marked as superseded; awaiting remote deletion.
    pub to_delete: bool,

    /// Failed remote delete attempts so far.
    pub delete_attempts: i64,

    /// Remote deletion gave up; left for operator inspection.
    pub delete_failed: bool,
}

/// Fields needed to record a freshly completed upload.
#[derive(Clone, Debug)]
pub struct NewArchive {
    pub path: String,
    pub vault_id: Uuid,
    pub remote_id: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub remote_location: String,
}
