//! Represents an asynchronous retrieval of an archive from cold storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Persisted stage of a retrieval, stored under its lowercase name. `Done`
/// is not stored: a finished job's row is deleted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RetrievalState {
    Requested,
    Polling,
    Ready,
    Downloading,
    Verifying,
    Failed,
}

/// An in-progress retrieval job.
///
/// At most one non-failed job exists per archive.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct RetrievalJob {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Job id assigned by the remote service.
    pub remote_job_id: String,

    /// Vault the archive lives in.
    pub vault_id: Uuid,

    /// Archive being retrieved.
    pub archive_id: Uuid,

    /// Local directory the archive is unpacked into.
    pub destination_path: String,

    pub state: RetrievalState,

    /// Times the remote job has been reported not ready.
    pub poll_count: i64,

    /// Failed download / verification attempts.
    pub attempts: i64,

    /// Most recent failure, if any.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Last time the remote job status was queried.
    pub last_polled_at: DateTime<Utc>,
}
