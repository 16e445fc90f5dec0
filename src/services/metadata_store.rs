//! src/services/metadata_store.rs
//!
//! MetadataStore: the single durable record of vaults, archives, queued
//! upload parts and retrieval jobs, backed by SQLite. Every mutation is one
//! SQL statement (or one transaction), so concurrent workers observe
//! compare-and-set semantics: a part is claimed by `UPDATE … WHERE
//! is_claimed = 0 … RETURNING`, never by reading a row and writing it back.

use crate::models::{
    archive::{Archive, NewArchive},
    retrieval_job::{RetrievalJob, RetrievalState},
    upload_part::{ByteRange, UploadPart, UploadSession},
    vault::Vault,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("archive {0} already has an active retrieval job")]
    RetrievalAlreadyActive(Uuid),
    #[error("upload `{0}` already exists")]
    UploadAlreadyExists(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything needed to queue a new multipart upload.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub upload_id: String,
    pub vault_id: Uuid,
    pub logical_path: String,
    pub source_file_path: String,
    pub full_object_size: i64,
    pub full_object_hash: String,
    pub part_size: i64,
}

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    // ---------------------------------------------------------------------
    // Vaults
    // ---------------------------------------------------------------------

    /// Register a vault. Registering an existing name returns the stored row.
    pub async fn create_vault(&self, name: &str, arn: &str) -> StoreResult<Vault> {
        let vault = Vault {
            id: Uuid::new_v4(),
            name: name.to_string(),
            arn: arn.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO vaults (id, name, arn, created_at) VALUES (?, ?, ?, ?)")
            .bind(vault.id)
            .bind(&vault.name)
            .bind(&vault.arn)
            .bind(vault.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(vault),
            Err(err) if is_unique_violation(&err) => {
                debug!("vault {} already registered", name);
                self.vault_by_name(name)
                    .await?
                    .ok_or(StoreError::Sqlx(sqlx::Error::RowNotFound))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Look up a registered vault by its name.
    pub async fn vault_by_name(&self, name: &str) -> StoreResult<Option<Vault>> {
        Ok(
            sqlx::query_as::<_, Vault>("SELECT id, name, arn, created_at FROM vaults WHERE name = ?")
                .bind(name)
                .fetch_optional(&*self.db)
                .await?,
        )
    }

    /// Look up a registered vault by id.
    pub async fn vault_by_id(&self, id: Uuid) -> StoreResult<Option<Vault>> {
        Ok(
            sqlx::query_as::<_, Vault>("SELECT id, name, arn, created_at FROM vaults WHERE id = ?")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?,
        )
    }

    // ---------------------------------------------------------------------
    // Archives
    // ---------------------------------------------------------------------

    /// Record an archive uploaded just now.
    pub async fn insert_archive(&self, archive: &NewArchive) -> StoreResult<Archive> {
        self.insert_archive_at(archive, Utc::now()).await
    }

    /// Insert an archive with an explicit upload time (imports, tests).
    pub async fn insert_archive_at(
        &self,
        archive: &NewArchive,
        uploaded_at: DateTime<Utc>,
    ) -> StoreResult<Archive> {
        Ok(sqlx::query_as::<_, Archive>(
            r#"
            INSERT INTO archives (
                id, path, vault_id, remote_id, content_hash, size_bytes,
                uploaded_at, remote_location, to_delete, delete_attempts, delete_failed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&archive.path)
        .bind(archive.vault_id)
        .bind(&archive.remote_id)
        .bind(&archive.content_hash)
        .bind(archive.size_bytes)
        .bind(uploaded_at)
        .bind(&archive.remote_location)
        .fetch_one(&*self.db)
        .await?)
    }

    /// Fetch an archive row, marked or not.
    pub async fn archive_by_id(&self, id: Uuid) -> StoreResult<Option<Archive>> {
        Ok(
            sqlx::query_as::<_, Archive>("SELECT * FROM archives WHERE id = ?")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?,
        )
    }

    /// Newest version of `path` that is not marked for deletion.
    pub async fn most_recent_archive(
        &self,
        path: &str,
        vault_id: Uuid,
    ) -> StoreResult<Option<Archive>> {
        Ok(sqlx::query_as::<_, Archive>(
            "SELECT * FROM archives
             WHERE path = ? AND vault_id = ? AND to_delete = 0
             ORDER BY uploaded_at DESC
             LIMIT 1",
        )
        .bind(path)
        .bind(vault_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Non-deleted versions of `path`, newest first, minus the newest
    /// `min_versions_to_keep`, filtered to those older than `max_age`.
    pub async fn archives_eligible_for_pruning(
        &self,
        path: &str,
        vault_id: Uuid,
        min_versions_to_keep: u32,
        max_age: chrono::Duration,
    ) -> StoreResult<Vec<Archive>> {
        let cutoff = Utc::now() - max_age;
        Ok(sqlx::query_as::<_, Archive>(
            "SELECT * FROM (
                 SELECT * FROM archives
                 WHERE path = ? AND vault_id = ? AND to_delete = 0
                 ORDER BY uploaded_at DESC
                 LIMIT -1 OFFSET ?
             )
             WHERE uploaded_at < ?
             ORDER BY uploaded_at DESC",
        )
        .bind(path)
        .bind(vault_id)
        .bind(i64::from(min_versions_to_keep))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Distinct logical paths with live archives in a vault.
    pub async fn archived_paths(&self, vault_id: Uuid) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT path FROM archives WHERE vault_id = ? AND to_delete = 0 ORDER BY path",
        )
        .bind(vault_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Set `to_delete`. Returns false if the archive does not exist or was
    /// already marked.
    pub async fn mark_for_deletion(&self, archive_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE archives SET to_delete = 1 WHERE id = ? AND to_delete = 0")
            .bind(archive_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Marked archives still awaiting a remote delete, oldest first.
    /// Dead-lettered archives are excluded.
    pub async fn archives_marked_for_deletion(
        &self,
        vault_id: Option<Uuid>,
    ) -> StoreResult<Vec<Archive>> {
        Ok(sqlx::query_as::<_, Archive>(
            "SELECT * FROM archives
             WHERE to_delete = 1 AND delete_failed = 0 AND (? IS NULL OR vault_id = ?)
             ORDER BY uploaded_at ASC",
        )
        .bind(vault_id)
        .bind(vault_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Count a failed remote delete; dead-letters the archive once
    /// `max_attempts` is reached.
    pub async fn record_delete_failure(
        &self,
        archive_id: Uuid,
        max_attempts: u32,
    ) -> StoreResult<Option<Archive>> {
        Ok(sqlx::query_as::<_, Archive>(
            "UPDATE archives
             SET delete_attempts = delete_attempts + 1,
                 delete_failed = (delete_attempts + 1 >= ?)
             WHERE id = ? AND to_delete = 1
             RETURNING *",
        )
        .bind(i64::from(max_attempts))
        .bind(archive_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Drop an archive row once its remote object is gone.
    pub async fn delete_archive_record(&self, archive_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM archives WHERE id = ?")
            .bind(archive_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ---------------------------------------------------------------------
    // Upload sessions and parts
    // ---------------------------------------------------------------------

    /// Persist a session and one unclaimed part per range in a single
    /// transaction, so a crash never leaves a partially split upload.
    pub async fn create_parts(
        &self,
        upload: &NewUpload,
        ranges: &[ByteRange],
    ) -> StoreResult<UploadSession> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let session = match sqlx::query_as::<_, UploadSession>(
            r#"
            INSERT INTO upload_sessions (
                upload_id, vault_id, logical_path, source_file_path, full_object_size,
                full_object_hash, part_size, finalizing, completion_attempts, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?)
            RETURNING *
            "#,
        )
        .bind(&upload.upload_id)
        .bind(upload.vault_id)
        .bind(&upload.logical_path)
        .bind(&upload.source_file_path)
        .bind(upload.full_object_size)
        .bind(&upload.full_object_hash)
        .bind(upload.part_size)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        {
            Ok(session) => session,
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::UploadAlreadyExists(upload.upload_id.clone()));
            }
            Err(err) => return Err(StoreError::Sqlx(err)),
        };

        for range in ranges {
            sqlx::query(
                r#"
                INSERT INTO upload_parts (
                    id, upload_id, vault_id, byte_range_start, byte_range_end,
                    source_file_path, is_claimed, attempts, dead_lettered,
                    full_object_size, full_object_hash, logical_path, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&upload.upload_id)
            .bind(upload.vault_id)
            .bind(range.start as i64)
            .bind(range.end as i64)
            .bind(&upload.source_file_path)
            .bind(upload.full_object_size)
            .bind(&upload.full_object_hash)
            .bind(&upload.logical_path)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(session)
    }

    /// Atomically claim the oldest claimable part, optionally restricted to
    /// one upload. `None` means the queue is drained.
    pub async fn claim_oldest_unclaimed_part(
        &self,
        upload_id: Option<&str>,
    ) -> StoreResult<Option<UploadPart>> {
        Ok(sqlx::query_as::<_, UploadPart>(
            "UPDATE upload_parts SET is_claimed = 1
             WHERE rowid = (
                 SELECT rowid FROM upload_parts
                 WHERE is_claimed = 0 AND dead_lettered = 0 AND (? IS NULL OR upload_id = ?)
                 ORDER BY rowid
                 LIMIT 1
             )
             AND is_claimed = 0
             RETURNING *",
        )
        .bind(upload_id)
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Whether any part could still be claimed.
    pub async fn has_claimable_parts(&self) -> StoreResult<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM upload_parts WHERE is_claimed = 0 AND dead_lettered = 0)",
        )
        .fetch_one(&*self.db)
        .await?)
    }

    /// Return a claimed part to the queue after a failed attempt. Once
    /// `max_attempts` failures accumulate the part is dead-lettered: it stays
    /// in the table (blocking completion) but is never claimed again.
    pub async fn release_part(
        &self,
        part_id: Uuid,
        max_attempts: u32,
    ) -> StoreResult<Option<UploadPart>> {
        Ok(sqlx::query_as::<_, UploadPart>(
            "UPDATE upload_parts
             SET is_claimed = 0,
                 attempts = attempts + 1,
                 dead_lettered = (attempts + 1 >= ?)
             WHERE id = ?
             RETURNING *",
        )
        .bind(i64::from(max_attempts))
        .bind(part_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Dead-letter a part immediately (permanent remote rejection).
    pub async fn dead_letter_part(&self, part_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_parts SET is_claimed = 0, attempts = attempts + 1, dead_lettered = 1
             WHERE id = ?",
        )
        .bind(part_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove an acknowledged part from the queue.
    pub async fn delete_part(&self, part_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM upload_parts WHERE id = ?")
            .bind(part_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether any part row (claimed, unclaimed or dead-lettered) remains.
    pub async fn remaining_parts_for_upload(&self, upload_id: &str) -> StoreResult<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM upload_parts WHERE upload_id = ?)",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await?)
    }

    /// Every part row of an upload, in byte order.
    pub async fn parts_for_upload(&self, upload_id: &str) -> StoreResult<Vec<UploadPart>> {
        Ok(sqlx::query_as::<_, UploadPart>(
            "SELECT * FROM upload_parts WHERE upload_id = ? ORDER BY byte_range_start",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Unclaim every part. Only valid when no worker is running, i.e. on
    /// start-up after a crash.
    pub async fn reset_claimed_parts(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE upload_parts SET is_claimed = 0 WHERE is_claimed = 1")
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// The session row for `upload_id`, if it has not been completed.
    pub async fn upload_session(&self, upload_id: &str) -> StoreResult<Option<UploadSession>> {
        Ok(
            sqlx::query_as::<_, UploadSession>("SELECT * FROM upload_sessions WHERE upload_id = ?")
                .bind(upload_id)
                .fetch_optional(&*self.db)
                .await?,
        )
    }

    /// Take the right to complete an upload. Succeeds for exactly one caller,
    /// and only once every part row is gone.
    pub async fn claim_session_for_completion(
        &self,
        upload_id: &str,
        max_attempts: u32,
    ) -> StoreResult<Option<UploadSession>> {
        Ok(sqlx::query_as::<_, UploadSession>(
            "UPDATE upload_sessions SET finalizing = 1
             WHERE upload_id = ?
               AND finalizing = 0
               AND completion_attempts < ?
               AND NOT EXISTS (SELECT 1 FROM upload_parts WHERE upload_id = upload_sessions.upload_id)
             RETURNING *",
        )
        .bind(upload_id)
        .bind(i64::from(max_attempts))
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Give up the completion claim after a failed attempt.
    pub async fn release_session(&self, upload_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET finalizing = 0, completion_attempts = completion_attempts + 1
             WHERE upload_id = ?",
        )
        .bind(upload_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remember that the remote service completed the upload, so a failed
    /// archive insert can be retried without completing it again.
    pub async fn record_remote_completion(
        &self,
        upload_id: &str,
        remote_id: &str,
        remote_location: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET remote_id = ?, remote_location = ? WHERE upload_id = ?",
        )
        .bind(remote_id)
        .bind(remote_location)
        .bind(upload_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Sessions whose parts are all acknowledged but which are not yet
    /// completed and not being completed right now.
    pub async fn sessions_awaiting_completion(
        &self,
        max_attempts: u32,
    ) -> StoreResult<Vec<UploadSession>> {
        Ok(sqlx::query_as::<_, UploadSession>(
            "SELECT * FROM upload_sessions
             WHERE finalizing = 0
               AND completion_attempts < ?
               AND NOT EXISTS (SELECT 1 FROM upload_parts WHERE upload_id = upload_sessions.upload_id)
             ORDER BY created_at",
        )
        .bind(i64::from(max_attempts))
        .fetch_all(&*self.db)
        .await?)
    }

    /// Clear completion claims left by a crashed process.
    pub async fn reset_finalizing_sessions(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE upload_sessions SET finalizing = 0 WHERE finalizing = 1")
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Record the finished archive and drop its session in one transaction.
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        archive: &NewArchive,
    ) -> StoreResult<Archive> {
        let mut tx = self.db.begin().await?;
        let recorded = sqlx::query_as::<_, Archive>(
            r#"
            INSERT INTO archives (
                id, path, vault_id, remote_id, content_hash, size_bytes,
                uploaded_at, remote_location, to_delete, delete_attempts, delete_failed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&archive.path)
        .bind(archive.vault_id)
        .bind(&archive.remote_id)
        .bind(&archive.content_hash)
        .bind(archive.size_bytes)
        .bind(Utc::now())
        .bind(&archive.remote_location)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(recorded)
    }

    // ---------------------------------------------------------------------
    // Retrieval jobs
    // ---------------------------------------------------------------------

    /// Persist a newly initiated retrieval in state `requested`. Fails with
    /// `RetrievalAlreadyActive` if the archive already has a live job.
    pub async fn create_retrieval_job(
        &self,
        remote_job_id: &str,
        vault_id: Uuid,
        archive_id: Uuid,
        destination_path: &str,
    ) -> StoreResult<RetrievalJob> {
        let now = Utc::now();
        match sqlx::query_as::<_, RetrievalJob>(
            r#"
            INSERT INTO retrieval_jobs (
                id, remote_job_id, vault_id, archive_id, destination_path, state,
                poll_count, attempts, last_error, created_at, last_polled_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, NULL, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(remote_job_id)
        .bind(vault_id)
        .bind(archive_id)
        .bind(destination_path)
        .bind(RetrievalState::Requested)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await
        {
            Ok(job) => Ok(job),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::RetrievalAlreadyActive(archive_id))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Fetch a retrieval job by id, failed jobs included.
    pub async fn retrieval_job(&self, job_id: Uuid) -> StoreResult<Option<RetrievalJob>> {
        Ok(
            sqlx::query_as::<_, RetrievalJob>("SELECT * FROM retrieval_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&*self.db)
                .await?,
        )
    }

    /// Active (non-failed) job for an archive, if any.
    pub async fn active_retrieval_for_archive(
        &self,
        archive_id: Uuid,
    ) -> StoreResult<Option<RetrievalJob>> {
        Ok(sqlx::query_as::<_, RetrievalJob>(
            "SELECT * FROM retrieval_jobs WHERE archive_id = ? AND state != 'failed'",
        )
        .bind(archive_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// The least recently polled active job in a vault.
    pub async fn oldest_retrieval_job(&self, vault_id: Uuid) -> StoreResult<Option<RetrievalJob>> {
        Ok(sqlx::query_as::<_, RetrievalJob>(
            "SELECT * FROM retrieval_jobs
             WHERE vault_id = ? AND state != 'failed'
             ORDER BY last_polled_at ASC, created_at ASC
             LIMIT 1",
        )
        .bind(vault_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Every retrieval job in a vault, failed jobs included.
    pub async fn retrieval_jobs(&self, vault_id: Uuid) -> StoreResult<Vec<RetrievalJob>> {
        Ok(sqlx::query_as::<_, RetrievalJob>(
            "SELECT * FROM retrieval_jobs WHERE vault_id = ? ORDER BY created_at",
        )
        .bind(vault_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Record a "not ready yet" poll.
    pub async fn touch_retrieval_job(&self, job_id: Uuid) -> StoreResult<Option<RetrievalJob>> {
        Ok(sqlx::query_as::<_, RetrievalJob>(
            "UPDATE retrieval_jobs
             SET last_polled_at = ?, poll_count = poll_count + 1, state = ?
             WHERE id = ? AND state != 'failed'
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(RetrievalState::Polling)
        .bind(job_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Move a job to `state`. Returns false if the row is gone.
    pub async fn set_retrieval_state(
        &self,
        job_id: Uuid,
        state: RetrievalState,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE retrieval_jobs SET state = ? WHERE id = ?")
            .bind(state)
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count a failed attempt and move the job to the back of the poll
    /// order. The job turns `failed` once `max_attempts` is reached.
    pub async fn record_retrieval_failure(
        &self,
        job_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> StoreResult<Option<RetrievalJob>> {
        Ok(sqlx::query_as::<_, RetrievalJob>(
            "UPDATE retrieval_jobs
             SET attempts = attempts + 1,
                 last_error = ?,
                 last_polled_at = ?,
                 state = CASE WHEN attempts + 1 >= ? THEN 'failed' ELSE state END
             WHERE id = ?
             RETURNING *",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(i64::from(max_attempts))
        .bind(job_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Mark a job permanently failed; the row is kept for inspection.
    pub async fn fail_retrieval_job(&self, job_id: Uuid, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE retrieval_jobs SET state = 'failed', last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(job_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop a finished job.
    pub async fn delete_retrieval_job(&self, job_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM retrieval_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
