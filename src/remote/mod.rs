//! Contract the engine needs from the cold-storage service.
//!
//! Only the calls used by the coordinators are modelled: vault creation,
//! multipart upload, delete, and the asynchronous retrieval job API.

pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::models::upload_part::ByteRange;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection closed, timeout, throttling, 5xx-equivalent.
    #[error("transient remote error: {0}")]
    Transient(String),
    #[error("remote resource `{0}` not found")]
    NotFound(String),
    #[error("remote rejected request: {0}")]
    Rejected(String),
    #[error("remote checksum mismatch: expected {expected}, remote computed {actual}")]
    ChecksumRejected { expected: String, actual: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Result of finalising a multipart upload.
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub remote_id: String,
    pub checksum: String,
    pub location: String,
}

/// Result of starting a retrieval job.
#[derive(Clone, Debug)]
pub struct InitiatedJob {
    pub job_id: String,
    pub location: String,
}

/// Remote job status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatusCode {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct JobStatus {
    pub completed: bool,
    pub status_code: JobStatusCode,
}

/// Body of a ranged job-output fetch. `status` mirrors the HTTP status the
/// service answered with; anything but 200/206 aborts the download.
#[derive(Clone, Debug)]
pub struct RangeOutput {
    pub status: u16,
    pub body: Bytes,
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn create_vault(&self, name: &str) -> RemoteResult<String>;

    async fn initiate_multipart_upload(
        &self,
        vault: &str,
        description: &str,
        part_size: u64,
    ) -> RemoteResult<String>;

    async fn upload_part(
        &self,
        vault: &str,
        upload_id: &str,
        range: ByteRange,
        body: Bytes,
    ) -> RemoteResult<()>;

    async fn complete_multipart_upload(
        &self,
        vault: &str,
        upload_id: &str,
        total_size: u64,
        digest: &str,
    ) -> RemoteResult<CompletedUpload>;

    async fn delete_object(&self, vault: &str, remote_id: &str) -> RemoteResult<()>;

    async fn initiate_retrieval_job(&self, vault: &str, remote_id: &str)
    -> RemoteResult<InitiatedJob>;

    async fn describe_job(&self, vault: &str, job_id: &str) -> RemoteResult<JobStatus>;

    async fn get_job_output_range(
        &self,
        vault: &str,
        job_id: &str,
        range: ByteRange,
    ) -> RemoteResult<RangeOutput>;
}

/// Whether an I/O error talking to the service is worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        if is_retryable_io(&err) {
            RemoteError::Transient(err.to_string())
        } else if err.kind() == std::io::ErrorKind::NotFound {
            RemoteError::NotFound(err.to_string())
        } else {
            RemoteError::Rejected(err.to_string())
        }
    }
}
