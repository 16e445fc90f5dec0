//! Engine-level error type and the failure taxonomy reported upward.
//!
//! Components raise their own error enums (`StoreError`, `RemoteError`,
//! `ArchiverError`); top-level operations fold them into `EngineError`,
//! whose `kind()` tells the caller whether retrying makes sense.

use crate::{archiver::ArchiverError, remote::RemoteError, services::metadata_store::StoreError};
use std::{fmt, io};
use thiserror::Error;

/// Enumerated reason attached to every failed top-level operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection closed, timeout, 5xx; safe to retry later.
    Transient,
    /// Rejected by the remote service; left for inspection.
    Permanent,
    /// Downloaded bytes did not match the recorded digest.
    Integrity,
    /// Local disk or permission failure.
    LocalIo,
    /// Configuration or usage error (unknown vault, bad arguments).
    Invariant,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Integrity => "integrity",
            FailureKind::LocalIo => "local-io",
            FailureKind::Invariant => "invariant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("vault `{0}` not found")]
    VaultNotFound(String),
    #[error("no archive recorded for `{path}` in vault `{vault}`")]
    ArchiveNotFound { path: String, vault: String },
    #[error("archive {0} already has an active retrieval job")]
    RetrievalAlreadyActive(uuid::Uuid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("digest mismatch for archive {archive}: expected {expected}, got {actual}")]
    DigestMismatch {
        archive: uuid::Uuid,
        expected: String,
        actual: String,
    },
    #[error("upload of `{0}` did not complete")]
    UploadIncomplete(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Archiver(#[from] ArchiverError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::VaultNotFound(_)
            | EngineError::ArchiveNotFound { .. }
            | EngineError::RetrievalAlreadyActive(_)
            | EngineError::InvalidInput(_) => FailureKind::Invariant,
            EngineError::DigestMismatch { .. } => FailureKind::Integrity,
            EngineError::UploadIncomplete(_) => FailureKind::Transient,
            EngineError::Remote(err) if err.is_transient() => FailureKind::Transient,
            EngineError::Remote(_) => FailureKind::Permanent,
            EngineError::Store(_) | EngineError::Io(_) => FailureKind::LocalIo,
            EngineError::Archiver(err) => err.kind(),
        }
    }
}
