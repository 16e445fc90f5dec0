//! Represents a vault, a named remote archival container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A cold-storage vault registered with the local database.
///
/// Vaults are created once through the remote service and are read-only for
/// the transfer engine afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Vault {
    /// Unique identifier for this vault (UUID for internal DB use).
    pub id: Uuid,

    /// Vault name as known to the remote service.
    pub name: String,

    /// Identifier (ARN / location URI) returned when the vault was created.
    pub arn: String,

    /// When this vault was registered locally.
    pub created_at: DateTime<Utc>,
}
