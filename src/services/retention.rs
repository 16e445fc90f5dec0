//! src/services/retention.rs
//!
//! Two-phase deletion of superseded archives. Marking is purely local and
//! safe to repeat; reclaiming issues the remote deletes and only drops a row
//! once the service has confirmed (or already forgotten) the archive.

use crate::{
    config::RetentionConfig,
    errors::{EngineError, EngineResult},
    models::{archive::Archive, vault::Vault},
    remote::{RemoteError, RemoteStorage},
    services::metadata_store::MetadataStore,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Totals from one `reclaim` pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub deleted: usize,
    /// Deletes that failed and will be retried on the next pass.
    pub failed: usize,
    /// Deletes that hit the attempt ceiling on this pass.
    pub dead_lettered: usize,
}

#[derive(Clone)]
pub struct RetentionManager {
    store: MetadataStore,
    remote: Arc<dyn RemoteStorage>,
    config: RetentionConfig,
}

impl RetentionManager {
    pub fn new(store: MetadataStore, remote: Arc<dyn RemoteStorage>, config: RetentionConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Mark the versions of `path` that fall outside the retention policy.
    pub async fn mark_prunable(&self, path: &str, vault: &Vault) -> EngineResult<Vec<Archive>> {
        let eligible = self
            .store
            .archives_eligible_for_pruning(
                path,
                vault.id,
                self.config.keep_versions,
                self.config.max_age,
            )
            .await?;

        let mut marked = Vec::with_capacity(eligible.len());
        for archive in eligible {
            if self.store.mark_for_deletion(archive.id).await? {
                info!(
                    "Marked {} from {} for deletion",
                    archive.path, archive.uploaded_at
                );
                marked.push(archive);
            }
        }
        Ok(marked)
    }

    /// Run the mark phase for every path with archives in `vault`.
    pub async fn mark_vault(&self, vault: &Vault) -> EngineResult<usize> {
        let mut total = 0;
        for path in self.store.archived_paths(vault.id).await? {
            total += self.mark_prunable(&path, vault).await?.len();
        }
        Ok(total)
    }

    /// Delete every marked archive remotely, then drop its row. Pass a vault
    /// to restrict the sweep; `None` reclaims across all vaults.
    pub async fn reclaim(&self, vault: Option<&Vault>) -> EngineResult<ReclaimReport> {
        let marked = self
            .store
            .archives_marked_for_deletion(vault.map(|v| v.id))
            .await?;
        let mut report = ReclaimReport::default();
        if marked.is_empty() {
            debug!("nothing to reclaim");
            return Ok(report);
        }

        let mut names: HashMap<Uuid, String> = HashMap::new();
        if let Some(vault) = vault {
            names.insert(vault.id, vault.name.clone());
        }

        for archive in marked {
            let vault_name = match names.get(&archive.vault_id) {
                Some(name) => name.clone(),
                None => {
                    let found = self
                        .store
                        .vault_by_id(archive.vault_id)
                        .await?
                        .ok_or_else(|| EngineError::VaultNotFound(archive.vault_id.to_string()))?;
                    names.insert(found.id, found.name.clone());
                    found.name
                }
            };

            match self
                .remote
                .delete_object(&vault_name, &archive.remote_id)
                .await
            {
                Ok(()) | Err(RemoteError::NotFound(_)) => {
                    self.store.delete_archive_record(archive.id).await?;
                    info!("Deleted {} ({})", archive.path, archive.remote_id);
                    report.deleted += 1;
                }
                Err(err) => {
                    let updated = self
                        .store
                        .record_delete_failure(archive.id, self.config.max_delete_attempts)
                        .await?;
                    if updated.is_some_and(|a| a.delete_failed) {
                        error!(
                            "Giving up deleting {} ({}): {}",
                            archive.path, archive.remote_id, err
                        );
                        report.dead_lettered += 1;
                    } else {
                        warn!(
                            "Failed to delete {} ({}): {}",
                            archive.path, archive.remote_id, err
                        );
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}
