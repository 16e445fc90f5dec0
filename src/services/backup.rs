//! src/services/backup.rs
//!
//! Top-level driver wiring the archiver, change detection, the upload and
//! retrieval coordinators and retention into the operations the CLI exposes.

use crate::{
    archiver::{Archiver, PackedObject, container_name, list_dirs},
    config::EngineConfig,
    errors::{EngineError, EngineResult},
    models::{retrieval_job::RetrievalJob, vault::Vault},
    remote::RemoteStorage,
    services::{
        metadata_store::MetadataStore,
        retention::{ReclaimReport, RetentionManager},
        retrieval_coordinator::RetrievalCoordinator,
        upload_coordinator::{ResumeReport, UploadCoordinator},
    },
    treehash::tree_hash_file,
};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to one logical path during a backup run.
#[derive(Debug)]
pub enum PathOutcome {
    Uploaded,
    /// Same digest and size as the current archive.
    Unchanged,
    /// Changed, but uploads were disabled for this run.
    Skipped,
    Failed(EngineError),
}

impl fmt::Display for PathOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathOutcome::Uploaded => write!(f, "uploaded"),
            PathOutcome::Unchanged => write!(f, "unchanged"),
            PathOutcome::Skipped => write!(f, "skipped"),
            PathOutcome::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[derive(Debug, Default)]
pub struct BackupSummary {
    pub outcomes: Vec<(String, PathOutcome)>,
    /// Archives marked for deletion by the retention pass.
    pub marked: usize,
    pub reclaimed: ReclaimReport,
}

impl BackupSummary {
    pub fn count(&self, pred: impl Fn(&PathOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn uploaded(&self) -> usize {
        self.count(|o| matches!(o, PathOutcome::Uploaded))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, PathOutcome::Unchanged))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PathOutcome::Failed(_)))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackupOptions {
    /// Upload changed containers. Off means a dry run that only reports.
    pub upload: bool,
    /// Run retention after the uploads finish.
    pub prune: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            upload: true,
            prune: true,
        }
    }
}

/// A queued upload awaiting confirmation after the workers drain.
struct PendingUpload {
    logical_path: String,
    content_hash: String,
    /// Per-directory staging dir, removed once the upload is confirmed.
    staging: PathBuf,
}

#[derive(Clone)]
pub struct BackupEngine {
    store: MetadataStore,
    remote: Arc<dyn RemoteStorage>,
    archiver: Arc<dyn Archiver>,
    staging_dir: PathBuf,
    uploads: UploadCoordinator,
    retrievals: RetrievalCoordinator,
    retention: RetentionManager,
}

impl BackupEngine {
    pub fn new(
        store: MetadataStore,
        remote: Arc<dyn RemoteStorage>,
        archiver: Arc<dyn Archiver>,
        config: EngineConfig,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        let uploads = UploadCoordinator::new(store.clone(), remote.clone(), config.upload.clone());
        let retrievals = RetrievalCoordinator::new(
            store.clone(),
            remote.clone(),
            archiver.clone(),
            config.retrieval.clone(),
        );
        let retention = RetentionManager::new(store.clone(), remote.clone(), config.retention);
        Self {
            store,
            remote,
            archiver,
            staging_dir: staging_dir.into(),
            uploads,
            retrievals,
            retention,
        }
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    pub fn retrievals(&self) -> &RetrievalCoordinator {
        &self.retrievals
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Create the vault remotely and register it. Registering an existing
    /// name returns the stored row.
    pub async fn create_vault(&self, name: &str) -> EngineResult<Vault> {
        if let Some(vault) = self.store.vault_by_name(name).await? {
            info!("Vault {} already registered", name);
            return Ok(vault);
        }
        let arn = self.remote.create_vault(name).await?;
        let vault = self.store.create_vault(name, &arn).await?;
        info!("Created vault {} at {}", vault.name, vault.arn);
        Ok(vault)
    }

    pub async fn vault(&self, name: &str) -> EngineResult<Vault> {
        self.store
            .vault_by_name(name)
            .await?
            .ok_or_else(|| EngineError::VaultNotFound(name.to_string()))
    }

    /// Back up every directory under `top_dir` into `vault_name`.
    pub async fn backup_tree(
        &self,
        top_dir: &Path,
        vault_name: &str,
        options: BackupOptions,
    ) -> EngineResult<BackupSummary> {
        let vault = self.vault(vault_name).await?;
        let dirs = list_dirs(top_dir)?;
        info!("Backing up {} directories of {}", dirs.len(), top_dir.display());

        let mut summary = BackupSummary::default();
        let mut pending = Vec::new();
        for rel_dir in &dirs {
            self.backup_dir(top_dir, rel_dir, &vault, options, &mut summary, &mut pending)
                .await;
        }

        self.uploads.wait_for_finish().await;
        for upload in pending {
            let outcome = self.confirm_upload(&upload, &vault).await;
            summary.outcomes.push((upload.logical_path, outcome));
        }
        remove_dir_quietly(&self.staging_dir).await;

        if options.prune {
            summary.marked = self.retention.mark_vault(&vault).await?;
            summary.reclaimed = self.retention.reclaim(Some(&vault)).await?;
        }
        info!(
            "Backup of {} finished: {} uploaded, {} unchanged, {} failed",
            top_dir.display(),
            summary.uploaded(),
            summary.unchanged(),
            summary.failed()
        );
        Ok(summary)
    }

    /// Back up the files of a single directory (relative to `top_dir`).
    pub async fn backup_path(
        &self,
        top_dir: &Path,
        rel_dir: &str,
        vault_name: &str,
        options: BackupOptions,
    ) -> EngineResult<BackupSummary> {
        let vault = self.vault(vault_name).await?;
        let mut summary = BackupSummary::default();
        let mut pending = Vec::new();
        self.backup_dir(top_dir, rel_dir, &vault, options, &mut summary, &mut pending)
            .await;
        self.uploads.wait_for_finish().await;
        for upload in pending {
            let outcome = self.confirm_upload(&upload, &vault).await;
            if options.prune && matches!(outcome, PathOutcome::Uploaded) {
                summary.marked += self
                    .retention
                    .mark_prunable(&upload.logical_path, &vault)
                    .await?
                    .len();
            }
            summary.outcomes.push((upload.logical_path, outcome));
        }
        remove_dir_quietly(&self.staging_dir).await;
        if options.prune {
            summary.reclaimed = self.retention.reclaim(Some(&vault)).await?;
        }
        Ok(summary)
    }

    async fn backup_dir(
        &self,
        top_dir: &Path,
        rel_dir: &str,
        vault: &Vault,
        options: BackupOptions,
        summary: &mut BackupSummary,
        pending: &mut Vec<PendingUpload>,
    ) {
        let out_dir = self.staging_dir.join(Uuid::new_v4().to_string());
        let object = match self.archiver.pack(top_dir, rel_dir, &out_dir).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                remove_dir_quietly(&out_dir).await;
                return;
            }
            Err(err) => {
                error!("Failed to archive {}: {}", top_dir.join(rel_dir).display(), err);
                summary.outcomes.push((
                    container_name(top_dir, rel_dir),
                    PathOutcome::Failed(err.into()),
                ));
                remove_dir_quietly(&out_dir).await;
                return;
            }
        };

        let logical_path = object.logical_path.clone();
        match self.backup_object(object, vault, &out_dir, options).await {
            Ok(Some(upload)) => pending.push(upload),
            Ok(None) => {
                let outcome = if options.upload {
                    PathOutcome::Unchanged
                } else {
                    PathOutcome::Skipped
                };
                summary.outcomes.push((logical_path, outcome));
                remove_dir_quietly(&out_dir).await;
            }
            Err(err) => {
                error!("Failed to back up {}: {}", logical_path, err);
                summary.outcomes.push((logical_path, PathOutcome::Failed(err)));
                remove_dir_quietly(&out_dir).await;
            }
        }
    }

    /// Compare one packed object with the current archive and queue it if
    /// it changed. `None` means nothing was queued.
    async fn backup_object(
        &self,
        object: PackedObject,
        vault: &Vault,
        staging: &Path,
        options: BackupOptions,
    ) -> EngineResult<Option<PendingUpload>> {
        let (content_hash, size) = tree_hash_file(&object.path).await?;
        let current = self
            .store
            .most_recent_archive(&object.logical_path, vault.id)
            .await?;

        let unchanged = current
            .as_ref()
            .is_some_and(|a| a.content_hash == content_hash && a.size_bytes as u64 == size);
        if unchanged || !options.upload {
            if unchanged {
                info!("{} has not changed, not uploading", object.logical_path);
            } else {
                info!("{} changed; uploads disabled", object.logical_path);
            }
            remove_file_quietly(&object.path).await;
            return Ok(None);
        }

        debug!(
            "{} changed ({} bytes, digest {})",
            object.logical_path, size, content_hash
        );
        if let Err(err) = self
            .uploads
            .initialize_upload(vault, &object.path, &object.logical_path, &content_hash, size)
            .await
        {
            remove_file_quietly(&object.path).await;
            return Err(err);
        }
        Ok(Some(PendingUpload {
            logical_path: object.logical_path,
            content_hash,
            staging: staging.to_path_buf(),
        }))
    }

    /// Check that the queued upload landed. A confirmed upload's source file
    /// is already gone, so its staging dir is removed too; a failed one keeps
    /// the file for `resume`.
    async fn confirm_upload(&self, upload: &PendingUpload, vault: &Vault) -> PathOutcome {
        match self
            .store
            .most_recent_archive(&upload.logical_path, vault.id)
            .await
        {
            Ok(Some(archive)) if archive.content_hash == upload.content_hash => {
                remove_dir_quietly(&upload.staging).await;
                PathOutcome::Uploaded
            }
            Ok(_) => {
                warn!("Upload of {} did not complete", upload.logical_path);
                PathOutcome::Failed(EngineError::UploadIncomplete(upload.logical_path.clone()))
            }
            Err(err) => PathOutcome::Failed(err.into()),
        }
    }

    /// Start restoring the current version of `logical_path`. With `wait`
    /// the call returns only once every retrieval in flight has settled.
    pub async fn retrieve_path(
        &self,
        logical_path: &str,
        vault_name: &str,
        destination: &Path,
        wait: bool,
    ) -> EngineResult<RetrievalJob> {
        let vault = self.vault(vault_name).await?;
        let archive = self
            .store
            .most_recent_archive(logical_path, vault.id)
            .await?
            .ok_or_else(|| EngineError::ArchiveNotFound {
                path: logical_path.to_string(),
                vault: vault.name.clone(),
            })?;
        let job = self
            .retrievals
            .initiate_retrieval(archive.id, destination)
            .await?;
        if wait {
            self.retrievals.wait_for_idle().await;
        }
        Ok(job)
    }

    /// Pick up work left by an earlier process: unfinished uploads and
    /// retrieval jobs still waiting in `vault_name`.
    pub async fn resume(&self, vault_name: &str, wait: bool) -> EngineResult<ResumeReport> {
        let vault = self.vault(vault_name).await?;
        let report = self.uploads.resume().await?;
        if self.store.oldest_retrieval_job(vault.id).await?.is_some() {
            self.retrievals.ensure_poller(&vault).await;
        }
        if wait {
            self.uploads.wait_for_finish().await;
            self.retrievals.wait_for_idle().await;
        }
        Ok(report)
    }

    /// Mark superseded versions in `vault_name` and delete every marked
    /// archive.
    pub async fn prune_vault(&self, vault_name: &str) -> EngineResult<(usize, ReclaimReport)> {
        let vault = self.vault(vault_name).await?;
        let marked = self.retention.mark_vault(&vault).await?;
        let report = self.retention.reclaim(Some(&vault)).await?;
        info!(
            "Pruned vault {}: {} marked, {} deleted, {} failed",
            vault.name, marked, report.deleted, report.failed
        );
        Ok((marked, report))
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        debug!("could not remove {}: {}", path.display(), err);
    }
}

/// Remove a directory only if it is empty; files of uploads still in flight
/// keep it alive.
async fn remove_dir_quietly(path: &Path) {
    if let Err(err) = fs::remove_dir(path).await {
        debug!("keeping {}: {}", path.display(), err);
    }
}
