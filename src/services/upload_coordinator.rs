//! src/services/upload_coordinator.rs
//!
//! UploadCoordinator: splits a local object into fixed-size parts, queues
//! them in the metadata store and drains the queue with a fixed-size pool of
//! workers shared by every upload.
//!
//! Workers claim parts through the store (the only synchronisation point),
//! so several uploads can be in flight at once and a crash loses nothing but
//! the parts that were mid-flight; `resume()` puts those back in the queue.

use crate::{
    config::UploadConfig,
    errors::{EngineError, EngineResult},
    models::{
        archive::{Archive, NewArchive},
        upload_part::{ByteRange, UploadPart, UploadSession, split_ranges},
        vault::Vault,
    },
    remote::RemoteStorage,
    services::metadata_store::{MetadataStore, NewUpload},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    io::SeekFrom,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of a `resume()` pass.
#[derive(Debug, Default)]
pub struct ResumeReport {
    /// Parts whose stale claim was cleared.
    pub released_parts: u64,
    /// Uploads whose completion succeeded during the pass.
    pub completed: Vec<Archive>,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: MetadataStore,
    remote: Arc<dyn RemoteStorage>,
    config: UploadConfig,
    pool: Mutex<WorkerPool>,
    vault_names: Mutex<HashMap<Uuid, String>>,
}

#[derive(Default)]
struct WorkerPool {
    /// Workers currently holding a slot.
    live: usize,
    handles: Vec<JoinHandle<()>>,
    next_id: usize,
}

/// A worker's seat in the pool. Dropping it (including on panic) frees the
/// seat so the pool can be refilled.
struct Slot {
    inner: Arc<Inner>,
    held: bool,
}

impl Slot {
    fn release(&mut self) {
        if self.held {
            self.inner.lock_pool().live -= 1;
            self.held = false;
        }
    }

    /// Take a seat back if the pool has room.
    fn reacquire(&mut self) -> bool {
        let mut pool = self.inner.lock_pool();
        if pool.live < self.inner.config.workers {
            pool.live += 1;
            self.held = true;
        }
        self.held
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

impl UploadCoordinator {
    pub fn new(store: MetadataStore, remote: Arc<dyn RemoteStorage>, config: UploadConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                config,
                pool: Mutex::new(WorkerPool::default()),
                vault_names: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a multipart upload for `local_object_path`, queue its parts and
    /// make sure the worker pool is running.
    pub async fn initialize_upload(
        &self,
        vault: &Vault,
        local_object_path: &Path,
        logical_path: &str,
        content_hash: &str,
        size: u64,
    ) -> EngineResult<UploadSession> {
        if size == 0 {
            return Err(EngineError::InvalidInput(format!(
                "`{}` is empty; zero-byte objects cannot be uploaded in parts",
                logical_path
            )));
        }
        let part_size = self.inner.config.part_size;

        let upload_id = self
            .inner
            .remote
            .initiate_multipart_upload(&vault.name, logical_path, part_size)
            .await
            .inspect_err(|err| error!("Failed to init multipart upload for {}: {}", logical_path, err))?;
        self.inner.remember_vault(vault);

        let ranges = split_ranges(size, part_size);
        let session = self
            .inner
            .store
            .create_parts(
                &NewUpload {
                    upload_id: upload_id.clone(),
                    vault_id: vault.id,
                    logical_path: logical_path.to_string(),
                    source_file_path: local_object_path.to_string_lossy().into_owned(),
                    full_object_size: size as i64,
                    full_object_hash: content_hash.to_string(),
                    part_size: part_size as i64,
                },
                &ranges,
            )
            .await?;
        info!(
            "Queued {} parts of {} bytes for {} (upload {})",
            ranges.len(),
            part_size,
            logical_path,
            upload_id
        );

        self.ensure_workers();
        Ok(session)
    }

    /// Fill the pool up to the configured worker count.
    pub fn ensure_workers(&self) {
        let mut pool = self.inner.lock_pool();
        pool.handles.retain(|handle| !handle.is_finished());
        while pool.live < self.inner.config.workers {
            pool.live += 1;
            pool.next_id += 1;
            let worker_id = pool.next_id;
            let slot = Slot {
                inner: self.inner.clone(),
                held: true,
            };
            let inner = self.inner.clone();
            pool.handles
                .push(tokio::spawn(async move { inner.worker_loop(worker_id, slot).await }));
            debug!("spawned upload worker {}", worker_id);
        }
    }

    /// Number of workers currently running.
    pub fn live_workers(&self) -> usize {
        self.inner.lock_pool().live
    }

    /// Block until every worker has exited.
    pub async fn wait_for_finish(&self) {
        loop {
            let handles = std::mem::take(&mut self.inner.lock_pool().handles);
            if handles.is_empty() {
                break;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(err) = result {
                    error!("upload worker terminated abnormally: {}", err);
                }
            }
        }
    }

    /// Recover after a restart: clear stale claims, retry completions whose
    /// parts are all acknowledged, and restart workers for leftover parts.
    pub async fn resume(&self) -> EngineResult<ResumeReport> {
        let mut report = ResumeReport::default();
        if self.live_workers() == 0 {
            report.released_parts = self.inner.store.reset_claimed_parts().await?;
            let reset = self.inner.store.reset_finalizing_sessions().await?;
            if report.released_parts > 0 || reset > 0 {
                info!(
                    "Released {} stale part claims and {} completion claims",
                    report.released_parts, reset
                );
            }
        }

        let pending = self
            .inner
            .store
            .sessions_awaiting_completion(self.inner.config.max_completion_attempts)
            .await?;
        for session in pending {
            match self.inner.finalize(&session.upload_id).await {
                Ok(Some(archive)) => report.completed.push(archive),
                Ok(None) => {}
                Err(err) => warn!("Completion of {} still failing: {}", session.upload_id, err),
            }
        }

        if self.inner.store.has_claimable_parts().await? {
            self.ensure_workers();
        }
        Ok(report)
    }
}

impl Inner {
    fn lock_pool(&self) -> MutexGuard<'_, WorkerPool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember_vault(&self, vault: &Vault) {
        self.vault_names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(vault.id, vault.name.clone());
    }

    async fn vault_name(&self, vault_id: Uuid) -> EngineResult<String> {
        let cached = self
            .vault_names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&vault_id)
            .cloned();
        if let Some(name) = cached {
            return Ok(name);
        }
        let vault = self
            .store
            .vault_by_id(vault_id)
            .await?
            .ok_or_else(|| EngineError::VaultNotFound(vault_id.to_string()))?;
        self.remember_vault(&vault);
        Ok(vault.name)
    }

    /// Claim and upload parts until the whole queue is empty.
    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut slot: Slot) {
        loop {
            match self.store.claim_oldest_unclaimed_part(None).await {
                Ok(Some(part)) => {
                    debug!(
                        "worker {} claimed bytes {}-{} of upload {}",
                        worker_id, part.byte_range_start, part.byte_range_end, part.upload_id
                    );
                    self.process_part(part).await;
                    continue;
                }
                Ok(None) => {}
                Err(err) => error!("worker {} could not claim a part: {}", worker_id, err),
            }

            // Give up the seat first, then look again: an upload queued in
            // between either sees the free seat or is seen here.
            slot.release();
            match self.store.has_claimable_parts().await {
                Ok(true) if slot.reacquire() => continue,
                Ok(_) => {}
                Err(err) => error!("worker {} could not inspect the queue: {}", worker_id, err),
            }
            debug!("upload worker {} exiting, queue drained", worker_id);
            return;
        }
    }

    async fn process_part(&self, part: UploadPart) {
        let range = ByteRange {
            start: part.byte_range_start as u64,
            end: part.byte_range_end as u64,
        };

        let vault = match self.vault_name(part.vault_id).await {
            Ok(vault) => vault,
            Err(err) => {
                error!("Cannot resolve vault for upload {}: {}", part.upload_id, err);
                self.release(&part).await;
                return;
            }
        };

        let body = match read_range(Path::new(&part.source_file_path), range).await {
            Ok(body) => body,
            Err(err) => {
                error!(
                    "Failed to read bytes {}-{} of {}: {}",
                    range.start, range.end, part.source_file_path, err
                );
                self.release(&part).await;
                return;
            }
        };

        match self
            .remote
            .upload_part(&vault, &part.upload_id, range, body)
            .await
        {
            Ok(()) => {
                if let Err(err) = self.store.delete_part(part.id).await {
                    error!("Uploaded part {} but could not delete its row: {}", part.id, err);
                    self.release(&part).await;
                    return;
                }
                info!(
                    "Uploaded bytes {} to {} of {}",
                    range.start, range.end, part.source_file_path
                );
                self.complete_if_done(&part.upload_id).await;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    "Failed to upload bytes {}-{} of upload {}: {}",
                    range.start, range.end, part.upload_id, err
                );
                self.release(&part).await;
            }
            Err(err) => {
                error!(
                    "Remote rejected bytes {}-{} of upload {}: {}",
                    range.start, range.end, part.upload_id, err
                );
                if let Err(err) = self.store.dead_letter_part(part.id).await {
                    error!("Could not dead-letter part {}: {}", part.id, err);
                }
            }
        }
    }

    /// Put a part back in the queue and pause before claiming again.
    async fn release(&self, part: &UploadPart) {
        match self
            .store
            .release_part(part.id, self.config.max_part_attempts)
            .await
        {
            Ok(Some(released)) if released.dead_lettered => error!(
                "Giving up on bytes {}-{} of upload {} after {} attempts",
                released.byte_range_start,
                released.byte_range_end,
                released.upload_id,
                released.attempts
            ),
            Ok(Some(released)) => {
                let delay = self
                    .config
                    .failure_backoff
                    .delay(released.attempts.saturating_sub(1) as u32);
                tokio::time::sleep(delay).await;
            }
            Ok(None) => warn!("Part {} vanished before it could be released", part.id),
            Err(err) => error!("Could not release part {}: {}", part.id, err),
        }
    }

    async fn complete_if_done(&self, upload_id: &str) {
        match self.store.remaining_parts_for_upload(upload_id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.finalize(upload_id).await {
                    error!("Failed to complete multipart upload {}: {}", upload_id, err);
                }
            }
            Err(err) => error!("Could not count parts of upload {}: {}", upload_id, err),
        }
    }

    async fn release_after_failure(&self, upload_id: &str) {
        if let Err(err) = self.store.release_session(upload_id).await {
            error!("Could not release completion of {}: {}", upload_id, err);
        }
    }

    /// Complete the remote upload and record the archive. Returns `None`
    /// when another worker already holds the completion. A remote completion
    /// is persisted on the session first, so a retry after a failed insert
    /// skips straight to recording the archive.
    async fn finalize(&self, upload_id: &str) -> EngineResult<Option<Archive>> {
        let Some(session) = self
            .store
            .claim_session_for_completion(upload_id, self.config.max_completion_attempts)
            .await?
        else {
            return Ok(None);
        };

        let vault = match self.vault_name(session.vault_id).await {
            Ok(vault) => vault,
            Err(err) => {
                self.store.release_session(upload_id).await?;
                return Err(err);
            }
        };

        let (remote_id, location) = match (session.remote_id, session.remote_location) {
            (Some(remote_id), Some(location)) => {
                debug!(
                    "upload {} already completed remotely as {}",
                    upload_id, remote_id
                );
                (remote_id, location)
            }
            _ => {
                let completed = match self
                    .remote
                    .complete_multipart_upload(
                        &vault,
                        upload_id,
                        session.full_object_size as u64,
                        &session.full_object_hash,
                    )
                    .await
                {
                    Ok(completed) => completed,
                    Err(err) => {
                        // Part rows are already gone; the session keeps what
                        // a later pass needs to retry.
                        self.store.release_session(upload_id).await?;
                        return Err(err.into());
                    }
                };

                if completed.checksum != session.full_object_hash {
                    self.store.release_session(upload_id).await?;
                    return Err(crate::remote::RemoteError::ChecksumRejected {
                        expected: session.full_object_hash,
                        actual: completed.checksum,
                    }
                    .into());
                }

                if let Err(err) = self
                    .store
                    .record_remote_completion(upload_id, &completed.remote_id, &completed.location)
                    .await
                {
                    error!(
                        "Upload {} completed remotely as {} at {} but could not be recorded: {}",
                        upload_id, completed.remote_id, completed.location, err
                    );
                    self.release_after_failure(upload_id).await;
                    return Err(err.into());
                }
                (completed.remote_id, completed.location)
            }
        };

        let archive = match self
            .store
            .complete_upload(
                upload_id,
                &NewArchive {
                    path: session.logical_path.clone(),
                    vault_id: session.vault_id,
                    remote_id: remote_id.clone(),
                    content_hash: session.full_object_hash.clone(),
                    size_bytes: session.full_object_size,
                    remote_location: location.clone(),
                },
            )
            .await
        {
            Ok(archive) => archive,
            Err(err) => {
                error!(
                    "Archive {} at {} for {} could not be recorded: {}",
                    remote_id, location, session.logical_path, err
                );
                self.release_after_failure(upload_id).await;
                return Err(err.into());
            }
        };
        info!(
            "Completed upload of {} as archive {}",
            session.logical_path, archive.remote_id
        );

        match fs::remove_file(&session.source_file_path).await {
            Ok(()) => debug!("removed temporary object {}", session.source_file_path),
            Err(err) => warn!(
                "Could not remove temporary object {}: {}",
                session.source_file_path, err
            ),
        }
        Ok(Some(archive))
    }
}

/// Read exactly `range` from a local file.
async fn read_range(path: &Path, range: ByteRange) -> std::io::Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
