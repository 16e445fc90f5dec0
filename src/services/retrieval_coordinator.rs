//! src/services/retrieval_coordinator.rs
//!
//! RetrievalCoordinator: drives asynchronous restore jobs.
//!
//! A job moves `requested → polling → downloading → verifying` and is deleted
//! once its archive has been verified and unpacked. Polling is one loop per
//! vault that always picks the least recently polled job, so several
//! retrievals round-robin without starving each other. Downloaded chunks are
//! kept on disk across attempts and reused when their length already matches.

use crate::{
    archiver::Archiver,
    config::RetrievalConfig,
    errors::{EngineError, EngineResult, FailureKind},
    models::{
        archive::Archive,
        retrieval_job::{RetrievalJob, RetrievalState},
        upload_part::{ByteRange, split_ranges},
        vault::Vault,
    },
    remote::{JobStatusCode, RemoteError, RemoteStorage},
    services::metadata_store::{MetadataStore, StoreError},
    treehash::tree_hash_file,
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a single poll step did.
#[derive(Debug)]
pub enum PollOutcome {
    /// No active job in the vault.
    Idle,
    /// The remote job is still being staged.
    NotReady { job: Uuid, poll_count: i64 },
    /// Archive verified and unpacked; the job row is gone.
    Restored {
        job: Uuid,
        archive: Uuid,
        destination: PathBuf,
    },
    /// The attempt failed and will be retried on a later poll.
    Retrying { job: Uuid, attempts: i64 },
    /// The job was marked failed and will not be polled again.
    Failed { job: Uuid, kind: FailureKind },
}

#[derive(Clone)]
pub struct RetrievalCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: MetadataStore,
    remote: Arc<dyn RemoteStorage>,
    archiver: Arc<dyn Archiver>,
    config: RetrievalConfig,
    shutdown: CancellationToken,
    /// One poll loop per vault id. Entries stay registered until the loop
    /// itself exits.
    pollers: Mutex<HashMap<Uuid, Poller>>,
    generation: AtomicU64,
}

/// A registered poll loop. The generation keeps an exiting loop from
/// unregistering its successor; `done` is cancelled when the task ends,
/// panics included.
struct Poller {
    generation: u64,
    done: CancellationToken,
    handle: JoinHandle<()>,
}

impl RetrievalCoordinator {
    pub fn new(
        store: MetadataStore,
        remote: Arc<dyn RemoteStorage>,
        archiver: Arc<dyn Archiver>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                archiver,
                config,
                shutdown: CancellationToken::new(),
                pollers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Ask the service to stage an archive and persist the job. Fails with
    /// `RetrievalAlreadyActive` if the archive already has a live job.
    pub async fn initiate_retrieval(
        &self,
        archive_id: Uuid,
        destination: &Path,
    ) -> EngineResult<RetrievalJob> {
        let store = &self.inner.store;
        let archive = store
            .archive_by_id(archive_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown archive {}", archive_id)))?;
        let vault = store
            .vault_by_id(archive.vault_id)
            .await?
            .ok_or_else(|| EngineError::VaultNotFound(archive.vault_id.to_string()))?;

        if let Some(active) = store.active_retrieval_for_archive(archive.id).await? {
            warn!(
                "Archive {} already being retrieved by job {}",
                archive.id, active.remote_job_id
            );
            return Err(EngineError::RetrievalAlreadyActive(archive.id));
        }

        let initiated = self
            .inner
            .remote
            .initiate_retrieval_job(&vault.name, &archive.remote_id)
            .await?;
        let job = match store
            .create_retrieval_job(
                &initiated.job_id,
                vault.id,
                archive.id,
                &destination.to_string_lossy(),
            )
            .await
        {
            Ok(job) => job,
            Err(StoreError::RetrievalAlreadyActive(id)) => {
                return Err(EngineError::RetrievalAlreadyActive(id));
            }
            Err(err) => return Err(err.into()),
        };
        info!(
            "Requested retrieval of {} ({}) as job {}",
            archive.path, archive.remote_id, initiated.job_id
        );

        self.ensure_poller(&vault).await;
        Ok(job)
    }

    /// Start the poll loop for `vault` unless one is already running.
    pub async fn ensure_poller(&self, vault: &Vault) {
        let mut pollers = self.inner.pollers.lock().await;
        if let Some(poller) = pollers.get(&vault.id) {
            if !poller.done.is_cancelled() {
                return;
            }
        }
        let inner = self.inner.clone();
        let vault = vault.clone();
        let vault_id = vault.id;
        let cancel = self.inner.shutdown.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let done = CancellationToken::new();
        let guard = done.clone().drop_guard();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            inner.run_poller(vault, generation, cancel).await
        });
        pollers.insert(
            vault_id,
            Poller {
                generation,
                done,
                handle,
            },
        );
        debug!("started retrieval poller for vault {}", vault_id);
    }

    /// One step of the poll loop: look at the least recently polled job and
    /// advance it as far as it will go.
    pub async fn poll_once(&self, vault: &Vault) -> EngineResult<PollOutcome> {
        self.inner.poll_once(vault).await
    }

    /// Stop every poll loop at its next wake-up.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait until every poll loop has exited. Running loops stay registered
    /// while this waits, so `ensure_poller` never starts a second one.
    pub async fn wait_for_idle(&self) {
        loop {
            let running: Vec<CancellationToken> = {
                let pollers = self.inner.pollers.lock().await;
                pollers
                    .values()
                    .filter(|poller| !poller.done.is_cancelled())
                    .map(|poller| poller.done.clone())
                    .collect()
            };
            if running.is_empty() {
                break;
            }
            futures::future::join_all(running.iter().map(|done| done.cancelled())).await;
        }

        let finished: Vec<JoinHandle<()>> = {
            let mut pollers = self.inner.pollers.lock().await;
            let ids: Vec<Uuid> = pollers
                .iter()
                .filter(|(_, poller)| poller.done.is_cancelled())
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| pollers.remove(id))
                .map(|poller| poller.handle)
                .collect()
        };
        for result in futures::future::join_all(finished).await {
            if let Err(err) = result {
                error!("retrieval poller terminated abnormally: {}", err);
            }
        }
    }
}

impl Inner {
    async fn run_poller(self: Arc<Self>, vault: Vault, generation: u64, cancel: CancellationToken) {
        info!("Polling retrieval jobs in vault {}", vault.name);
        loop {
            let delay = match self.poll_once(&vault).await {
                Ok(PollOutcome::Idle) => {
                    // Re-check under the registry lock so a job created
                    // right now either sees this loop gone or gets polled.
                    let mut pollers = self.pollers.lock().await;
                    match self.store.oldest_retrieval_job(vault.id).await {
                        Ok(None) => {
                            unregister(&mut pollers, vault.id, generation);
                            info!("No retrieval jobs left in vault {}", vault.name);
                            return;
                        }
                        Ok(Some(_)) => Duration::ZERO,
                        Err(err) => {
                            error!("Could not inspect retrieval jobs: {}", err);
                            unregister(&mut pollers, vault.id, generation);
                            return;
                        }
                    }
                }
                Ok(PollOutcome::NotReady { poll_count, .. }) => {
                    self.config.poll_backoff.delay(poll_count.saturating_sub(1) as u32)
                }
                Ok(PollOutcome::Retrying { attempts, .. }) => {
                    self.config.poll_backoff.delay(attempts.saturating_sub(1) as u32)
                }
                Ok(PollOutcome::Restored { .. }) | Ok(PollOutcome::Failed { .. }) => {
                    Duration::ZERO
                }
                Err(err) => {
                    error!("Retrieval poll in vault {} failed: {}", vault.name, err);
                    self.config.poll_backoff.min
                }
            };

            if delay.is_zero() {
                if cancel.is_cancelled() {
                    break;
                }
                continue;
            }
            debug!("next retrieval poll in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Retrieval poller for vault {} stopped", vault.name);
        unregister(&mut *self.pollers.lock().await, vault.id, generation);
    }

    async fn poll_once(&self, vault: &Vault) -> EngineResult<PollOutcome> {
        let Some(job) = self.store.oldest_retrieval_job(vault.id).await? else {
            return Ok(PollOutcome::Idle);
        };

        let status = match self.remote.describe_job(&vault.name, &job.remote_job_id).await {
            Ok(status) => status,
            Err(err) => return self.attempt_failed(&job, err.into()).await,
        };

        if !status.completed {
            let poll_count = match self.store.touch_retrieval_job(job.id).await? {
                Some(touched) => touched.poll_count,
                None => job.poll_count + 1,
            };
            info!(
                "Retrieval job {} not ready yet (poll {})",
                job.remote_job_id, poll_count
            );
            return Ok(PollOutcome::NotReady {
                job: job.id,
                poll_count,
            });
        }

        if status.status_code != JobStatusCode::Succeeded {
            let message = format!("remote job {} finished unsuccessfully", job.remote_job_id);
            error!("{}", message);
            self.store.fail_retrieval_job(job.id, &message).await?;
            return Ok(PollOutcome::Failed {
                job: job.id,
                kind: FailureKind::Permanent,
            });
        }

        let Some(archive) = self.store.archive_by_id(job.archive_id).await? else {
            let message = format!("archive {} no longer recorded", job.archive_id);
            error!("Retrieval job {}: {}", job.remote_job_id, message);
            self.store.fail_retrieval_job(job.id, &message).await?;
            return Ok(PollOutcome::Failed {
                job: job.id,
                kind: FailureKind::Invariant,
            });
        };

        self.store
            .set_retrieval_state(job.id, RetrievalState::Ready)
            .await?;
        self.restore(vault, &job, &archive).await
    }

    /// Download, reassemble, verify and unpack a ready job.
    async fn restore(
        &self,
        vault: &Vault,
        job: &RetrievalJob,
        archive: &Archive,
    ) -> EngineResult<PollOutcome> {
        self.store
            .set_retrieval_state(job.id, RetrievalState::Downloading)
            .await?;
        let container = match self.download_archive(vault, job, archive).await {
            Ok(container) => container,
            Err(err) => return self.attempt_failed(job, err).await,
        };

        self.store
            .set_retrieval_state(job.id, RetrievalState::Verifying)
            .await?;
        let (digest, size) = match tree_hash_file(&container).await {
            Ok(result) => result,
            Err(err) => return self.attempt_failed(job, err.into()).await,
        };
        if digest != archive.content_hash || size != archive.size_bytes as u64 {
            let err = EngineError::DigestMismatch {
                archive: archive.id,
                expected: archive.content_hash.clone(),
                actual: digest,
            };
            error!("Retrieval job {}: {}", job.remote_job_id, err);
            remove_quietly(&container).await;
            self.store.fail_retrieval_job(job.id, &err.to_string()).await?;
            return Ok(PollOutcome::Failed {
                job: job.id,
                kind: err.kind(),
            });
        }
        info!("Verified {} ({} bytes)", archive.path, size);

        let destination = PathBuf::from(&job.destination_path);
        if let Err(err) = self.archiver.unpack(&container, &destination).await {
            let err = EngineError::from(err);
            error!(
                "Could not unpack {} into {}: {}",
                container.display(),
                destination.display(),
                err
            );
            self.store.fail_retrieval_job(job.id, &err.to_string()).await?;
            return Ok(PollOutcome::Failed {
                job: job.id,
                kind: err.kind(),
            });
        }

        self.store.delete_retrieval_job(job.id).await?;
        remove_quietly(&container).await;
        info!("Restored {} into {}", archive.path, destination.display());
        Ok(PollOutcome::Restored {
            job: job.id,
            archive: archive.id,
            destination,
        })
    }

    /// Fetch the job output in fixed-size ranges and concatenate them into
    /// one container file in the work directory.
    async fn download_archive(
        &self,
        vault: &Vault,
        job: &RetrievalJob,
        archive: &Archive,
    ) -> EngineResult<PathBuf> {
        let chunk_dir = self.config.work_dir.join(job.id.to_string());
        fs::create_dir_all(&chunk_dir).await?;

        let ranges = split_ranges(archive.size_bytes as u64, self.config.chunk_size);
        let mut chunks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let chunk_path = chunk_dir.join(format!("{}-{}.chunk", range.start, range.end));
            if let Ok(meta) = fs::metadata(&chunk_path).await {
                if meta.len() == range.len() {
                    debug!("reusing downloaded chunk {}", chunk_path.display());
                    chunks.push(chunk_path);
                    continue;
                }
            }
            self.fetch_chunk(vault, job, range, &chunk_path).await?;
            info!(
                "Downloaded bytes {} to {} of {}",
                range.start, range.end, archive.path
            );
            chunks.push(chunk_path);
        }

        let container = self.config.work_dir.join(format!("{}.archive", job.id));
        let mut out = File::create(&container).await?;
        for chunk in &chunks {
            let data = fs::read(chunk).await?;
            out.write_all(&data).await?;
            fs::remove_file(chunk).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        remove_dir_quietly(&chunk_dir).await;
        Ok(container)
    }

    async fn fetch_chunk(
        &self,
        vault: &Vault,
        job: &RetrievalJob,
        range: ByteRange,
        chunk_path: &Path,
    ) -> EngineResult<()> {
        let output = self
            .remote
            .get_job_output_range(&vault.name, &job.remote_job_id, range)
            .await?;
        if !matches!(output.status, 200 | 206) {
            return Err(RemoteError::Transient(format!(
                "job output answered status {} for bytes {}-{}",
                output.status, range.start, range.end
            ))
            .into());
        }
        if output.body.len() as u64 != range.len() {
            return Err(RemoteError::Transient(format!(
                "job output returned {} bytes for range {}-{}",
                output.body.len(),
                range.start,
                range.end
            ))
            .into());
        }

        let tmp = chunk_path.with_extension("partial");
        let mut file = File::create(&tmp).await?;
        file.write_all(&output.body).await?;
        file.flush().await?;
        fs::rename(&tmp, chunk_path).await?;
        Ok(())
    }

    /// Count a failed attempt. Permanent remote errors fail the job at once.
    async fn attempt_failed(
        &self,
        job: &RetrievalJob,
        err: EngineError,
    ) -> EngineResult<PollOutcome> {
        let kind = err.kind();
        if kind == FailureKind::Permanent {
            error!("Retrieval job {} failed: {}", job.remote_job_id, err);
            self.store.fail_retrieval_job(job.id, &err.to_string()).await?;
            return Ok(PollOutcome::Failed { job: job.id, kind });
        }

        warn!("Retrieval job {} attempt failed: {}", job.remote_job_id, err);
        match self
            .store
            .record_retrieval_failure(job.id, &err.to_string(), self.config.max_attempts)
            .await?
        {
            Some(updated) if updated.state == RetrievalState::Failed => {
                error!(
                    "Giving up on retrieval job {} after {} attempts",
                    job.remote_job_id, updated.attempts
                );
                Ok(PollOutcome::Failed { job: job.id, kind })
            }
            Some(updated) => Ok(PollOutcome::Retrying {
                job: job.id,
                attempts: updated.attempts,
            }),
            None => Ok(PollOutcome::Failed { job: job.id, kind }),
        }
    }
}

fn unregister(pollers: &mut HashMap<Uuid, Poller>, vault_id: Uuid, generation: u64) {
    if pollers
        .get(&vault_id)
        .is_some_and(|poller| poller.generation == generation)
    {
        pollers.remove(&vault_id);
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        debug!("could not remove {}: {}", path.display(), err);
    }
}

async fn remove_dir_quietly(path: &Path) {
    if let Err(err) = fs::remove_dir(path).await {
        debug!("could not remove {}: {}", path.display(), err);
    }
}
