//! Shared fixtures: a SQLite store in a temp dir, a scriptable in-memory
//! vault service and an archiver that just concatenates files.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cold_backup::{
    archiver::{Archiver, ArchiverError, PackedObject, container_name},
    config::EngineConfig,
    db,
    models::{upload_part::ByteRange, vault::Vault},
    remote::{
        CompletedUpload, InitiatedJob, JobStatus, JobStatusCode, RangeOutput, RemoteError,
        RemoteResult, RemoteStorage,
    },
    retry::Backoff,
    services::metadata_store::MetadataStore,
    treehash::tree_hash,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const MIB: u64 = 1024 * 1024;

pub async fn test_store(dir: &Path) -> MetadataStore {
    let url = format!("sqlite://{}", dir.join("meta.db").display());
    let pool = db::open(&url).await.unwrap();
    MetadataStore::new(Arc::new(pool))
}

/// Default tunables with millisecond backoffs so retries do not stall tests.
pub fn test_config(work_dir: &Path) -> EngineConfig {
    let mut cfg = EngineConfig::with_work_dir(work_dir.join("retrievals"));
    cfg.upload.failure_backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
    cfg.retrieval.poll_backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
    cfg
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: MetadataStore,
    pub remote: Arc<MockRemote>,
    pub vault: Vault,
    pub config: EngineConfig,
}

pub async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = test_store(dir.path()).await;
    let remote = Arc::new(MockRemote::default());
    let arn = remote.create_vault("photos").await.unwrap();
    let vault = store.create_vault("photos", &arn).await.unwrap();
    let config = test_config(dir.path());
    Fixture {
        dir,
        store,
        remote,
        vault,
        config,
    }
}

/// Deterministic file content of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64 % 251) as u8 ^ seed)
        .collect()
}

#[derive(Default)]
struct MockJob {
    archive: String,
    polls_left: u32,
}

/// In-memory vault service with failure injection.
#[derive(Default)]
pub struct MockRemote {
    uploads: Mutex<HashMap<String, BTreeMap<u64, Bytes>>>,
    archives: Mutex<HashMap<String, Bytes>>,
    jobs: Mutex<HashMap<String, MockJob>>,
    /// Every successful `upload_part` as `(upload_id, range start)`.
    pub part_log: Mutex<Vec<(String, u64)>>,
    pub range_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,

    /// Polls a new retrieval job answers "in progress".
    pub polls_before_ready: AtomicUsize,
    /// The next N part uploads fail transiently.
    pub fail_parts: AtomicUsize,
    /// Every part upload is rejected permanently.
    pub reject_parts: AtomicBool,
    /// The next N completions fail transiently.
    pub fail_completions: AtomicUsize,
    /// The next N ranged fetches fail transiently.
    pub fail_ranges: AtomicUsize,
    /// Ranged fetches return a flipped first byte.
    pub corrupt_output: AtomicBool,
    /// Deletes fail transiently.
    pub fail_deletes: AtomicBool,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockRemote {
    pub fn archive_bytes(&self, remote_id: &str) -> Option<Bytes> {
        self.archives.lock().unwrap().get(remote_id).cloned()
    }

    pub fn archive_count(&self) -> usize {
        self.archives.lock().unwrap().len()
    }

    /// Store an archive directly, bypassing the multipart flow.
    pub fn put_archive(&self, data: &[u8]) -> String {
        let id = Uuid::new_v4().to_string();
        self.archives
            .lock()
            .unwrap()
            .insert(id.clone(), Bytes::copy_from_slice(data));
        id
    }
}

#[async_trait]
impl RemoteStorage for MockRemote {
    async fn create_vault(&self, name: &str) -> RemoteResult<String> {
        Ok(format!("mock://{name}"))
    }

    async fn initiate_multipart_upload(
        &self,
        _vault: &str,
        _description: &str,
        _part_size: u64,
    ) -> RemoteResult<String> {
        let id = Uuid::new_v4().to_string();
        self.uploads.lock().unwrap().insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    async fn upload_part(
        &self,
        _vault: &str,
        upload_id: &str,
        range: ByteRange,
        body: Bytes,
    ) -> RemoteResult<()> {
        tokio::task::yield_now().await;
        if self.reject_parts.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("part rejected".into()));
        }
        if take_one(&self.fail_parts) {
            return Err(RemoteError::Transient("connection reset".into()));
        }
        assert_eq!(body.len() as u64, range.len());
        let mut uploads = self.uploads.lock().unwrap();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| RemoteError::NotFound(upload_id.to_string()))?;
        parts.insert(range.start, body);
        self.part_log
            .lock()
            .unwrap()
            .push((upload_id.to_string(), range.start));
        Ok(())
    }

    async fn complete_multipart_upload(
        &self,
        _vault: &str,
        upload_id: &str,
        total_size: u64,
        digest: &str,
    ) -> RemoteResult<CompletedUpload> {
        if take_one(&self.fail_completions) {
            return Err(RemoteError::Transient("service unavailable".into()));
        }
        let parts = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| RemoteError::NotFound(upload_id.to_string()))?;
        let data: Vec<u8> = parts.values().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(data.len() as u64, total_size);
        let checksum = tree_hash(&data);
        if checksum != digest {
            return Err(RemoteError::ChecksumRejected {
                expected: digest.to_string(),
                actual: checksum,
            });
        }
        let remote_id = self.put_archive(&data);
        Ok(CompletedUpload {
            location: format!("/photos/archives/{remote_id}"),
            remote_id,
            checksum,
        })
    }

    async fn delete_object(&self, _vault: &str, remote_id: &str) -> RemoteResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("throttled".into()));
        }
        match self.archives.lock().unwrap().remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(remote_id.to_string())),
        }
    }

    async fn initiate_retrieval_job(
        &self,
        _vault: &str,
        remote_id: &str,
    ) -> RemoteResult<InitiatedJob> {
        if !self.archives.lock().unwrap().contains_key(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        let job_id = Uuid::new_v4().to_string();
        self.jobs.lock().unwrap().insert(
            job_id.clone(),
            MockJob {
                archive: remote_id.to_string(),
                polls_left: self.polls_before_ready.load(Ordering::SeqCst) as u32,
            },
        );
        Ok(InitiatedJob {
            location: format!("/photos/jobs/{job_id}"),
            job_id,
        })
    }

    async fn describe_job(&self, _vault: &str, job_id: &str) -> RemoteResult<JobStatus> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| RemoteError::NotFound(job_id.to_string()))?;
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(JobStatus {
                completed: false,
                status_code: JobStatusCode::InProgress,
            });
        }
        let available = self.archives.lock().unwrap().contains_key(&job.archive);
        Ok(JobStatus {
            completed: true,
            status_code: if available {
                JobStatusCode::Succeeded
            } else {
                JobStatusCode::Failed
            },
        })
    }

    async fn get_job_output_range(
        &self,
        _vault: &str,
        job_id: &str,
        range: ByteRange,
    ) -> RemoteResult<RangeOutput> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_ranges) {
            return Err(RemoteError::Transient("connection closed".into()));
        }
        let archive = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .map(|job| job.archive.clone())
            .ok_or_else(|| RemoteError::NotFound(job_id.to_string()))?;
        let data = self
            .archive_bytes(&archive)
            .ok_or_else(|| RemoteError::NotFound(archive.clone()))?;
        let mut body = data.slice(range.start as usize..=range.end as usize).to_vec();
        if self.corrupt_output.load(Ordering::SeqCst) && range.start == 0 {
            body[0] ^= 0xff;
        }
        Ok(RangeOutput {
            status: 206,
            body: Bytes::from(body),
        })
    }
}

/// Packs the files of a directory into one object by concatenating them in
/// name order; unpacking writes the container out as `restored.bin`.
#[derive(Default)]
pub struct ConcatArchiver;

#[async_trait]
impl Archiver for ConcatArchiver {
    async fn pack(
        &self,
        root: &Path,
        rel_dir: &str,
        out_dir: &Path,
    ) -> Result<Option<PackedObject>, ArchiverError> {
        let source = root.join(rel_dir);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&source)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        if files.is_empty() {
            return Ok(None);
        }
        files.sort();

        let mut data = Vec::new();
        for file in files {
            data.extend_from_slice(file.file_name().unwrap().to_string_lossy().as_bytes());
            data.extend_from_slice(&std::fs::read(&file)?);
        }
        std::fs::create_dir_all(out_dir)?;
        let logical_path = container_name(root, rel_dir);
        let path = out_dir.join(logical_path.replace('/', "__"));
        std::fs::write(&path, &data)?;
        Ok(Some(PackedObject {
            path,
            logical_path,
            size: data.len() as u64,
        }))
    }

    async fn unpack(&self, container: &Path, destination: &Path) -> Result<(), ArchiverError> {
        std::fs::create_dir_all(destination)?;
        std::fs::copy(container, destination.join("restored.bin"))?;
        Ok(())
    }
}
