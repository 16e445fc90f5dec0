//! Filesystem-backed vault service.
//!
//! Implements the remote contract on a local directory so the engine can
//! run end-to-end without a cloud account. Layout beneath `base_path`:
//!
//! - `{vault}/archives/{shard}/{shard}/{archive_id}`: finished archives
//! - `{vault}/uploads/{upload_id}/{start}-{end}.part`: staged parts
//! - `{vault}/jobs/{job_id}`: retrieval job descriptors
//!
//! Retrieval jobs report "in progress" for a configurable number of polls
//! before becoming ready, mimicking the asynchronous staging of cold storage.

use super::{
    CompletedUpload, InitiatedJob, JobStatus, JobStatusCode, RangeOutput, RemoteError,
    RemoteResult, RemoteStorage,
};
use crate::{models::upload_part::ByteRange, treehash::TreeHasher};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const VAULT_NAME_MAX_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct LocalVaultService {
    /// Root directory holding every vault.
    pub base_path: PathBuf,

    /// Polls a retrieval job answers "in progress" before turning ready.
    pub polls_before_ready: u32,
}

impl LocalVaultService {
    pub fn new(base_path: impl Into<PathBuf>, polls_before_ready: u32) -> Self {
        Self {
            base_path: base_path.into(),
            polls_before_ready,
        }
    }

    /// Vault names: 1–255 characters of `a-z A-Z 0-9 _ - .`.
    fn ensure_vault_name_safe(name: &str) -> RemoteResult<()> {
        if name.is_empty() || name.len() > VAULT_NAME_MAX_LEN {
            return Err(RemoteError::Rejected(format!(
                "vault name `{name}` must be between 1 and {VAULT_NAME_MAX_LEN} characters"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(RemoteError::Rejected(format!(
                "vault name `{name}` may only contain letters, digits, '_', '-' and '.'"
            )));
        }
        if name == "." || name == ".." {
            return Err(RemoteError::Rejected(format!("vault name `{name}` is reserved")));
        }
        Ok(())
    }

    /// Ids handed out by this service are UUIDs; anything else is rejected
    /// before it is used as a path component.
    fn ensure_id_safe(id: &str) -> RemoteResult<()> {
        Uuid::parse_str(id)
            .map(|_| ())
            .map_err(|_| RemoteError::Rejected(format!("malformed id `{id}`")))
    }

    fn vault_root(&self, vault: &str) -> PathBuf {
        self.base_path.join(vault)
    }

    async fn existing_vault_root(&self, vault: &str) -> RemoteResult<PathBuf> {
        Self::ensure_vault_name_safe(vault)?;
        let root = self.vault_root(vault);
        if fs::metadata(&root).await.is_err() {
            return Err(RemoteError::NotFound(format!("vault {vault}")));
        }
        Ok(root)
    }

    /// Two-level shard identifiers from MD5(vault/archive_id).
    fn archive_shards(vault: &str, archive_id: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", vault, archive_id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn archive_path(&self, vault: &str, archive_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::archive_shards(vault, archive_id);
        let mut path = self.vault_root(vault);
        path.push("archives");
        path.push(shard_a);
        path.push(shard_b);
        path.push(archive_id);
        path
    }

    fn upload_dir(&self, vault: &str, upload_id: &str) -> PathBuf {
        self.vault_root(vault).join("uploads").join(upload_id)
    }

    fn job_path(&self, vault: &str, job_id: &str) -> PathBuf {
        self.vault_root(vault).join("jobs").join(job_id)
    }

    async fn read_job(&self, vault: &str, job_id: &str) -> RemoteResult<LocalJob> {
        Self::ensure_id_safe(job_id)?;
        let raw = fs::read(self.job_path(vault, job_id))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => RemoteError::NotFound(format!("job {job_id}")),
                _ => RemoteError::from(err),
            })?;
        serde_json::from_slice(&raw)
            .map_err(|err| RemoteError::Rejected(format!("corrupt job {job_id}: {err}")))
    }

    async fn write_job(&self, vault: &str, job_id: &str, job: &LocalJob) -> RemoteResult<()> {
        let path = self.job_path(vault, job_id);
        let raw = serde_json::to_vec(job)
            .map_err(|err| RemoteError::Rejected(format!("unencodable job {job_id}: {err}")))?;
        write_atomic(&path, &raw).await?;
        Ok(())
    }

    /// Recursively remove empty directories up to the vault root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Persisted job descriptor, stored as JSON under `jobs/<job id>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct LocalJob {
    archive_id: String,
    /// Describes left before the job reports ready.
    polls_remaining: u32,
}

/// Write to a sibling temp file, fsync, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::Other, "path missing parent directory"))?;
    fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;
    let written = async {
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    Ok(())
}

fn part_file_name(range: ByteRange) -> String {
    format!("{:020}-{:020}.part", range.start, range.end)
}

fn parse_part_file_name(name: &str) -> Option<ByteRange> {
    let stem = name.strip_suffix(".part")?;
    let (start, end) = stem.split_once('-')?;
    Some(ByteRange {
        start: start.parse().ok()?,
        end: end.parse().ok()?,
    })
}

#[async_trait]
impl RemoteStorage for LocalVaultService {
    async fn create_vault(&self, name: &str) -> RemoteResult<String> {
        Self::ensure_vault_name_safe(name)?;
        let root = self.vault_root(name);
        for sub in ["archives", "uploads", "jobs"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(format!("local://{}", root.display()))
    }

    async fn initiate_multipart_upload(
        &self,
        vault: &str,
        description: &str,
        part_size: u64,
    ) -> RemoteResult<String> {
        let _ = self.existing_vault_root(vault).await?;
        if part_size == 0 {
            return Err(RemoteError::Rejected("part size must be positive".into()));
        }
        let upload_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.upload_dir(vault, &upload_id)).await?;
        debug!(
            "initiated upload {} in vault {} for `{}`",
            upload_id, vault, description
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        vault: &str,
        upload_id: &str,
        range: ByteRange,
        body: Bytes,
    ) -> RemoteResult<()> {
        let _ = self.existing_vault_root(vault).await?;
        Self::ensure_id_safe(upload_id)?;
        if body.len() as u64 != range.len() {
            return Err(RemoteError::Rejected(format!(
                "part body is {} bytes but range {}-{} covers {}",
                body.len(),
                range.start,
                range.end,
                range.len()
            )));
        }
        let dir = self.upload_dir(vault, upload_id);
        if fs::metadata(&dir).await.is_err() {
            return Err(RemoteError::NotFound(format!("upload {upload_id}")));
        }
        write_atomic(&dir.join(part_file_name(range)), &body).await?;
        Ok(())
    }

    async fn complete_multipart_upload(
        &self,
        vault: &str,
        upload_id: &str,
        total_size: u64,
        digest: &str,
    ) -> RemoteResult<CompletedUpload> {
        let _ = self.existing_vault_root(vault).await?;
        Self::ensure_id_safe(upload_id)?;
        let dir = self.upload_dir(vault, upload_id);

        let mut parts = Vec::new();
        let mut entries = fs::read_dir(&dir).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(format!("upload {upload_id}")),
            _ => RemoteError::from(err),
        })?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(range) = entry.file_name().to_str().and_then(parse_part_file_name) {
                parts.push((range, entry.path()));
            }
        }
        parts.sort_by_key(|(range, _)| range.start);

        let mut expected_start = 0u64;
        for (range, _) in &parts {
            if range.start != expected_start {
                return Err(RemoteError::Rejected(format!(
                    "upload {upload_id} is missing bytes starting at {expected_start}"
                )));
            }
            expected_start = range.end + 1;
        }
        if expected_start != total_size {
            return Err(RemoteError::Rejected(format!(
                "upload {upload_id} covers {expected_start} bytes, expected {total_size}"
            )));
        }

        let archive_id = Uuid::new_v4().to_string();
        let archive_path = self.archive_path(vault, &archive_id);
        let parent = archive_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| RemoteError::Rejected("archive path missing parent".into()))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut out = File::create(&tmp_path).await?;
        let mut hasher = TreeHasher::new();
        for (_, part_path) in &parts {
            let data = fs::read(part_path).await?;
            hasher.update(&data);
            if let Err(err) = out.write_all(&data).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        out.flush().await?;
        out.sync_all().await?;

        let computed = hasher.finalize();
        if computed != digest {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(RemoteError::ChecksumRejected {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        fs::rename(&tmp_path, &archive_path).await?;
        if let Err(err) = fs::remove_dir_all(&dir).await {
            debug!("failed to remove staged upload {}: {}", dir.display(), err);
        }

        Ok(CompletedUpload {
            location: format!("/{}/archives/{}", vault, archive_id),
            remote_id: archive_id,
            checksum: computed,
        })
    }

    async fn delete_object(&self, vault: &str, remote_id: &str) -> RemoteResult<()> {
        let root = self.existing_vault_root(vault).await?;
        Self::ensure_id_safe(remote_id)?;
        let path = self.archive_path(vault, remote_id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed archive {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RemoteError::NotFound(format!("archive {remote_id}")));
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &root.join("archives")).await;
        }
        Ok(())
    }

    async fn initiate_retrieval_job(
        &self,
        vault: &str,
        remote_id: &str,
    ) -> RemoteResult<InitiatedJob> {
        let _ = self.existing_vault_root(vault).await?;
        Self::ensure_id_safe(remote_id)?;
        if fs::metadata(self.archive_path(vault, remote_id)).await.is_err() {
            return Err(RemoteError::NotFound(format!("archive {remote_id}")));
        }
        let job_id = Uuid::new_v4().to_string();
        let job = LocalJob {
            archive_id: remote_id.to_string(),
            polls_remaining: self.polls_before_ready,
        };
        self.write_job(vault, &job_id, &job).await?;
        Ok(InitiatedJob {
            location: format!("/{}/jobs/{}", vault, job_id),
            job_id,
        })
    }

    async fn describe_job(&self, vault: &str, job_id: &str) -> RemoteResult<JobStatus> {
        let _ = self.existing_vault_root(vault).await?;
        let mut job = self.read_job(vault, job_id).await?;
        if job.polls_remaining > 0 {
            job.polls_remaining -= 1;
            self.write_job(vault, job_id, &job).await?;
            return Ok(JobStatus {
                completed: false,
                status_code: JobStatusCode::InProgress,
            });
        }
        let available = fs::metadata(self.archive_path(vault, &job.archive_id))
            .await
            .is_ok();
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
        vault: &str,
        job_id: &str,
        range: ByteRange,
    ) -> RemoteResult<RangeOutput> {
        let _ = self.existing_vault_root(vault).await?;
        let job = self.read_job(vault, job_id).await?;
        let mut file = File::open(self.archive_path(vault, &job.archive_id)).await?;
        let size = file.metadata().await?.len();
        if range.start >= size {
            return Ok(RangeOutput {
                status: 416,
                body: Bytes::new(),
            });
        }
        let end = range.end.min(size - 1);
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (end - range.start + 1) as usize];
        file.read_exact(&mut buf).await?;
        let status = if range.start == 0 && end == size - 1 {
            200
        } else {
            206
        };
        Ok(RangeOutput {
            status,
            body: Bytes::from(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treehash::tree_hash;

    #[test]
    fn vault_names_are_validated() {
        assert!(LocalVaultService::ensure_vault_name_safe("photos-2024_v1.0").is_ok());
        assert!(LocalVaultService::ensure_vault_name_safe("").is_err());
        assert!(LocalVaultService::ensure_vault_name_safe("a/b").is_err());
        assert!(LocalVaultService::ensure_vault_name_safe("..").is_err());
    }

    #[test]
    fn part_names_round_trip() {
        let range = ByteRange { start: 16, end: 31 };
        assert_eq!(parse_part_file_name(&part_file_name(range)), Some(range));
        assert_eq!(parse_part_file_name("garbage"), None);
    }

    #[tokio::test]
    async fn job_descriptors_are_json_and_corruption_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVaultService::new(dir.path(), 2);
        service.create_vault("vault").await.unwrap();
        let remote_id = {
            let upload_id = service
                .initiate_multipart_upload("vault", "a.7z", 64)
                .await
                .unwrap();
            service
                .upload_part(
                    "vault",
                    &upload_id,
                    ByteRange { start: 0, end: 2 },
                    Bytes::from_static(b"abc"),
                )
                .await
                .unwrap();
            service
                .complete_multipart_upload("vault", &upload_id, 3, &tree_hash(b"abc"))
                .await
                .unwrap()
                .remote_id
        };
        let job = service
            .initiate_retrieval_job("vault", &remote_id)
            .await
            .unwrap();
        service.describe_job("vault", &job.job_id).await.unwrap();

        let path = service.job_path("vault", &job.job_id);
        let stored: LocalJob = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            stored,
            LocalJob {
                archive_id: remote_id,
                polls_remaining: 1,
            }
        );

        std::fs::write(&path, b"{\"archive_id\": 7}").unwrap();
        let err = service.describe_job("vault", &job.job_id).await.unwrap_err();
        assert!(matches!(&err, RemoteError::Rejected(msg) if msg.contains("corrupt job")));
    }

    #[tokio::test]
    async fn multipart_upload_then_ranged_retrieval() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVaultService::new(dir.path(), 1);
        service.create_vault("vault").await.unwrap();

        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let upload_id = service
            .initiate_multipart_upload("vault", "docs.7z", 64)
            .await
            .unwrap();
        // Parts may arrive out of order.
        service
            .upload_part(
                "vault",
                &upload_id,
                ByteRange { start: 64, end: 99 },
                Bytes::copy_from_slice(&data[64..]),
            )
            .await
            .unwrap();
        service
            .upload_part(
                "vault",
                &upload_id,
                ByteRange { start: 0, end: 63 },
                Bytes::copy_from_slice(&data[..64]),
            )
            .await
            .unwrap();

        let done = service
            .complete_multipart_upload("vault", &upload_id, 100, &tree_hash(&data))
            .await
            .unwrap();
        assert_eq!(done.checksum, tree_hash(&data));

        let job = service
            .initiate_retrieval_job("vault", &done.remote_id)
            .await
            .unwrap();
        let first = service.describe_job("vault", &job.job_id).await.unwrap();
        assert!(!first.completed);
        let second = service.describe_job("vault", &job.job_id).await.unwrap();
        assert!(second.completed);
        assert_eq!(second.status_code, JobStatusCode::Succeeded);

        let out = service
            .get_job_output_range("vault", &job.job_id, ByteRange { start: 10, end: 19 })
            .await
            .unwrap();
        assert_eq!(out.status, 206);
        assert_eq!(&out.body[..], &data[10..20]);
    }

    #[tokio::test]
    async fn completion_rejects_wrong_digest_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVaultService::new(dir.path(), 0);
        service.create_vault("vault").await.unwrap();

        let upload_id = service
            .initiate_multipart_upload("vault", "x", 4)
            .await
            .unwrap();
        service
            .upload_part(
                "vault",
                &upload_id,
                ByteRange { start: 0, end: 3 },
                Bytes::from_static(b"abcd"),
            )
            .await
            .unwrap();

        let gap = service
            .complete_multipart_upload("vault", &upload_id, 8, &tree_hash(b"abcdefgh"))
            .await;
        assert!(matches!(gap, Err(RemoteError::Rejected(_))));

        let wrong = service
            .complete_multipart_upload("vault", &upload_id, 4, &tree_hash(b"zzzz"))
            .await;
        assert!(matches!(wrong, Err(RemoteError::ChecksumRejected { .. })));
    }

    #[tokio::test]
    async fn deleting_unknown_archive_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalVaultService::new(dir.path(), 0);
        service.create_vault("vault").await.unwrap();
        let missing = service
            .delete_object("vault", &Uuid::new_v4().to_string())
            .await;
        assert!(matches!(missing, Err(RemoteError::NotFound(_))));
    }
}
