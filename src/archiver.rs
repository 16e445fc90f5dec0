//! Packaging of directories into opaque containers.
//!
//! Only the *files* of a directory go into its container; each subdirectory
//! gets a container of its own. A change deep in the tree therefore only
//! re-uploads the directory that actually changed.

use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{config::ArchiverConfig, errors::FailureKind};

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("archiver warning (exit 1): some files could not be read")]
    Warning,
    #[error("archiver fatal error (exit 2)")]
    Fatal,
    #[error("archiver command-line error (exit 7): {0}")]
    CommandLine(String),
    #[error("archiver ran out of memory (exit 8)")]
    OutOfMemory,
    #[error("archiver stopped by user (exit 255)")]
    Interrupted,
    #[error("archiver exited with status {0}")]
    Other(i32),
    #[error("failed to run archiver: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ArchiverError {
    fn from_exit_code(code: Option<i32>, cmd: &str) -> Self {
        match code {
            Some(1) => ArchiverError::Warning,
            Some(2) => ArchiverError::Fatal,
            Some(7) => ArchiverError::CommandLine(cmd.to_string()),
            Some(8) => ArchiverError::OutOfMemory,
            Some(255) | None => ArchiverError::Interrupted,
            Some(other) => ArchiverError::Other(other),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ArchiverError::CommandLine(_) | ArchiverError::Spawn(_) => FailureKind::Invariant,
            _ => FailureKind::LocalIo,
        }
    }
}

/// One packaged object ready for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedObject {
    /// Temporary file holding the container bytes.
    pub path: PathBuf,
    /// Logical name recorded in the metadata store (`photos/2019.7z`).
    pub logical_path: String,
    pub size: u64,
}

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Package the files of `root/rel_dir` into one container under
    /// `out_dir`. A directory without files yields `None`.
    async fn pack(
        &self,
        root: &Path,
        rel_dir: &str,
        out_dir: &Path,
    ) -> Result<Option<PackedObject>, ArchiverError>;

    /// Extract a container into `destination`.
    async fn unpack(&self, container: &Path, destination: &Path) -> Result<(), ArchiverError>;
}

/// Every subdirectory of `root`, relative to it, plus `""` for the root
/// itself. Sorted for deterministic runs.
pub fn list_dirs(root: &Path) -> io::Result<Vec<String>> {
    info!("Finding subdirectories of {}", root.display());
    let mut dirs = vec![String::new()];
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            debug!("Found subdirectory {}", rel);
            dirs.push(rel);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Logical container name for a directory relative to the backup root. The
/// root's own files are named after the root directory.
pub fn container_name(root: &Path, rel_dir: &str) -> String {
    let rel_dir = rel_dir.trim_end_matches('/');
    if rel_dir.is_empty() {
        let base = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "root".to_string());
        format!("{}.7z", base)
    } else {
        format!("{}.7z", rel_dir)
    }
}

/// Shells out to `7z` (BZip2, files only, default exclusions).
#[derive(Clone, Debug)]
pub struct SevenZipArchiver {
    pub binary: PathBuf,
    pub config: ArchiverConfig,
}

impl SevenZipArchiver {
    pub fn new(config: ArchiverConfig) -> Self {
        Self {
            binary: PathBuf::from("7z"),
            config,
        }
    }

    async fn has_files(dir: &Path) -> io::Result<bool> {
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn run(&self, args: Vec<String>) -> Result<(), ArchiverError> {
        let cmd = format!("{} {}", self.binary.display(), args.join(" "));
        debug!("running {}", cmd);
        let status = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(ArchiverError::Spawn)?;
        if status.success() {
            Ok(())
        } else {
            Err(ArchiverError::from_exit_code(status.code(), &cmd))
        }
    }
}

#[async_trait]
impl Archiver for SevenZipArchiver {
    async fn pack(
        &self,
        root: &Path,
        rel_dir: &str,
        out_dir: &Path,
    ) -> Result<Option<PackedObject>, ArchiverError> {
        let source = root.join(rel_dir);
        if !Self::has_files(&source).await? {
            debug!("{} has no files, not archiving", source.display());
            return Ok(None);
        }

        let logical_path = container_name(root, rel_dir);
        let archive_path = out_dir.join(logical_path.replace('/', "__"));
        fs::create_dir_all(out_dir).await?;

        info!("Archiving {} to {}", source.display(), archive_path.display());
        let mut args = vec![
            "a".to_string(),
            "-t7z".to_string(),
            archive_path.to_string_lossy().into_owned(),
            source.join("*").to_string_lossy().into_owned(),
            "-m0=BZip2".to_string(),
            "-y".to_string(),
            "-aoa".to_string(),
            "-xr-!*/".to_string(),
        ];
        args.extend(self.config.excludes.iter().map(|p| format!("-xr-!{}", p)));
        self.run(args).await?;

        let size = fs::metadata(&archive_path).await?.len();
        Ok(Some(PackedObject {
            path: archive_path,
            logical_path,
            size,
        }))
    }

    async fn unpack(&self, container: &Path, destination: &Path) -> Result<(), ArchiverError> {
        fs::create_dir_all(destination).await?;
        let args = vec![
            "x".to_string(),
            container.to_string_lossy().into_owned(),
            format!("-o{}", destination.display()),
            "-y".to_string(),
        ];
        self.run(args).await
    }
}
