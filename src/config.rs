use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, time::Duration};

use crate::retry::Backoff;

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub remote_dir: PathBuf,
    pub work_dir: PathBuf,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
    pub engine: EngineConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Differential backup of a directory tree to cold-storage vaults"
)]
pub struct Args {
    /// Database URL (overrides COLD_BACKUP_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Root directory of the vault service (overrides COLD_BACKUP_REMOTE_DIR)
    #[arg(long, global = true)]
    pub remote_dir: Option<PathBuf>,

    /// Scratch directory for archives and download chunks (overrides COLD_BACKUP_WORK_DIR)
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Number of parallel part uploads (overrides COLD_BACKUP_UPLOAD_WORKERS)
    #[arg(long, global = true)]
    pub upload_workers: Option<usize>,

    /// Set the default log level to DEBUG
    #[arg(long, global = true)]
    pub debug: bool,

    /// Write the log to `<dir>/.cupoLog` instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a vault and register it with the local database
    NewVault {
        /// The name of the new vault
        name: String,
    },
    /// Back up every directory beneath `top_dir`, then prune old versions
    Backup {
        /// The top directory to back up
        top_dir: PathBuf,
        /// The vault to upload archives to
        vault: String,
        /// Skip uploading, go straight to maintenance
        #[arg(long)]
        no_backup: bool,
        /// Skip marking and deleting superseded archives
        #[arg(long)]
        no_prune: bool,
        /// Additional exclude pattern passed to the archiver
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },
    /// Retrieve the newest archive of a path into a local directory
    Retrieve {
        /// Logical path as recorded at backup time (e.g. `photos/2019.7z`)
        path: String,
        /// The vault holding the archive
        vault: String,
        /// Directory the archive is unpacked into
        destination: PathBuf,
        /// Only initiate the job; a later run resumes polling
        #[arg(long)]
        no_wait: bool,
    },
    /// Resume pending uploads and retrievals left by an earlier run
    Resume {
        /// Vault to resume
        vault: String,
    },
    /// Delete every archive marked as superseded
    Prune {
        /// Vault to prune
        vault: String,
    },
}

/// Tunables passed explicitly into every coordinator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub upload: UploadConfig,
    pub retrieval: RetrievalConfig,
    pub retention: RetentionConfig,
    pub archiver: ArchiverConfig,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Multipart part size in bytes.
    pub part_size: u64,
    /// Size of the shared worker pool.
    pub workers: usize,
    /// Failed attempts before a part is dead-lettered.
    pub max_part_attempts: u32,
    /// Failed attempts before a completion is abandoned.
    pub max_completion_attempts: u32,
    /// Pause after a failed part before the worker claims again.
    pub failure_backoff: Backoff,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Ranged fetch size.
    pub chunk_size: u64,
    /// Delay between polls; escalates with the job's poll count.
    pub poll_backoff: Backoff,
    /// Failed download attempts before a job is marked failed.
    pub max_attempts: u32,
    /// Directory holding downloaded chunks and reassembled containers.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Newest versions always kept.
    pub keep_versions: u32,
    /// Versions older than this beyond the kept ones are eligible.
    pub max_age: chrono::Duration,
    /// Failed remote deletes before an archive is dead-lettered.
    pub max_delete_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub excludes: Vec<String>,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            excludes: [
                "*sync-conflict*",
                "*desktop.ini",
                "*.tmp",
                "*thumbs.db",
                "*.ini",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EngineConfig {
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload: UploadConfig {
                part_size: 16 * MIB,
                workers: 3,
                max_part_attempts: 5,
                max_completion_attempts: 5,
                failure_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            },
            retrieval: RetrievalConfig {
                chunk_size: 16 * MIB,
                poll_backoff: Backoff::new(
                    Duration::from_secs(15 * 60),
                    Duration::from_secs(4 * 60 * 60),
                ),
                max_attempts: 5,
                work_dir: work_dir.into(),
            },
            retention: RetentionConfig {
                keep_versions: 3,
                max_age: chrono::Duration::days(93),
                max_delete_attempts: 5,
            },
            archiver: ArchiverConfig::default(),
        }
    }

    /// Reject settings the remote service or the coordinators cannot honour.
    pub fn validate(&self) -> Result<()> {
        let part = self.upload.part_size;
        if part < MIB || !(part / MIB).is_power_of_two() || part % MIB != 0 {
            bail!("part size {part} must be a power-of-two multiple of 1 MiB");
        }
        if self.upload.workers == 0 {
            bail!("at least one upload worker is required");
        }
        if self.retrieval.chunk_size == 0 {
            bail!("download chunk size must be positive");
        }
        if self.upload.max_part_attempts == 0 || self.retrieval.max_attempts == 0 {
            bail!("retry ceilings must be at least 1");
        }
        Ok(())
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig, migrate flag and command.
    pub fn from_env_and_args() -> Result<(Self, bool, Option<Command>)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_db = env::var("COLD_BACKUP_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/cold-backup.db".into());
        let env_remote =
            env::var("COLD_BACKUP_REMOTE_DIR").unwrap_or_else(|_| "./data/vaults".into());
        let env_work = env::var("COLD_BACKUP_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("cold-backup"));
        let env_workers = match env::var("COLD_BACKUP_UPLOAD_WORKERS") {
            Ok(value) => Some(
                value
                    .parse::<usize>()
                    .with_context(|| format!("parsing COLD_BACKUP_UPLOAD_WORKERS value `{}`", value))?,
            ),
            Err(env::VarError::NotPresent) => None,
            Err(err) => return Err(err).context("reading COLD_BACKUP_UPLOAD_WORKERS"),
        };

        // --- Merge ---
        let work_dir = args.work_dir.unwrap_or(env_work);
        let mut engine = EngineConfig::with_work_dir(work_dir.join("retrievals"));
        if let Some(workers) = args.upload_workers.or(env_workers) {
            engine.upload.workers = workers;
        }
        if let Some(Command::Backup { excludes, .. }) = &args.command {
            engine.archiver.excludes.extend(excludes.iter().cloned());
        }
        engine.validate()?;

        let cfg = Self {
            database_url: args.database_url.unwrap_or(env_db),
            remote_dir: args.remote_dir.unwrap_or_else(|| env_remote.into()),
            work_dir,
            debug: args.debug,
            log_dir: args.log_dir,
            engine,
        };

        Ok((cfg, args.migrate, args.command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::with_work_dir("/tmp/x");
        cfg.validate().unwrap();
        assert_eq!(cfg.upload.part_size, 16 * MIB);
        assert_eq!(cfg.retention.keep_versions, 3);
        assert_eq!(cfg.retention.max_age, chrono::Duration::days(93));
    }

    #[test]
    fn part_size_must_be_power_of_two_mib() {
        let mut cfg = EngineConfig::with_work_dir("/tmp/x");
        cfg.upload.part_size = 3 * MIB;
        assert!(cfg.validate().is_err());
        cfg.upload.part_size = MIB / 2;
        assert!(cfg.validate().is_err());
        cfg.upload.part_size = 64 * MIB;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn cli_parses_backup_subcommand() {
        let args = Args::parse_from([
            "cold-backup",
            "backup",
            "/data",
            "photos",
            "--no-prune",
            "--exclude",
            "*.bak",
        ]);
        match args.command {
            Some(Command::Backup {
                top_dir,
                vault,
                no_prune,
                no_backup,
                excludes,
            }) => {
                assert_eq!(top_dir, PathBuf::from("/data"));
                assert_eq!(vault, "photos");
                assert!(no_prune);
                assert!(!no_backup);
                assert_eq!(excludes, vec!["*.bak".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
