use anyhow::{Context, Result};
use cold_backup::{
    archiver::SevenZipArchiver,
    config::{self, Command},
    db,
    remote::local::LocalVaultService,
    services::{
        backup::{BackupEngine, BackupOptions},
        metadata_store::MetadataStore,
    },
};
use std::{fs, sync::Arc};
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = ".cupoLog";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + migrate flag ---
    let (cfg, migrate, command) = config::AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let default_level = if cfg.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match &cfg.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE_NAME))
                .context("opening log file")?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    tracing::info!("Starting cold-backup with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let pool = db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::run_migrations(&pool).await?;

    let Some(command) = command else {
        tracing::warn!("No command given; nothing to do");
        return Ok(());
    };

    // --- Initialize core services ---
    fs::create_dir_all(&cfg.remote_dir)?;
    fs::create_dir_all(&cfg.engine.retrieval.work_dir)?;
    let store = MetadataStore::new(Arc::new(pool));
    let remote = Arc::new(LocalVaultService::new(cfg.remote_dir.clone(), 0));
    let archiver = Arc::new(SevenZipArchiver::new(cfg.engine.archiver.clone()));
    let engine = BackupEngine::new(
        store,
        remote,
        archiver,
        cfg.engine.clone(),
        cfg.work_dir.join("staging"),
    );

    // Ctrl-C stops retrieval polling; persisted jobs resume on the next run.
    let retrievals = engine.retrievals().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping retrieval polling");
            retrievals.shutdown();
        }
    });

    match command {
        Command::NewVault { name } => {
            let vault = engine.create_vault(&name).await?;
            println!("{} {}", vault.name, vault.arn);
        }
        Command::Backup {
            top_dir,
            vault,
            no_backup,
            no_prune,
            ..
        } => {
            if no_backup {
                if !no_prune {
                    engine.prune_vault(&vault).await?;
                }
            } else {
                let summary = engine
                    .backup_tree(
                        &top_dir,
                        &vault,
                        BackupOptions {
                            upload: true,
                            prune: !no_prune,
                        },
                    )
                    .await?;
                for (path, outcome) in &summary.outcomes {
                    println!("{path}: {outcome}");
                }
                if summary.failed() > 0 {
                    anyhow::bail!("{} paths failed to back up", summary.failed());
                }
            }
        }
        Command::Retrieve {
            path,
            vault,
            destination,
            no_wait,
        } => {
            let job = engine
                .retrieve_path(&path, &vault, &destination, !no_wait)
                .await?;
            println!("retrieval job {} ({})", job.id, job.remote_job_id);
        }
        Command::Resume { vault } => {
            let report = engine.resume(&vault, true).await?;
            println!(
                "released {} stale parts, completed {} uploads",
                report.released_parts,
                report.completed.len()
            );
        }
        Command::Prune { vault } => {
            let (marked, report) = engine.prune_vault(&vault).await?;
            println!(
                "marked {}, deleted {}, failed {}, gave up on {}",
                marked, report.deleted, report.failed, report.dead_lettered
            );
        }
    }

    Ok(())
}
