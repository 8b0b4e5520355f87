//! One full migration run: discovery, presort prefetch, per-database migration
//! and the post-jobs, bracketed by the in-progress marker.

use crate::catalog::{pair_sources, DatabasePair, Source};
use crate::config::{LogBackend, MigratorConfig};
use crate::error::{MigrateError, Result};
use crate::migration_log::{FileMigrationLog, MigrationLog, TargetMigrationLog};
use crate::migrator::{postjob, DatabaseReport, Migrator};
use crate::presort::PresortPipeline;
use crate::stats::{MigrationStats, StatsReporter};
use crate::target::{MySqlTarget, TargetStore};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub const SOURCE_A: &str = "src_a";
pub const SOURCE_B: &str = "src_b";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub fresh: bool,
    pub databases: Vec<DatabaseReport>,
    pub temporary_keys_dropped: usize,
    pub total_bytes: u64,
}

/// Connects to the target and runs the migration with the configured log backend.
pub async fn run(config: MigratorConfig) -> Result<RunSummary> {
    info!(
        "Starting migration: {}",
        serde_json::to_string(&config).unwrap_or_else(|_| "<unprintable config>".to_string())
    );

    let target = Arc::new(MySqlTarget::connect(&config.target).await?);
    let stats = Arc::new(MigrationStats::new());
    let reporter = StatsReporter::start(stats.clone(), Some(target.clone()), config.stats_interval());

    let result = match config.log_backend {
        LogBackend::File => {
            let log = Arc::new(FileMigrationLog::new(config.migration_log_root()));
            run_with(target.clone(), log, &config, stats).await
        }
        LogBackend::Target => {
            let log = Arc::new(TargetMigrationLog::new(target.clone()));
            run_with(target.clone(), log, &config, stats).await
        }
    };

    reporter.stop().await;
    target.close().await;
    result
}

pub async fn run_with<S: TargetStore, L: MigrationLog>(
    store: Arc<S>,
    log: Arc<L>,
    config: &MigratorConfig,
    stats: Arc<MigrationStats>,
) -> Result<RunSummary> {
    check_connectivity(store.as_ref()).await?;

    let marker = config.in_progress_marker();
    let (run_id, fresh) = match read_marker(&marker).await? {
        Some(run_id) => {
            info!("Resuming interrupted run {}", run_id);
            (run_id, false)
        }
        None => {
            let run_id = uuid::Uuid::new_v4().to_string();
            info!("Starting fresh run {}", run_id);
            if let Err(e) = log.discard().await {
                warn!("Failed to discard stale {} migration log: {}", log.backend(), e);
            }
            write_marker(&marker, &run_id).await?;
            (run_id, true)
        }
    };
    log.prepare().await?;

    let pairs = discover(config).await?;
    let pipeline = Arc::new(PresortPipeline::new(config.presort.clone()));
    let background = config
        .background_presort
        .then(|| pipeline.spawn_background(pairs.clone()));

    let migrator = Arc::new(Migrator::new(
        store.clone(),
        log.clone(),
        pipeline,
        stats.clone(),
        config.migration_settings(),
    ));
    let databases = match migrator.migrate_source(pairs).await {
        Ok(databases) => databases,
        Err(e) => {
            if let Some(background) = &background {
                background.abort();
            }
            return Err(e);
        }
    };
    if let Some(background) = background {
        background.wait().await?;
    }

    let temporary_keys_dropped = if config.drop_temporary_keys {
        postjob::drop_temporary_keys(store.as_ref(), log.as_ref()).await
    } else {
        0
    };
    postjob::drop_meta(log.as_ref()).await;

    if let Err(e) = tokio::fs::remove_file(&marker).await {
        warn!("Failed to remove {}: {}", marker.display(), e);
    }
    info!("Run {} complete, {} bytes migrated", run_id, stats.total_bytes());

    Ok(RunSummary {
        run_id,
        fresh,
        databases,
        temporary_keys_dropped,
        total_bytes: stats.total_bytes(),
    })
}

async fn check_connectivity<S: TargetStore>(store: &S) -> Result<()> {
    let databases = store.query("SHOW DATABASES", &[]).await?;
    let names = databases
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect::<Vec<_>>();
    debug!("Target databases: {}", names.join(", "));
    Ok(())
}

async fn discover(config: &MigratorConfig) -> Result<Vec<Arc<DatabasePair>>> {
    let source_a = Source::open(config.source_path(SOURCE_A), SOURCE_A).await?;
    let source_b = Source::open(config.source_path(SOURCE_B), SOURCE_B).await?;
    let mut pairs = pair_sources(&source_a, &source_b)?;

    if config.secondary_index_first {
        for pair in &mut pairs {
            pair.a.prioritize_secondary_index_tables().await?;
        }
    }
    info!(
        "Discovered {} databases, {} tables",
        pairs.len(),
        pairs.iter().map(|pair| pair.a.tables.len()).sum::<usize>()
    );
    Ok(pairs.into_iter().map(Arc::new).collect())
}

async fn read_marker(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(
            content
                .lines()
                .next()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .unwrap_or("unknown")
                .to_string(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MigrateError::io(format!("Failed to read {}", path.display()), e)),
    }
}

async fn write_marker(path: &Path, run_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MigrateError::io(format!("Failed to create {}", parent.display()), e))?;
    }
    let content = format!("{}\n{}\n", run_id, chrono::Local::now().to_rfc3339());
    tokio::fs::write(path, content)
        .await
        .map_err(|e| MigrateError::io(format!("Failed to write {}", path.display()), e))
}
