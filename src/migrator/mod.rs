//! Streams merged CSVs into the target cluster, table by table, in committed
//! batches whose progress is recorded in the migration log.

use crate::catalog::DatabasePair;
use crate::error::Result;
use crate::migration_log::MigrationLog;
use crate::presort::PresortPipeline;
use crate::scheduler::run_bounded;
use crate::schema::SchemaTransform;
use crate::stats::MigrationStats;
use crate::target::TargetStore;
use log::info;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub mod convert;
pub mod postjob;
pub(crate) mod prepare;
pub mod statements;
mod table;

pub use prepare::DedupMode;

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub batch_size: usize,
    /// Batches per transaction.
    pub commit_interval: usize,
    pub schema: SchemaTransform,
    pub index_retry_delay: Duration,
    pub database_workers: usize,
    pub table_workers: usize,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        MigrationSettings {
            batch_size: 3000,
            commit_interval: 10,
            schema: SchemaTransform::default(),
            index_retry_delay: Duration::from_secs(1),
            database_workers: 8,
            table_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    pub database: String,
    pub table: String,
    pub lines: u64,
    pub bytes: u64,
    pub rows_affected: u64,
    pub resumed_from: Option<u64>,
    pub already_finished: bool,
    pub temporary_key: bool,
    pub index_rebuilt: bool,
}

impl TableReport {
    fn new(database: &str, table: &str) -> Self {
        TableReport {
            database: database.to_string(),
            table: table.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseReport {
    pub database: String,
    pub tables: Vec<TableReport>,
}

impl DatabaseReport {
    pub fn rows_affected(&self) -> u64 {
        self.tables.iter().map(|table| table.rows_affected).sum()
    }
}

pub struct Migrator<S: TargetStore, L: MigrationLog> {
    store: Arc<S>,
    log: Arc<L>,
    pipeline: Arc<PresortPipeline>,
    stats: Arc<MigrationStats>,
    settings: MigrationSettings,
}

impl<S: TargetStore, L: MigrationLog> Migrator<S, L> {
    pub fn new(
        store: Arc<S>,
        log: Arc<L>,
        pipeline: Arc<PresortPipeline>,
        stats: Arc<MigrationStats>,
        settings: MigrationSettings,
    ) -> Self {
        Migrator {
            store,
            log,
            pipeline,
            stats,
            settings,
        }
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    /// Migrates every table of one database with `table_workers` in parallel.
    /// The first failing table fails the database; tables already running finish.
    pub async fn migrate_database(self: Arc<Self>, pair: Arc<DatabasePair>) -> Result<DatabaseReport> {
        info!("Migrating database {}", pair.name());
        let tables = pair.a.tables.clone();
        let migrator = self.clone();
        let worker_pair = pair.clone();
        let mut reports = run_bounded(tables, self.settings.table_workers, move |table: String| {
            let migrator = migrator.clone();
            let pair = worker_pair.clone();
            async move { migrator.migrate_table(&pair, &table).await }
        })
        .await?;
        reports.sort_by(|a, b| a.table.cmp(&b.table));

        info!("Database {} migrated", pair.name());
        Ok(DatabaseReport {
            database: pair.name().to_string(),
            tables: reports,
        })
    }

    /// Migrates all databases with `database_workers` in parallel.
    pub async fn migrate_source(self: Arc<Self>, pairs: Vec<Arc<DatabasePair>>) -> Result<Vec<DatabaseReport>> {
        let migrator = self.clone();
        let mut reports = run_bounded(pairs, self.settings.database_workers, move |pair| {
            migrator.clone().migrate_database(pair)
        })
        .await?;
        reports.sort_by(|a, b| a.database.cmp(&b.database));
        Ok(reports)
    }
}
