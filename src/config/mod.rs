use crate::error::{MigrateError, Result};
use crate::migrator::MigrationSettings;
use crate::presort::PresortSettings;
use crate::schema::SchemaTransform;
use crate::target::TargetConnectionConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// `migration_log/<src>/<db>/<table>/seek.txt` under the work dir.
    File,
    /// `meta_migration.migration_log` on the target cluster.
    Target,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "shardmerge",
    version,
    about = "Merges two pre-sharded CSV dumps into one MySQL-compatible cluster, resumably."
)]
pub struct CliArgs {
    #[arg(long, env = "SHARDMERGE_DATA_PATH", default_value = "/tmp/data/", value_name = "PATH")]
    pub data_path: PathBuf,

    #[arg(long, env = "SHARDMERGE_WORK_DIR", default_value = ".", value_name = "PATH")]
    pub work_dir: PathBuf,

    #[arg(long, env = "SHARDMERGE_DST_IP", default_value = "127.0.0.1")]
    pub dst_ip: String,

    #[arg(long, env = "SHARDMERGE_DST_PORT", default_value_t = 3306)]
    pub dst_port: u16,

    #[arg(long, env = "SHARDMERGE_DST_USER", default_value = "root")]
    pub dst_user: String,

    #[arg(long, env = "SHARDMERGE_DST_PASSWORD", hide_env_values = true)]
    pub dst_password: Option<String>,

    #[arg(long, default_value = "./presort/sortdata", value_name = "PROGRAM")]
    pub sorter: PathBuf,

    #[arg(long, default_value = "./presort/merge", value_name = "PROGRAM")]
    pub merger: PathBuf,

    #[arg(long, default_value_t = 3000)]
    pub batch_size: usize,

    /// Batches per committed transaction.
    #[arg(long, default_value_t = 10)]
    pub commit_interval: usize,

    #[arg(long, default_value_t = 7)]
    pub presort_jobs: usize,

    #[arg(long, default_value_t = 8)]
    pub database_workers: usize,

    #[arg(long, default_value_t = 4)]
    pub table_workers: usize,

    #[arg(long, default_value_t = 100)]
    pub max_connections: u32,

    #[arg(long, value_enum, default_value_t = LogBackend::File)]
    pub log_backend: LogBackend,

    #[arg(long, default_value = "id", conflicts_with = "no_shard_key")]
    pub shard_key: String,

    /// Do not append a shard key directive nor synthesize a primary key for it.
    #[arg(long)]
    pub no_shard_key: bool,

    #[arg(long, default_value = "id,a,b", value_delimiter = ',')]
    pub fallback_primary_key: Vec<String>,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub secondary_index_first: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub background_presort: bool,

    #[arg(long)]
    pub drop_temporary_keys: bool,

    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MigratorConfig {
    pub data_path: PathBuf,
    pub work_dir: PathBuf,
    pub target: TargetConnectionConfig,
    pub presort: PresortSettings,
    pub batch_size: usize,
    pub commit_interval: usize,
    pub database_workers: usize,
    pub table_workers: usize,
    pub log_backend: LogBackend,
    pub shard_key: Option<String>,
    pub fallback_primary_key: Vec<String>,
    pub secondary_index_first: bool,
    pub background_presort: bool,
    pub drop_temporary_keys: bool,
    pub stats_interval_secs: u64,
}

impl From<CliArgs> for MigratorConfig {
    fn from(args: CliArgs) -> Self {
        let presort = PresortSettings {
            data_root: args.work_dir.join("presort").join("data"),
            sorter: args.sorter,
            merger: args.merger,
            jobs: args.presort_jobs,
        };
        MigratorConfig {
            target: TargetConnectionConfig {
                host: args.dst_ip,
                port: args.dst_port,
                username: args.dst_user,
                password: args.dst_password,
                max_connections: args.max_connections,
            },
            presort,
            data_path: args.data_path,
            work_dir: args.work_dir,
            batch_size: args.batch_size,
            commit_interval: args.commit_interval,
            database_workers: args.database_workers,
            table_workers: args.table_workers,
            log_backend: args.log_backend,
            shard_key: (!args.no_shard_key).then_some(args.shard_key),
            fallback_primary_key: args
                .fallback_primary_key
                .into_iter()
                .map(|column| column.trim().to_string())
                .filter(|column| !column.is_empty())
                .collect(),
            secondary_index_first: args.secondary_index_first,
            background_presort: args.background_presort,
            drop_temporary_keys: args.drop_temporary_keys,
            stats_interval_secs: args.stats_interval_secs,
        }
    }
}

impl MigratorConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch size must be at least 1".to_string());
        }
        if self.commit_interval == 0 {
            return Err("commit interval must be at least 1".to_string());
        }
        if self.database_workers == 0 || self.table_workers == 0 || self.presort.jobs == 0 {
            return Err("worker counts must be at least 1".to_string());
        }
        if self.target.max_connections == 0 {
            return Err("max connections must be at least 1".to_string());
        }
        if self.shard_key.is_some() && self.fallback_primary_key.is_empty() {
            return Err("fallback primary key must name at least one column".to_string());
        }
        if self.stats_interval_secs == 0 {
            return Err("stats interval must be at least 1 second".to_string());
        }
        Ok(())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = MigratorConfig::from(args);
        config.validate().map_err(MigrateError::Config)?;
        Ok(config)
    }

    pub fn source_path(&self, source: &str) -> PathBuf {
        self.data_path.join(source)
    }

    pub fn migration_log_root(&self) -> PathBuf {
        self.work_dir.join("migration_log")
    }

    pub fn in_progress_marker(&self) -> PathBuf {
        self.work_dir.join("migration_inprogress.txt")
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            batch_size: self.batch_size,
            commit_interval: self.commit_interval,
            schema: SchemaTransform {
                defer_secondary_index: true,
                shard_key: self.shard_key.clone(),
                fallback_primary_key: self.fallback_primary_key.clone(),
            },
            index_retry_delay: Duration::from_secs(1),
            database_workers: self.database_workers,
            table_workers: self.table_workers,
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
