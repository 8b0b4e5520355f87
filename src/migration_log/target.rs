use super::{LogEntry, LogStatement, MigrationLog, ResumePoint, TableKey};
use crate::error::{MigrateError, Result};
use crate::target::{SqlArg, TargetStore};
use std::sync::Arc;

pub(crate) const CREATE_META_DATABASE: &str = "CREATE DATABASE IF NOT EXISTS `meta_migration`";

pub(crate) const CREATE_META_TABLE: &str = "CREATE TABLE IF NOT EXISTS `meta_migration`.`migration_log` (\n  `dbname` varchar(128) NOT NULL,\n  `tablename` varchar(128) NOT NULL,\n  `src` varchar(128) NOT NULL,\n  `seek` bigint NOT NULL DEFAULT -2,\n  `temp_prikey` tinyint(1) NOT NULL DEFAULT 0,\n  PRIMARY KEY (`dbname`,`tablename`,`src`)\n)";

pub(crate) const DROP_META_DATABASE: &str = "DROP DATABASE IF EXISTS `meta_migration`";

pub(crate) const SELECT_ENTRY: &str = "SELECT `seek`, `temp_prikey` FROM `meta_migration`.`migration_log` WHERE `dbname` = ? AND `tablename` = ? AND `src` = ?";

pub(crate) const INITIALIZE_ENTRY: &str = "INSERT INTO `meta_migration`.`migration_log` (`dbname`,`tablename`,`src`,`seek`,`temp_prikey`) VALUES (?, ?, ?, 0, ?) ON DUPLICATE KEY UPDATE `seek` = 0, `temp_prikey` = VALUES(`temp_prikey`)";

pub(crate) const UPSERT_SEEK: &str = "INSERT INTO `meta_migration`.`migration_log` (`dbname`,`tablename`,`src`,`seek`) VALUES (?, ?, ?, ?) ON DUPLICATE KEY UPDATE `seek` = VALUES(`seek`)";

pub(crate) const SELECT_TEMPORARY_KEYS: &str = "SELECT DISTINCT `dbname`, `tablename` FROM `meta_migration`.`migration_log` WHERE `temp_prikey` = 1 ORDER BY `dbname`, `tablename`";

pub(crate) const CLEAR_TEMPORARY_KEY: &str = "UPDATE `meta_migration`.`migration_log` SET `temp_prikey` = 0 WHERE `dbname` = ? AND `tablename` = ?";

/// Keeps the log in `meta_migration.migration_log` on the target, so a batch and
/// its resume point commit in the same transaction.
pub struct TargetMigrationLog<S: TargetStore> {
    store: Arc<S>,
}

impl<S: TargetStore> TargetMigrationLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        TargetMigrationLog { store }
    }
}

fn key_args(key: &TableKey) -> Vec<SqlArg> {
    vec![
        SqlArg::Text(key.database.clone()),
        SqlArg::Text(key.table.clone()),
        SqlArg::Text(key.source.clone()),
    ]
}

#[async_trait::async_trait]
impl<S: TargetStore> MigrationLog for TargetMigrationLog<S> {
    fn backend(&self) -> &'static str {
        "target"
    }

    async fn prepare(&self) -> Result<()> {
        self.store.exec(CREATE_META_DATABASE, &[]).await?;
        self.store.exec(CREATE_META_TABLE, &[]).await?;
        Ok(())
    }

    async fn read_entry(&self, key: &TableKey) -> Result<LogEntry> {
        let rows = self.store.query(SELECT_ENTRY, &key_args(key)).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(LogEntry::not_started());
        };

        let seek = row
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| MigrateError::MigrationLog(format!("Missing seek for {}", key)))?
            .parse::<i64>()
            .map_err(|e| MigrateError::MigrationLog(format!("Invalid seek for {}: {}", key, e)))?;
        let temporary_key = matches!(
            row.get(1).cloned().flatten().as_deref(),
            Some("1") | Some("true")
        );

        Ok(LogEntry {
            resume: ResumePoint::from_seek(seek)?,
            temporary_key,
        })
    }

    async fn initialize(&self, key: &TableKey, temporary_key: bool) -> Result<()> {
        let mut args = key_args(key);
        args.push(SqlArg::Bool(temporary_key));
        self.store.exec(INITIALIZE_ENTRY, &args).await?;
        Ok(())
    }

    async fn write_resume_point(&self, key: &TableKey, point: ResumePoint) -> Result<()> {
        let mut args = key_args(key);
        args.push(SqlArg::Int(point.to_seek()));
        self.store.exec(UPSERT_SEEK, &args).await?;
        Ok(())
    }

    fn transactional_write(&self, key: &TableKey, point: ResumePoint) -> Option<LogStatement> {
        let mut args = key_args(key);
        args.push(SqlArg::Int(point.to_seek()));
        Some(LogStatement {
            sql: UPSERT_SEEK.to_string(),
            args,
        })
    }

    async fn temporary_keys(&self) -> Result<Vec<(String, String)>> {
        let rows = self.store.query(SELECT_TEMPORARY_KEYS, &[]).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let mut values = row.into_iter();
                match (values.next().flatten(), values.next().flatten()) {
                    (Some(database), Some(table)) => Some((database, table)),
                    _ => None,
                }
            })
            .collect())
    }

    async fn clear_temporary_key(&self, database: &str, table: &str) -> Result<()> {
        self.store
            .exec(
                CLEAR_TEMPORARY_KEY,
                &[SqlArg::Text(database.to_string()), SqlArg::Text(table.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn discard(&self) -> Result<()> {
        self.store.exec(DROP_META_DATABASE, &[]).await?;
        Ok(())
    }
}
