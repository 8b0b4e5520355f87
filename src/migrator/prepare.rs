use super::convert::{ColumnKind, LiveColumn};
use crate::error::{MigrateError, Result};
use crate::schema::{quote_identifier, SecondaryIndex};
use crate::target::{exec_all_in_transaction, SqlArg, TargetStore};
use log::{info, warn};
use std::time::Duration;

pub(crate) const COLUMNS_QUERY: &str = "SELECT `COLUMN_NAME`, `DATA_TYPE`, `COLUMN_TYPE` FROM `information_schema`.`COLUMNS` WHERE `TABLE_SCHEMA` = ? AND `TABLE_NAME` = ? ORDER BY `ORDINAL_POSITION`";

pub(crate) const INDEXES_QUERY: &str = "SELECT `INDEX_NAME`, `COLUMN_NAME`, `NON_UNIQUE` FROM `information_schema`.`STATISTICS` WHERE `TABLE_SCHEMA` = ? AND `TABLE_NAME` = ? ORDER BY `INDEX_NAME`, `SEQ_IN_INDEX`";

pub const UPDATED_AT: &str = "updated_at";

/// How duplicates on the table's unique key are resolved by the batch INSERT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupMode {
    /// A real key exists: the incoming row wins when its `updated_at` is not older.
    UpsertIfNewer { key: Vec<String> },
    /// The key spans every non-`updated_at` column, so duplicates are identical rows.
    IgnoreDuplicates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIndex {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

fn table_args(database: &str, table: &str) -> [SqlArg; 2] {
    [
        SqlArg::Text(database.to_string()),
        SqlArg::Text(table.to_string()),
    ]
}

pub fn qualified_name(database: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(database), quote_identifier(table))
}

/// `CREATE TABLE` that tolerates a table left behind by an interrupted run.
fn create_if_missing(create_table: &str) -> String {
    let trimmed = create_table.trim_start();
    let head = trimmed.get(..13).unwrap_or("");
    if head.eq_ignore_ascii_case("CREATE TABLE ")
        && !trimmed[13..].trim_start().to_uppercase().starts_with("IF NOT EXISTS")
    {
        format!("CREATE TABLE IF NOT EXISTS {}", &trimmed[13..])
    } else {
        trimmed.to_string()
    }
}

/// Creates the database and the (already transformed) table in one transaction.
pub async fn create_table<S: TargetStore>(store: &S, database: &str, create_table: &str) -> Result<()> {
    let statements = [
        format!("CREATE DATABASE IF NOT EXISTS {}", quote_identifier(database)),
        format!("USE {}", quote_identifier(database)),
        create_if_missing(create_table),
    ];
    exec_all_in_transaction(store, &statements).await?;
    Ok(())
}

pub async fn detect_columns<S: TargetStore>(
    store: &S,
    database: &str,
    table: &str,
) -> Result<Vec<LiveColumn>> {
    let rows = store.query(COLUMNS_QUERY, &table_args(database, table)).await?;
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = row.into_iter();
        let name = values.next().flatten().ok_or_else(|| {
            MigrateError::Target(format!("Column without name in {}.{}", database, table))
        })?;
        let data_type = values.next().flatten().unwrap_or_default();
        let column_type = values.next().flatten().unwrap_or_default();
        columns.push(LiveColumn {
            kind: ColumnKind::classify(&data_type, &column_type),
            name,
        });
    }

    if columns.is_empty() {
        return Err(MigrateError::Target(format!(
            "Table {}.{} has no columns on the target",
            database, table
        )));
    }
    Ok(columns)
}

pub async fn list_indexes<S: TargetStore>(
    store: &S,
    database: &str,
    table: &str,
) -> Result<Vec<TargetIndex>> {
    let rows = store.query(INDEXES_QUERY, &table_args(database, table)).await?;
    let mut indexes: Vec<TargetIndex> = Vec::new();
    for row in rows {
        let mut values = row.into_iter();
        let (Some(name), Some(column)) = (values.next().flatten(), values.next().flatten()) else {
            continue;
        };
        let unique = values.next().flatten().as_deref() == Some("0");
        match indexes.iter_mut().find(|index| index.name == name) {
            Some(index) => index.columns.push(column),
            None => indexes.push(TargetIndex {
                name,
                unique,
                columns: vec![column],
            }),
        }
    }
    Ok(indexes)
}

/// The key duplicates collide on: the primary key, else the first unique index.
pub fn unique_key(indexes: &[TargetIndex]) -> Option<Vec<String>> {
    indexes
        .iter()
        .filter(|index| index.unique)
        .find(|index| index.name == "PRIMARY")
        .or_else(|| indexes.iter().find(|index| index.unique))
        .map(|index| index.columns.clone())
}

pub fn temporary_key_columns(columns: &[LiveColumn]) -> Vec<String> {
    columns
        .iter()
        .filter(|column| column.name != UPDATED_AT)
        .map(|column| column.name.clone())
        .collect()
}

/// Makes sure the table has a key for duplicates to collide on.
///
/// Returns the dedup mode and whether the key was synthesized. `natural_key`
/// says whether the created schema was expected to bring its own key; a key
/// found on a table that was not is one an interrupted run already added.
pub async fn ensure_dedup_key<S: TargetStore>(
    store: &S,
    database: &str,
    table: &str,
    columns: &[LiveColumn],
    natural_key: bool,
) -> Result<(DedupMode, bool)> {
    let indexes = list_indexes(store, database, table).await?;
    if let Some(key) = unique_key(&indexes) {
        if natural_key {
            return Ok((DedupMode::UpsertIfNewer { key }, false));
        }
        return Ok((DedupMode::IgnoreDuplicates, true));
    }

    let key = temporary_key_columns(columns);
    if key.is_empty() {
        return Err(MigrateError::Schema(format!(
            "Table {}.{} has no column to build a temporary key from",
            database, table
        )));
    }
    info!("Adding temporary key ({}) to {}.{}", key.join(","), database, table);
    store
        .exec(
            &format!(
                "ALTER TABLE {} ADD PRIMARY KEY ({})",
                qualified_name(database, table),
                quoted_list(&key)
            ),
            &[],
        )
        .await?;
    Ok((DedupMode::IgnoreDuplicates, true))
}

/// Dedup mode of a table whose preparation already happened in an earlier run.
pub async fn resume_dedup_mode<S: TargetStore>(
    store: &S,
    database: &str,
    table: &str,
    temporary_key: bool,
) -> Result<DedupMode> {
    if temporary_key {
        return Ok(DedupMode::IgnoreDuplicates);
    }
    let indexes = list_indexes(store, database, table).await?;
    unique_key(&indexes)
        .map(|key| DedupMode::UpsertIfNewer { key })
        .ok_or_else(|| {
            MigrateError::Schema(format!(
                "Table {}.{} lost its unique key between runs",
                database, table
            ))
        })
}

/// Adds the deferred secondary index unless an index over the same columns is
/// already there. Lock wait timeouts are retried until the build goes through.
pub async fn rebuild_secondary_index<S: TargetStore>(
    store: &S,
    database: &str,
    table: &str,
    index: &SecondaryIndex,
    retry_delay: Duration,
) -> Result<bool> {
    let existing = list_indexes(store, database, table).await?;
    if existing
        .iter()
        .any(|candidate| !candidate.unique && candidate.columns == index.columns)
    {
        return Ok(false);
    }

    let statement = index.add_index_statement(database, table);
    let mut attempt = 1u32;
    loop {
        match store.exec(&statement, &[]).await {
            Ok(_) => {
                info!("Rebuilt secondary index on {}.{}", database, table);
                return Ok(true);
            }
            Err(e) if e.is_lock_wait_timeout() => {
                warn!(
                    "Index rebuild on {}.{} hit a lock wait timeout (attempt {}), retrying",
                    database, table, attempt
                );
                attempt += 1;
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn drop_primary_key<S: TargetStore>(store: &S, database: &str, table: &str) -> Result<()> {
    store
        .exec(
            &format!("ALTER TABLE {} DROP PRIMARY KEY", qualified_name(database, table)),
            &[],
        )
        .await?;
    Ok(())
}

pub fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<_>>()
        .join(",")
}
