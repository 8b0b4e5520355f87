//! In-memory `TargetStore` used by the tests.
//!
//! It understands the statements the migrator and the target-backed log issue
//! and nothing more. Unknown statements are recorded and succeed with zero rows.
//! A transaction works on a private copy and replays its statements onto the
//! shared state on commit; dropping it without commit discards everything.

use super::{SqlArg, SqlRow, TargetStore, TargetTransaction};
use crate::error::{MigrateError, Result};
use crate::migration_log::target as meta;
use crate::migrator::prepare::{COLUMNS_QUERY, INDEXES_QUERY};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const IGNORE_DUPLICATES_SUFFIX: &str = "ON DUPLICATE KEY UPDATE `updated_at`=`updated_at`";

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    /// `(COLUMN_NAME, DATA_TYPE, COLUMN_TYPE)` in declaration order.
    pub columns: Vec<(String, String, String)>,
    pub unique_key: Vec<String>,
    pub secondary_indexes: Vec<Vec<String>>,
    pub rows: Vec<Vec<SqlArg>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    databases: BTreeSet<String>,
    tables: BTreeMap<(String, String), MemoryTable>,
    meta: Option<BTreeMap<(String, String, String), (i64, bool)>>,
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    message: String,
    skip: usize,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: MemoryState,
    current_database: Option<String>,
    statements: Vec<String>,
    failures: Vec<Failure>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `times` statements containing `pattern` fail with `message`.
    pub fn fail_matching(&self, pattern: &str, message: &str, times: usize) {
        self.fail_after(pattern, message, 0, times);
    }

    /// Lets `skip` matching statements through, then fails the next `times`.
    pub fn fail_after(&self, pattern: &str, message: &str, skip: usize, times: usize) {
        self.lock().failures.push(Failure {
            pattern: pattern.to_string(),
            message: message.to_string(),
            skip,
            remaining: times,
        });
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn table(&self, database: &str, table: &str) -> Option<MemoryTable> {
        self.lock()
            .state
            .tables
            .get(&(database.to_string(), table.to_string()))
            .cloned()
    }

    pub fn rows(&self, database: &str, table: &str) -> Vec<Vec<SqlArg>> {
        self.table(database, table).map(|t| t.rows).unwrap_or_default()
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.lock().state.databases.contains(database)
    }

    pub fn meta_entry(&self, source: &str, database: &str, table: &str) -> Option<(i64, bool)> {
        self.lock().state.meta.as_ref().and_then(|entries| {
            entries
                .get(&(database.to_string(), table.to_string(), source.to_string()))
                .copied()
        })
    }

    fn intercept(&self, sql: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.statements.push(sql.to_string());
        if let Some(failure) = inner
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern))
        {
            if failure.skip > 0 {
                failure.skip -= 1;
                return Ok(());
            }
            failure.remaining -= 1;
            return Err(MigrateError::Target(format!(
                "Failed to execute statement: {}",
                failure.message
            )));
        }
        Ok(())
    }
}

pub struct MemoryTransaction {
    target: MemoryTarget,
    working: MemoryState,
    current_database: Option<String>,
    journal: Vec<(String, Vec<SqlArg>)>,
}

#[async_trait::async_trait]
impl TargetStore for MemoryTarget {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let inner = self.lock();
        Ok(MemoryTransaction {
            target: self.clone(),
            working: inner.state.clone(),
            current_database: inner.current_database.clone(),
            journal: Vec::new(),
        })
    }

    async fn exec(&self, sql: &str, args: &[SqlArg]) -> Result<u64> {
        self.intercept(sql)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        apply(&mut inner.state, &mut inner.current_database, sql, args)
    }

    async fn query(&self, sql: &str, args: &[SqlArg]) -> Result<Vec<SqlRow>> {
        self.intercept(sql)?;
        Ok(answer(&self.lock().state, sql, args))
    }
}

#[async_trait::async_trait]
impl TargetTransaction for MemoryTransaction {
    async fn exec(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64> {
        self.target.intercept(sql)?;
        let affected = apply(&mut self.working, &mut self.current_database, sql, args)?;
        self.journal.push((sql.to_string(), args.to_vec()));
        Ok(affected)
    }

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<SqlRow>> {
        self.target.intercept(sql)?;
        Ok(answer(&self.working, sql, args))
    }

    async fn commit(self) -> Result<()> {
        let mut guard = self.target.lock();
        let inner = &mut *guard;
        for (sql, args) in &self.journal {
            apply(&mut inner.state, &mut inner.current_database, sql, args)?;
        }
        Ok(())
    }
}

fn text(arg: Option<&SqlArg>) -> String {
    match arg {
        Some(SqlArg::Text(value)) => value.clone(),
        Some(SqlArg::Int(value)) => value.to_string(),
        Some(SqlArg::UInt(value)) => value.to_string(),
        Some(other) => format!("{:?}", other),
        None => String::new(),
    }
}

fn int(arg: Option<&SqlArg>) -> i64 {
    match arg {
        Some(SqlArg::Int(value)) => *value,
        Some(SqlArg::UInt(value)) => *value as i64,
        Some(SqlArg::Bool(value)) => *value as i64,
        _ => 0,
    }
}

fn backticked(fragment: &str) -> Vec<String> {
    fragment
        .split('`')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

fn last_parenthesized(fragment: &str) -> Vec<String> {
    match (fragment.rfind('('), fragment.rfind(')')) {
        (Some(open), Some(close)) if open < close => backticked(&fragment[open..close]),
        _ => Vec::new(),
    }
}

fn missing_table(database: &str, table: &str) -> MigrateError {
    MigrateError::Target(format!(
        "Failed to execute statement: Table '{}.{}' doesn't exist",
        database, table
    ))
}

fn apply(
    state: &mut MemoryState,
    current_database: &mut Option<String>,
    sql: &str,
    args: &[SqlArg],
) -> Result<u64> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();

    if trimmed == meta::CREATE_META_TABLE {
        state.meta.get_or_insert_with(BTreeMap::new);
        return Ok(0);
    }
    if trimmed == meta::DROP_META_DATABASE {
        state.meta = None;
        state.databases.remove("meta_migration");
        return Ok(0);
    }
    if trimmed == meta::INITIALIZE_ENTRY || trimmed == meta::UPSERT_SEEK {
        let entries = state.meta.as_mut().ok_or_else(|| {
            MigrateError::Target("Failed to execute statement: Unknown database 'meta_migration'".to_string())
        })?;
        let entry_key = (text(args.first()), text(args.get(1)), text(args.get(2)));
        let existing = entries.get(&entry_key).copied();
        let entry = if trimmed == meta::INITIALIZE_ENTRY {
            (0, int(args.get(3)) != 0)
        } else {
            (int(args.get(3)), existing.map(|(_, temporary)| temporary).unwrap_or(false))
        };
        entries.insert(entry_key, entry);
        return Ok(if existing.is_some() { 2 } else { 1 });
    }
    if trimmed == meta::CLEAR_TEMPORARY_KEY {
        let (database, table) = (text(args.first()), text(args.get(1)));
        let mut changed = 0;
        for ((db, t, _), entry) in state.meta.iter_mut().flatten() {
            if *db == database && *t == table && entry.1 {
                entry.1 = false;
                changed += 1;
            }
        }
        return Ok(changed);
    }

    if upper.starts_with("CREATE DATABASE") {
        if let Some(name) = backticked(trimmed).into_iter().next() {
            state.databases.insert(name);
        }
        return Ok(1);
    }
    if upper.starts_with("USE ") {
        *current_database = backticked(trimmed).into_iter().next();
        return Ok(0);
    }
    if upper.starts_with("CREATE TABLE") {
        return create_table(state, current_database.as_deref(), trimmed);
    }
    if upper.starts_with("ALTER TABLE") {
        return alter_table(state, trimmed, &upper);
    }
    if upper.starts_with("INSERT INTO") {
        return insert_rows(state, trimmed, args);
    }
    Ok(0)
}

fn create_table(state: &mut MemoryState, current_database: Option<&str>, sql: &str) -> Result<u64> {
    let header_end = sql.find('(').unwrap_or(sql.len());
    let names = backticked(&sql[..header_end]);
    let (database, table) = match names.as_slice() {
        [database, table] => (database.clone(), table.clone()),
        [table] => (
            current_database
                .ok_or_else(|| MigrateError::Target("Failed to execute statement: No database selected".to_string()))?
                .to_string(),
            table.clone(),
        ),
        _ => return Err(MigrateError::Target(format!("Cannot parse CREATE TABLE: {}", sql))),
    };
    if !state.databases.contains(&database) {
        return Err(MigrateError::Target(format!(
            "Failed to execute statement: Unknown database '{}'",
            database
        )));
    }
    let key = (database, table);
    if state.tables.contains_key(&key) {
        return Ok(0);
    }

    let mut definition = MemoryTable::default();
    for line in sql[header_end + 1..].lines() {
        let line = line.trim().trim_end_matches(',');
        let upper = line.to_uppercase();
        if line.starts_with('`') {
            let name = backticked(line).into_iter().next().unwrap_or_default();
            let rest = line.splitn(3, '`').nth(2).unwrap_or("").trim();
            let column_type = rest.split_whitespace().next().unwrap_or("").to_lowercase();
            let data_type = column_type.split('(').next().unwrap_or("").to_string();
            let column_type = if upper.contains(" UNSIGNED") {
                format!("{} unsigned", column_type)
            } else {
                column_type
            };
            definition.columns.push((name, data_type, column_type));
        } else if upper.starts_with("PRIMARY KEY") {
            definition.unique_key = last_parenthesized(line);
        } else if upper.starts_with("UNIQUE") {
            if definition.unique_key.is_empty() {
                definition.unique_key = last_parenthesized(line);
            }
        } else if upper.starts_with("KEY") || upper.starts_with("INDEX") {
            definition.secondary_indexes.push(last_parenthesized(line));
        }
    }
    state.tables.insert(key, definition);
    Ok(0)
}

fn alter_table(state: &mut MemoryState, sql: &str, upper: &str) -> Result<u64> {
    let names = backticked(sql);
    let (database, table) = match names.as_slice() {
        [database, table, ..] => (database.clone(), table.clone()),
        _ => return Err(MigrateError::Target(format!("Cannot parse ALTER TABLE: {}", sql))),
    };
    let definition = state
        .tables
        .get_mut(&(database.clone(), table.clone()))
        .ok_or_else(|| missing_table(&database, &table))?;

    if upper.contains("ADD PRIMARY KEY") {
        if !definition.unique_key.is_empty() {
            return Err(MigrateError::Target(
                "Failed to execute statement: Multiple primary key defined".to_string(),
            ));
        }
        definition.unique_key = last_parenthesized(sql);
    } else if upper.contains("DROP PRIMARY KEY") {
        definition.unique_key.clear();
    } else if upper.contains("ADD INDEX") || upper.contains("ADD KEY") {
        definition.secondary_indexes.push(last_parenthesized(sql));
    }
    Ok(0)
}

fn insert_rows(state: &mut MemoryState, sql: &str, args: &[SqlArg]) -> Result<u64> {
    let values_at = sql.find(" VALUES").unwrap_or(sql.len());
    let names = backticked(&sql[..values_at]);
    if names.len() < 3 {
        return Err(MigrateError::Target(format!("Cannot parse INSERT: {}", sql)));
    }
    let (database, table) = (names[0].clone(), names[1].clone());
    let columns = &names[2..];
    if args.len() % columns.len() != 0 {
        return Err(MigrateError::Target(format!(
            "Failed to execute statement: {} arguments for {} columns",
            args.len(),
            columns.len()
        )));
    }
    let ignore_duplicates = sql.ends_with(IGNORE_DUPLICATES_SUFFIX);

    let definition = state
        .tables
        .get_mut(&(database.clone(), table.clone()))
        .ok_or_else(|| missing_table(&database, &table))?;

    let mut positions = Vec::with_capacity(columns.len());
    for (name, _, _) in &definition.columns {
        let position = columns.iter().position(|c| c == name).ok_or_else(|| {
            MigrateError::Target(format!(
                "Failed to execute statement: Field '{}' doesn't have a default value",
                name
            ))
        })?;
        positions.push(position);
    }
    let key_positions: Vec<usize> = definition
        .unique_key
        .iter()
        .filter_map(|k| definition.columns.iter().position(|(name, _, _)| name == k))
        .collect();
    let updated_at = definition
        .columns
        .iter()
        .position(|(name, _, _)| name == "updated_at");

    let mut affected = 0u64;
    for chunk in args.chunks(columns.len()) {
        let row: Vec<SqlArg> = positions.iter().map(|&p| chunk[p].clone()).collect();
        let existing = if key_positions.is_empty() {
            None
        } else {
            definition.rows.iter().position(|candidate| {
                key_positions.iter().all(|&k| candidate[k] == row[k])
            })
        };

        match existing {
            None => {
                definition.rows.push(row);
                affected += 1;
            }
            Some(_) if ignore_duplicates => {}
            Some(index) => {
                let newer = match updated_at {
                    Some(u) => at_least(&row[u], &definition.rows[index][u]),
                    None => true,
                };
                if newer && definition.rows[index] != row {
                    definition.rows[index] = row;
                    affected += 2;
                }
            }
        }
    }
    Ok(affected)
}

fn at_least(incoming: &SqlArg, existing: &SqlArg) -> bool {
    match (incoming, existing) {
        (SqlArg::Timestamp(a), SqlArg::Timestamp(b)) => a >= b,
        (SqlArg::Text(a), SqlArg::Text(b)) => a >= b,
        (SqlArg::Int(a), SqlArg::Int(b)) => a >= b,
        (SqlArg::UInt(a), SqlArg::UInt(b)) => a >= b,
        _ => true,
    }
}

fn answer(state: &MemoryState, sql: &str, args: &[SqlArg]) -> Vec<SqlRow> {
    let trimmed = sql.trim();
    if trimmed == COLUMNS_QUERY || trimmed == INDEXES_QUERY {
        let Some(definition) = state.tables.get(&(text(args.first()), text(args.get(1)))) else {
            return Vec::new();
        };
        if trimmed == COLUMNS_QUERY {
            return definition
                .columns
                .iter()
                .map(|(name, data_type, column_type)| {
                    vec![Some(name.clone()), Some(data_type.clone()), Some(column_type.clone())]
                })
                .collect();
        }
        let mut rows: Vec<SqlRow> = definition
            .unique_key
            .iter()
            .map(|column| vec![Some("PRIMARY".to_string()), Some(column.clone()), Some("0".to_string())])
            .collect();
        for (i, index) in definition.secondary_indexes.iter().enumerate() {
            for column in index {
                rows.push(vec![
                    Some(format!("idx_{}", i)),
                    Some(column.clone()),
                    Some("1".to_string()),
                ]);
            }
        }
        return rows;
    }
    if trimmed == meta::SELECT_ENTRY {
        let entry_key = (text(args.first()), text(args.get(1)), text(args.get(2)));
        return state
            .meta
            .as_ref()
            .and_then(|entries| entries.get(&entry_key))
            .map(|(seek, temporary)| {
                vec![vec![Some(seek.to_string()), Some(if *temporary { "1" } else { "0" }.to_string())]]
            })
            .unwrap_or_default();
    }
    if trimmed == meta::SELECT_TEMPORARY_KEYS {
        let keys: BTreeSet<(String, String)> = state
            .meta
            .iter()
            .flatten()
            .filter(|(_, (_, temporary))| *temporary)
            .map(|((database, table, _), _)| (database.clone(), table.clone()))
            .collect();
        return keys
            .into_iter()
            .map(|(database, table)| vec![Some(database), Some(table)])
            .collect();
    }
    if trimmed.eq_ignore_ascii_case("SHOW DATABASES") {
        return state
            .databases
            .iter()
            .map(|name| vec![Some(name.clone())])
            .collect();
    }
    Vec::new()
}
