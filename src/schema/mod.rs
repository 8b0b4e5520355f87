//! Narrow reader for the `CREATE TABLE` dumps shipped with each source.
//!
//! This is not a DDL parser. It recognises exactly the clauses the migration
//! depends on (the `PRIMARY KEY`, `UNIQUE` keys and plain secondary `KEY`s that
//! mysqldump writes one per line) and leaves everything else untouched.
//! When a table declares several candidate keys, the `PRIMARY KEY` clause
//! decides the key mode and a plain two-column `KEY` is only consulted when the
//! primary key is absent or three columns wide.

use crate::error::{MigrateError, Result};
use regex::Regex;
use std::sync::LazyLock;

static PRIMARY_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)PRIMARY\s+KEY\s*(?:`[^`]*`\s*)?\(([^)]*)\)").expect("valid primary key regex")
});
static UNIQUE_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUNIQUE\s+(?:KEY|INDEX)\b").expect("valid unique key regex"));
static SECONDARY_INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i),[ \t]*\r?\n[ \t]*(?:KEY|INDEX)[ \t]*(?:`([^`]+)`[ \t]*)?\(([^)]*)\)(?:[ \t]+USING[ \t]+\w+)?")
        .expect("valid secondary index regex")
});
static TABLE_OPTIONS_ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\)\s*ENGINE\s*=").expect("valid table options regex"));

/// Key shape handed to the external sorter and merger as their last argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMode {
    /// `id`
    Id,
    /// `id`, then `a`
    IdA,
    /// `id`, then `a`, then `b`
    IdAB,
    /// `id`, then `b`, then `a`
    IdBA,
}

impl KeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Id => "id",
            KeyMode::IdA => "id_a",
            KeyMode::IdAB => "id_a_b",
            KeyMode::IdBA => "id_b_a",
        }
    }
}

impl std::fmt::Display for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plain (non-unique) secondary index declared inside the CREATE TABLE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndex {
    pub name: Option<String>,
    pub columns: Vec<String>,
    clause: String,
}

impl SecondaryIndex {
    pub fn add_index_statement(&self, database: &str, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(",");
        match &self.name {
            Some(name) => format!(
                "ALTER TABLE {}.{} ADD INDEX {} ({});",
                quote_identifier(database),
                quote_identifier(table),
                quote_identifier(name),
                columns
            ),
            None => format!(
                "ALTER TABLE {}.{} ADD INDEX ({});",
                quote_identifier(database),
                quote_identifier(table),
                columns
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub raw: String,
    pub primary_key: Vec<String>,
    pub has_unique_key: bool,
    pub secondary_index: Option<SecondaryIndex>,
}

/// Target-specific rewrites applied before the schema is executed.
#[derive(Debug, Clone, Default)]
pub struct SchemaTransform {
    pub defer_secondary_index: bool,
    pub shard_key: Option<String>,
    pub fallback_primary_key: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TransformedSchema {
    pub create_table: String,
    pub deferred_index: Option<SecondaryIndex>,
    pub synthesized_primary_key: bool,
}

impl TableSchema {
    pub fn parse(table: &str, raw: &str) -> Self {
        let primary_key = PRIMARY_KEY_RE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| split_column_list(m.as_str()))
            .unwrap_or_default();

        let secondary_index = SECONDARY_INDEX_RE.captures(raw).and_then(|caps| {
            let clause = caps.get(0)?.as_str().to_string();
            let name = caps.get(1).map(|m| m.as_str().to_string());
            let columns = split_column_list(caps.get(2)?.as_str());
            if columns.is_empty() {
                return None;
            }
            Some(SecondaryIndex {
                name,
                columns,
                clause,
            })
        });

        TableSchema {
            table: table.to_string(),
            raw: raw.to_string(),
            primary_key,
            has_unique_key: UNIQUE_KEY_RE.is_match(raw),
            secondary_index,
        }
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// True when the dump itself declares a row identity (primary or unique key).
    pub fn has_natural_identity(&self) -> bool {
        self.has_primary_key() || self.has_unique_key
    }

    pub fn key_arity(&self) -> usize {
        self.primary_key.len()
    }

    pub fn key_mode(&self) -> KeyMode {
        match self.key_arity() {
            1 => KeyMode::Id,
            2 => KeyMode::IdA,
            _ => match &self.secondary_index {
                Some(index) if index.columns == ["id", "b"] => KeyMode::IdBA,
                _ => KeyMode::IdAB,
            },
        }
    }

    pub fn transform(&self, options: &SchemaTransform) -> Result<TransformedSchema> {
        let mut sql = self.raw.trim_end().trim_end_matches(';').trim_end().to_string();

        let deferred_index = match &self.secondary_index {
            Some(index) if options.defer_secondary_index => {
                sql = sql.replacen(&index.clause, "", 1);
                Some(index.clone())
            }
            _ => None,
        };

        let mut synthesized_primary_key = false;
        if let Some(shard_key) = &options.shard_key {
            // the cluster only accepts a shard key on tables that have a primary key
            if !self.has_primary_key() {
                if options.fallback_primary_key.is_empty() {
                    return Err(MigrateError::Schema(format!(
                        "Table {} has no primary key and no fallback key columns are configured",
                        self.table
                    )));
                }
                let anchor = locate_body_end(&sql).ok_or_else(|| {
                    MigrateError::Schema(format!(
                        "Could not locate the end of the column list in the schema of table {}",
                        self.table
                    ))
                })?;
                let key_columns = options
                    .fallback_primary_key
                    .iter()
                    .map(|column| quote_identifier(column))
                    .collect::<Vec<_>>()
                    .join(",");
                sql.insert_str(anchor, &format!(",\n  PRIMARY KEY({})\n", key_columns));
                synthesized_primary_key = true;
            }
            sql.push_str(&format!(" shardkey={}", shard_key));
        }

        Ok(TransformedSchema {
            create_table: sql,
            deferred_index,
            synthesized_primary_key,
        })
    }
}

/// Byte index of the `)` that closes the column list.
fn locate_body_end(sql: &str) -> Option<usize> {
    if let Some(m) = TABLE_OPTIONS_ANCHOR_RE.find(sql) {
        return Some(m.start());
    }
    if sql.ends_with(')') {
        return Some(sql.len() - 1);
    }
    None
}

fn split_column_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|column| column.trim().trim_matches('`').trim())
        .filter(|column| !column.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
