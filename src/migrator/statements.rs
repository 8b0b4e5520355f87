use super::convert::LiveColumn;
use super::prepare::{qualified_name, DedupMode, UPDATED_AT};
use crate::schema::quote_identifier;

/// Multi-row `INSERT ... ON DUPLICATE KEY UPDATE` for one table.
#[derive(Debug, Clone)]
pub struct InsertStatement {
    head: String,
    row_placeholders: String,
    conflict: String,
}

impl InsertStatement {
    pub fn new(database: &str, table: &str, columns: &[LiveColumn], mode: &DedupMode) -> Self {
        let names = columns
            .iter()
            .map(|column| quote_identifier(&column.name))
            .collect::<Vec<_>>()
            .join(",");
        InsertStatement {
            head: format!("INSERT INTO {} ({}) VALUES ", qualified_name(database, table), names),
            row_placeholders: format!("({})", vec!["?"; columns.len()].join(",")),
            conflict: conflict_clause(columns, mode),
        }
    }

    pub fn sql(&self, rows: usize) -> String {
        let mut sql = String::with_capacity(
            self.head.len() + rows * (self.row_placeholders.len() + 1) + self.conflict.len() + 1,
        );
        sql.push_str(&self.head);
        for i in 0..rows {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(&self.row_placeholders);
        }
        sql.push(' ');
        sql.push_str(&self.conflict);
        sql
    }
}

/// Assignments run left to right and later ones see earlier results, so
/// `updated_at` is always assigned last.
pub fn conflict_clause(columns: &[LiveColumn], mode: &DedupMode) -> String {
    let updated_at = quote_identifier(UPDATED_AT);
    let key = match mode {
        DedupMode::IgnoreDuplicates => {
            return format!("ON DUPLICATE KEY UPDATE {}={}", updated_at, updated_at);
        }
        DedupMode::UpsertIfNewer { key } => key,
    };

    let newer = format!("VALUES({})>={}", updated_at, updated_at);
    let mut assignments = columns
        .iter()
        .filter(|column| column.name != UPDATED_AT && !key.contains(&column.name))
        .map(|column| {
            let name = quote_identifier(&column.name);
            format!("{}=IF({}, VALUES({}), {})", name, newer, name, name)
        })
        .collect::<Vec<_>>();
    if columns.iter().any(|column| column.name == UPDATED_AT) {
        assignments.push(format!(
            "{}=IF({}, VALUES({}), {})",
            updated_at, newer, updated_at, updated_at
        ));
    }
    if assignments.is_empty() {
        // every column is part of the key; keep the statement valid as a no-op update
        let first = key.first().map(|column| quote_identifier(column)).unwrap_or(updated_at);
        return format!("ON DUPLICATE KEY UPDATE {}={}", first, first);
    }
    format!("ON DUPLICATE KEY UPDATE {}", assignments.join(", "))
}
