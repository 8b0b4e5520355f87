use crate::error::{MigrateError, Result};
use crate::target::SqlArg;
use chrono::NaiveDateTime;
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    UnsignedInteger,
    Integer,
    Float,
    Text,
    Timestamp,
}

impl ColumnKind {
    /// Maps `information_schema.COLUMNS` type info to the value a field is bound as.
    pub fn classify(data_type: &str, column_type: &str) -> Self {
        let data_type = data_type.to_lowercase();
        match data_type.as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => {
                if column_type.to_lowercase().contains("unsigned") {
                    ColumnKind::UnsignedInteger
                } else {
                    ColumnKind::Integer
                }
            }
            "float" | "double" | "real" => ColumnKind::Float,
            "datetime" | "timestamp" => ColumnKind::Timestamp,
            // decimal, date, char/varchar/text and the rest go through as text
            _ => ColumnKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub kind: ColumnKind,
}

pub fn convert_field(column: &LiveColumn, value: &str) -> Result<SqlArg> {
    let invalid = |e: &dyn std::fmt::Display| {
        MigrateError::Conversion(format!(
            "Invalid value {:?} for column {} ({:?}): {}",
            value, column.name, column.kind, e
        ))
    };
    match column.kind {
        ColumnKind::UnsignedInteger => value.trim().parse::<u64>().map(SqlArg::UInt).map_err(|e| invalid(&e)),
        ColumnKind::Integer => value.trim().parse::<i64>().map(SqlArg::Int).map_err(|e| invalid(&e)),
        ColumnKind::Float => value.trim().parse::<f64>().map(SqlArg::Float).map_err(|e| invalid(&e)),
        ColumnKind::Timestamp => NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
            .map(SqlArg::Timestamp)
            .map_err(|e| invalid(&e)),
        ColumnKind::Text => Ok(SqlArg::Text(value.to_string())),
    }
}

/// Parses the CSV lines in `buffer` and appends one argument per field to `args`.
/// Returns the number of rows. Every row must have exactly one field per column.
///
/// Records end at `\n` and fields are split on `,` only; quotes are ordinary characters.
pub fn convert_batch(buffer: &[u8], columns: &[LiveColumn], args: &mut Vec<SqlArg>) -> Result<usize> {
    // the csv reader skips empty lines without a trace
    if let Some(position) = blank_line(buffer) {
        return Err(MigrateError::Conversion(format!(
            "Empty record at byte {} of the batch",
            position
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_reader(buffer);

    let mut rows = 0usize;
    for record in reader.records() {
        let record = record
            .map_err(|e| MigrateError::Conversion(format!("Malformed CSV record: {}", e)))?;
        if record.len() != columns.len() {
            return Err(MigrateError::Conversion(format!(
                "Row {:?} has {} fields but the table has {} columns",
                record.iter().collect::<Vec<_>>().join(","),
                record.len(),
                columns.len()
            )));
        }
        for (column, value) in columns.iter().zip(record.iter()) {
            args.push(convert_field(column, value)?);
        }
        rows += 1;
    }
    Ok(rows)
}

fn blank_line(buffer: &[u8]) -> Option<usize> {
    let mut start = 0usize;
    for line in buffer.split_inclusive(|byte| *byte == b'\n') {
        if line == b"\n" {
            return Some(start);
        }
        start += line.len();
    }
    None
}
