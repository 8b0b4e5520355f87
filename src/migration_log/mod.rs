//! Durable resume points, one per (source, database, table).
//!
//! A seek is `-2` (not started), `-1` (finished) or the byte offset into the
//! merged CSV up to which rows are committed on the target. It is only ever
//! advanced after (or together with) the commit of the rows it covers.

use crate::error::{MigrateError, Result};
use crate::target::SqlArg;

mod file;
pub(crate) mod target;

pub use file::FileMigrationLog;
pub use target::TargetMigrationLog;

pub const SEEK_NOT_STARTED: i64 = -2;
pub const SEEK_FINISHED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub source: String,
    pub database: String,
    pub table: String,
}

impl TableKey {
    pub fn new(source: &str, database: &str, table: &str) -> Self {
        TableKey {
            source: source.to_string(),
            database: database.to_string(),
            table: table.to_string(),
        }
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}.{}", self.source, self.database, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    NotStarted,
    At(u64),
    Finished,
}

impl ResumePoint {
    pub fn from_seek(seek: i64) -> Result<Self> {
        match seek {
            SEEK_NOT_STARTED => Ok(ResumePoint::NotStarted),
            SEEK_FINISHED => Ok(ResumePoint::Finished),
            offset if offset >= 0 => Ok(ResumePoint::At(offset as u64)),
            other => Err(MigrateError::MigrationLog(format!("Invalid seek value {}", other))),
        }
    }

    pub fn to_seek(&self) -> i64 {
        match self {
            ResumePoint::NotStarted => SEEK_NOT_STARTED,
            ResumePoint::Finished => SEEK_FINISHED,
            ResumePoint::At(offset) => i64::try_from(*offset).unwrap_or(i64::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub resume: ResumePoint,
    /// The table's dedup key was synthesized and should be dropped after the migration.
    pub temporary_key: bool,
}

impl LogEntry {
    pub fn not_started() -> Self {
        LogEntry {
            resume: ResumePoint::NotStarted,
            temporary_key: false,
        }
    }
}

/// A statement that records a resume point inside the caller's data transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct LogStatement {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

#[async_trait::async_trait]
pub trait MigrationLog: Send + Sync + 'static {
    fn backend(&self) -> &'static str;

    /// Creates whatever storage the log needs. Safe to call on every start.
    async fn prepare(&self) -> Result<()>;

    async fn read_entry(&self, key: &TableKey) -> Result<LogEntry>;

    /// First write for a table: resume point 0 plus the temporary key flag.
    async fn initialize(&self, key: &TableKey, temporary_key: bool) -> Result<()>;

    async fn write_resume_point(&self, key: &TableKey, point: ResumePoint) -> Result<()>;

    /// When the log lives next to the data, the returned statement is executed in
    /// the batch transaction so data and resume point commit atomically. `None`
    /// means the caller must `write_resume_point` strictly after committing.
    fn transactional_write(&self, key: &TableKey, point: ResumePoint) -> Option<LogStatement>;

    /// `(database, table)` pairs still carrying a synthesized key.
    async fn temporary_keys(&self) -> Result<Vec<(String, String)>>;

    async fn clear_temporary_key(&self, database: &str, table: &str) -> Result<()>;

    /// Throws away the whole log. Used when a fresh run starts and after a full success.
    async fn discard(&self) -> Result<()> {
        Ok(())
    }
}
