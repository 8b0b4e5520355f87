//! The SQL capability the migration consumes from the target cluster.

use crate::error::Result;
use chrono::NaiveDateTime;

mod mysql;

#[cfg(test)]
pub mod memory;

pub use mysql::{MySqlTarget, TargetConnectionConfig};

/// A bound statement argument in its native type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    UInt(u64),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Bool(bool),
}

/// One result row, every value rendered as text (`None` for SQL NULL).
pub type SqlRow = Vec<Option<String>>;

#[async_trait::async_trait]
pub trait TargetTransaction: Send {
    async fn exec(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64>;
    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<SqlRow>>;
    async fn commit(self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TargetStore: Send + Sync + 'static {
    type Tx: TargetTransaction + 'static;

    async fn begin(&self) -> Result<Self::Tx>;
    async fn exec(&self, sql: &str, args: &[SqlArg]) -> Result<u64>;
    async fn query(&self, sql: &str, args: &[SqlArg]) -> Result<Vec<SqlRow>>;
}

/// Runs `statements` in order inside one transaction.
pub async fn exec_all_in_transaction<S: TargetStore>(store: &S, statements: &[String]) -> Result<u64> {
    let mut tx = store.begin().await?;
    let mut rows_affected = 0u64;
    for statement in statements {
        rows_affected = rows_affected.saturating_add(tx.exec(statement, &[]).await?);
    }
    tx.commit().await?;
    Ok(rows_affected)
}
