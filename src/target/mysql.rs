// =====================================================
// MySQL-COMPATIBLE TARGET CLUSTER
// =====================================================

use super::{SqlArg, SqlRow, TargetStore, TargetTransaction};
use crate::error::{MigrateError, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{ConnectOptions, MySql, Pool, Row, Transaction};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TargetConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct MySqlTarget {
    pool: Pool<MySql>,
}

impl MySqlTarget {
    pub async fn connect(config: &TargetConnectionConfig) -> Result<Self> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username);

        if let Some(pwd) = &config.password {
            options = options.password(pwd);
        }

        options = options.log_statements(log::LevelFilter::Debug);

        // workers hold connections for a whole commit interval, so never expire them
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(600))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                let err_msg = e.to_string();
                if err_msg.contains("os error 111") {
                    return MigrateError::Target(format!(
                        "Connection Refused ({}). Check if the target is running on {}:{}",
                        err_msg, config.host, config.port
                    ));
                }
                MigrateError::Target(format!("Failed to create pool: {}", e))
            })?;

        Ok(MySqlTarget { pool })
    }

    pub fn pool_size(&self) -> u32 {
        self.pool.size()
    }

    pub fn idle_connections(&self) -> usize {
        self.pool.num_idle()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct MySqlTargetTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait::async_trait]
impl TargetStore for MySqlTarget {
    type Tx = MySqlTargetTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrateError::Target(format!("Failed to begin transaction: {}", e)))?;
        Ok(MySqlTargetTransaction { tx })
    }

    async fn exec(&self, sql: &str, args: &[SqlArg]) -> Result<u64> {
        let result = if args.is_empty() {
            sqlx::raw_sql(sql).execute(&self.pool).await
        } else {
            bind_args(sqlx::query(sql), args).execute(&self.pool).await
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| MigrateError::Target(format!("Failed to execute statement: {}", e)))
    }

    async fn query(&self, sql: &str, args: &[SqlArg]) -> Result<Vec<SqlRow>> {
        let rows = if args.is_empty() {
            sqlx::raw_sql(sql).fetch_all(&self.pool).await
        } else {
            bind_args(sqlx::query(sql), args).fetch_all(&self.pool).await
        };
        rows.map(|rows| rows.iter().map(row_to_strings).collect())
            .map_err(|e| MigrateError::Target(format!("Query error: {}", e)))
    }
}

#[async_trait::async_trait]
impl TargetTransaction for MySqlTargetTransaction {
    async fn exec(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64> {
        // a bare &str has no arguments, so it runs over the text protocol like raw_sql
        let result = if args.is_empty() {
            sqlx::Executor::execute(&mut *self.tx, sql).await
        } else {
            bind_args(sqlx::query(sql), args).execute(&mut *self.tx).await
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| MigrateError::Target(format!("Failed to execute statement: {}", e)))
    }

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<SqlRow>> {
        let rows = if args.is_empty() {
            sqlx::Executor::fetch_all(&mut *self.tx, sql).await
        } else {
            bind_args(sqlx::query(sql), args).fetch_all(&mut *self.tx).await
        };
        rows.map(|rows| rows.iter().map(row_to_strings).collect())
            .map_err(|e| MigrateError::Target(format!("Query error: {}", e)))
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| MigrateError::Target(format!("Failed to commit transaction: {}", e)))
    }
}

fn bind_args<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    args: &'q [SqlArg],
) -> Query<'q, MySql, MySqlArguments> {
    for arg in args {
        query = match arg {
            SqlArg::UInt(value) => query.bind(*value),
            SqlArg::Int(value) => query.bind(*value),
            SqlArg::Float(value) => query.bind(*value),
            SqlArg::Text(value) => query.bind(value.as_str()),
            SqlArg::Timestamp(value) => query.bind(*value),
            SqlArg::Bool(value) => query.bind(*value),
        };
    }
    query
}

fn row_to_strings(row: &MySqlRow) -> SqlRow {
    (0..row.len())
        .map(|i| {
            row.try_get::<Option<i64>, _>(i)
                .map(|v| v.map(|v| v.to_string()))
                .or_else(|_| row.try_get::<Option<u64>, _>(i).map(|v| v.map(|v| v.to_string())))
                .or_else(|_| row.try_get::<Option<f64>, _>(i).map(|v| v.map(|v| v.to_string())))
                .or_else(|_| row.try_get::<Option<bool>, _>(i).map(|v| v.map(|v| v.to_string())))
                .or_else(|_| {
                    row.try_get::<Option<NaiveDateTime>, _>(i)
                        .map(|v| v.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string()))
                })
                .or_else(|_| row.try_get::<Option<String>, _>(i))
                .or_else(|_| {
                    row.try_get::<Option<Vec<u8>>, _>(i)
                        .map(|v| v.map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
                })
                .unwrap_or(None)
        })
        .collect()
}
