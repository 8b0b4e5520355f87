// Sharded dump migration engine
pub mod catalog;
pub mod config;
pub mod error;
pub mod migration_log;
pub mod migrator;
pub mod presort;
pub mod runner;
pub mod scheduler;
pub mod schema;
pub mod stats;
pub mod target;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{CliArgs, LogBackend, MigratorConfig};
pub use error::{MigrateError, Result};
pub use runner::{run, RunSummary};
