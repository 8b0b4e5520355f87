use thiserror::Error;

/// MySQL error 1205, raised when an online index build waits too long on row locks.
const LOCK_WAIT_TIMEOUT_SIGNATURE: &str = "Lock wait timeout exceeded";

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("target error: {0}")]
    Target(String),

    #[error("migration log error: {0}")]
    MigrationLog(String),

    #[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, MigrateError>;

impl MigrateError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MigrateError::Io {
            context: context.into(),
            source,
        }
    }

    /// Only target errors can carry the lock wait signature; everything else is fatal.
    pub fn is_lock_wait_timeout(&self) -> bool {
        match self {
            MigrateError::Target(message) => message.contains(LOCK_WAIT_TIMEOUT_SIGNATURE),
            _ => false,
        }
    }
}
