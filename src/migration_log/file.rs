use super::{LogEntry, LogStatement, MigrationLog, ResumePoint, TableKey};
use crate::error::{MigrateError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const SEEK_FILE: &str = "seek.txt";
const TEMPORARY_KEY_FILE: &str = "temporary_key.txt";

/// `<root>/<source>/<database>/<table>/seek.txt` holding the decimal seek.
#[derive(Debug, Clone)]
pub struct FileMigrationLog {
    root: PathBuf,
}

impl FileMigrationLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileMigrationLog { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, key: &TableKey) -> PathBuf {
        self.root.join(&key.source).join(&key.database).join(&key.table)
    }

    async fn ensure_table_dir(&self, key: &TableKey) -> Result<PathBuf> {
        let dir = self.table_dir(key);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            MigrateError::io(format!("Failed to create migration log dir {}", dir.display()), e)
        })?;
        Ok(dir)
    }

    async fn table_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for source_dir in sub_dirs(&self.root).await? {
            for database_dir in sub_dirs(&source_dir).await? {
                dirs.extend(sub_dirs(&database_dir).await?);
            }
        }
        Ok(dirs)
    }
}

#[async_trait::async_trait]
impl MigrationLog for FileMigrationLog {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            MigrateError::io(
                format!("Failed to create migration log root {}", self.root.display()),
                e,
            )
        })
    }

    async fn read_entry(&self, key: &TableKey) -> Result<LogEntry> {
        let dir = self.table_dir(key);
        let seek_path = dir.join(SEEK_FILE);
        let seek = match tokio::fs::read_to_string(&seek_path).await {
            Ok(content) => content.trim().parse::<i64>().map_err(|e| {
                MigrateError::MigrationLog(format!(
                    "Corrupt seek file {} ({:?}): {}",
                    seek_path.display(),
                    content,
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogEntry::not_started()),
            Err(e) => {
                return Err(MigrateError::io(
                    format!("Failed to read seek file {}", seek_path.display()),
                    e,
                ))
            }
        };

        Ok(LogEntry {
            resume: ResumePoint::from_seek(seek)?,
            temporary_key: tokio::fs::try_exists(dir.join(TEMPORARY_KEY_FILE))
                .await
                .unwrap_or(false),
        })
    }

    async fn initialize(&self, key: &TableKey, temporary_key: bool) -> Result<()> {
        let dir = self.ensure_table_dir(key).await?;
        let flag_path = dir.join(TEMPORARY_KEY_FILE);
        if temporary_key {
            tokio::fs::write(&flag_path, b"1").await.map_err(|e| {
                MigrateError::io(format!("Failed to write {}", flag_path.display()), e)
            })?;
        } else if let Err(e) = tokio::fs::remove_file(&flag_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(MigrateError::io(
                    format!("Failed to remove {}", flag_path.display()),
                    e,
                ));
            }
        }
        self.write_resume_point(key, ResumePoint::At(0)).await
    }

    async fn write_resume_point(&self, key: &TableKey, point: ResumePoint) -> Result<()> {
        let dir = self.ensure_table_dir(key).await?;
        let seek_path = dir.join(SEEK_FILE);
        let staging_path = dir.join(format!("{}.tmp", SEEK_FILE));

        // synced before the rename, so a crash leaves either the old or the new seek
        let write_error =
            |e| MigrateError::io(format!("Failed to write {}", staging_path.display()), e);
        let mut staging = tokio::fs::File::create(&staging_path)
            .await
            .map_err(write_error)?;
        staging
            .write_all(point.to_seek().to_string().as_bytes())
            .await
            .map_err(write_error)?;
        staging.sync_all().await.map_err(write_error)?;
        drop(staging);

        tokio::fs::rename(&staging_path, &seek_path)
            .await
            .map_err(|e| {
                MigrateError::io(format!("Failed to replace {}", seek_path.display()), e)
            })
    }

    fn transactional_write(&self, _key: &TableKey, _point: ResumePoint) -> Option<LogStatement> {
        None
    }

    async fn temporary_keys(&self) -> Result<Vec<(String, String)>> {
        let mut keys = BTreeSet::new();
        for dir in self.table_dirs().await? {
            if !tokio::fs::try_exists(dir.join(TEMPORARY_KEY_FILE))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            let table = file_name(&dir);
            let database = dir.parent().map(file_name).unwrap_or_default();
            keys.insert((database, table));
        }
        Ok(keys.into_iter().collect())
    }

    async fn clear_temporary_key(&self, database: &str, table: &str) -> Result<()> {
        for dir in self.table_dirs().await? {
            let matches = file_name(&dir) == table
                && dir.parent().map(file_name).as_deref() == Some(database);
            if !matches {
                continue;
            }
            let flag_path = dir.join(TEMPORARY_KEY_FILE);
            if let Err(e) = tokio::fs::remove_file(&flag_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(MigrateError::io(
                        format!("Failed to remove {}", flag_path.display()),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    async fn discard(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MigrateError::io(
                format!("Failed to remove migration log root {}", self.root.display()),
                e,
            )),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

async fn sub_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = match tokio::fs::read_dir(path).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(MigrateError::io(
                format!("Failed to read directory {}", path.display()),
                e,
            ))
        }
    };

    let mut dirs = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(|e| {
        MigrateError::io(format!("Failed to list directory {}", path.display()), e)
    })? {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
