//! Sort-merge deduplication through the external `sorter` and `merger` programs.
//!
//! Layout under the data root:
//! `<src>/<db>/<table>.csv` + `.presorted` for each source, and
//! `merged/<db>/<table>.csv` + `.sql` + `.mark` for the merged stream.
//! A mark file is written only after everything it vouches for is on disk, so a
//! present mark means the output is trusted and an absent one means redo the step.

use crate::catalog::{DatabasePair, SrcDatabase};
use crate::error::{MigrateError, Result};
use crate::scheduler::JobLimiter;
use crate::schema::KeyMode;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, PoisonError};
use tokio::process::Command;
use tokio::task::JoinHandle;

const MERGED_DIR: &str = "merged";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresortSettings {
    pub data_root: PathBuf,
    pub sorter: PathBuf,
    pub merger: PathBuf,
    pub jobs: usize,
}

/// One async mutex per output path, created on first use and kept for the
/// life of the process.
#[derive(Debug, Default)]
pub struct MergeLockRegistry {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl MergeLockRegistry {
    pub fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct PresortPipeline {
    settings: PresortSettings,
    limiter: JobLimiter,
    locks: MergeLockRegistry,
}

impl PresortPipeline {
    pub fn new(settings: PresortSettings) -> Self {
        let limiter = JobLimiter::new(settings.jobs);
        PresortPipeline {
            settings,
            limiter,
            locks: MergeLockRegistry::default(),
        }
    }

    pub fn settings(&self) -> &PresortSettings {
        &self.settings
    }

    pub fn presorted_csv_path(&self, db: &SrcDatabase, table: &str) -> PathBuf {
        self.presort_dir(db).join(format!("{}.csv", table))
    }

    fn presort_dir(&self, db: &SrcDatabase) -> PathBuf {
        self.settings.data_root.join(&db.src_name).join(&db.name)
    }

    fn presort_mark_path(&self, db: &SrcDatabase, table: &str) -> PathBuf {
        self.presort_dir(db).join(format!("{}.presorted", table))
    }

    fn merged_dir(&self, database: &str) -> PathBuf {
        self.settings.data_root.join(MERGED_DIR).join(database)
    }

    pub fn merged_csv_path(&self, database: &str, table: &str) -> PathBuf {
        self.merged_dir(database).join(format!("{}.csv", table))
    }

    pub fn merged_schema_path(&self, database: &str, table: &str) -> PathBuf {
        self.merged_dir(database).join(format!("{}.sql", table))
    }

    fn merged_mark_path(&self, database: &str, table: &str) -> PathBuf {
        self.merged_dir(database).join(format!("{}.mark", table))
    }

    pub async fn is_table_presorted(&self, db: &SrcDatabase, table: &str) -> bool {
        file_exists(&self.presort_mark_path(db, table)).await
    }

    pub async fn is_table_merged(&self, database: &str, table: &str) -> bool {
        file_exists(&self.merged_mark_path(database, table)).await
    }

    /// Sorts one source's raw CSV by the table's key shape.
    pub async fn presort_table(&self, db: &SrcDatabase, table: &str) -> Result<PathBuf> {
        let output = self.presorted_csv_path(db, table);
        if self.is_table_presorted(db, table).await {
            return Ok(output);
        }

        let _permit = self.limiter.acquire().await?;
        let lock = self.locks.lock_for(&output);
        let _guard = lock.lock().await;
        if self.is_table_presorted(db, table).await {
            return Ok(output);
        }

        create_dir(&self.presort_dir(db)).await?;
        let key_mode = db.read_schema(table).await?.key_mode();
        info!("Presorting {} {}.{} ({})", db.src_name, db.name, table, key_mode);

        let input = db.csv_path(table);
        run_program(
            &self.settings.sorter,
            &[input.as_path(), output.as_path()],
            key_mode,
        )
        .await?;
        sync_file(&output).await?;
        write_mark(&self.presort_mark_path(db, table)).await?;
        Ok(output)
    }

    /// Returns the merged, deduplicated CSV for `table`, producing it if needed.
    pub async fn presort_and_merge(&self, pair: &DatabasePair, table: &str) -> Result<PathBuf> {
        let database = pair.name();
        let output = self.merged_csv_path(database, table);
        if self.is_table_merged(database, table).await {
            return Ok(output);
        }

        let (sorted_a, sorted_b) = futures::try_join!(
            self.presort_table(&pair.a, table),
            self.presort_table(&pair.b, table)
        )?;

        let _permit = self.limiter.acquire().await?;
        let lock = self.locks.lock_for(&output);
        let _guard = lock.lock().await;
        if self.is_table_merged(database, table).await {
            return Ok(output);
        }

        create_dir(&self.merged_dir(database)).await?;
        let schema = pair.a.read_schema(table).await?;
        let key_mode = schema.key_mode();
        info!("Merging {}.{} ({})", database, table, key_mode);

        let result = run_program(
            &self.settings.merger,
            &[sorted_a.as_path(), sorted_b.as_path(), output.as_path()],
            key_mode,
        )
        .await?;
        let stdout = String::from_utf8_lossy(&result.stdout);
        if !stdout.trim().is_empty() {
            info!("{}", stdout.trim_end());
        }

        sync_file(&output).await?;
        let schema_path = self.merged_schema_path(database, table);
        tokio::fs::write(&schema_path, schema.raw.as_bytes())
            .await
            .map_err(|e| MigrateError::io(format!("Failed to write {}", schema_path.display()), e))?;
        write_mark(&self.merged_mark_path(database, table)).await?;
        Ok(output)
    }

    /// Starts presorting and merging every table of `pairs` in catalog order on a
    /// background task. Callers needing a table early block on the same locks.
    pub fn spawn_background(self: &Arc<Self>, pairs: Vec<Arc<DatabasePair>>) -> BackgroundPresort {
        let pipeline = self.clone();
        let handle = tokio::spawn(async move {
            let mut merged = 0usize;
            for pair in &pairs {
                for table in &pair.a.tables {
                    pipeline.presort_and_merge(pair, table).await?;
                    merged += 1;
                }
            }
            debug!("Background presort finished {} tables", merged);
            Ok(merged)
        });
        BackgroundPresort { handle }
    }
}

/// Owned handle of the background presort task.
#[derive(Debug)]
pub struct BackgroundPresort {
    handle: JoinHandle<Result<usize>>,
}

impl BackgroundPresort {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task and returns how many tables it merged (or already found merged).
    pub async fn wait(self) -> Result<usize> {
        self.handle
            .await
            .map_err(|e| MigrateError::Worker(format!("Background presort panicked: {}", e)))?
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run_program(program: &Path, paths: &[&Path], key_mode: KeyMode) -> Result<Output> {
    let output = Command::new(program)
        .args(paths)
        .arg(key_mode.as_str())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            MigrateError::Subprocess(format!("Failed to start {}: {}", program.display(), e))
        })?;

    if !output.status.success() {
        return Err(MigrateError::Subprocess(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output)
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| MigrateError::io(format!("Failed to create {}", path.display()), e))
}

async fn sync_file(path: &Path) -> Result<()> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        MigrateError::Subprocess(format!("Expected output {} is missing: {}", path.display(), e))
    })?;
    file.sync_all()
        .await
        .map_err(|e| MigrateError::io(format!("Failed to sync {}", path.display()), e))
}

async fn write_mark(path: &Path) -> Result<()> {
    tokio::fs::write(path, b"")
        .await
        .map_err(|e| MigrateError::io(format!("Failed to write mark {}", path.display()), e))
}
