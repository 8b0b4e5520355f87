use super::convert::convert_batch;
use super::prepare::{self, DedupMode};
use super::statements::InsertStatement;
use super::{Migrator, TableReport};
use crate::catalog::DatabasePair;
use crate::error::{MigrateError, Result};
use crate::migration_log::{MigrationLog, ResumePoint, TableKey};
use crate::target::{TargetStore, TargetTransaction};
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};

/// MySQL rejects statements with more placeholders than this.
const MAX_PLACEHOLDERS: usize = 65_535;

impl<S: TargetStore, L: MigrationLog> Migrator<S, L> {
    /// Migrates one table from the merged stream of `pair`, resuming where the
    /// log says the last run stopped.
    pub async fn migrate_table(&self, pair: &DatabasePair, table: &str) -> Result<TableReport> {
        let database = pair.name();
        let key = TableKey::new(&pair.a.src_name, database, table);
        let mut report = TableReport::new(database, table);

        let merged = self.pipeline.presort_and_merge(pair, table).await?;

        let schema = pair.a.read_schema(table).await?;
        let transformed = schema.transform(&self.settings.schema)?;
        let entry = self.log.read_entry(&key).await?;
        report.temporary_key = entry.temporary_key;

        let start = match entry.resume {
            ResumePoint::Finished => {
                info!("{} already migrated", key);
                report.already_finished = true;
                if let Some(index) = &transformed.deferred_index {
                    report.index_rebuilt = prepare::rebuild_secondary_index(
                        self.store.as_ref(),
                        database,
                        table,
                        index,
                        self.settings.index_retry_delay,
                    )
                    .await?;
                }
                return Ok(report);
            }
            ResumePoint::NotStarted => {
                info!("Creating {}.{}", database, table);
                prepare::create_table(self.store.as_ref(), database, &transformed.create_table)
                    .await?;
                0
            }
            ResumePoint::At(offset) => {
                info!("Resuming {} from byte {}", key, offset);
                report.resumed_from = Some(offset);
                offset
            }
        };

        let columns = prepare::detect_columns(self.store.as_ref(), database, table).await?;
        let mode = if entry.resume == ResumePoint::NotStarted {
            let natural_key = schema.has_natural_identity() || transformed.synthesized_primary_key;
            let (mode, temporary_key) = prepare::ensure_dedup_key(
                self.store.as_ref(),
                database,
                table,
                &columns,
                natural_key,
            )
            .await?;
            self.log.initialize(&key, temporary_key).await?;
            report.temporary_key = temporary_key;
            mode
        } else {
            prepare::resume_dedup_mode(self.store.as_ref(), database, table, entry.temporary_key)
                .await?
        };

        self.stream_rows(&key, &merged, start, &columns, &mode, &mut report)
            .await?;

        if let Some(index) = &transformed.deferred_index {
            report.index_rebuilt = prepare::rebuild_secondary_index(
                self.store.as_ref(),
                database,
                table,
                index,
                self.settings.index_retry_delay,
            )
            .await?;
        }

        info!(
            "Finished {}: {} lines, {} rows affected",
            key, report.lines, report.rows_affected
        );
        Ok(report)
    }

    async fn stream_rows(
        &self,
        key: &TableKey,
        merged: &Path,
        start: u64,
        columns: &[super::convert::LiveColumn],
        mode: &DedupMode,
        report: &mut TableReport,
    ) -> Result<()> {
        let mut reader = open_at(merged, start).await?;

        let batch_size = effective_batch_size(self.settings.batch_size, columns.len());
        let statement = InsertStatement::new(&key.database, &key.table, columns, mode);
        let full_batch_sql = statement.sql(batch_size);

        let mut seek = start;
        let mut buffer = Vec::new();
        let mut args = Vec::with_capacity(batch_size * columns.len());
        let mut uncommitted = 0usize;
        let mut tx = self.store.begin().await?;

        loop {
            let started = Instant::now();
            buffer.clear();
            let (lines, end_of_input) = read_batch(&mut reader, &mut buffer, batch_size, merged).await?;

            if lines > 0 {
                args.clear();
                let rows = convert_batch(&buffer, columns, &mut args)?;
                if rows > 0 {
                    let affected = if rows == batch_size {
                        tx.exec(&full_batch_sql, &args).await?
                    } else {
                        tx.exec(&statement.sql(rows), &args).await?
                    };
                    report.rows_affected += affected;
                }

                seek += buffer.len() as u64;
                report.lines += lines as u64;
                report.bytes += buffer.len() as u64;
                self.stats.report_bytes_migrated(buffer.len() as u64);
                uncommitted += 1;

                let elapsed = started.elapsed().as_secs_f64();
                debug!(
                    "batchok {} new seek {} rows {} speed(KB/s) {:.2}",
                    key,
                    seek,
                    rows,
                    if elapsed > 0.0 { buffer.len() as f64 / 1024.0 / elapsed } else { 0.0 }
                );
            }

            if end_of_input {
                self.commit_progress(tx, key, ResumePoint::Finished).await?;
                return Ok(());
            }

            if uncommitted >= self.settings.commit_interval {
                self.commit_progress(tx, key, ResumePoint::At(seek)).await?;
                tx = self.store.begin().await?;
                uncommitted = 0;
            }
        }
    }

    /// Commits the open transaction together with (or strictly before) the new resume point.
    async fn commit_progress(&self, mut tx: S::Tx, key: &TableKey, point: ResumePoint) -> Result<()> {
        match self.log.transactional_write(key, point) {
            Some(statement) => {
                tx.exec(&statement.sql, &statement.args).await?;
                tx.commit().await
            }
            None => {
                tx.commit().await?;
                self.log.write_resume_point(key, point).await
            }
        }
    }
}

pub fn effective_batch_size(configured: usize, columns: usize) -> usize {
    let limit = (MAX_PLACEHOLDERS / columns.max(1)).max(1);
    if configured > limit {
        warn!(
            "Batch size {} exceeds the placeholder limit for {} columns, using {}",
            configured, columns, limit
        );
        return limit;
    }
    configured.max(1)
}

/// Opens the merged CSV positioned at `offset`, which must sit on a record boundary.
async fn open_at(path: &Path, offset: u64) -> Result<BufReader<File>> {
    let open_error = |e| MigrateError::io(format!("Failed to open merged CSV {}", path.display()), e);
    let mut file = File::open(path).await.map_err(open_error)?;
    let length = file
        .metadata()
        .await
        .map_err(|e| MigrateError::io(format!("Failed to stat {}", path.display()), e))?
        .len();

    if offset > length {
        return Err(MigrateError::MigrationLog(format!(
            "Resume point {} is past the end of {} ({} bytes)",
            offset,
            path.display(),
            length
        )));
    }
    let seek_error = |e| MigrateError::io(format!("Failed to seek {}", path.display()), e);
    if offset > 0 {
        let mut previous = [0u8; 1];
        file.seek(SeekFrom::Start(offset - 1)).await.map_err(seek_error)?;
        file.read_exact(&mut previous).await.map_err(seek_error)?;
        if previous[0] != b'\n' {
            return Err(MigrateError::MigrationLog(format!(
                "Resume point {} in {} is not at a record boundary",
                offset,
                path.display()
            )));
        }
    }
    Ok(BufReader::new(file))
}

/// Reads up to `batch_size` lines. A final line without a newline still counts.
async fn read_batch(
    reader: &mut BufReader<File>,
    buffer: &mut Vec<u8>,
    batch_size: usize,
    path: &Path,
) -> Result<(usize, bool)> {
    let mut lines = 0usize;
    while lines < batch_size {
        let read = reader
            .read_until(b'\n', buffer)
            .await
            .map_err(|e| MigrateError::io(format!("Failed to read {}", path.display()), e))?;
        if read == 0 {
            return Ok((lines, true));
        }
        lines += 1;
        if buffer.last() != Some(&b'\n') {
            return Ok((lines, true));
        }
    }
    Ok((lines, false))
}
