use crate::error::{MigrateError, Result};
use crate::schema::TableSchema;
use std::path::{Path, PathBuf};

/// One origin data set: `<root>/<database>/<table>.sql` + `<table>.csv`.
#[derive(Debug, Clone)]
pub struct Source {
    pub path: PathBuf,
    pub name: String,
    pub databases: Vec<SrcDatabase>,
}

#[derive(Debug, Clone)]
pub struct SrcDatabase {
    path: PathBuf,
    pub src_name: String,
    pub name: String,
    pub tables: Vec<String>,
}

/// The same database as seen by both sources; `a` owns the migration log entries.
#[derive(Debug, Clone)]
pub struct DatabasePair {
    pub a: SrcDatabase,
    pub b: SrcDatabase,
}

impl DatabasePair {
    pub fn name(&self) -> &str {
        &self.a.name
    }
}

impl Source {
    pub async fn open(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut database_names = list_entries(&path, true).await?;
        database_names.sort();

        let mut databases = Vec::with_capacity(database_names.len());
        for database_name in database_names {
            let database_path = path.join(&database_name);
            let mut tables = list_entries(&database_path, false)
                .await?
                .into_iter()
                .filter_map(|file_name| file_name.strip_suffix(".sql").map(str::to_string))
                .filter(|table| !table.is_empty())
                .collect::<Vec<_>>();
            tables.sort();

            databases.push(SrcDatabase {
                path: database_path,
                src_name: name.to_string(),
                name: database_name,
                tables,
            });
        }

        Ok(Source {
            path,
            name: name.to_string(),
            databases,
        })
    }

    pub fn database(&self, name: &str) -> Option<&SrcDatabase> {
        self.databases.iter().find(|database| database.name == name)
    }
}

impl SrcDatabase {
    pub fn schema_path(&self, table: &str) -> PathBuf {
        self.path.join(format!("{}.sql", table))
    }

    pub fn csv_path(&self, table: &str) -> PathBuf {
        self.path.join(format!("{}.csv", table))
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.iter().any(|candidate| candidate == table)
    }

    pub async fn read_schema(&self, table: &str) -> Result<TableSchema> {
        let path = self.schema_path(table);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            MigrateError::io(format!("Failed to read schema file {}", path.display()), e)
        })?;
        Ok(TableSchema::parse(table, &raw))
    }

    /// Moves tables with a deferrable secondary index to the front, keeping
    /// relative order otherwise, so their index rebuild starts as early as possible.
    pub async fn prioritize_secondary_index_tables(&mut self) -> Result<()> {
        let mut indexed = Vec::new();
        let mut plain = Vec::new();
        for table in std::mem::take(&mut self.tables) {
            let schema = self.read_schema(&table).await?;
            if schema.secondary_index.is_some() {
                indexed.push(table);
            } else {
                plain.push(table);
            }
        }
        indexed.extend(plain);
        self.tables = indexed;
        Ok(())
    }
}

/// Pairs every database of `a` with its namesake in `b`. Both sides must carry
/// the same tables, because each table's merged stream needs both inputs.
pub fn pair_sources(a: &Source, b: &Source) -> Result<Vec<DatabasePair>> {
    let mut pairs = Vec::with_capacity(a.databases.len());
    for database_a in &a.databases {
        let database_b = b.database(&database_a.name).ok_or_else(|| {
            MigrateError::Config(format!(
                "Database {} exists in {} but not in {}",
                database_a.name, a.name, b.name
            ))
        })?;
        if let Some(missing) = database_a
            .tables
            .iter()
            .find(|table| !database_b.has_table(table))
        {
            return Err(MigrateError::Config(format!(
                "Table {}.{} exists in {} but not in {}",
                database_a.name, missing, a.name, b.name
            )));
        }
        pairs.push(DatabasePair {
            a: database_a.clone(),
            b: database_b.clone(),
        });
    }
    Ok(pairs)
}

async fn list_entries(path: &Path, directories: bool) -> Result<Vec<String>> {
    let mut reader = tokio::fs::read_dir(path).await.map_err(|e| {
        MigrateError::io(format!("Failed to read directory {}", path.display()), e)
    })?;

    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(|e| {
        MigrateError::io(format!("Failed to list directory {}", path.display()), e)
    })? {
        let file_type = entry.file_type().await.map_err(|e| {
            MigrateError::io(format!("Failed to stat {}", entry.path().display()), e)
        })?;
        if file_type.is_dir() == directories {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}
