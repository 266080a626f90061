//! Tabular store interface for Hourline, with in-memory and JSON-file
//! backends. Tables are plain grids of text cells; the reconciliation engine
//! only ever bulk-reads a table and bulk-appends rows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hourline-store";

/// A full table snapshot: rows of text cells, header included.
pub type Grid = Vec<Vec<String>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table `{0}` not found")]
    MissingTable(String),
    #[error("store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// External tabular store, read fully at run start and appended to once at
/// run end. Append and header operations create the table when absent.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn read_table(&self, table: &str) -> Result<Grid, StoreError>;

    async fn append_rows(&self, table: &str, rows: Vec<Vec<String>>) -> Result<(), StoreError>;

    /// Replaces row 1 with the given header, creating the table if needed.
    /// Used to create or repair the destination header before any append.
    async fn replace_first_row(&self, table: &str, header: Vec<String>)
        -> Result<(), StoreError>;
}

/// Store backend holding every table in memory. The default backend in tests
/// and the model for what the engine may assume about the real store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Grid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_table(&self, table: &str, grid: Grid) {
        self.tables.lock().await.insert(table.to_string(), grid);
    }

    pub async fn snapshot(&self, table: &str) -> Option<Grid> {
        self.tables.lock().await.get(table).cloned()
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn read_table(&self, table: &str) -> Result<Grid, StoreError> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    async fn append_rows(&self, table: &str, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.entry(table.to_string()).or_default().extend(rows);
        Ok(())
    }

    async fn replace_first_row(
        &self,
        table: &str,
        header: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let grid = tables.entry(table.to_string()).or_default();
        if grid.is_empty() {
            grid.push(header);
        } else {
            grid[0] = header;
        }
        Ok(())
    }
}

/// Store backend persisting all tables in a single JSON file, written
/// atomically via a temp file and rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, Grid>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn save(&self, tables: &BTreeMap<String, Grid>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(tables).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        file.write_all(&bytes).await.map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;
        file.flush().await.map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), "store file written");
        Ok(())
    }
}

#[async_trait]
impl TableStore for JsonFileStore {
    async fn read_table(&self, table: &str) -> Result<Grid, StoreError> {
        let _guard = self.guard.lock().await;
        let tables = self.load().await?;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    async fn append_rows(&self, table: &str, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let _guard = self.guard.lock().await;
        let mut tables = self.load().await?;
        tables.entry(table.to_string()).or_default().extend(rows);
        self.save(&tables).await
    }

    async fn replace_first_row(
        &self,
        table: &str,
        header: Vec<String>,
    ) -> Result<(), StoreError> {
        let _guard = self.guard.lock().await;
        let mut tables = self.load().await?;
        let grid = tables.entry(table.to_string()).or_default();
        if grid.is_empty() {
            grid.push(header);
        } else {
            grid[0] = header;
        }
        self.save(&tables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn memory_store_round_trips_appends() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.read_table("Pick").await,
            Err(StoreError::MissingTable(_))
        ));

        store
            .append_rows("Pick", vec![row(&["a", "1"]), row(&["b", "2"])])
            .await
            .unwrap();
        let grid = store.read_table("Pick").await.unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[1], row(&["b", "2"]));
    }

    #[tokio::test]
    async fn replace_first_row_creates_then_repairs() {
        let store = MemoryStore::new();
        store
            .replace_first_row("All_Data", row(&["full_name", "task_type"]))
            .await
            .unwrap();
        assert_eq!(store.read_table("All_Data").await.unwrap().len(), 1);

        store
            .replace_first_row("All_Data", row(&["full_name", "task_type", "quantity"]))
            .await
            .unwrap();
        let grid = store.read_table("All_Data").await.unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid[0].len(), 3);
    }

    #[tokio::test]
    async fn json_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        {
            let store = JsonFileStore::new(&path);
            store
                .append_rows("All_Data", vec![row(&["x", "Pick", "22"])])
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::new(&path);
        let grid = reopened.read_table("All_Data").await.unwrap();
        assert_eq!(grid, vec![row(&["x", "Pick", "22"])]);
        assert!(matches!(
            reopened.read_table("Pick").await,
            Err(StoreError::MissingTable(_))
        ));
    }

    #[tokio::test]
    async fn json_store_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("fresh.json"));
        assert!(matches!(
            store.read_table("Pick").await,
            Err(StoreError::MissingTable(_))
        ));
    }
}
