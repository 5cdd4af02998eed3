//! DuckDB-backed cache.
//!
//! Each table is stored as `(id BIGINT PRIMARY KEY, data TEXT)` where `data`
//! is the JSON encoding of the flat row. Queries load the table and evaluate
//! the [`Query`] in process so ordering matches the remote store.

use super::{CacheStatement, LocalCache};
use crate::error::{Result, StoreError};
use crate::model::{row_id, Row, Table};
use crate::query::Query;
use async_trait::async_trait;
use duckdb::{params, Connection};
use loto_sync_config::CacheConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub struct DuckDbCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl DuckDbCache {
    /// Open (or create) a cache database on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Cache(format!(
                        "cannot create cache directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        info!("Opened local cache at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        if config.in_memory {
            Self::in_memory()
        } else {
            Self::open(config.resolved_path()?)
        }
    }

    /// Location on disk, `None` for an in-memory cache.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Cache("cache connection mutex poisoned".to_string()))
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    for table in Table::ALL {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY, data TEXT NOT NULL);",
            table
        ))?;
    }
    Ok(())
}

#[async_trait]
impl LocalCache for DuckDbCache {
    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT data FROM {} ORDER BY id", table))?;
        let encoded = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut rows = Vec::new();
        for data in encoded {
            let data = data?;
            match serde_json::from_str::<Value>(&data)
                .map_err(|source| StoreError::Codec { table, source })?
            {
                Value::Object(row) => rows.push(row),
                _ => return Err(StoreError::NotARow(table)),
            }
        }

        Ok(query.apply(rows))
    }

    async fn upsert(&self, table: Table, row: &Row) -> Result<()> {
        let id = row_id(row).ok_or(StoreError::MissingId(table))?;
        let data = serde_json::to_string(row).map_err(|source| StoreError::Codec { table, source })?;

        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO {} (id, data) VALUES (?, ?)", table),
            params![id, data],
        )?;
        Ok(())
    }

    async fn delete(&self, table: Table, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(&format!("DELETE FROM {} WHERE id = ?", table), params![id])?;
        Ok(())
    }

    async fn exec(&self, statement: CacheStatement) -> Result<()> {
        let conn = self.conn()?;
        match statement {
            CacheStatement::Truncate(table) => {
                let removed = conn.execute(&format!("DELETE FROM {}", table), [])?;
                debug!(table = %table, removed, "Truncated cache table");
            }
            CacheStatement::Compact => {
                conn.execute_batch("CHECKPOINT;")?;
                debug!("Compacted local cache");
            }
        }
        Ok(())
    }
}
