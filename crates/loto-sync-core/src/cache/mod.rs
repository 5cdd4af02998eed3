//! Local durable cache interface.

pub mod duckdb_cache;

use crate::error::Result;
use crate::model::{Row, Table};
use crate::query::Query;
use async_trait::async_trait;

pub use duckdb_cache::DuckDbCache;

/// Statements that bypass the row interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatement {
    /// Remove every row of one table
    Truncate(Table),
    /// Reclaim space after bulk deletes
    Compact,
}

/// Store available with no network; written only by the replicated store.
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>>;

    /// Insert or replace the row keyed by its `id` column.
    async fn upsert(&self, table: Table, row: &Row) -> Result<()>;

    async fn delete(&self, table: Table, id: i64) -> Result<()>;

    async fn exec(&self, statement: CacheStatement) -> Result<()>;
}
