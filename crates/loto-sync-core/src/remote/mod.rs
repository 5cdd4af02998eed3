//! Authoritative remote store interface.

pub mod rest;

use crate::error::{Result, StoreError};
use crate::model::{Row, Table};
use crate::query::Query;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub use rest::RestRemoteStore;

/// Networked tabular store that holds the source of truth.
///
/// Errors are opaque to the replication layer; any `Err` counts as "remote failed".
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>>;

    /// Insert a row and return it as stored (with the assigned id).
    async fn insert(&self, table: Table, row: &Row) -> Result<Row>;

    /// Update the row with `id` and return it as stored.
    async fn update(&self, table: Table, id: i64, row: &Row) -> Result<Row>;

    async fn delete(&self, table: Table, id: i64) -> Result<()>;

    /// Remove every row of `table` in one request.
    async fn delete_all(&self, table: Table) -> Result<()>;
}

/// Run a remote call with an upper bound on its duration.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
