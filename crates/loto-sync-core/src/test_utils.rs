//! Helpers for exercising the replication layer without a network.

use crate::cache::{DuckDbCache, LocalCache};
use crate::connection::ConnectionMonitor;
use crate::error::{Result, StoreError};
use crate::model::{row_id, Entity, Row, Table};
use crate::query::Query;
use crate::remote::RemoteStore;
use crate::store::StoreContext;
use async_trait::async_trait;
use loto_sync_config::AppConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type Tables = HashMap<Table, BTreeMap<i64, Row>>;

/// In-memory stand-in for the hosted store with fault injection and call counters.
///
/// Behaves like the REST backend where it matters to the replication layer:
/// inserts without an id get `max(id) + 1`, inserting an existing id is a 409,
/// updating a missing row is a 404, and deleting a missing row succeeds.
#[derive(Default)]
pub struct MemoryRemoteStore {
    tables: Mutex<Tables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_reads_left: AtomicUsize,
    bare_insert_replies: AtomicBool,
    query_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next `count` reads.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads_left.store(count, Ordering::SeqCst);
    }

    /// Answer inserts with `{"id": n}` alone instead of the stored row.
    pub fn set_bare_insert_replies(&self, bare: bool) {
        self.bare_insert_replies.store(bare, Ordering::SeqCst);
    }

    /// Fail every call, as an unreachable server would.
    pub fn set_failing(&self, fail: bool) {
        self.set_fail_reads(fail);
        self.set_fail_writes(fail);
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Current rows of a table in id order.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.tables()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current rows decoded as entities; undecodable rows panic.
    pub fn records<T: Entity>(&self) -> Vec<T> {
        self.rows(T::TABLE)
            .into_iter()
            .map(|row| T::from_row(row).expect("remote row decodes"))
            .collect()
    }

    /// Place a record directly into the store, bypassing counters and faults.
    pub fn seed<T: Entity>(&self, mut record: T) -> T {
        let mut tables = self.tables();
        let rows = tables.entry(T::TABLE).or_default();
        let id = record.id().unwrap_or_else(|| next_id(rows));
        record.set_id(id);
        let row = record.to_row().expect("seed record encodes");
        rows.insert(id, row);
        record
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_write(&self) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("connection refused".to_string()));
        }
        Ok(())
    }
}

fn next_id(rows: &BTreeMap<i64, Row>) -> i64 {
    rows.keys().next_back().copied().unwrap_or(0) + 1
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let one_off = self
            .failing_reads_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if one_off || self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Remote("connection refused".to_string()));
        }
        Ok(query.apply(self.rows(table)))
    }

    async fn insert(&self, table: Table, row: &Row) -> Result<Row> {
        self.begin_write()?;
        let mut tables = self.tables();
        let rows = tables.entry(table).or_default();
        let id = match row_id(row) {
            Some(id) if rows.contains_key(&id) => {
                return Err(StoreError::RemoteRejected {
                    status: 409,
                    message: format!("duplicate key id={}", id),
                })
            }
            Some(id) => id,
            None => next_id(rows),
        };
        let mut stored = row.clone();
        stored.insert("id".to_string(), id.into());
        rows.insert(id, stored.clone());
        if self.bare_insert_replies.load(Ordering::SeqCst) {
            return Ok(Row::from_iter([("id".to_string(), serde_json::Value::from(id))]));
        }
        Ok(stored)
    }

    async fn update(&self, table: Table, id: i64, row: &Row) -> Result<Row> {
        self.begin_write()?;
        let mut tables = self.tables();
        let existing = tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| StoreError::RemoteRejected {
                status: 404,
                message: format!("no {} row with id {}", table, id),
            })?;
        for (column, value) in row {
            existing.insert(column.clone(), value.clone());
        }
        existing.insert("id".to_string(), id.into());
        Ok(existing.clone())
    }

    async fn delete(&self, table: Table, id: i64) -> Result<()> {
        self.begin_write()?;
        if let Some(rows) = self.tables().get_mut(&table) {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn delete_all(&self, table: Table) -> Result<()> {
        self.begin_write()?;
        self.tables().remove(&table);
        Ok(())
    }
}

/// Configuration for tests: in-memory cache and no purge pauses.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.cache.in_memory = true;
    config.purge.pause_ms = 0;
    config
}

/// A store context over a fresh [`MemoryRemoteStore`] and in-memory cache.
pub fn test_context() -> (StoreContext, Arc<MemoryRemoteStore>) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let cache: Arc<dyn LocalCache> =
        Arc::new(DuckDbCache::in_memory().expect("in-memory cache opens"));
    let monitor = Arc::new(ConnectionMonitor::new(
        remote.clone(),
        Table::Breakers,
        Duration::from_secs(30),
        Duration::from_secs(5),
    ));
    let ctx = StoreContext::new(remote.clone(), cache, monitor, Duration::from_secs(5));
    (ctx, remote)
}

/// Rows of `T`'s table as held by the local cache, in id order.
pub async fn cache_rows<T: Entity>(ctx: &StoreContext) -> Vec<T> {
    ctx.cache()
        .query(T::TABLE, &Query::new().order_by("id", true))
        .await
        .expect("cache query succeeds")
        .into_iter()
        .map(|row| T::from_row(row).expect("cache row decodes"))
        .collect()
}

/// Let spawned background work (cache refreshes) run to completion.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
