//! Cloud-first replicated store.
//!
//! Reads prefer the remote store and fall back to the local cache. Writes go
//! to the remote store first while it is reachable; a remote failure aborts
//! the write before the cache is touched, so the cache never holds a change
//! the authoritative store refused. Successful remote writes are mirrored
//! locally, and writes made while offline land in the cache and the pending
//! queue.

use crate::cache::{CacheStatement, LocalCache};
use crate::connection::ConnectionMonitor;
use crate::error::{Result, StoreError};
use crate::model::{row_id, Entity, Row, Table, WriteOp};
use crate::pending::PendingWriteQueue;
use crate::query::Query;
use crate::remote::{bounded, RemoteStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Remote,
    Cache,
    /// Neither store answered; rows are empty
    None,
}

#[derive(Debug, Clone)]
pub struct ReadResult<T> {
    pub rows: Vec<T>,
    pub source: Source,
}

impl<T> ReadResult<T> {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            source: Source::None,
        }
    }
}

/// Composite result of a dual write.
#[derive(Debug)]
pub struct WriteOutcome<T> {
    pub overall_success: bool,
    pub remote_succeeded: bool,
    pub local_succeeded: bool,
    /// The write was applied to the cache only because the remote store was unreachable
    pub was_offline_fallback: bool,
    /// The record as confirmed by the store that accepted it
    pub record: Option<T>,
    pub error: Option<StoreError>,
}

impl<T> WriteOutcome<T> {
    fn failed(error: StoreError) -> Self {
        Self {
            overall_success: false,
            remote_succeeded: false,
            local_succeeded: false,
            was_offline_fallback: false,
            record: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Option<T>> {
        match self.error {
            Some(error) if !self.overall_success => Err(error),
            _ => Ok(self.record),
        }
    }
}

/// Per-row write counters used to keep background cache refreshes from
/// overwriting rows written after the refreshing read began.
#[derive(Debug, Default)]
pub(crate) struct WriteEpochs {
    counter: AtomicU64,
    rows: Mutex<HashMap<(Table, i64), u64>>,
    tables: Mutex<HashMap<Table, u64>>,
}

impl WriteEpochs {
    pub(crate) fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self, table: Table, id: i64) {
        let epoch = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((table, id), epoch);
    }

    pub(crate) fn touch_table(&self, table: Table) {
        let epoch = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, epoch);
    }

    fn written_since(&self, table: Table, id: i64, epoch: u64) -> bool {
        let table_cleared = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table)
            .is_some_and(|e| *e > epoch);
        table_cleared
            || self
                .rows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&(table, id))
                .is_some_and(|e| *e > epoch)
    }
}

/// Collaborators shared by every replicated table.
#[derive(Clone)]
pub struct StoreContext {
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) cache: Arc<dyn LocalCache>,
    pub(crate) monitor: Arc<ConnectionMonitor>,
    pub(crate) pending: Arc<PendingWriteQueue>,
    pub(crate) request_timeout: Duration,
    pub(crate) epochs: Arc<WriteEpochs>,
}

impl StoreContext {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        monitor: Arc<ConnectionMonitor>,
        request_timeout: Duration,
    ) -> Self {
        let epochs = Arc::new(WriteEpochs::default());
        let pending = Arc::new(PendingWriteQueue::new(
            remote.clone(),
            cache.clone(),
            epochs.clone(),
            request_timeout,
        ));
        Self {
            remote,
            cache,
            monitor,
            pending,
            request_timeout,
            epochs,
        }
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn pending(&self) -> &Arc<PendingWriteQueue> {
        &self.pending
    }

    pub fn cache(&self) -> &Arc<dyn LocalCache> {
        &self.cache
    }
}

/// Read-through cache and dual-write replicator for one entity table.
pub struct ReplicatedStore<T: Entity> {
    ctx: StoreContext,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for ReplicatedStore<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> ReplicatedStore<T> {
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            ctx: ctx.clone(),
            _entity: PhantomData,
        }
    }

    pub fn table(&self) -> Table {
        T::TABLE
    }

    /// Read rows, remote first.
    ///
    /// Never fails: remote errors fall back to the cache and cache errors
    /// yield an empty result tagged [`Source::None`].
    pub async fn read(&self, query: Query) -> ReadResult<T> {
        let table = T::TABLE;

        if self.ctx.monitor.is_reachable() && !table.is_local_only() {
            let epoch = self.ctx.epochs.current();
            match bounded(
                self.ctx.request_timeout,
                self.ctx.remote.query(table, &query),
            )
            .await
            {
                Ok(rows) => {
                    self.refresh_cache(rows.clone(), epoch);
                    return ReadResult {
                        rows: decode_rows(rows),
                        source: Source::Remote,
                    };
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "Remote read failed, falling back to local cache");
                }
            }
        }

        match self.ctx.cache.query(table, &query).await {
            Ok(rows) => ReadResult {
                rows: decode_rows(rows),
                source: Source::Cache,
            },
            Err(e) => {
                warn!(table = %table, error = %e, "Local cache read failed");
                ReadResult::empty()
            }
        }
    }

    pub async fn read_all(&self) -> ReadResult<T> {
        self.read(Query::new()).await
    }

    pub async fn get(&self, id: i64) -> Option<T> {
        self.read(Query::by_id(id)).await.rows.into_iter().next()
    }

    pub async fn insert(&self, record: T) -> WriteOutcome<T> {
        self.write(WriteOp::Insert, record).await
    }

    pub async fn update(&self, record: T) -> WriteOutcome<T> {
        self.write(WriteOp::Update, record).await
    }

    pub async fn delete(&self, record: T) -> WriteOutcome<T> {
        self.write(WriteOp::Delete, record).await
    }

    /// Dual write.
    ///
    /// While reachable the remote write runs first and its failure fails the
    /// whole operation with the cache untouched. The cache write follows a
    /// remote success or happens alone while offline. A cache failure after a
    /// remote success is logged but does not fail the write.
    pub async fn write(&self, op: WriteOp, record: T) -> WriteOutcome<T> {
        let table = T::TABLE;
        let mut record = record;
        record.prepare_for_write(op, Utc::now());

        if op != WriteOp::Insert && record.id().is_none() {
            return WriteOutcome::failed(StoreError::MissingId(table));
        }

        let online = self.ctx.monitor.is_reachable() && !table.is_local_only();
        let mut confirmed = record;
        let mut remote_succeeded = false;

        if online {
            match self.write_remote(op, &confirmed).await {
                Ok(Some(stored)) => {
                    let remote_id = row_id(&stored);
                    match T::from_row(stored) {
                        Ok(stored) => confirmed = stored,
                        Err(e) => {
                            warn!(table = %table, error = %e, id = ?remote_id, "Remote returned an undecodable row; mirroring the submitted record");
                            if let Some(id) = remote_id {
                                confirmed.set_id(id);
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(table = %table, %op, error = %e, "Remote write failed; local cache left unchanged");
                    return WriteOutcome::failed(e);
                }
            }
            remote_succeeded = true;

            if confirmed.id().is_none() {
                // Never give a remotely stored row a provisional id
                warn!(table = %table, %op, "Remote write returned no id; local mirror skipped");
                return WriteOutcome {
                    overall_success: true,
                    remote_succeeded,
                    local_succeeded: false,
                    was_offline_fallback: false,
                    record: Some(confirmed),
                    error: Some(StoreError::MissingId(table)),
                };
            }
        }

        let local = self.write_local(op, &mut confirmed).await;
        let local_succeeded = local.is_ok();

        if !online {
            if let Err(e) = &local {
                error!(table = %table, %op, error = %e, "Offline write failed in local cache");
            } else if !table.is_local_only() {
                if let Err(e) = self.enqueue_pending(op, &confirmed).await {
                    warn!(table = %table, %op, error = %e, "Could not queue offline write for replay");
                }
            }
        } else if let Err(e) = &local {
            warn!(table = %table, %op, error = %e, "Remote write succeeded but local mirror failed");
        }

        let error = if online { None } else { local.err() };

        WriteOutcome {
            overall_success: remote_succeeded || local_succeeded,
            remote_succeeded,
            local_succeeded,
            was_offline_fallback: !online,
            record: Some(confirmed),
            error,
        }
    }

    /// Delete every row of the table on both sides under the same remote-first rule.
    pub async fn clear(&self) -> WriteOutcome<()> {
        let table = T::TABLE;
        let online = self.ctx.monitor.is_reachable() && !table.is_local_only();

        if online {
            if let Err(e) = bounded(
                self.ctx.request_timeout,
                self.ctx.remote.delete_all(table),
            )
            .await
            {
                error!(table = %table, error = %e, "Remote bulk delete failed; local cache left unchanged");
                return WriteOutcome::failed(e);
            }
        } else if !table.is_local_only() {
            warn!(table = %table, "Bulk delete while offline is applied locally only and is not queued");
        }

        let local = self
            .ctx
            .cache
            .exec(CacheStatement::Truncate(table))
            .await;
        self.ctx.epochs.touch_table(table);
        let local_succeeded = local.is_ok();
        if let Err(e) = &local {
            warn!(table = %table, error = %e, "Local bulk delete failed");
        }

        WriteOutcome {
            overall_success: online || local_succeeded,
            remote_succeeded: online,
            local_succeeded,
            was_offline_fallback: !online,
            record: None,
            error: if online { None } else { local.err() },
        }
    }

    async fn write_remote(&self, op: WriteOp, record: &T) -> Result<Option<Row>> {
        let table = T::TABLE;
        let row = record.to_row()?;
        let remote = &self.ctx.remote;
        let limit = self.ctx.request_timeout;

        match (op, record.id()) {
            (WriteOp::Insert, _) => bounded(limit, remote.insert(table, &row)).await.map(Some),
            (WriteOp::Update, Some(id)) => bounded(limit, remote.update(table, id, &row))
                .await
                .map(Some),
            (WriteOp::Delete, Some(id)) => bounded(limit, remote.delete(table, id))
                .await
                .map(|_| None),
            (_, None) => Err(StoreError::MissingId(table)),
        }
    }

    async fn write_local(&self, op: WriteOp, record: &mut T) -> Result<()> {
        let table = T::TABLE;

        if op == WriteOp::Insert && record.id().is_none() {
            let id = self.next_local_id().await?;
            debug!(table = %table, id, "Assigned provisional local id");
            record.set_id(id);
        }

        let id = record.id().ok_or(StoreError::MissingId(table))?;
        let result = match op {
            WriteOp::Delete => self.ctx.cache.delete(table, id).await,
            WriteOp::Insert | WriteOp::Update => {
                let row = record.to_row()?;
                self.ctx.cache.upsert(table, &row).await
            }
        };
        self.ctx.epochs.touch(table, id);
        result
    }

    /// Provisional ids count down from -1 so they never meet a server-assigned id.
    async fn next_local_id(&self) -> Result<i64> {
        let lowest = self
            .ctx
            .cache
            .query(T::TABLE, &Query::new().order_by("id", true).limit(1))
            .await?;
        Ok(lowest.first().and_then(row_id).unwrap_or(0).min(0) - 1)
    }

    async fn enqueue_pending(&self, op: WriteOp, record: &T) -> Result<()> {
        let row = record.to_row()?;
        self.ctx
            .pending
            .enqueue(T::TABLE, op, record.id(), row)
            .await
            .map(|_| ())
    }

    /// Best-effort overwrite of cached rows with what the remote returned.
    /// The read result does not wait for it.
    ///
    /// Rows with a queued offline write keep their local version until replay.
    fn refresh_cache(&self, rows: Vec<Row>, epoch: u64) {
        let table = T::TABLE;
        let cache = self.ctx.cache.clone();
        let epochs = self.ctx.epochs.clone();
        let pending = self.ctx.pending.clone();

        tokio::spawn(async move {
            let queued = match pending.queued_ids(table).await {
                Ok(ids) => ids,
                Err(e) => {
                    debug!(table = %table, error = %e, "Cache refresh skipped, pending queue unreadable");
                    return;
                }
            };
            for row in rows {
                let Some(id) = row_id(&row) else { continue };
                if queued.contains(&id) || epochs.written_since(table, id, epoch) {
                    continue;
                }
                if let Err(e) = cache.upsert(table, &row).await {
                    debug!(table = %table, id, error = %e, "Cache refresh failed");
                }
            }
        });
    }
}

fn decode_rows<T: Entity>(rows: Vec<Row>) -> Vec<T> {
    let table = T::TABLE;
    rows.into_iter()
        .filter_map(|row| match T::from_row(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(table = %table, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}
