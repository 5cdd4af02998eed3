//! Queue of writes accepted locally while the remote store was unreachable.
//!
//! Entries live in the cache's `pending_operations` table so they survive a
//! restart. Replay pushes them to the remote store in sequence order; the
//! queued row wins over whatever the remote holds (last writer wins).

use crate::cache::{CacheStatement, LocalCache};
use crate::error::{Result, StoreError};
use crate::model::{row_id, Entity, PendingWrite, Row, Table, WriteOp};
use crate::query::Query;
use crate::remote::{bounded, RemoteStore};
use crate::store::WriteEpochs;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    /// Entries still queued after the pass
    pub remaining: usize,
    /// Why the pass stopped early, if it did
    pub error: Option<String>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0 && self.error.is_none()
    }
}

pub struct PendingWriteQueue {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    epochs: Arc<WriteEpochs>,
    request_timeout: Duration,
    append: Mutex<()>,
    replaying: Mutex<()>,
}

impl PendingWriteQueue {
    pub(crate) fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        epochs: Arc<WriteEpochs>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            cache,
            epochs,
            request_timeout,
            append: Mutex::new(()),
            replaying: Mutex::new(()),
        }
    }

    /// Append a write that was applied to the cache only.
    pub async fn enqueue(
        &self,
        table: Table,
        op: WriteOp,
        record_id: Option<i64>,
        row: Row,
    ) -> Result<PendingWrite> {
        let _guard = self.append.lock().await;

        let newest = self
            .cache
            .query(
                Table::PendingOperations,
                &Query::new().order_by("id", false).limit(1),
            )
            .await?;
        let seq = newest.first().and_then(row_id).unwrap_or(0) + 1;

        let entry = PendingWrite {
            id: Some(seq),
            op_id: Uuid::new_v4(),
            table,
            op,
            record_id,
            row,
            queued_at: Utc::now(),
        };
        self.cache
            .upsert(Table::PendingOperations, &entry.to_row()?)
            .await?;
        debug!(table = %table, %op, seq, "Queued offline write");
        Ok(entry)
    }

    /// Queued entries in replay order.
    pub async fn pending(&self) -> Result<Vec<PendingWrite>> {
        let rows = self
            .cache
            .query(Table::PendingOperations, &Query::new().order_by("id", true))
            .await?;
        rows.into_iter().map(PendingWrite::from_row).collect()
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.pending().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Ids of `table` rows whose queued writes have not reached the remote store.
    pub async fn queued_ids(&self, table: Table) -> Result<HashSet<i64>> {
        Ok(self
            .pending()
            .await?
            .into_iter()
            .filter(|entry| entry.table == table)
            .filter_map(|entry| entry.record_id)
            .collect())
    }

    /// Drop the queued entries of one table, returning how many were dropped.
    pub async fn discard_table(&self, table: Table) -> Result<usize> {
        let _guard = self.append.lock().await;
        let mut dropped = 0;
        for entry in self.pending().await?.into_iter().filter(|e| e.table == table) {
            if let Some(seq) = entry.id {
                self.cache.delete(Table::PendingOperations, seq).await?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(table = %table, dropped, "Discarded queued offline writes");
        }
        Ok(dropped)
    }

    /// Drop every queued entry without replaying it.
    pub async fn clear(&self) -> Result<()> {
        self.cache
            .exec(CacheStatement::Truncate(Table::PendingOperations))
            .await
    }

    /// Push queued writes to the remote store, oldest first.
    ///
    /// Stops at the first failure so later writes never overtake earlier ones.
    /// Only one replay runs at a time; a concurrent call waits for it.
    pub async fn replay(&self) -> Result<ReplayReport> {
        let _guard = self.replaying.lock().await;

        let mut queue = self.pending().await?;
        let mut report = ReplayReport::default();
        if queue.is_empty() {
            return Ok(report);
        }
        info!(count = queue.len(), "Replaying offline writes");

        let mut index = 0;
        while index < queue.len() {
            let entry = queue[index].clone();
            let seq = entry.id.ok_or(StoreError::MissingId(Table::PendingOperations))?;

            match self.apply(&entry).await {
                Ok(Some((provisional, assigned))) if provisional != assigned => {
                    self.remap_ids(&mut queue[index + 1..], entry.table, provisional, assigned)
                        .await?;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(table = %entry.table, op = %entry.op, seq, error = %e, "Replay stopped");
                    report.error = Some(e.to_string());
                    break;
                }
            }

            self.cache.delete(Table::PendingOperations, seq).await?;
            report.replayed += 1;
            index += 1;
        }

        report.remaining = queue.len() - report.replayed;
        info!(
            replayed = report.replayed,
            remaining = report.remaining,
            "Replay finished"
        );
        Ok(report)
    }

    /// Apply one entry remotely and mirror the confirmed row locally.
    ///
    /// For inserts, returns the provisional local id and the id the remote
    /// store assigned.
    async fn apply(&self, entry: &PendingWrite) -> Result<Option<(i64, i64)>> {
        let table = entry.table;
        let limit = self.request_timeout;

        match entry.op {
            WriteOp::Insert => {
                let mut row = entry.row.clone();
                let provisional = row.remove("id").and_then(|v| v.as_i64());
                let stored = bounded(limit, self.remote.insert(table, &row)).await?;
                let assigned = row_id(&stored).ok_or(StoreError::MissingId(table))?;

                if let Some(provisional) = provisional.filter(|p| *p != assigned) {
                    self.cache.delete(table, provisional).await?;
                    self.epochs.touch(table, provisional);
                }
                self.mirror(table, &stored).await?;
                Ok(provisional.map(|p| (p, assigned)))
            }
            WriteOp::Update => {
                let id = entry.record_id.ok_or(StoreError::MissingId(table))?;
                let stored = match bounded(limit, self.remote.update(table, id, &entry.row)).await
                {
                    Err(e) if e.is_not_found() => {
                        debug!(table = %table, id, "Row missing remotely, replaying update as insert");
                        bounded(limit, self.remote.insert(table, &entry.row)).await?
                    }
                    other => other?,
                };
                self.mirror(table, &stored).await?;
                Ok(None)
            }
            WriteOp::Delete => {
                let id = entry.record_id.ok_or(StoreError::MissingId(table))?;
                match bounded(limit, self.remote.delete(table, id)).await {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                }
                self.cache.delete(table, id).await?;
                self.epochs.touch(table, id);
                Ok(None)
            }
        }
    }

    async fn mirror(&self, table: Table, row: &Row) -> Result<()> {
        let id = row_id(row).ok_or(StoreError::MissingId(table))?;
        self.cache.upsert(table, row).await?;
        self.epochs.touch(table, id);
        Ok(())
    }

    /// Point later queued writes for a replayed insert at the remote id.
    async fn remap_ids(
        &self,
        rest: &mut [PendingWrite],
        table: Table,
        provisional: i64,
        assigned: i64,
    ) -> Result<()> {
        for entry in rest
            .iter_mut()
            .filter(|e| e.table == table && e.record_id == Some(provisional))
        {
            entry.record_id = Some(assigned);
            if entry.row.contains_key("id") {
                entry.row.insert("id".to_string(), assigned.into());
            }
            self.cache
                .upsert(Table::PendingOperations, &entry.to_row()?)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Personnel;
    use crate::store::ReplicatedStore;
    use crate::test_utils::{cache_rows, settle, test_context};

    #[tokio::test]
    async fn replay_pushes_offline_writes_in_order() {
        let (ctx, remote) = test_context();
        let store: ReplicatedStore<Personnel> = ReplicatedStore::new(&ctx);

        ctx.monitor().set_network_status(false);
        let mut dana = store.insert(Personnel::new("Dana")).await.record.unwrap();
        dana.role = Some("electrician".into());
        store.update(dana).await;
        assert_eq!(ctx.pending().len().await.unwrap(), 2);

        ctx.monitor().set_network_status(true);
        let report = ctx.pending().replay().await.unwrap();

        assert_eq!(report.replayed, 2);
        assert!(report.is_complete());
        let remote_people = remote.records::<Personnel>();
        assert_eq!(remote_people.len(), 1);
        assert_eq!(remote_people[0].role.as_deref(), Some("electrician"));
        assert!(ctx.pending().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn replayed_insert_adopts_remote_id() {
        let (ctx, remote) = test_context();
        remote.seed(Personnel::new("Existing"));
        let store: ReplicatedStore<Personnel> = ReplicatedStore::new(&ctx);

        ctx.monitor().set_network_status(false);
        let offline = store.insert(Personnel::new("Offline")).await.record.unwrap();
        assert_eq!(offline.id, Some(-1));
        store.delete(offline).await;

        ctx.monitor().set_network_status(true);
        ctx.pending().replay().await.unwrap();

        // The insert landed as id 2 and the follow-up delete was remapped to it
        let names: Vec<_> = remote
            .records::<Personnel>()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Existing"]);
        assert!(cache_rows::<Personnel>(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn replay_leaves_other_clients_rows_in_cache() {
        let (ctx, remote) = test_context();
        let store: ReplicatedStore<Personnel> = ReplicatedStore::new(&ctx);
        store.insert(Personnel::new("Mine")).await;
        remote.seed(Personnel::new("OtherClient"));

        ctx.monitor().set_network_status(false);
        store.insert(Personnel::new("Offline")).await;

        ctx.monitor().set_network_status(true);
        store.read_all().await;
        settle().await;
        assert!(ctx.pending().replay().await.unwrap().is_complete());

        let cached: Vec<_> = cache_rows::<Personnel>(&ctx)
            .await
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        let remote_rows: Vec<_> = remote
            .records::<Personnel>()
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        assert_eq!(
            cached,
            vec![
                (Some(1), "Mine".to_string()),
                (Some(2), "OtherClient".to_string()),
                (Some(3), "Offline".to_string()),
            ]
        );
        assert_eq!(cached, remote_rows);
    }

    #[tokio::test]
    async fn discard_table_keeps_other_tables_queued() {
        let (ctx, _remote) = test_context();
        let queue = ctx.pending();
        queue
            .enqueue(Table::Breakers, WriteOp::Insert, Some(-1), Row::new())
            .await
            .unwrap();
        queue
            .enqueue(Table::Plans, WriteOp::Delete, Some(3), Row::new())
            .await
            .unwrap();
        queue
            .enqueue(Table::Breakers, WriteOp::Update, Some(-1), Row::new())
            .await
            .unwrap();

        assert_eq!(queue.discard_table(Table::Breakers).await.unwrap(), 2);
        let left = queue.pending().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].table, Table::Plans);
        assert!(queue.queued_ids(Table::Breakers).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_stops_at_first_failure_and_keeps_order() {
        let (ctx, remote) = test_context();
        let store: ReplicatedStore<Personnel> = ReplicatedStore::new(&ctx);

        ctx.monitor().set_network_status(false);
        store.insert(Personnel::new("A")).await;
        store.insert(Personnel::new("B")).await;

        remote.set_fail_writes(true);
        let report = ctx.pending().replay().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.remaining, 2);
        assert!(report.error.is_some());

        remote.set_fail_writes(false);
        let report = ctx.pending().replay().await.unwrap();
        assert_eq!(report.replayed, 2);
        let names: Vec<_> = remote
            .records::<Personnel>()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn update_of_remotely_deleted_row_is_reinserted() {
        let (ctx, remote) = test_context();
        let store: ReplicatedStore<Personnel> = ReplicatedStore::new(&ctx);
        let lee = store.insert(Personnel::new("Lee")).await.record.unwrap();

        ctx.monitor().set_network_status(false);
        let mut renamed = lee.clone();
        renamed.name = "Lee Ann".into();
        store.update(renamed).await;

        remote.set_fail_writes(false);
        // Someone else removed the row meanwhile
        remote.delete(Table::Personnel, lee.id.unwrap()).await.unwrap();

        ctx.monitor().set_network_status(true);
        ctx.pending().replay().await.unwrap();
        assert_eq!(remote.records::<Personnel>()[0].name, "Lee Ann");
    }

    #[tokio::test]
    async fn clear_discards_queue() {
        let (ctx, _remote) = test_context();
        ctx.pending()
            .enqueue(Table::Plans, WriteOp::Delete, Some(3), Row::new())
            .await
            .unwrap();
        ctx.pending().clear().await.unwrap();
        assert!(ctx.pending().is_empty().await.unwrap());
    }
}
