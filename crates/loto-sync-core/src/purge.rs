//! Selective mass deletion for administrative resets.
//!
//! Row-oriented tables are deleted one row at a time through the replicated
//! write path, pausing between batches so the remote store is not flooded.
//! The lock inventory is reset rather than deleted, append-only tables are
//! cleared in bulk, and the cache is compacted at the end.

use crate::cache::{CacheStatement, LocalCache};
use crate::connection::ConnectionMonitor;
use crate::error::Result;
use crate::locks::{LockUsageReconciler, ReconcileReport};
use crate::model::{row_id, Breaker, Entity, HistoryEntry, LockInventory, Personnel, Plan, Table};
use crate::pending::PendingWriteQueue;
use crate::query::Query;
use crate::store::{ReplicatedStore, StoreContext, WriteEpochs};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tables chosen for a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSelection {
    tables: BTreeMap<Table, bool>,
}

impl PurgeSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, table: Table, selected: bool) -> Self {
        self.tables.insert(table, selected);
        self
    }

    pub fn select(self, table: Table) -> Self {
        self.with(table, true)
    }

    /// Build a selection from table names such as `breakers` or `inventory`.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(Self::new(), |selection, name| -> Result<Self> {
                Ok(selection.select(name.as_ref().parse()?))
            })
    }

    pub fn is_selected(&self, table: Table) -> bool {
        self.tables.get(&table).copied().unwrap_or(false)
    }

    /// Locks are purged by resetting capacity, never by deleting lock rows.
    pub fn resets_capacity(&self) -> bool {
        self.is_selected(Table::Locks) || self.is_selected(Table::LockInventory)
    }

    pub fn is_empty(&self) -> bool {
        !self.tables.values().any(|selected| *selected)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeReport {
    pub online: bool,
    pub tables: BTreeMap<Table, TableCounts>,
    /// Queued offline writes dropped because their table was purged
    pub discarded_pending: usize,
    pub capacity_reset: Option<bool>,
    pub bulk_cleared: BTreeSet<Table>,
    pub locks_reconciled: Option<ReconcileReport>,
    pub compacted: bool,
}

impl PurgeReport {
    pub fn total_failed(&self) -> usize {
        let bulk_failures = self.capacity_reset.map_or(0, |ok| usize::from(!ok));
        self.tables.values().map(|c| c.failed).sum::<usize>() + bulk_failures
    }
}

pub struct BulkPurgeCoordinator {
    monitor: Arc<ConnectionMonitor>,
    cache: Arc<dyn LocalCache>,
    pending: Arc<PendingWriteQueue>,
    epochs: Arc<WriteEpochs>,
    breakers: ReplicatedStore<Breaker>,
    personnel: ReplicatedStore<Personnel>,
    plans: ReplicatedStore<Plan>,
    inventory: ReplicatedStore<LockInventory>,
    history: ReplicatedStore<HistoryEntry>,
    reconciler: LockUsageReconciler,
    batch_size: usize,
    pause: Duration,
}

impl BulkPurgeCoordinator {
    pub fn new(ctx: &StoreContext, reconciler: LockUsageReconciler) -> Self {
        Self {
            monitor: ctx.monitor().clone(),
            cache: ctx.cache().clone(),
            pending: ctx.pending().clone(),
            epochs: ctx.epochs.clone(),
            breakers: ReplicatedStore::new(ctx),
            personnel: ReplicatedStore::new(ctx),
            plans: ReplicatedStore::new(ctx),
            inventory: ReplicatedStore::new(ctx),
            history: ReplicatedStore::new(ctx),
            reconciler,
            batch_size: 10,
            pause: Duration::from_millis(100),
        }
    }

    /// Pause for `pause` after every `batch_size` row deletions.
    pub fn with_throttle(mut self, batch_size: usize, pause: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.pause = pause;
        self
    }

    /// Purge the selected tables.
    ///
    /// Per-row failures are counted, never fatal. The purge also runs while
    /// offline, in which case only the cache is affected. Queued offline
    /// writes of a purged table are dropped first so a later replay cannot
    /// bring purged rows back.
    pub async fn purge(&self, selection: &PurgeSelection) -> PurgeReport {
        let online = self.monitor.probe(true).await;
        if !online {
            warn!("Remote store unreachable; purging local cache only");
        }
        let mut report = PurgeReport {
            online,
            ..Default::default()
        };

        for table in [Table::Breakers, Table::Personnel, Table::Plans, Table::History] {
            if !selection.is_selected(table) {
                continue;
            }
            match self.pending.discard_table(table).await {
                Ok(dropped) => report.discarded_pending += dropped,
                Err(e) => warn!(table = %table, error = %e, "Could not drop queued writes of purged table"),
            }
        }

        if selection.is_selected(Table::Breakers) {
            let counts = self.delete_rows(&self.breakers).await;
            report.tables.insert(Table::Breakers, counts);
        }
        if selection.is_selected(Table::Personnel) {
            let counts = self.delete_rows(&self.personnel).await;
            report.tables.insert(Table::Personnel, counts);
        }
        if selection.is_selected(Table::Plans) {
            let counts = self.delete_rows(&self.plans).await;
            report.tables.insert(Table::Plans, counts);
        }

        if selection.resets_capacity() {
            report.capacity_reset = Some(self.reset_capacity().await);
        }

        if selection.is_selected(Table::History) {
            if self.history.clear().await.overall_success {
                report.bulk_cleared.insert(Table::History);
            } else {
                error!("Failed to clear history");
            }
        }
        if selection.is_selected(Table::PendingOperations) {
            match self.pending.clear().await {
                Ok(()) => {
                    report.bulk_cleared.insert(Table::PendingOperations);
                }
                Err(e) => error!(error = %e, "Failed to clear pending operations"),
            }
        }

        if selection.is_selected(Table::Breakers) {
            match self.reconciler.reconcile_all().await {
                Ok(reconciled) => report.locks_reconciled = Some(reconciled),
                Err(e) => warn!(error = %e, "Lock reconciliation after purge failed"),
            }
        }

        match self.cache.exec(CacheStatement::Compact).await {
            Ok(()) => report.compacted = true,
            Err(e) => warn!(error = %e, "Cache compaction failed"),
        }

        info!(
            online,
            failed = report.total_failed(),
            "Purge finished"
        );
        report
    }

    async fn delete_rows<T: Entity>(&self, store: &ReplicatedStore<T>) -> TableCounts {
        let table = T::TABLE;
        let rows = store.read_all().await.rows;
        let mut counts = TableCounts::default();
        let mut attempted = HashSet::new();

        for (index, record) in rows.into_iter().enumerate() {
            let id = record.id();
            attempted.extend(id);
            let outcome = store.delete(record).await;
            if outcome.overall_success {
                counts.deleted += 1;
            } else {
                warn!(table = %table, id = ?id, error = ?outcome.error, "Purge delete failed");
                counts.failed += 1;
            }

            if (index + 1) % self.batch_size == 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        // Rows only the cache still holds, e.g. deleted remotely by another client
        match self.delete_cached_leftovers(table, &attempted).await {
            Ok(swept) => counts.deleted += swept,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not clear leftover cached rows");
                counts.failed += 1;
            }
        }

        info!(
            table = %table,
            deleted = counts.deleted,
            failed = counts.failed,
            "Purged table"
        );
        counts
    }

    /// Delete cached rows the per-row pass never saw. Rows whose delete was
    /// attempted and failed stay, as the remote store still holds them.
    async fn delete_cached_leftovers(&self, table: Table, attempted: &HashSet<i64>) -> Result<usize> {
        let leftovers = self.cache.query(table, &Query::new()).await?;
        let mut swept = 0;
        for id in leftovers
            .iter()
            .filter_map(row_id)
            .filter(|id| !attempted.contains(id))
        {
            self.cache.delete(table, id).await?;
            self.epochs.touch(table, id);
            swept += 1;
        }
        if swept > 0 {
            debug!(table = %table, swept, "Removed cache-only rows");
        }
        Ok(swept)
    }

    /// Set capacity to zero through the normal update path.
    async fn reset_capacity(&self) -> bool {
        let outcome = match self.inventory.get(LockInventory::SINGLETON_ID).await {
            Some(mut inventory) => {
                inventory.total_capacity = 0;
                self.inventory.update(inventory).await
            }
            None => self.inventory.insert(LockInventory::new(0)).await,
        };
        if !outcome.overall_success {
            error!(error = ?outcome.error, "Failed to reset lock capacity");
        }
        outcome.overall_success
    }
}
