//! Entry point that wires every component over one remote store and one cache.

use crate::cache::{DuckDbCache, LocalCache};
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::Result;
use crate::history::{HistoryDeduplicator, HistorySubmission};
use crate::locks::{LockStats, LockUsageReconciler, ReconcileReport};
use crate::model::{Breaker, HistoryEntry, Lock, LockInventory, Personnel, Plan, Table, WriteOp};
use crate::pending::{PendingWriteQueue, ReplayReport};
use crate::purge::{BulkPurgeCoordinator, PurgeReport, PurgeSelection};
use crate::remote::{RemoteStore, RestRemoteStore};
use crate::query::Query;
use crate::store::{ReadResult, ReplicatedStore, StoreContext, WriteOutcome};
use loto_sync_config::AppConfig;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Replicator {
    ctx: StoreContext,
    breakers: ReplicatedStore<Breaker>,
    locks: ReplicatedStore<Lock>,
    inventory: ReplicatedStore<LockInventory>,
    personnel: ReplicatedStore<Personnel>,
    plans: ReplicatedStore<Plan>,
    reconciler: LockUsageReconciler,
    history: HistoryDeduplicator,
    purger: BulkPurgeCoordinator,
    replay_on_reconnect: bool,
}

impl Replicator {
    /// Build from explicit collaborators.
    pub fn new(
        config: &AppConfig,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
    ) -> Result<Self> {
        let probe_table: Table = config.connection.probe_table.parse()?;
        let request_timeout = config.remote.request_timeout();
        let monitor = Arc::new(ConnectionMonitor::new(
            remote.clone(),
            probe_table,
            config.connection.probe_interval(),
            request_timeout,
        ));
        let ctx = StoreContext::new(remote, cache, monitor, request_timeout);

        let breakers = ReplicatedStore::new(&ctx);
        let locks = ReplicatedStore::new(&ctx);
        let reconciler = LockUsageReconciler::new(breakers.clone(), locks.clone());
        let history =
            HistoryDeduplicator::new(ReplicatedStore::new(&ctx), config.history.dedup_window());
        let purger = BulkPurgeCoordinator::new(&ctx, reconciler.clone())
            .with_throttle(config.purge.batch_size, config.purge.pause());

        Ok(Self {
            breakers,
            locks,
            inventory: ReplicatedStore::new(&ctx),
            personnel: ReplicatedStore::new(&ctx),
            plans: ReplicatedStore::new(&ctx),
            reconciler,
            history,
            purger,
            replay_on_reconnect: config.replication.replay_on_reconnect,
            ctx,
        })
    }

    /// Build the REST remote store and DuckDB cache described by `config`.
    pub fn open(config: &AppConfig) -> Result<Self> {
        let remote = Arc::new(RestRemoteStore::from_config(&config.remote)?);
        let cache = Arc::new(DuckDbCache::from_config(&config.cache)?);
        Self::new(config, remote, cache)
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        self.ctx.monitor()
    }

    pub fn pending(&self) -> &Arc<PendingWriteQueue> {
        self.ctx.pending()
    }

    /// Breakers are read here and written only through [`Self::write_breaker`]
    /// so every change reaches the lock reconciler.
    pub async fn read_breakers(&self, query: Query) -> ReadResult<Breaker> {
        self.breakers.read(query).await
    }

    pub async fn breaker(&self, id: i64) -> Option<Breaker> {
        self.breakers.get(id).await
    }

    pub async fn insert_breaker(&self, breaker: Breaker) -> WriteOutcome<Breaker> {
        self.write_breaker(WriteOp::Insert, breaker).await
    }

    pub async fn update_breaker(&self, breaker: Breaker) -> WriteOutcome<Breaker> {
        self.write_breaker(WriteOp::Update, breaker).await
    }

    pub async fn delete_breaker(&self, breaker: Breaker) -> WriteOutcome<Breaker> {
        self.write_breaker(WriteOp::Delete, breaker).await
    }

    pub fn locks(&self) -> &ReplicatedStore<Lock> {
        &self.locks
    }

    pub fn inventory(&self) -> &ReplicatedStore<LockInventory> {
        &self.inventory
    }

    pub fn personnel(&self) -> &ReplicatedStore<Personnel> {
        &self.personnel
    }

    pub fn plans(&self) -> &ReplicatedStore<Plan> {
        &self.plans
    }

    /// Write a breaker, then bring the locks it released or took in line.
    ///
    /// Reconciliation problems are logged; the returned outcome is the
    /// breaker write's own. When the breaker's state before an update or
    /// delete cannot be read, every lock is reconciled instead, since the
    /// key it released is unknown.
    pub async fn write_breaker(&self, op: WriteOp, breaker: Breaker) -> WriteOutcome<Breaker> {
        let (previous, previous_known) = match (op, breaker.id) {
            (WriteOp::Insert, _) | (_, None) => (None, true),
            (_, Some(id)) => {
                let previous = self.breakers.get(id).await;
                let known = previous.is_some();
                (previous, known)
            }
        };
        let id = breaker.id;

        let outcome = self.breakers.write(op, breaker).await;
        if !outcome.overall_success {
            return outcome;
        }

        let current = match op {
            WriteOp::Delete => None,
            WriteOp::Insert | WriteOp::Update => outcome.record.as_ref(),
        };
        let reconciled = if previous_known {
            self.reconciler
                .on_breaker_written(previous.as_ref(), current)
                .await
        } else {
            warn!(id = ?id, %op, "Previous breaker state unavailable; reconciling all locks");
            self.reconciler.reconcile_all().await
        };
        match reconciled {
            Ok(report) if report.failures > 0 || !report.missing_keys.is_empty() => {
                warn!(?report, "Lock usage only partly reconciled after breaker write")
            }
            Ok(report) => debug!(updated = report.locks_updated, "Lock usage reconciled"),
            Err(e) => warn!(error = %e, "Lock usage reconciliation failed"),
        }
        outcome
    }

    pub async fn log_history(&self, entry: HistoryEntry) -> Result<HistorySubmission> {
        self.history.submit(entry).await
    }

    /// Capacity statistics derived from live breaker state.
    pub async fn lock_stats(&self) -> LockStats {
        let inventory = self.inventory.get(LockInventory::SINGLETON_ID).await;
        let breakers = self.breakers.read_all().await;
        LockStats::compute(inventory.as_ref(), &breakers.rows)
    }

    pub async fn reconcile_locks(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile_all().await
    }

    pub async fn purge(&self, selection: &PurgeSelection) -> PurgeReport {
        self.purger.purge(selection).await
    }

    /// Push queued offline writes if the remote store answers a live probe.
    pub async fn replay_pending(&self) -> Result<ReplayReport> {
        if !self.monitor().probe(true).await {
            let remaining = self.pending().len().await?;
            return Ok(ReplayReport {
                replayed: 0,
                remaining,
                error: Some("remote store unreachable".to_string()),
            });
        }
        self.pending().replay().await
    }

    /// Replay the queue on every offline to online transition.
    ///
    /// Returns `None` when reconnect replay is disabled. The task ends when
    /// this replicator's monitor is dropped.
    pub fn spawn_reconnect_replay(&self) -> Option<JoinHandle<()>> {
        if !self.replay_on_reconnect {
            return None;
        }
        let mut events = self.monitor().subscribe();
        let pending = self.pending().clone();

        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionState::Online) => match pending.replay().await {
                        Ok(report) => info!(
                            replayed = report.replayed,
                            remaining = report.remaining,
                            "Reconnect replay finished"
                        ),
                        Err(e) => warn!(error = %e, "Reconnect replay failed"),
                    },
                    Ok(ConnectionState::Offline) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connection events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BreakerState;
    use crate::test_utils::{test_config, MemoryRemoteStore};
    use std::time::Duration;

    fn replicator() -> (Replicator, Arc<MemoryRemoteStore>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(DuckDbCache::in_memory().unwrap());
        let replicator = Replicator::new(&test_config(), remote.clone(), cache).unwrap();
        (replicator, remote)
    }

    #[tokio::test]
    async fn closing_a_breaker_marks_its_lock() {
        let (replicator, remote) = replicator();
        remote.seed(Lock::new("K7"));

        let outcome = replicator
            .write_breaker(
                WriteOp::Insert,
                Breaker::new("TD-7", BreakerState::Closed).with_lock_key("K7"),
            )
            .await;
        assert!(outcome.overall_success);

        let lock = &remote.records::<Lock>()[0];
        assert!(lock.used);
        assert_eq!(lock.assigned_to.as_deref(), Some("TD-7"));
    }

    #[tokio::test]
    async fn moving_a_key_releases_the_old_lock() {
        let (replicator, remote) = replicator();
        remote.seed(Lock::new("K1"));
        remote.seed(Lock::new("K2"));
        let breaker = replicator
            .write_breaker(
                WriteOp::Insert,
                Breaker::new("TD-1", BreakerState::Closed).with_lock_key("K1"),
            )
            .await
            .record
            .unwrap();

        let mut moved = breaker;
        moved.lock_key = Some("K2".into());
        replicator.write_breaker(WriteOp::Update, moved).await;

        let locks = remote.records::<Lock>();
        assert!(!locks[0].used && locks[0].assigned_to.is_none());
        assert!(locks[1].used);
    }

    #[tokio::test]
    async fn deleting_a_breaker_releases_its_lock() {
        let (replicator, remote) = replicator();
        remote.seed(Lock::new("K1"));
        let breaker = replicator
            .write_breaker(
                WriteOp::Insert,
                Breaker::new("TD-1", BreakerState::Closed).with_lock_key("K1"),
            )
            .await
            .record
            .unwrap();

        replicator.write_breaker(WriteOp::Delete, breaker).await;
        assert!(!remote.records::<Lock>()[0].used);
    }

    #[tokio::test]
    async fn unreadable_previous_state_still_releases_the_old_key() {
        let (replicator, remote) = replicator();
        let mut held = Lock::new("K1");
        held.used = true;
        held.assigned_to = Some("TD-1".into());
        remote.seed(held);
        let closed = remote.seed(Breaker::new("TD-1", BreakerState::Closed).with_lock_key("K1"));

        // The lookup of the old row fails and the cache has never seen it
        remote.fail_next_reads(1);
        let mut opened = closed;
        opened.state = BreakerState::On;
        let outcome = replicator.update_breaker(opened).await;
        assert!(outcome.overall_success);

        let lock = &remote.records::<Lock>()[0];
        assert!(!lock.used);
        assert_eq!(lock.assigned_to, None);
    }

    #[tokio::test]
    async fn breaker_helpers_keep_locks_in_step() {
        let (replicator, remote) = replicator();
        remote.seed(Lock::new("K3"));

        let breaker = replicator
            .insert_breaker(Breaker::new("TD-3", BreakerState::Closed).with_lock_key("K3"))
            .await
            .record
            .unwrap();
        assert!(remote.records::<Lock>()[0].used);
        assert_eq!(replicator.breaker(breaker.id.unwrap()).await, Some(breaker.clone()));

        replicator.delete_breaker(breaker).await;
        assert!(!remote.records::<Lock>()[0].used);
        assert!(replicator.read_breakers(Query::new()).await.rows.is_empty());
    }

    #[tokio::test]
    async fn stats_come_from_breakers_not_lock_flags() {
        let (replicator, remote) = replicator();
        remote.seed(LockInventory::new(10));
        // Stale flag with no breaker holding the key
        let mut stale = Lock::new("K9");
        stale.used = true;
        remote.seed(stale);
        remote.seed(Breaker::new("TD-1", BreakerState::Closed).with_lock_key("K1"));

        let stats = replicator.lock_stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.available, 9);
    }

    #[tokio::test]
    async fn replay_is_skipped_while_unreachable() {
        let (replicator, remote) = replicator();
        replicator.monitor().set_network_status(false);
        replicator.personnel().insert(Personnel::new("Sam")).await;

        remote.set_failing(true);
        let report = replicator.replay_pending().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn reconnect_triggers_replay() {
        let (replicator, remote) = replicator();
        let task = replicator.spawn_reconnect_replay().unwrap();

        replicator.monitor().set_network_status(false);
        replicator.personnel().insert(Personnel::new("Sam")).await;
        replicator.monitor().set_network_status(true);

        for _ in 0..50 {
            if !remote.rows(Table::Personnel).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.records::<Personnel>()[0].name, "Sam");
        task.abort();
    }

    #[test]
    fn unknown_probe_table_is_rejected() {
        let mut config = test_config();
        config.connection.probe_table = "fuses".into();
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(DuckDbCache::in_memory().unwrap());
        assert!(Replicator::new(&config, remote, cache).is_err());
    }
}
