//! Lock usage derived from breaker state.
//!
//! A lock is in use when a breaker is Closed with that lock's key. Both the
//! reconciler and the statistics path go through [`derive_lock_usage`], so the
//! `used`/`assigned_to` columns on lock rows can never disagree with the counts.

use crate::error::{Result, StoreError};
use crate::model::{Breaker, Lock, LockInventory, Table};
use crate::store::{ReplicatedStore, Source};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A breaker that references a key already held by an earlier breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyConflict {
    pub key: String,
    /// Breaker that holds the key
    pub holder: String,
    /// Breaker that also claims it
    pub breaker: String,
}

/// Which keys are held, and by whom.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockUsage {
    holders: BTreeMap<String, String>,
    conflicts: Vec<KeyConflict>,
}

impl LockUsage {
    /// Name of the breaker holding `key`, if any.
    pub fn holder(&self, key: &str) -> Option<&str> {
        self.holders.get(key.trim()).map(String::as_str)
    }

    pub fn is_used(&self, key: &str) -> bool {
        self.holder(key).is_some()
    }

    pub fn in_use(&self) -> usize {
        self.holders.len()
    }

    pub fn held_keys(&self) -> impl Iterator<Item = &str> {
        self.holders.keys().map(String::as_str)
    }

    pub fn conflicts(&self) -> &[KeyConflict] {
        &self.conflicts
    }

    /// The `(used, assigned_to)` pair a lock row should carry.
    pub fn desired_state(&self, lock: &Lock) -> (bool, Option<String>) {
        match self.holder(&lock.key_number) {
            Some(name) => (true, Some(name.to_string())),
            None => (false, None),
        }
    }
}

/// Derive lock usage from the current breakers.
///
/// Breakers are visited in id order; the first holder of a key is the one
/// recorded, later holders are reported as conflicts.
pub fn derive_lock_usage(breakers: &[Breaker]) -> LockUsage {
    let mut ordered: Vec<&Breaker> = breakers.iter().collect();
    ordered.sort_by_key(|b| (b.id.is_none(), b.id));

    let mut usage = LockUsage::default();
    for breaker in ordered {
        let Some(key) = breaker.active_lock_key() else {
            continue;
        };
        match usage.holders.get(key) {
            Some(holder) => usage.conflicts.push(KeyConflict {
                key: key.to_string(),
                holder: holder.clone(),
                breaker: breaker.name.clone(),
            }),
            None => {
                usage
                    .holders
                    .insert(key.to_string(), breaker.name.clone());
            }
        }
    }
    usage
}

/// Capacity figures shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub total_capacity: i64,
    pub in_use: i64,
    /// Negative when more keys are held than the inventory allows
    pub available: i64,
}

impl LockStats {
    pub fn compute(inventory: Option<&LockInventory>, breakers: &[Breaker]) -> Self {
        let total_capacity = inventory.map(|i| i.total_capacity).unwrap_or(0);
        let in_use = derive_lock_usage(breakers).in_use() as i64;
        Self {
            total_capacity,
            in_use,
            available: total_capacity - in_use,
        }
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub locks_updated: usize,
    pub failures: usize,
    /// Held keys with no matching lock row
    pub missing_keys: Vec<String>,
    pub conflicts: Vec<KeyConflict>,
}

/// Keeps lock rows in line with breaker state.
#[derive(Clone)]
pub struct LockUsageReconciler {
    breakers: ReplicatedStore<Breaker>,
    locks: ReplicatedStore<Lock>,
}

impl LockUsageReconciler {
    pub fn new(breakers: ReplicatedStore<Breaker>, locks: ReplicatedStore<Lock>) -> Self {
        Self { breakers, locks }
    }

    /// Incremental update after one breaker write.
    ///
    /// `previous` is the breaker before the write (`None` for an insert) and
    /// `current` the breaker after it (`None` for a delete). The key released
    /// by the breaker and the key it now holds are recomputed from all
    /// breakers, so a released key still held by another breaker stays used.
    pub async fn on_breaker_written(
        &self,
        previous: Option<&Breaker>,
        current: Option<&Breaker>,
    ) -> Result<ReconcileReport> {
        let old_key = previous.and_then(Breaker::active_lock_key);
        let new_key = current.and_then(Breaker::active_lock_key);

        let mut affected = Vec::new();
        if let Some(old) = old_key {
            if new_key != Some(old) {
                affected.push(old.to_string());
            }
        }
        if let Some(new) = new_key {
            affected.push(new.to_string());
        }
        if affected.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let breakers = self.breakers.read_all().await;
        let usage = if breakers.source == Source::None {
            warn!("Breakers unreadable; deriving lock usage from the written breaker only");
            derive_lock_usage(current.cloned().as_slice())
        } else {
            derive_lock_usage(&breakers.rows)
        };

        let all_locks = self.locks.read_all().await.rows;
        let mut report = ReconcileReport::default();
        for key in affected {
            let locks: Vec<Lock> = all_locks
                .iter()
                .filter(|lock| lock.matches_key(&key))
                .cloned()
                .collect();
            if locks.is_empty() {
                if usage.is_used(&key) {
                    warn!(key = %key, "Breaker references a lock key with no lock record");
                    report.missing_keys.push(key);
                }
                continue;
            }
            for lock in locks {
                self.apply(lock, &usage, &mut report).await;
            }
        }
        Ok(report)
    }

    /// Recompute every lock row from all breakers.
    ///
    /// Writes only rows whose state differs, so a second pass with no
    /// breaker changes in between writes nothing.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let breakers = self.breakers.read_all().await;
        if breakers.source == Source::None {
            return Err(StoreError::Cache(format!(
                "{} unavailable from both stores",
                Table::Breakers
            )));
        }
        let locks = self.locks.read_all().await;

        let usage = derive_lock_usage(&breakers.rows);
        let mut report = ReconcileReport {
            conflicts: usage.conflicts().to_vec(),
            ..Default::default()
        };
        for conflict in &report.conflicts {
            warn!(
                key = %conflict.key,
                holder = %conflict.holder,
                breaker = %conflict.breaker,
                "Lock key claimed by more than one breaker"
            );
        }

        for key in usage.held_keys() {
            if !locks.rows.iter().any(|lock| lock.matches_key(key)) {
                warn!(key, "Breaker references a lock key with no lock record");
                report.missing_keys.push(key.to_string());
            }
        }

        for lock in locks.rows {
            self.apply(lock, &usage, &mut report).await;
        }

        info!(
            updated = report.locks_updated,
            failures = report.failures,
            in_use = usage.in_use(),
            "Lock reconciliation finished"
        );
        Ok(report)
    }

    async fn apply(&self, mut lock: Lock, usage: &LockUsage, report: &mut ReconcileReport) {
        let (used, assigned_to) = usage.desired_state(&lock);
        if lock.used == used && lock.assigned_to == assigned_to {
            return;
        }

        debug!(key = %lock.key_number, used, "Updating lock usage");
        lock.used = used;
        lock.assigned_to = assigned_to;
        let key = lock.key_number.clone();
        let outcome = self.locks.update(lock).await;
        if outcome.overall_success {
            report.locks_updated += 1;
        } else {
            warn!(key = %key, error = ?outcome.error, "Failed to update lock usage");
            report.failures += 1;
        }
    }
}
