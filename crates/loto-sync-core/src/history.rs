//! Time-window guard against duplicate audit entries.

use crate::error::{Result, StoreError};
use crate::model::{HistoryEntry, Table};
use crate::store::ReplicatedStore;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// What happened to a submitted entry.
#[derive(Debug, Clone, PartialEq)]
pub enum HistorySubmission {
    /// Written; carries the stored entry and whether it went to the cache only
    Stored {
        entry: HistoryEntry,
        was_offline_fallback: bool,
    },
    /// Dropped because the same event was submitted within the window
    Deduplicated,
}

impl HistorySubmission {
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, HistorySubmission::Deduplicated)
    }
}

pub struct HistoryDeduplicator {
    store: ReplicatedStore<HistoryEntry>,
    window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl HistoryDeduplicator {
    pub fn new(store: ReplicatedStore<HistoryEntry>, window: Duration) -> Self {
        Self {
            store,
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `entry` unless an entry with the same key was accepted within the window.
    ///
    /// The key is `action`, `user_mode` and the caller's timestamp when one is
    /// given. A failed write releases the key so a retry is not swallowed.
    pub async fn submit(&self, entry: HistoryEntry) -> Result<HistorySubmission> {
        let key = dedup_key(&entry);
        if !self.claim(&key) {
            debug!(key = %key, "Dropping duplicate history entry");
            return Ok(HistorySubmission::Deduplicated);
        }

        let outcome = self.store.insert(entry).await;
        if !outcome.overall_success {
            self.release(&key);
        }
        let was_offline_fallback = outcome.was_offline_fallback;
        match outcome.into_result()? {
            Some(entry) => Ok(HistorySubmission::Stored {
                entry,
                was_offline_fallback,
            }),
            None => Err(StoreError::MissingId(Table::History)),
        }
    }

    fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.retain(|_, at| now.duration_since(*at) < self.window);
        if recent.contains_key(key) {
            return false;
        }
        recent.insert(key.to_string(), now);
        true
    }

    fn release(&self, key: &str) {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

fn dedup_key(entry: &HistoryEntry) -> String {
    match entry.timestamp {
        Some(at) => format!("{}|{}|{}", entry.action, entry.user_mode, at.to_rfc3339()),
        None => format!("{}|{}", entry.action, entry.user_mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_context;
    use chrono::{TimeZone, Utc};

    fn dedup(ctx: &crate::store::StoreContext) -> HistoryDeduplicator {
        HistoryDeduplicator::new(ReplicatedStore::new(ctx), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn same_event_within_window_is_stored_once() {
        let (ctx, remote) = test_context();
        let history = dedup(&ctx);

        let first = history
            .submit(HistoryEntry::new("Breaker closed", "admin"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let second = history
            .submit(HistoryEntry::new("Breaker closed", "admin"))
            .await
            .unwrap();

        assert!(!first.is_deduplicated());
        assert!(second.is_deduplicated());
        assert_eq!(remote.rows(Table::History).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_event_after_window_is_stored_again() {
        let (ctx, remote) = test_context();
        let history = dedup(&ctx);

        history
            .submit(HistoryEntry::new("Breaker closed", "admin"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(2_100)).await;
        let again = history
            .submit(HistoryEntry::new("Breaker closed", "admin"))
            .await
            .unwrap();

        assert!(!again.is_deduplicated());
        assert_eq!(remote.rows(Table::History).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_timestamps_are_distinct_events() {
        let (ctx, remote) = test_context();
        let history = dedup(&ctx);
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 1).unwrap();

        history
            .submit(HistoryEntry::new("Lock assigned", "user").at(t1))
            .await
            .unwrap();
        history
            .submit(HistoryEntry::new("Lock assigned", "user").at(t2))
            .await
            .unwrap();
        assert_eq!(remote.rows(Table::History).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_does_not_suppress_retry() {
        let (ctx, remote) = test_context();
        let history = dedup(&ctx);

        remote.set_fail_writes(true);
        assert!(history
            .submit(HistoryEntry::new("Purge", "admin"))
            .await
            .is_err());

        remote.set_fail_writes(false);
        let retry = history
            .submit(HistoryEntry::new("Purge", "admin"))
            .await
            .unwrap();
        assert!(!retry.is_deduplicated());
    }
}
