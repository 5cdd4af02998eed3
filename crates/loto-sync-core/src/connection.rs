//! Remote reachability tracking.
//!
//! The monitor owns the cached online/offline flag that every replicated
//! store consults before deciding between remote-first and cache-only
//! behaviour. Live checks are throttled; transitions are broadcast to
//! subscribers for presentation only and never drive store decisions.

use crate::model::Table;
use crate::query::Query;
use crate::remote::{bounded, RemoteStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Online,
    Offline,
}

impl ConnectionState {
    fn from_flag(online: bool) -> Self {
        if online {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        }
    }
}

pub struct ConnectionMonitor {
    remote: Arc<dyn RemoteStore>,
    probe_table: Table,
    probe_interval: Duration,
    request_timeout: Duration,
    online: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    events: broadcast::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    /// Create a monitor that starts optimistic (online) with no probe recorded,
    /// so the first unforced probe performs a live check.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        probe_table: Table,
        probe_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            remote,
            probe_table,
            probe_interval,
            request_timeout,
            online: AtomicBool::new(true),
            last_probe: Mutex::new(None),
            events,
        }
    }

    /// Cached reachability; never touches the network.
    pub fn is_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_flag(self.is_reachable())
    }

    /// Check reachability.
    ///
    /// Without `force`, a call within the probe interval of the previous probe
    /// returns the cached flag. A live check is a one-row read of the probe
    /// table; any error (including a timeout) marks the store offline.
    pub async fn probe(&self, force: bool) -> bool {
        {
            let mut last = self
                .last_probe
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < self.probe_interval {
                        return self.is_reachable();
                    }
                }
            }
            *last = Some(Instant::now());
        }

        let query = Query::new().limit(1);
        let result = bounded(
            self.request_timeout,
            self.remote.query(self.probe_table, &query),
        )
        .await;

        match result {
            Ok(_) => {
                debug!(table = %self.probe_table, "Probe succeeded");
                self.set_online(true);
                true
            }
            Err(e) => {
                warn!(table = %self.probe_table, error = %e, "Probe failed");
                self.set_online(false);
                false
            }
        }
    }

    /// Apply the host environment's native online/offline signal.
    ///
    /// Takes effect immediately and restarts the probe interval.
    pub fn set_network_status(&self, online: bool) {
        *self
            .last_probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.set_online(online);
    }

    /// Receive an event on every online/offline transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            let state = ConnectionState::from_flag(online);
            info!(?state, "Remote store connectivity changed");
            // No subscribers is fine
            let _ = self.events.send(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryRemoteStore;

    fn monitor(remote: Arc<MemoryRemoteStore>) -> ConnectionMonitor {
        ConnectionMonitor::new(
            remote,
            Table::Breakers,
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn unforced_probes_are_throttled() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = monitor(remote.clone());

        assert!(monitor.probe(false).await);
        assert!(monitor.probe(false).await);
        assert_eq!(remote.query_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        monitor.probe(false).await;
        assert_eq!(remote.query_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_probe_bypasses_throttle() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = monitor(remote.clone());

        monitor.probe(false).await;
        remote.set_fail_reads(true);
        assert!(!monitor.probe(true).await);
        assert_eq!(remote.query_calls(), 2);
        assert!(!monitor.is_reachable());
    }

    #[tokio::test(start_paused = true)]
    async fn events_fire_on_transitions_only() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = monitor(remote.clone());
        let mut events = monitor.subscribe();

        monitor.probe(true).await;
        remote.set_fail_reads(true);
        monitor.probe(true).await;
        monitor.probe(true).await;
        remote.set_fail_reads(false);
        monitor.probe(true).await;

        assert_eq!(events.try_recv().unwrap(), ConnectionState::Offline);
        assert_eq!(events.try_recv().unwrap(), ConnectionState::Online);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn native_signal_sets_flag_and_resets_timer() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = monitor(remote.clone());

        monitor.set_network_status(false);
        assert_eq!(monitor.state(), ConnectionState::Offline);

        // Within the interval the cached offline flag is returned without a check
        assert!(!monitor.probe(false).await);
        assert_eq!(remote.query_calls(), 0);
    }
}
