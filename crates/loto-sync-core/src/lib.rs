//! Replication layer for the LOTO key tracker.
//!
//! A [`Replicator`] presents one CRUD surface over a hosted authoritative
//! store and a local DuckDB cache, keeps lock usage derived from breaker
//! state, guards the audit log against duplicate submissions, and coordinates
//! administrative purges.

pub mod cache;
pub mod connection;
pub mod error;
pub mod history;
pub mod locks;
pub mod model;
pub mod pending;
pub mod purge;
pub mod query;
pub mod remote;
pub mod replicator;
pub mod store;
pub mod test_utils;

pub use connection::{ConnectionMonitor, ConnectionState};
pub use error::{Result, StoreError};
pub use history::{HistoryDeduplicator, HistorySubmission};
pub use locks::{derive_lock_usage, LockStats, LockUsage, LockUsageReconciler, ReconcileReport};
pub use model::{
    Breaker, BreakerState, Entity, HistoryEntry, Lock, LockInventory, Personnel, Plan, Row, Table,
    WriteOp,
};
pub use pending::{PendingWriteQueue, ReplayReport};
pub use purge::{BulkPurgeCoordinator, PurgeReport, PurgeSelection, TableCounts};
pub use query::{Filter, OrderBy, Query};
pub use replicator::Replicator;
pub use store::{ReadResult, ReplicatedStore, Source, StoreContext, WriteOutcome};

pub use loto_sync_config as config;
