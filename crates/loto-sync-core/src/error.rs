//! Error types for the replication layer.

use crate::model::Table;
use std::time::Duration;

/// Failures surfaced by the remote store, the local cache, or the row codecs.
///
/// Remote transport errors, remote rejections and timeouts are all treated as
/// "remote failed" by the write protocol; the distinction only matters for
/// logging and for replay (a 404 on update is retried as an insert).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("remote request failed: {0}")]
    Remote(String),

    #[error("remote store rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("remote request timed out after {0:?}")]
    Timeout(Duration),

    #[error("local cache error: {0}")]
    Cache(String),

    #[error("cannot encode or decode {table} row: {source}")]
    Codec {
        table: Table,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} record is not a flat object")]
    NotARow(Table),

    #[error("{0} record has no id")]
    MissingId(Table),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error(transparent)]
    Config(#[from] loto_sync_config::ConfigError),
}

impl StoreError {
    /// True for failures that originate on the remote side of a write.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            StoreError::Remote(_) | StoreError::RemoteRejected { .. } | StoreError::Timeout(_)
        )
    }

    /// True when the remote store reported that the addressed row does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::RemoteRejected { status: 404, .. })
    }
}

impl From<duckdb::Error> for StoreError {
    fn from(err: duckdb::Error) -> Self {
        StoreError::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Remote(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
