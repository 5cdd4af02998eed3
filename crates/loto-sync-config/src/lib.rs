//! Configuration for the loto-sync replication layer.
//!
//! Settings are read from a TOML file (by default `config.toml` in the
//! platform config directory) and may be overridden through environment
//! variables. A missing file is not an error; every section has defaults.

pub mod config;

pub use config::{
    AppConfig, CacheConfig, ConfigError, ConnectionConfig, HistoryConfig, LoggingConfig,
    PurgeConfig, RemoteConfig, ReplicationConfig,
};
