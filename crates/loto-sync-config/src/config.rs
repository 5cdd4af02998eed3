use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding `remote.url`
pub const ENV_REMOTE_URL: &str = "LOTO_REMOTE_URL";
/// Environment variable overriding `remote.api_key`
pub const ENV_REMOTE_API_KEY: &str = "LOTO_REMOTE_API_KEY";
/// Environment variable overriding `cache.path`
pub const ENV_CACHE_PATH: &str = "LOTO_CACHE_PATH";

const CONFIG_FILE_NAME: &str = "config.toml";
const CACHE_FILE_NAME: &str = "loto-cache.duckdb";

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not determine a platform directory for loto-sync")]
    NoProjectDirs,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub connection: ConnectionConfig,
    pub history: HistoryConfig,
    pub purge: PurgeConfig,
    pub replication: ReplicationConfig,
    pub logging: LoggingConfig,
}

/// Hosted authoritative store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the REST endpoint, e.g. `https://project.example.co`
    pub url: String,
    /// Key sent as both `apikey` header and bearer token
    pub api_key: String,
    /// Upper bound on any single remote request
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            request_timeout_secs: 15,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Local durable cache
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache database path; defaults to the platform data directory
    pub path: Option<PathBuf>,
    /// Keep the cache in memory only (tests, kiosks)
    pub in_memory: bool,
}

impl CacheConfig {
    /// Resolve the on-disk cache location, falling back to the data directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => {
                let dirs = project_dirs()?;
                Ok(dirs.data_dir().join(CACHE_FILE_NAME))
            }
        }
    }
}

/// Reachability probing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Table used for the bounded probe query
    pub probe_table: String,
    /// Minimum spacing between unforced probes
    pub probe_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_table: "breakers".to_string(),
            probe_interval_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Audit-log deduplication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub dedup_window_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 2_000,
        }
    }
}

impl HistoryConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

/// Bulk purge throttling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PurgeConfig {
    /// Deletions issued between pauses
    pub batch_size: usize,
    /// Pause inserted after every batch
    pub pause_ms: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            pause_ms: 100,
        }
    }
}

impl PurgeConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

/// Offline write handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Push queued offline writes when the remote store becomes reachable again
    pub replay_on_reconnect: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replay_on_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit path or the default location,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default config file location under the platform config directory.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Apply overrides from a variable lookup (usually the process environment).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_REMOTE_URL) {
            self.remote.url = url;
        }
        if let Some(key) = lookup(ENV_REMOTE_API_KEY) {
            self.remote.api_key = key;
        }
        if let Some(path) = lookup(ENV_CACHE_PATH) {
            self.cache.path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.url.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.url must not be empty".into()));
        }
        if self.remote.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "remote.request_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.purge.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "purge.batch_size must be greater than zero".into(),
            ));
        }
        if self.connection.probe_table.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "connection.probe_table must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "loto", "loto-sync").ok_or(ConfigError::NoProjectDirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_replication_constants() {
        let config = AppConfig::default();
        assert_eq!(config.connection.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.history.dedup_window(), Duration::from_secs(2));
        assert_eq!(config.purge.batch_size, 10);
        assert!(config.replication.replay_on_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[remote]
url = "https://loto.example.co"
api_key = "anon"

[purge]
pause_ms = 0
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.remote.url, "https://loto.example.co");
        assert_eq!(config.remote.request_timeout_secs, 15);
        assert_eq!(config.purge.pause(), Duration::ZERO);
        assert_eq!(config.purge.batch_size, 10);
        assert_eq!(config.connection.probe_table, "breakers");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.history.dedup_window_ms, 2_000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[remote\nurl = 1").unwrap();

        let err = AppConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = [
            (ENV_REMOTE_URL, "https://override.example.co"),
            (ENV_CACHE_PATH, "/var/lib/loto/cache.duckdb"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.remote.url, "https://override.example.co");
        assert_eq!(config.remote.api_key, "");
        assert_eq!(
            config.cache.resolved_path().unwrap(),
            PathBuf::from("/var/lib/loto/cache.duckdb")
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = AppConfig::default();
        config.purge.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
