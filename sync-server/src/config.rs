//! Configuration loading for the sync server.
//!
//! Configuration is loaded from a TOML file (default: `nexsync.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the sync server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Signal bus configuration.
    pub signalbus: SignalBusConfig,
    /// Fetch manager configuration.
    pub fetch: FetchConfig,
    /// Watch stream configuration.
    pub watch: WatchConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    pub http: HttpConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum items returned by one loader call (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Which signal bus implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalBusMode {
    /// In-process only.
    #[default]
    Memory,
    /// Clustered through a Postgres notify channel.
    Postgres,
}

/// Signal bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalBusConfig {
    /// Bus implementation (default: memory).
    #[serde(default)]
    pub mode: SignalBusMode,
    /// Postgres connection URL, required in postgres mode.
    pub database_url: Option<String>,
    /// Notify channel name (default: signalbus).
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Reconnect delay after the first failure (default: 10).
    #[serde(default = "default_min_reconnect_secs")]
    pub min_reconnect_secs: u64,
    /// Upper bound for the reconnect delay (default: 60).
    #[serde(default = "default_max_reconnect_secs")]
    pub max_reconnect_secs: u64,
    /// Ping the listen connection after this long without traffic (default: 90).
    #[serde(default = "default_idle_ping_secs")]
    pub idle_ping_secs: u64,
    /// A ping that takes longer than this counts as a lost connection (default: 10).
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

/// Which fetch manager to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchManagerKind {
    /// No caching, every fetch hits the loader.
    None,
    /// Per-process ring buffer cache.
    #[default]
    Memory,
    /// Cache table shared by every replica.
    Shared,
}

/// Fetch manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Fetch manager implementation (default: memory).
    #[serde(default)]
    pub manager: FetchManagerKind,
    /// Tail cache size for device lists (default: 500).
    #[serde(default = "default_device_cache_size")]
    pub device_cache_size: usize,
    /// Database URL of the shared cache (default: the signal bus database).
    ///
    /// `postgres://` URLs are shared by every replica; a SQLite URL or path
    /// only serves replicas on one host.
    pub shared_url: Option<String>,
    /// Prefix for shared cache keys (default: fetchmgr:).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Timeout for shared cache operations in milliseconds (default: 2000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Watch stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Longest wait while every kind is parked (default: 30).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Lines buffered between dispatcher and response body (default: 16).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Watch streams opened per organization per minute (default: 60).
    #[serde(default = "default_watches_per_minute")]
    pub watches_per_minute: u32,
    /// Maximum requests per second across all clients (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("nexsync.db")
}

fn default_page_size() -> u32 {
    100
}

fn default_channel() -> String {
    "signalbus".to_string()
}

fn default_min_reconnect_secs() -> u64 {
    10
}

fn default_max_reconnect_secs() -> u64 {
    60
}

fn default_idle_ping_secs() -> u64 {
    90
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_device_cache_size() -> usize {
    500
}

fn default_key_prefix() -> String {
    "fetchmgr:".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    16
}

fn default_watches_per_minute() -> u32 {
    60
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            page_size: default_page_size(),
        }
    }
}

impl Default for SignalBusConfig {
    fn default() -> Self {
        Self {
            mode: SignalBusMode::default(),
            database_url: None,
            channel: default_channel(),
            min_reconnect_secs: default_min_reconnect_secs(),
            max_reconnect_secs: default_max_reconnect_secs(),
            idle_ping_secs: default_idle_ping_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

impl SignalBusConfig {
    /// Reconnect backoff bounds as a policy.
    pub fn backoff(&self) -> sync_core::BackoffPolicy {
        sync_core::BackoffPolicy::new(
            Duration::from_secs(self.min_reconnect_secs),
            Duration::from_secs(self.max_reconnect_secs.max(self.min_reconnect_secs)),
        )
    }

    /// Idle window before pinging the listen connection.
    pub fn idle_ping(&self) -> Duration {
        Duration::from_secs(self.idle_ping_secs.max(1))
    }

    /// How long a keepalive query may take.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs.max(1))
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            manager: FetchManagerKind::default(),
            device_cache_size: default_device_cache_size(),
            shared_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl FetchConfig {
    /// Shared cache operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WatchConfig {
    /// Longest all-parked wait.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            watches_per_minute: default_watches_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// selected backend is missing its connection setting.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Database URL of the shared fetch cache.
    ///
    /// Falls back to the signal bus database, which every replica of a
    /// clustered deployment already reaches.
    pub fn shared_cache_url(&self) -> Option<&str> {
        self.fetch
            .shared_url
            .as_deref()
            .or(self.signalbus.database_url.as_deref())
    }

    /// Check settings that depend on each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signalbus.mode == SignalBusMode::Postgres && self.signalbus.database_url.is_none() {
            return Err(ConfigError::Missing {
                field: "signalbus.database_url",
            });
        }
        if self.fetch.manager == FetchManagerKind::Shared && self.shared_cache_url().is_none() {
            return Err(ConfigError::Missing {
                field: "fetch.shared_url",
            });
        }
        if self.limits.watches_per_minute == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.watches_per_minute",
            });
        }
        if self.limits.global_requests_per_second == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.global_requests_per_second",
            });
        }
        if self.storage.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.page_size",
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A setting required by the selected backend is absent.
    #[error("missing required setting: {field}")]
    Missing {
        /// Dotted name of the setting.
        field: &'static str,
    },
    /// A setting has an unusable value.
    #[error("invalid setting: {field} must be greater than zero")]
    Invalid {
        /// Dotted name of the setting.
        field: &'static str,
    },
}
