//! Configuration management for Authguard.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthGuardError, Result};
use crate::ratelimit::{
    LimitSettings, DEFAULT_LOCKOUT_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW_SECS,
};

/// Prefix for environment variable overrides, e.g. `AUTHGUARD__LIMITS__MAX_ATTEMPTS`.
pub const ENV_PREFIX: &str = "AUTHGUARD";

/// Main configuration for the Authguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthGuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limit thresholds
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Attempt store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Lockout cleanup notices
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Honor the `now` field of incoming requests instead of the server clock
    #[serde(default)]
    pub accept_client_time: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            accept_client_time: false,
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50051))
}

/// Rate limit thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Attempts within the window at which both identifiers are locked
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Lockout duration in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    /// Deadline in milliseconds for the read fan-out and for each write
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            lockout_secs: default_lockout_secs(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u64 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_lockout_secs() -> u64 {
    DEFAULT_LOCKOUT_SECS
}

fn default_store_timeout_ms() -> u64 {
    2000
}

impl LimitsConfig {
    pub fn settings(&self) -> LimitSettings {
        LimitSettings {
            max_attempts: self.max_attempts,
            window_secs: self.window_secs,
            lockout_secs: self.lockout_secs,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Which attempt store backend to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Attempt store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection string for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    /// Connection pool size for the postgres backend
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How often expired records are physically purged, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            max_connections: default_max_connections(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

/// Lockout cleanup notice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,

    /// Upper bound on notices waiting for their due time
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            max_pending: default_max_pending(),
        }
    }
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_max_pending() -> usize {
    10_000
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AuthGuardConfig {
    /// Load configuration from defaults, an optional YAML file and
    /// `AUTHGUARD__*` environment variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Yaml));
        }

        let config: AuthGuardConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AuthGuardConfig =
            serde_yaml::from_str(yaml).map_err(|e| AuthGuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_attempts == 0 {
            return Err(AuthGuardError::Config("limits.max_attempts must be positive".into()));
        }
        if limits.window_secs == 0 {
            return Err(AuthGuardError::Config("limits.window_secs must be positive".into()));
        }
        if limits.lockout_secs == 0 {
            return Err(AuthGuardError::Config("limits.lockout_secs must be positive".into()));
        }
        if limits.store_timeout_ms == 0 {
            return Err(AuthGuardError::Config("limits.store_timeout_ms must be positive".into()));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(AuthGuardError::Config("store.sweep_interval_secs must be positive".into()));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(AuthGuardError::Config(
                "store.database_url is required for the postgres backend".into(),
            ));
        }
        Ok(())
    }
}
