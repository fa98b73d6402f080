//! Configuration management for Turnstile.
//!
//! Settings come from, in increasing priority: built-in defaults, an optional
//! YAML file and `GATEWAY_`-prefixed environment variables (nested keys are
//! separated by `__`, e.g. `GATEWAY_POLICY__REQUESTS_PER_MINUTE=120`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::ratelimit::Policy;

/// Main configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission limits
    #[serde(default)]
    pub policy: Policy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Request header carrying the caller identity
    #[serde(default = "default_caller_header")]
    pub caller_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            caller_header: default_caller_header(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_caller_header() -> String {
    "x-api-key".to_string()
}

/// Which counter store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process counters; limits hold for this process only
    #[default]
    Memory,
    /// A shared Redis server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound for a single store round-trip in milliseconds (0 disables)
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,

    /// How often the memory backend drops expired counters, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            op_timeout_ms: default_op_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_op_timeout() -> u64 {
    500
}

fn default_sweep_interval() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    true
}

impl GatewayConfig {
    /// Load configuration from a YAML file only.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_yaml::from_str(&contents)
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file and the
    /// environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.caller_header.trim().is_empty() {
            return Err(GatewayError::Config(
                "server.caller_header must not be empty".to_string(),
            ));
        }
        if axum::http::HeaderName::from_bytes(self.server.caller_header.as_bytes()).is_err() {
            return Err(GatewayError::Config(format!(
                "server.caller_header {:?} is not a valid header name",
                self.server.caller_header
            )));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(GatewayError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(GatewayError::Config(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Bound for one store round-trip, if any.
    pub fn store_timeout(&self) -> Option<Duration> {
        match self.store.op_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
