//! Wolfpack Configuration
//!
//! Configuration for the coordination layer, supplied by the host
//! process at startup. Loaded from TOML with per-field defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Main wolfpack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Cluster identity configuration
    pub cluster: ClusterConfig,

    /// Coordination store endpoint configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Session (lease) configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Retry policy for transient store faults
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, used to tag and filter membership records
    pub name: String,

    /// Service name registered in the store's catalog
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Prefix for every KV key this layer writes
    #[serde(default = "default_kv_prefix")]
    pub kv_prefix: String,

    /// Extra tags attached to every membership registration
    #[serde(default)]
    pub extended_tags: Vec<String>,
}

/// Coordination store endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the store's HTTP agent
    #[serde(default = "default_store_address")]
    pub address: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Session (lease) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lease TTL in seconds; heartbeats must arrive more often than this
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// How long a critical membership record lingers before the store
    /// deregisters it
    #[serde(default = "default_destroy_timeout")]
    pub destroy_timeout_secs: u64,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per operation (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_service_name() -> String {
    "wolfpack".to_string()
}

fn default_kv_prefix() -> String {
    "wolfpack".to_string()
}

fn default_store_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_session_ttl() -> u64 {
    10
}

fn default_destroy_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            destroy_timeout_secs: default_destroy_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: CoordinationConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.name.is_empty() {
            return Err(crate::Error::Config("cluster.name cannot be empty".into()));
        }

        if self.session.ttl_secs < 10 {
            return Err(crate::Error::Config(
                "session.ttl_secs must be at least 10 (store minimum)".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be at least 1".into()));
        }

        if self.retry.multiplier < 1.0 {
            return Err(crate::Error::Config("retry.multiplier must be at least 1.0".into()));
        }

        Ok(())
    }

    /// Get the session TTL as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    /// Get the critical-record destroy timeout as Duration
    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.session.destroy_timeout_secs)
    }

    /// Build the retry policy from the configured knobs
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
        }
    }
}

/// Initialize logging from the configured level
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
