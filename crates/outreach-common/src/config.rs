//! Configuration for the outreach delivery core

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Send scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-account rate limits
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Inbound event processing
    #[serde(default)]
    pub events: EventsConfig,

    /// Delivery gateway client
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Webhook intake listener
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Send scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum items claimed per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Maximum concurrent gateway calls
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Interval between batches (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Gateway attempts before an item is failed permanently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Upper bound of the per-item retry jitter (seconds)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_secs: u64,

    /// Age after which a `processing` claim is considered abandoned (seconds)
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            poll_interval_secs: default_poll_interval(),
            max_attempts: default_max_attempts(),
            retry_jitter_secs: default_retry_jitter(),
            claim_timeout_secs: default_claim_timeout(),
        }
    }
}

fn default_batch_size() -> i64 {
    100
}

fn default_concurrency() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_attempts() -> i32 {
    3
}

fn default_retry_jitter() -> u64 {
    30
}

fn default_claim_timeout() -> u64 {
    600
}

/// Limits for a single sending account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    pub daily_limit: i32,
    pub hourly_limit: i32,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Default sends per rolling day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: i32,

    /// Default sends per rolling hour
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: i32,

    /// Per-account overrides
    #[serde(default)]
    pub accounts: HashMap<String, AccountLimits>,
}

impl RateLimitConfig {
    /// Limits applied when the counter row for `account_id` is created
    pub fn limits_for(&self, account_id: &str) -> AccountLimits {
        self.accounts
            .get(account_id)
            .copied()
            .unwrap_or(AccountLimits {
                daily_limit: self.daily_limit,
                hourly_limit: self.hourly_limit,
            })
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            hourly_limit: default_hourly_limit(),
            accounts: HashMap::new(),
        }
    }
}

fn default_daily_limit() -> i32 {
    700
}

fn default_hourly_limit() -> i32 {
    50
}

/// Inbound event processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Number of committed event ids kept in the in-process cache
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: usize,

    /// Window for the recipient-email fallback when resolving messages
    #[serde(default = "default_recipient_lookback_days")]
    pub recipient_lookback_days: i64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            dedup_cache_size: default_dedup_cache_size(),
            recipient_lookback_days: default_recipient_lookback_days(),
        }
    }
}

fn default_dedup_cache_size() -> usize {
    10_000
}

fn default_recipient_lookback_days() -> i64 {
    30
}

/// Delivery gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider API base URL
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// Bearer token for the provider API
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_key: None,
            timeout_secs: default_gateway_timeout(),
        }
    }
}

fn default_gateway_url() -> String {
    "http://localhost:9000/v3".to_string()
}

fn default_gateway_timeout() -> u64 {
    30
}

/// Webhook intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Bind address for the intake listener
    #[serde(default = "default_webhook_bind")]
    pub bind: String,

    /// Shared secret for `X-Webhook-Signature` verification
    pub signing_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_webhook_bind(),
            signing_secret: None,
        }
    }
}

fn default_webhook_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the first file found, layered with
    /// `OUTREACH__SECTION__KEY` environment overrides
    pub fn load() -> crate::Result<Self> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var("OUTREACH_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("./config.toml"));
        paths.push(PathBuf::from("/etc/outreach/config.toml"));

        let mut builder = config::Config::builder();
        if let Some(path) = paths.iter().find(|p| p.exists()) {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder
            .add_source(
                config::Environment::with_prefix("OUTREACH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
