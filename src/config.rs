//! Configuration management for verigate.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `UPSTREAM_BASE_URL` - Optional. Base URL of the verification service.
//! - `UPSTREAM_API_KEY` - Optional. Sent upstream as `X-API-Key`.
//! - `UPSTREAM_TIMEOUT_MS` - Optional. Per-call upstream timeout. Defaults to `30000`.
//! - `UPSTREAM_MAX_RETRIES` - Optional. Retries on transient upstream errors. Defaults to `2`.
//! - `POLL_INTERVAL_MS` - Optional. Wait between confirmation checks. Defaults to `3000`.
//! - `MAX_POLL_DURATION_SECS` - Optional. Polling budget per task. Defaults to `300`.
//! - `TASK_RETENTION_SECS` - Optional. How long finished tasks stay queryable. Defaults to `3600`.
//! - `CANCEL_WINDOW_SECS` - Optional. Lifetime of pre-emptive cancel markers. Defaults to `300`.
//! - `BATCH_CONCURRENCY` - Optional. Parallel upstream calls per batch. Defaults to `5`.
//! - `MAX_BATCH_SIZE` - Optional. Ids accepted per batch request. Defaults to `50`.
//! - `DATA_DIR` - Optional. Enables JSON persistence of the ledger and redemption codes.
//! - `API_KEYS` - Optional. Comma-separated `key` or `key:credits` account seeds.
//! - `ADMIN_TOKEN` - Optional. Enables `/admin/*` routes.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Upstream verification service settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Hard bound on a single upstream call (verify or probe)
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            api_key: None,
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Task engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries on transient upstream errors, per attempt
    pub max_retries: u32,
    /// Base delay for retry backoff
    pub retry_base_delay: Duration,
    /// Cap for retry backoff
    pub retry_max_delay: Duration,
    /// Wait between checks while a task is `polling`
    pub poll_interval: Duration,
    /// A polling task exceeding this turns into `error`
    pub max_poll_duration: Duration,
    /// Finished tasks are garbage-collected after this long
    pub task_retention: Duration,
    /// Pre-emptive cancellation markers expire after this long
    pub cancel_window: Duration,
    /// Concurrent executions inside one batch
    pub batch_concurrency: usize,
    /// Maximum ids per batch request
    pub max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            poll_interval: Duration::from_millis(3_000),
            max_poll_duration: Duration::from_secs(300),
            task_retention: Duration::from_secs(3_600),
            cancel_window: Duration::from_secs(300),
            batch_concurrency: 5,
            max_batch_size: 50,
        }
    }
}

impl EngineConfig {
    /// Interval of the background sweeper: a quarter of the shorter expiry, at least 1s.
    pub fn sweep_interval(&self) -> Duration {
        (self.task_retention.min(self.cancel_window) / 4).max(Duration::from_secs(1))
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    pub upstream: UpstreamConfig,

    pub engine: EngineConfig,

    /// Directory for the JSON ledger and code files (None = in-memory only)
    pub data_dir: Option<PathBuf>,

    /// Accounts opened at startup: (api key, initial credits)
    pub seed_accounts: Vec<(String, u64)>,

    /// Token guarding the admin routes (None = admin routes disabled)
    pub admin_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable numbers, zero-valued
    /// windows, or malformed `API_KEYS` entries.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("PORT", 3000u16)?;

        let upstream = UpstreamConfig {
            base_url: std::env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| UpstreamConfig::default().base_url),
            api_key: non_empty_env("UPSTREAM_API_KEY"),
            timeout: Duration::from_millis(parse_env("UPSTREAM_TIMEOUT_MS", 30_000u64)?),
        };
        url::Url::parse(&upstream.base_url).map_err(|e| {
            ConfigError::InvalidValue("UPSTREAM_BASE_URL".to_string(), e.to_string())
        })?;

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            max_retries: parse_env("UPSTREAM_MAX_RETRIES", defaults.max_retries)?,
            poll_interval: Duration::from_millis(parse_env("POLL_INTERVAL_MS", 3_000u64)?),
            max_poll_duration: Duration::from_secs(parse_env("MAX_POLL_DURATION_SECS", 300u64)?),
            task_retention: Duration::from_secs(positive_env("TASK_RETENTION_SECS", 3_600)?),
            cancel_window: Duration::from_secs(positive_env("CANCEL_WINDOW_SECS", 300)?),
            batch_concurrency: positive_env("BATCH_CONCURRENCY", 5)? as usize,
            max_batch_size: positive_env("MAX_BATCH_SIZE", 50)? as usize,
            ..defaults
        };

        let seed_accounts = match std::env::var("API_KEYS") {
            Ok(raw) => parse_seed_accounts(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            host,
            port,
            upstream,
            engine,
            data_dir: non_empty_env("DATA_DIR").map(PathBuf::from),
            seed_accounts,
            admin_token: non_empty_env("ADMIN_TOKEN"),
        })
    }

    /// Create a config with short timings (useful for testing).
    pub fn for_tests(upstream_base_url: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            upstream: UpstreamConfig {
                base_url: upstream_base_url.into(),
                api_key: None,
                timeout: Duration::from_millis(500),
            },
            engine: EngineConfig {
                max_retries: 1,
                retry_base_delay: Duration::from_millis(5),
                retry_max_delay: Duration::from_millis(20),
                poll_interval: Duration::from_millis(10),
                max_poll_duration: Duration::from_millis(300),
                task_retention: Duration::from_secs(60),
                cancel_window: Duration::from_secs(60),
                batch_concurrency: 4,
                max_batch_size: 50,
            },
            data_dir: None,
            seed_accounts: Vec::new(),
            admin_token: None,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn positive_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_env(name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

/// Parse `API_KEYS`: `key` or `key:credits`, comma-separated.
pub fn parse_seed_accounts(raw: &str) -> Result<Vec<(String, u64)>, ConfigError> {
    let mut accounts = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, credits) = match entry.split_once(':') {
            Some((key, credits)) => {
                let credits = credits.trim().parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue("API_KEYS".to_string(), format!("{}: {}", entry, e))
                })?;
                (key.trim(), credits)
            }
            None => (entry, 0),
        };
        if key.is_empty() {
            return Err(ConfigError::InvalidValue(
                "API_KEYS".to_string(),
                format!("empty key in entry '{}'", entry),
            ));
        }
        accounts.push((key.to_string(), credits));
    }
    Ok(accounts)
}
