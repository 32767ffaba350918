//! Application configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

use crate::{AppError, AppResult};

/// Application configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// Redis configuration.
    #[serde(default)]
    pub redis: RedisConfig,
    /// Scheduler and worker pool settings.
    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerSettings,
    /// Retry/backoff defaults for publish attempts.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,
    /// Sliding window limits keyed by platform name.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, PlatformLimit>,
    /// Media resolution settings.
    #[serde(default)]
    pub media: MediaConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Scheduler and worker pool settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SchedulerSettings {
    /// Queue name. Job keys live under `{prefix}:{queue}` so independent
    /// pipelines can share one store; rate windows stay shared.
    #[serde(default = "default_queue_name")]
    #[validate(length(min = 1))]
    pub queue: String,
    /// Maximum number of concurrently executing jobs.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1))]
    pub concurrency: usize,
    /// How often the dispatcher looks for due jobs, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    /// How long completed job records are kept, in seconds.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
    /// How long failed job records are kept, in seconds.
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
    /// Claims older than this are considered stalled, in seconds.
    #[serde(default = "default_stall_timeout_secs")]
    #[validate(range(min = 1))]
    pub stall_timeout_secs: u64,
    /// How often retention purge and stall reaping run, in seconds.
    #[serde(default = "default_maintenance_interval_secs")]
    #[validate(range(min = 1))]
    pub maintenance_interval_secs: u64,
}

/// Retry/backoff settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the exponential part of the delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Sliding window limit for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Validate)]
pub struct PlatformLimit {
    /// Requests allowed per window.
    #[validate(range(min = 1))]
    pub capacity: u32,
    /// Window length in seconds.
    #[validate(range(min = 1))]
    pub window_secs: u64,
}

/// Media resolution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Directory for downloaded media.
    #[serde(default = "default_media_temp_dir")]
    pub temp_dir: PathBuf,
    /// Download timeout in seconds.
    #[serde(default = "default_media_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_prefix() -> String {
    "cadence".to_string()
}

fn default_queue_name() -> String {
    "publish".to_string()
}

const fn default_concurrency() -> usize {
    5
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_completed_retention_secs() -> u64 {
    3600
}

const fn default_failed_retention_secs() -> u64 {
    7 * 24 * 3600
}

const fn default_stall_timeout_secs() -> u64 {
    15 * 60
}

const fn default_maintenance_interval_secs() -> u64 {
    60
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_media_temp_dir() -> PathBuf {
    std::env::temp_dir().join("cadence-media")
}

const fn default_media_fetch_timeout_secs() -> u64 {
    60
}

fn default_log_filter() -> String {
    "cadence=info".to_string()
}

/// Platform publishing limits. These mirror the documented posting quotas of
/// each platform and can be overridden per deployment.
fn default_rate_limits() -> HashMap<String, PlatformLimit> {
    const HOUR: u64 = 3600;
    const DAY: u64 = 24 * HOUR;

    [
        ("twitter", 300, 3 * HOUR),
        ("linkedin", 100, DAY),
        ("facebook", 200, HOUR),
        ("instagram", 25, DAY),
        ("bluesky", 1666, HOUR),
        ("mastodon", 300, 300),
        ("threads", 250, DAY),
    ]
    .into_iter()
    .map(|(platform, capacity, window_secs)| {
        (
            platform.to_string(),
            PlatformLimit {
                capacity,
                window_secs,
            },
        )
    })
    .collect()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            prefix: default_redis_prefix(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            queue: default_queue_name(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            completed_retention_secs: default_completed_retention_secs(),
            failed_retention_secs: default_failed_retention_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl SchedulerSettings {
    /// Dispatcher poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retention for completed job records.
    #[must_use]
    pub const fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    /// Retention for failed job records.
    #[must_use]
    pub const fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    /// Age after which a claim counts as stalled.
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Interval between maintenance passes.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl PlatformLimit {
    /// Window length as a duration.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_media_temp_dir(),
            fetch_timeout_secs: default_media_fetch_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            scheduler: SchedulerSettings::default(),
            retry: RetrySettings::default(),
            rate_limits: default_rate_limits(),
            media: MediaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `CADENCE_ENV`)
    /// 4. Environment variables with `CADENCE__` prefix
    pub fn load() -> AppResult<Self> {
        // A missing .env file is the normal case outside development.
        let _ = dotenvy::dotenv();

        let env = std::env::var("CADENCE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate_all()?;
        Ok(config)
    }

    /// Validate every section, including each platform limit.
    pub fn validate_all(&self) -> AppResult<()> {
        self.validate()?;
        for (platform, limit) in &self.rate_limits {
            limit
                .validate()
                .map_err(|e| AppError::Validation(format!("rate_limits.{platform}: {e}")))?;
        }
        Ok(())
    }
}
