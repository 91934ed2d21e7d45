//! Configuration management for acton-queue
//!
//! Configuration is loaded from multiple sources with clear precedence:
//!
//! 1. Environment variables (highest priority, `ACTON_QUEUE_` prefix, `__` for nesting)
//! 2. `./config.toml` (development)
//! 3. `~/.config/acton-queue/{service_name}/config.toml` (user config, XDG)
//! 4. `/etc/acton-queue/{service_name}/config.toml` (system config)
//! 5. Hardcoded defaults (fallback)
//!
//! Environment variable format: `ACTON_QUEUE_SECTION__FIELD_NAME`, for
//! example `ACTON_QUEUE_POOL__RPM=120`.
//!
//! # Example Configuration
//!
//! ```toml
//! [store]
//! redis_url = "redis://127.0.0.1:6379"
//! key_prefix = "acton:queue"
//!
//! [admission]
//! default_concurrency = 3
//! timeout_secs = 15
//!
//! [admission.concurrency]
//! start = 2
//!
//! [pool]
//! rpm = 200
//! concurrency = 10
//!
//! [batcher]
//! stability_window_ms = 3000
//! ```

use crate::error::{QueueError, QueueResult};
use crate::jobs::{JobKind, StateTtls};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Redis connection URL
    pub redis_url: String,

    /// Prefix for every key this crate writes
    pub key_prefix: String,

    /// Maximum pooled connections
    pub pool_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "acton:queue".to_string(),
            pool_size: 16,
        }
    }
}

/// Admission queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSettings {
    /// Concurrency cap for kinds without an override
    pub default_concurrency: usize,

    /// Per-kind overrides, keyed by lowercase kind name
    pub concurrency: BTreeMap<String, usize>,

    /// Seconds an admitted job may stay active before it is force-failed
    pub timeout_secs: u64,

    /// TTL of completed records, in seconds
    pub completed_ttl_secs: u64,

    /// TTL of failed records, in seconds
    pub failed_ttl_secs: u64,

    /// TTL of waiting/active records, in seconds
    pub pending_ttl_secs: u64,

    /// Finished records older than this are purged by maintenance
    pub retention_hours: u64,

    /// Hours between maintenance runs
    pub cleanup_interval_hours: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        let ttls = StateTtls::default();
        Self {
            default_concurrency: 3,
            concurrency: BTreeMap::new(),
            timeout_secs: 15,
            completed_ttl_secs: ttls.completed.as_secs(),
            failed_ttl_secs: ttls.failed.as_secs(),
            pending_ttl_secs: ttls.pending.as_secs(),
            retention_hours: 12,
            cleanup_interval_hours: 4,
        }
    }
}

impl AdmissionSettings {
    /// Concurrency cap for `kind`. `None` means the kind never waits.
    #[must_use]
    pub fn cap_for(&self, kind: JobKind) -> Option<usize> {
        if kind == JobKind::Delete {
            return None;
        }
        Some(
            self.concurrency
                .get(kind.as_str())
                .copied()
                .unwrap_or(self.default_concurrency),
        )
    }

    /// Admission timeout window.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Record TTLs per state.
    #[must_use]
    pub const fn ttls(&self) -> StateTtls {
        StateTtls {
            completed: Duration::from_secs(self.completed_ttl_secs),
            failed: Duration::from_secs(self.failed_ttl_secs),
            pending: Duration::from_secs(self.pending_ttl_secs),
        }
    }

    /// Retention window for finished records.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    /// Interval between maintenance runs.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 3600)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Requests-per-minute ceiling, shared by every process
    pub rpm: u32,

    /// Maximum jobs in flight, shared by every process
    pub concurrency: usize,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Backoff before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Backoff ceiling, in milliseconds
    pub max_delay_ms: u64,

    /// Upper bound of the random backoff stretch (0.3 = up to +30%)
    pub jitter: f64,

    /// Per-attempt timeout, in seconds
    pub request_timeout_secs: u64,

    /// Pump back-off when nothing can be claimed, in milliseconds
    pub poll_interval_ms: u64,

    /// Per-minute units the immediate path may not use
    pub immediate_reserve: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            rpm: 200,
            concurrency: 10,
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.3,
            request_timeout_secs: 30,
            poll_interval_ms: 1000,
            immediate_reserve: 0,
        }
    }
}

impl PoolSettings {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Pump back-off.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Conversation batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherSettings {
    /// Quiet period the buffer must survive unchanged, in milliseconds
    pub stability_window_ms: u64,

    /// Delay before re-checking a buffer that grew during a run, in milliseconds
    pub settle_delay_ms: u64,

    /// Buffer TTL, refreshed on every push, in seconds
    pub buffer_ttl_secs: u64,

    /// Safety TTL on the busy flag, in seconds
    pub busy_ttl_secs: u64,

    /// Seconds between sweeps for stranded buffers
    pub watchdog_interval_secs: u64,

    /// Joins message texts into the batch text
    pub separator: String,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            stability_window_ms: 3000,
            settle_delay_ms: 500,
            buffer_ttl_secs: 3600,
            busy_ttl_secs: 600,
            watchdog_interval_secs: 60,
            separator: "\n".to_string(),
        }
    }
}

impl BatcherSettings {
    /// Stability window.
    #[must_use]
    pub const fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    /// Settle delay.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Buffer TTL.
    #[must_use]
    pub const fn buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_ttl_secs)
    }

    /// Busy flag TTL.
    #[must_use]
    pub const fn busy_ttl(&self) -> Duration {
        Duration::from_secs(self.busy_ttl_secs)
    }

    /// How often a running batch extends its busy flag: a third of the TTL,
    /// at least one second.
    #[must_use]
    pub fn busy_heartbeat(&self) -> Duration {
        (self.busy_ttl() / 3).max(Duration::from_secs(1))
    }

    /// Watchdog period.
    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

/// HTTP executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Endpoint jobs are POSTed to
    pub endpoint: Option<String>,

    /// Bearer token sent with every request
    pub api_key: Option<String>,

    /// Client-side request timeout, in seconds
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-oriented
    #[default]
    Pretty,
    /// Single-line text
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Output format
    pub format: LogFormat,

    /// Filter used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            format: if cfg!(debug_assertions) {
                LogFormat::Pretty
            } else {
                LogFormat::Json
            },
            filter: "info,acton_queue=debug".to_string(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Shared store
    pub store: StoreSettings,
    /// Admission queue
    pub admission: AdmissionSettings,
    /// Worker pool
    pub pool: PoolSettings,
    /// Conversation batcher
    pub batcher: BatcherSettings,
    /// HTTP executor
    pub http: HttpSettings,
    /// Logging
    pub observability: ObservabilitySettings,
}

impl QueueConfig {
    /// Load configuration for a service.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file cannot be parsed, a value has
    /// the wrong type, or the merged configuration fails [`Self::validate`].
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use acton_queue::config::QueueConfig;
    ///
    /// # fn example() -> anyhow::Result<()> {
    /// let config = QueueConfig::load_for_service("session-gateway")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn load_for_service(service_name: &str) -> anyhow::Result<Self> {
        let mut figment = Figment::new().merge(Toml::string(&toml::to_string(&Self::default())?));

        let system_config = PathBuf::from("/etc/acton-queue")
            .join(service_name)
            .join("config.toml");
        if system_config.exists() {
            figment = figment.merge(Toml::file(&system_config));
        }

        let user_config = Self::recommended_path(service_name);
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }

        let local_config = PathBuf::from("./config.toml");
        if local_config.exists() {
            figment = figment.merge(Toml::file(&local_config));
        }

        figment = figment.merge(Env::prefixed("ACTON_QUEUE_").split("__").lowercase(true));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honouring the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the result is invalid.
    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::string(&toml::to_string(&Self::default())?))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ACTON_QUEUE_").split("__").lowercase(true))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// XDG config path for a service.
    #[must_use]
    pub fn recommended_path(service_name: &str) -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from("./config.toml"),
            |config_dir| {
                config_dir
                    .join("acton-queue")
                    .join(service_name)
                    .join("config.toml")
            },
        )
    }

    /// Reject settings the queues cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Config`] naming the first bad value.
    pub fn validate(&self) -> QueueResult<()> {
        if self.pool.rpm == 0 {
            return Err(QueueError::Config("pool.rpm must be positive".into()));
        }
        if self.pool.concurrency == 0 {
            return Err(QueueError::Config("pool.concurrency must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.pool.jitter) {
            return Err(QueueError::Config("pool.jitter must be within 0..=1".into()));
        }
        if self.pool.immediate_reserve >= self.pool.rpm {
            return Err(QueueError::Config(
                "pool.immediate_reserve must leave part of pool.rpm for the immediate path".into(),
            ));
        }
        for (kind, cap) in &self.admission.concurrency {
            if kind.parse::<JobKind>().is_err() {
                return Err(QueueError::Config(format!("unknown job kind in admission.concurrency: {kind}")));
            }
            if *cap == 0 {
                return Err(QueueError::Config(format!("admission.concurrency.{kind} must be positive")));
            }
        }
        if self.admission.default_concurrency == 0 {
            return Err(QueueError::Config("admission.default_concurrency must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.pool.rpm, 200);
        assert_eq!(config.pool.concurrency, 10);
        assert_eq!(config.admission.timeout(), Duration::from_secs(15));
        assert_eq!(config.batcher.stability_window(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cap_overrides_and_delete_bypass() {
        let mut admission = AdmissionSettings::default();
        admission.concurrency.insert("start".into(), 1);

        assert_eq!(admission.cap_for(JobKind::Start), Some(1));
        assert_eq!(admission.cap_for(JobKind::Stop), Some(3));
        assert_eq!(admission.cap_for(JobKind::Delete), None);
    }

    #[test]
    fn test_defaults_survive_toml() {
        let raw = toml::to_string(&QueueConfig::default()).unwrap();
        let config: QueueConfig = Figment::new().merge(Toml::string(&raw)).extract().unwrap();
        assert_eq!(config.batcher.separator, "\n");
        assert_eq!(config.admission.retention(), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_env_overrides_nested_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ACTON_QUEUE_POOL__RPM", "120");
            jail.set_env("ACTON_QUEUE_ADMISSION__CONCURRENCY__START", "2");
            let config = QueueConfig::load_for_service("test-service")
                .map_err(|e| e.to_string())?;
            assert_eq!(config.pool.rpm, 120);
            assert_eq!(config.admission.cap_for(JobKind::Start), Some(2));
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_unknown_kind() {
        let mut config = QueueConfig::default();
        config.admission.concurrency.insert("reboot".into(), 2);
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_reserve_swallowing_budget() {
        let mut config = QueueConfig::default();
        config.pool.immediate_reserve = 200;
        assert!(config.validate().is_err());
    }
}
