//! Matching service configuration
//!
//! All knobs of the matching engine live in [`MatchingConfig`]. Values can be
//! built in code with the `with_*` methods or loaded from `MATCHING_*`
//! environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Configuration for the matching engine and its handler
///
/// # Example
///
/// ```
/// use everruns_matching::MatchingConfig;
/// use std::time::Duration;
///
/// let config = MatchingConfig::default()
///     .with_sync_match_wait(Duration::from_millis(20))
///     .with_rps(500);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchingConfig {
    /// Host-level admission rate (requests per second)
    pub rps: u32,

    /// How long a producer waits for a poller before persisting its task
    #[serde(with = "duration_millis")]
    pub sync_match_wait: Duration,

    /// Longest deadline accepted on long-poll and query calls
    #[serde(with = "duration_millis")]
    pub max_long_poll_timeout: Duration,

    /// Deadlines shorter than this are accepted but logged
    #[serde(with = "duration_millis")]
    pub critical_long_poll_timeout: Duration,

    /// Backlog page size, also the capacity of the in-memory backlog buffer
    pub read_batch_size: usize,

    /// Period of the idle task list sweep
    #[serde(with = "duration_millis")]
    pub idle_check_interval: Duration,

    /// Idle time after which a task list manager may be unloaded
    #[serde(with = "duration_millis")]
    pub max_task_list_idle_time: Duration,

    /// Number of task IDs in one lease range
    pub range_size: i64,

    /// Estimated backlog depth at which new tasks are refused
    #[serde(default)]
    pub max_backlog_size: Option<u64>,

    /// Maximum accepted task list name length
    pub max_task_list_name_length: usize,

    /// How long a poller stays visible in `DescribeTaskList`
    #[serde(with = "duration_millis")]
    pub poller_history_ttl: Duration,

    /// Maximum number of pollers remembered per task list
    pub poller_history_capacity: usize,

    /// Backoff used when reading the backlog fails
    pub read_retry: RetryPolicy,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            rps: 1200,
            sync_match_wait: Duration::from_millis(50),
            max_long_poll_timeout: Duration::from_secs(300),
            critical_long_poll_timeout: Duration::from_secs(2),
            read_batch_size: 100,
            idle_check_interval: Duration::from_secs(60),
            max_task_list_idle_time: Duration::from_secs(300),
            range_size: 100_000,
            max_backlog_size: None,
            max_task_list_name_length: 1000,
            poller_history_ttl: Duration::from_secs(300),
            poller_history_capacity: 1000,
            read_retry: RetryPolicy::exponential()
                .with_initial_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_secs(10))
                .with_max_attempts(u32::MAX),
        }
    }
}

impl MatchingConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional, defaults otherwise):
    /// - `MATCHING_RPS`
    /// - `MATCHING_SYNC_MATCH_WAIT_MS`
    /// - `MATCHING_MAX_LONG_POLL_TIMEOUT_MS`
    /// - `MATCHING_READ_BATCH_SIZE`
    /// - `MATCHING_IDLE_CHECK_INTERVAL_MS`
    /// - `MATCHING_MAX_TASK_LIST_IDLE_TIME_MS`
    /// - `MATCHING_MAX_BACKLOG_SIZE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rps: env_parse("MATCHING_RPS").unwrap_or(defaults.rps),
            sync_match_wait: env_millis("MATCHING_SYNC_MATCH_WAIT_MS")
                .unwrap_or(defaults.sync_match_wait),
            max_long_poll_timeout: env_millis("MATCHING_MAX_LONG_POLL_TIMEOUT_MS")
                .unwrap_or(defaults.max_long_poll_timeout),
            read_batch_size: env_parse("MATCHING_READ_BATCH_SIZE")
                .unwrap_or(defaults.read_batch_size),
            idle_check_interval: env_millis("MATCHING_IDLE_CHECK_INTERVAL_MS")
                .unwrap_or(defaults.idle_check_interval),
            max_task_list_idle_time: env_millis("MATCHING_MAX_TASK_LIST_IDLE_TIME_MS")
                .unwrap_or(defaults.max_task_list_idle_time),
            max_backlog_size: env_parse("MATCHING_MAX_BACKLOG_SIZE").or(defaults.max_backlog_size),
            ..defaults
        }
    }

    /// Set the host admission rate
    pub fn with_rps(mut self, rps: u32) -> Self {
        self.rps = rps;
        self
    }

    /// Set the sync-match wait window
    pub fn with_sync_match_wait(mut self, wait: Duration) -> Self {
        self.sync_match_wait = wait;
        self
    }

    /// Set the longest accepted long-poll deadline
    pub fn with_max_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.max_long_poll_timeout = timeout;
        self
    }

    /// Set the backlog page size
    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size.max(1);
        self
    }

    /// Set the idle sweep period
    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    /// Set the idle time after which a task list may be unloaded
    pub fn with_max_task_list_idle_time(mut self, idle: Duration) -> Self {
        self.max_task_list_idle_time = idle;
        self
    }

    /// Refuse new tasks once the estimated backlog reaches `size`
    pub fn with_max_backlog_size(mut self, size: u64) -> Self {
        self.max_backlog_size = Some(size);
        self
    }

    /// Set the poller history retention
    pub fn with_poller_history_ttl(mut self, ttl: Duration) -> Self {
        self.poller_history_ttl = ttl;
        self
    }

    /// Set the backlog read retry policy
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rps == 0 {
            return Err(ConfigError::Invalid("rps must be positive".into()));
        }
        if self.range_size <= 0 {
            return Err(ConfigError::Invalid("range_size must be positive".into()));
        }
        if self.critical_long_poll_timeout > self.max_long_poll_timeout {
            return Err(ConfigError::Invalid(
                "critical_long_poll_timeout must not exceed max_long_poll_timeout".into(),
            ));
        }
        if self.idle_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "idle_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another
    #[error("invalid matching configuration: {0}")]
    Invalid(String),
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
