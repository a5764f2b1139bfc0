use std::time::Duration;

use courier_queue::PeekLimit;
use serde::Deserialize;

use crate::{BackoffPolicy, ConfigError, EscalationConfig};

const fn default_retries() -> i32 {
    -1 // forever
}

const fn default_delay_ms() -> i64 {
    5_000
}

const fn default_ping_interval_ms() -> i64 {
    10_000
}

const fn default_instant_retry_ms() -> u64 {
    400
}

const fn default_burst_limit() -> i64 {
    -1
}

const fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Interceptor used when a destination does not name one.
pub const DEFAULT_INTERCEPTOR: &str = "Default,1.0";

/// Delivery behaviour of one destination.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchConfig {
    /// Consecutive transport failures tolerated before the destination goes
    /// DEAD. Negative retries forever.
    #[serde(default = "default_retries")]
    pub retries: i32,

    /// Base reconnect delay (in milliseconds)
    ///
    /// Zero or negative disables the automatic reconnect timer; only
    /// `retry_now` probes the destination then.
    ///
    /// Default: 5000
    #[serde(default = "default_delay_ms")]
    pub delay_ms: i64,

    /// How often an ALIVE destination is pinged (in milliseconds)
    ///
    /// Zero or negative disables pinging.
    ///
    /// Default: 10000
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: i64,

    /// Delay of the first reconnect attempt after leaving ALIVE (in
    /// milliseconds)
    ///
    /// Default: 400
    #[serde(default = "default_instant_retry_ms")]
    pub instant_retry_ms: u64,

    /// Growth of the reconnect delay with consecutive failures
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// How long a scheduled worker waits before peeking, letting publishers
    /// fill a larger batch (in milliseconds)
    ///
    /// Default: 0 (drain immediately)
    #[serde(default)]
    pub collect_time_ms: u64,

    /// Maximum entries per batch, negative for no limit
    #[serde(default = "default_burst_limit")]
    pub burst_max_entries: i64,

    /// Maximum payload bytes per batch, negative for no limit
    #[serde(default = "default_burst_limit")]
    pub burst_max_bytes: i64,

    /// Delivery interceptor as `"name,version"`, [`DEFAULT_INTERCEPTOR`] if
    /// unset
    #[serde(default)]
    pub interceptor: Option<String>,

    /// What happens to entries that cannot be delivered
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// How long `shutdown` waits for an in-flight batch (in seconds)
    ///
    /// Default: 30
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            delay_ms: default_delay_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            instant_retry_ms: default_instant_retry_ms(),
            backoff: BackoffPolicy::default(),
            collect_time_ms: 0,
            burst_max_entries: default_burst_limit(),
            burst_max_bytes: default_burst_limit(),
            interceptor: None,
            escalation: EscalationConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl DispatchConfig {
    /// Check values serde cannot reject on its own.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff.is_valid() {
            return Err(ConfigError::Invalid {
                field: "backoff",
                reason: "jitter must be between 0.0 and 1.0".to_string(),
            });
        }

        if let Some(key) = &self.interceptor
            && !key.contains(',')
        {
            return Err(ConfigError::Invalid {
                field: "interceptor",
                reason: format!("'{key}' is not of the form 'name,version'"),
            });
        }

        if self.burst_max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "burst_max_entries",
                reason: "a batch must hold at least one entry".to_string(),
            });
        }

        Ok(())
    }

    /// The reconnect delay, or `None` if automatic reconnects are disabled.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        positive_millis(self.delay_ms)
    }

    /// The ping interval, or `None` if pinging is disabled.
    #[must_use]
    pub fn ping_interval(&self) -> Option<Duration> {
        positive_millis(self.ping_interval_ms)
    }

    #[must_use]
    pub const fn instant_retry(&self) -> Duration {
        Duration::from_millis(self.instant_retry_ms)
    }

    #[must_use]
    pub const fn collect_time(&self) -> Duration {
        Duration::from_millis(self.collect_time_ms)
    }

    #[must_use]
    pub fn burst_limit(&self) -> PeekLimit {
        PeekLimit::from_signed(self.burst_max_entries, self.burst_max_bytes)
    }

    #[must_use]
    pub fn interceptor_key(&self) -> &str {
        self.interceptor.as_deref().unwrap_or(DEFAULT_INTERCEPTOR)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn positive_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|&millis| millis > 0)
        .map(Duration::from_millis)
}
