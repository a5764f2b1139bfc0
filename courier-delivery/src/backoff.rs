//! Reconnect delays for destinations in POLLING state.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

const fn default_max_delay_ms() -> u64 {
    300_000 // 5 minutes
}

const fn default_jitter() -> f64 {
    0.1 // ±10%
}

/// How the reconnect delay grows with consecutive failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub enum BackoffPolicy {
    /// Always wait the configured delay.
    #[default]
    Fixed,

    /// `min(delay * 2^(attempt - 1), max_delay) * (1 ± jitter)`
    Exponential {
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
        #[serde(default = "default_jitter")]
        jitter: f64,
    },
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-indexed) given the base
    /// `delay`.
    #[must_use]
    pub fn delay_for(&self, delay: Duration, attempt: u32) -> Duration {
        match *self {
            Self::Fixed => delay,
            Self::Exponential {
                max_delay_ms,
                jitter,
            } => exponential(delay, attempt, Duration::from_millis(max_delay_ms), jitter),
        }
    }

    /// Jitter must stay within `0.0..=1.0`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Fixed => true,
            Self::Exponential { jitter, .. } => (0.0..=1.0).contains(&jitter),
        }
    }
}

fn exponential(base: Duration, attempt: u32, max_delay: Duration, jitter_factor: f64) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 31 {
        max_delay
    } else {
        base.saturating_mul(1u32 << exponent).min(max_delay)
    };

    if jitter_factor <= 0.0 {
        return delay;
    }

    let millis = delay.as_secs_f64() * 1000.0;
    let range = millis * jitter_factor;
    let jitter: f64 = rand::rng().random_range(-range..=range);

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Clamped to a non-negative millisecond count"
    )]
    Duration::from_millis((millis + jitter).max(0.0) as u64)
}
