use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how patiently a client operation is retried.
///
/// `max_attempts` of `None` retries forever. The delay before retry `n`
/// (1-based) is `initial_backoff_ms * multiplier^(n-1)`, capped at
/// `max_backoff_ms`. The default is unbounded with a fixed one second
/// backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::unbounded(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn unbounded(backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: None,
            initial_backoff_ms: backoff.as_millis() as u64,
            max_backoff_ms: backoff.as_millis() as u64,
            multiplier: 1.0,
        }
    }

    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts),
            ..RetryPolicy::unbounded(backoff)
        }
    }

    pub fn exponential(max_attempts: Option<u32>, initial: Duration, max: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: initial.as_millis() as u64,
            max_backoff_ms: max.as_millis() as u64,
            multiplier: 2.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Delay before retry number `attempt`, counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let cap = self.max_backoff_ms.max(self.initial_backoff_ms) as f64;
        let millis = (self.initial_backoff_ms as f64 * factor).min(cap);
        Duration::from_millis(millis as u64)
    }
}
