//! # Retry Decisions
//!
//! A [`RetryDecision`] answers three questions for a transient failure: whether
//! to retry now or later, how much later, and which pending status the object
//! returns to. [`BackoffPolicy`] computes exponential delays for processors that
//! do not supply their own.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::BackoffConfig;
use crate::state_machine::Status;

/// When a retried object becomes claimable again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "delay")]
pub enum RetryDelay {
    /// Reclaimable in the next poll cycle
    Immediate,
    /// Reclaimable once the delay has elapsed
    After(Duration),
}

/// Decision for a transient failure with attempts remaining
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub target_status: Status,
    pub delay: RetryDelay,
}

impl RetryDecision {
    pub fn immediate(target_status: Status) -> Self {
        Self {
            target_status,
            delay: RetryDelay::Immediate,
        }
    }

    pub fn delayed(target_status: Status, delay: Duration) -> Self {
        Self {
            target_status,
            delay: RetryDelay::After(delay),
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.delay, RetryDelay::Immediate)
    }

    /// The `next_processed` value to persist: `None` for immediate retries
    pub fn next_processed(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.delay {
            RetryDelay::Immediate => None,
            RetryDelay::After(delay) => Some(saturating_after(now, delay)),
        }
    }
}

/// `now + delay`, saturating at the latest representable instant
pub(crate) fn saturating_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - delay`, or `None` when that precedes the earliest representable instant
pub(crate) fn checked_before(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
}

/// Exponential backoff: `base * multiplier^(attempt - 1)`, capped, optionally jittered
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Option<f64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config
                .jitter_enabled
                .then_some(config.jitter_max_percentage.clamp(0.0, 1.0))
                .filter(|j| *j > 0.0),
        }
    }

    /// Deterministic policy without jitter
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            jitter: None,
        }
    }

    /// Fixed delay for every attempt
    pub fn fixed(delay: Duration) -> Self {
        Self::exponential(delay, 1.0, delay)
    }

    /// Delay before the retry following attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 62);
        let factor = self.multiplier.powi(exponent);
        let raw = self.base_delay.as_secs_f64() * factor;
        let capped = if raw.is_finite() {
            Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };

        match self.jitter {
            Some(max_jitter) => {
                let jitter = rand::thread_rng().gen_range(0.0..=max_jitter);
                capped.mul_f64(1.0 - jitter)
            }
            None => capped,
        }
    }

    /// Retry decision targeting `target_status` after the backoff for `attempt`
    pub fn decide(&self, target_status: Status, attempt: i32) -> RetryDecision {
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            RetryDecision::immediate(target_status)
        } else {
            RetryDecision::delayed(target_status, delay)
        }
    }
}
