//! Retry classification and backoff.
//!
//! Failures classify themselves as a [`RetryDecision`]; the backoff loops in
//! [`crate::transport`] and [`crate::init`] ask a [`BackoffSchedule`] how
//! long to wait before the next try.

use std::time::Duration;

use crate::config::{InitConfig, RetrySettings};

/// What to do after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the exponential schedule.
    Backoff,
    /// Retry after the server-specified delay.
    After(Duration),
    /// Give up.
    Terminal,
}

impl RetryDecision {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

/// Exponential backoff schedule with a retry budget.
///
/// Retry `n` (counting from 0) waits `first * 2^n`, capped at `cap`. With
/// jitter on, the wait is scaled into the upper half of that delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    pub first: Duration,
    pub cap: Duration,
    pub jitter: bool,
    /// Retries allowed after the first attempt.
    pub retries: u32,
}

impl From<&RetrySettings> for BackoffSchedule {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            first: Duration::from_millis(settings.base_backoff_ms),
            cap: Duration::from_millis(settings.max_backoff_ms),
            jitter: settings.jitter,
            retries: settings.max_retries,
        }
    }
}

impl From<&InitConfig> for BackoffSchedule {
    /// `max_init_retry` counts attempts, so the retry budget is one less.
    fn from(settings: &InitConfig) -> Self {
        Self {
            first: Duration::from_millis(settings.base_backoff_ms),
            cap: Duration::from_millis(settings.max_backoff_ms),
            jitter: true,
            retries: settings.max_init_retry.max(1) - 1,
        }
    }
}

impl BackoffSchedule {
    /// Wait before retry number `retry`, or `None` once the budget is spent
    /// or the decision is terminal. `sample` is a uniform draw in `[0, 1]`.
    #[must_use]
    pub fn delay(&self, retry: u32, decision: RetryDecision, sample: f64) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        match decision {
            RetryDecision::Terminal => None,
            RetryDecision::After(wait) => Some(wait),
            RetryDecision::Backoff => {
                let scaled = self.first.saturating_mul(1 << retry.min(20)).min(self.cap);
                if self.jitter {
                    Some(scaled.mul_f64(0.5 + sample.clamp(0.0, 1.0) / 2.0))
                } else {
                    Some(scaled)
                }
            }
        }
    }
}

/// Used for a 429 that carries no `Retry-After`.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

/// Rate limiting waits; server errors back off; every other status,
/// including the remaining 4xx codes, is final.
#[must_use]
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> RetryDecision {
    match status {
        429 => RetryDecision::After(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT)),
        500..=599 => RetryDecision::Backoff,
        _ => RetryDecision::Terminal,
    }
}

/// `Retry-After` in whole seconds.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
