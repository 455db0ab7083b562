//! Retry decisions for failed remote calls.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::remote::{RateLimitSignal, RemoteError};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off for `delay`, then try again. Counts against the budget.
    Retry { delay: Duration },
    /// Throttled: hold until the quota window (or `retry_after`) passes.
    /// Does not count against the budget.
    WaitForQuota { retry_after: Option<Duration> },
    /// Surface the error.
    GiveUp,
}

/// Exponential backoff with jitter.
///
/// `delay = min(max_delay, base_delay * 2^attempt) * uniform(0.5, 1.5)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries transient failures.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Decide what follows failure number `failures` (0-based) with `error`.
    pub fn decide(&self, failures: u32, error: &RemoteError) -> RetryDecision {
        if let Some(signal) = error.rate_limit() {
            let retry_after = match signal {
                RateLimitSignal::Secondary { retry_after } => retry_after,
                RateLimitSignal::Primary => None,
            };
            return RetryDecision::WaitForQuota { retry_after };
        }

        if error.is_transient() && failures < self.max_retries {
            return RetryDecision::Retry {
                delay: self.backoff(failures),
            };
        }

        RetryDecision::GiveUp
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        self.backoff_with_factor(attempt, factor)
    }

    /// Deterministic part of [`backoff`](Self::backoff).
    pub fn backoff_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let exponential = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay);
        exponential.min(self.max_delay).mul_f64(factor)
    }
}
