//! The request gate: one quota bucket per credential.

use std::future::Future;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::remote::{ApiResponse, RemoteError, RemoteResult};

use super::retry::{RetryDecision, RetryPolicy};
use super::state::{QuotaHeaders, RateLimitState};

/// Hold time after a rate-limit rejection that names no reset time.
const FALLBACK_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GateError {
    /// the request failed and the policy gave up; `error` is the last failure
    #[error("{error} (after {attempts} attempt(s))")]
    Remote { error: RemoteError, attempts: u32 },

    /// holding for the quota would exceed the configured maximum wait
    #[error("rate limited: waited {waited:?}, another {needed:?} needed")]
    WaitExceeded {
        waited: Duration,
        needed: Duration,
        attempts: u32,
        last_error: Option<RemoteError>,
    },
}

impl GateError {
    pub fn attempts(&self) -> u32 {
        match self {
            GateError::Remote { attempts, .. } | GateError::WaitExceeded { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The underlying remote failure, if the gate got as far as sending.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            GateError::Remote { error, .. } => Some(error),
            GateError::WaitExceeded { last_error, .. } => last_error.as_ref(),
        }
    }
}

/// Paces every remote call against the shared quota.
///
/// Calls are dispatched one at a time in arrival order. When the quota is
/// exhausted the head of the queue sleeps until the reset time and the
/// rest wait behind it, so nothing is sent that the server would reject.
#[derive(Debug)]
pub struct RequestGate {
    state: Mutex<RateLimitState>,
    /// FIFO dispatch slot
    dispatch: tokio::sync::Mutex<()>,
    policy: RetryPolicy,
    call_timeout: Duration,
    max_rate_limit_wait: Duration,
    clock: Clock,
}

impl RequestGate {
    pub fn new(policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RateLimitState::new()),
            dispatch: tokio::sync::Mutex::new(()),
            policy,
            call_timeout,
            max_rate_limit_wait: RetryConfig::default().max_rate_limit_wait,
            clock: Clock::system(),
        }
    }

    pub fn from_config(retry: &RetryConfig, call_timeout: Duration) -> Self {
        Self::new(RetryPolicy::from(retry), call_timeout)
            .with_max_rate_limit_wait(retry.max_rate_limit_wait)
    }

    pub fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Current view of the quota.
    pub fn snapshot(&self) -> RateLimitState {
        self.state.lock().clone()
    }

    /// Feed quota metadata obtained outside the gate.
    pub fn observe_quota(&self, quota: &QuotaHeaders) {
        self.state.lock().update(quota);
    }

    /// Run `request` through the gate, retrying per the policy.
    ///
    /// `request` is invoked once per attempt. `operation` names the call in
    /// logs.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T, GateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<ApiResponse<T>>>,
    {
        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut waited = Duration::ZERO;
        let mut last_error: Option<RemoteError> = None;

        loop {
            let outcome = {
                let _slot = self.dispatch.lock().await;

                while let Some(wait) = self.pending_wait() {
                    if waited + wait > self.max_rate_limit_wait {
                        warn!(operation, waited_ms = waited.as_millis() as u64, needed_ms = wait.as_millis() as u64, "rate limit wait exceeds maximum");
                        return Err(GateError::WaitExceeded {
                            waited,
                            needed: wait,
                            attempts,
                            last_error,
                        });
                    }
                    info!(operation, wait_ms = wait.as_millis() as u64, "quota exhausted, holding until reset");
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }

                self.state.lock().record_dispatch();
                attempts += 1;

                let outcome = match tokio::time::timeout(self.call_timeout, request()).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout(self.call_timeout)),
                };
                self.refresh(&outcome);
                outcome
            };

            let error = match outcome {
                Ok(response) => return Ok(response.body),
                Err(error) => error,
            };

            match self.policy.decide(failures, &error) {
                RetryDecision::WaitForQuota { retry_after } => {
                    let until = self.rate_limit_deadline(&error, retry_after);
                    warn!(operation, attempt = attempts, until = %until, "rate limited, rescheduling");
                    self.state.lock().block_until(until);
                    last_error = Some(error);
                }
                RetryDecision::Retry { delay } => {
                    failures += 1;
                    warn!(
                        operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(error);
                }
                RetryDecision::GiveUp => {
                    debug!(operation, attempts, error = %error, "giving up");
                    return Err(GateError::Remote { error, attempts });
                }
            }
        }
    }

    fn pending_wait(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.state
            .lock()
            .wait_duration(now)
            .filter(|wait| !wait.is_zero())
    }

    fn refresh<T>(&self, outcome: &RemoteResult<ApiResponse<T>>) {
        let quota = match outcome {
            Ok(response) => response.quota.as_ref(),
            Err(error) => error.quota(),
        };
        if let Some(quota) = quota {
            debug!(
                limit = quota.limit,
                remaining = quota.remaining,
                reset_at = %quota.reset_at,
                "quota refreshed"
            );
            self.state.lock().update(quota);
        }
    }

    /// When a rate-limited call may be sent again.
    fn rate_limit_deadline(
        &self,
        error: &RemoteError,
        retry_after: Option<Duration>,
    ) -> chrono::DateTime<chrono::Utc> {
        let now = self.clock.now();
        if let Some(after) = retry_after {
            return now + ChronoDuration::from_std(after).unwrap_or_else(|_| ChronoDuration::seconds(60));
        }
        match error.quota().map(|q| q.reset_at) {
            Some(reset_at) if reset_at > now => reset_at,
            _ => now + ChronoDuration::seconds(FALLBACK_RATE_LIMIT_WAIT.as_secs() as i64),
        }
    }
}
