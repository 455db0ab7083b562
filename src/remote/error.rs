//! Transport-level errors for remote object API calls.
//!
//! These describe what happened on the wire. Whether a failure is retried,
//! waited out, or surfaced is decided by the retry policy, and the mapping
//! into the user-facing taxonomy lives in [`crate::error::SyncError`].

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::QuotaHeaders;

/// Result type alias for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Which throttling mechanism rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSignal {
    /// The hourly quota is used up; wait for the reset time.
    Primary,
    /// Burst throttling; wait `retry_after` when the server says so.
    Secondary { retry_after: Option<Duration> },
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// connection refused, DNS failure, reset mid-body, ...
    #[error("network error: {0}")]
    Network(String),

    /// the per-call deadline expired
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// the host has no connectivity at all
    #[error("no network connectivity")]
    Offline,

    /// the branch could not be moved without discarding its history
    #[error("update is not a fast forward: {message}")]
    NonFastForward { message: String },

    /// any other non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        rate_limit: Option<RateLimitSignal>,
        quota: Option<QuotaHeaders>,
    },

    /// the response body did not have the expected shape
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// A plain status error without rate-limit metadata.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        RemoteError::Status {
            status,
            message: message.into(),
            rate_limit: None,
            quota: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(404, message)
    }

    /// HTTP status code, when the failure came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            RemoteError::NonFastForward { .. } => Some(422),
            _ => None,
        }
    }

    /// Quota metadata carried by a failed response.
    pub fn quota(&self) -> Option<&QuotaHeaders> {
        match self {
            RemoteError::Status { quota, .. } => quota.as_ref(),
            _ => None,
        }
    }

    pub fn rate_limit(&self) -> Option<RateLimitSignal> {
        match self {
            RemoteError::Status { rate_limit, .. } => *rate_limit,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_non_fast_forward(&self) -> bool {
        matches!(self, RemoteError::NonFastForward { .. })
    }

    /// Failures that may succeed if the identical request is sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => true,
            RemoteError::Status {
                status, rate_limit, ..
            } => rate_limit.is_none() && (*status >= 500 || *status == 408),
            _ => false,
        }
    }

    /// 401, or 403 that is not a throttling response.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            RemoteError::Status {
                status, rate_limit, ..
            } => rate_limit.is_none() && (*status == 401 || *status == 403),
            _ => false,
        }
    }
}
