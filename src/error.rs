//! Error taxonomy surfaced to callers of the pipeline and the scheduler.
//!
//! Transport failures ([`RemoteError`]) are classified here once, after the
//! request gate has finished retrying. The classification keeps the last
//! failure's status and message; only the attempt count is added.

use std::time::Duration;

use thiserror::Error;

use crate::autosave::ConflictReport;
use crate::pipeline::ValidationError;
use crate::ratelimit::GateError;
use crate::remote::RemoteError;
use crate::types::CommitSha;

/// Result type alias for pipeline and scheduler operations
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// the change batch was rejected before any remote call
    #[error("invalid change batch: {0}")]
    Validation(#[from] ValidationError),

    /// the branch moved between reading the tip and moving the ref
    #[error("concurrent modification: branch {branch} is no longer at {expected}")]
    ConcurrentModification {
        branch: String,
        expected: CommitSha,
        /// the tip observed instead, when known
        actual: Option<CommitSha>,
    },

    /// quota or secondary limit that could not be waited out
    #[error("rate limited: {message} (waited {waited:?}, {attempts} attempt(s))")]
    RateLimited {
        message: String,
        waited: Duration,
        attempts: u32,
    },

    /// timeouts, connection failures and 5xx responses past the retry ceiling
    #[error("{message} ({attempts} attempt(s))")]
    TransientNetwork {
        message: String,
        status: Option<u16>,
        attempts: u32,
    },

    #[error("offline: no network connectivity")]
    Offline,

    /// 401, or 403 unrelated to rate limiting
    #[error("authentication failed (HTTP {status}): {message}")]
    PermanentAuth { status: u16, message: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    /// any other rejection by the remote
    #[error("remote rejected the request: {message}")]
    Remote {
        message: String,
        status: Option<u16>,
    },

    /// the remote branch diverged from the last known commit
    #[error("conflict: {0}")]
    Conflict(ConflictReport),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// the operation does not apply in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Classify a transport failure that the gate gave up on.
    pub fn from_remote(error: RemoteError, attempts: u32) -> Self {
        let status = error.status_code();
        let message = match &error {
            RemoteError::Status { message, .. } | RemoteError::NonFastForward { message } => {
                message.clone()
            }
            other => other.to_string(),
        };

        if matches!(error, RemoteError::Offline) {
            SyncError::Offline
        } else if error.rate_limit().is_some() {
            SyncError::RateLimited {
                message,
                waited: Duration::ZERO,
                attempts,
            }
        } else if error.is_transient() {
            SyncError::TransientNetwork {
                message,
                status,
                attempts,
            }
        } else if error.is_auth_failure() {
            SyncError::PermanentAuth {
                status: status.unwrap_or(401),
                message,
            }
        } else if error.is_not_found() {
            SyncError::NotFound { what: message }
        } else {
            SyncError::Remote { message, status }
        }
    }

    /// Worth another save cycle without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork { .. } | SyncError::RateLimited { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SyncError::ConcurrentModification { .. } | SyncError::Conflict(_)
        )
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, SyncError::PermanentAuth { .. })
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::Offline)
    }

    /// how many remote attempts were made, for errors that went through the gate
    pub fn attempts(&self) -> Option<u32> {
        match self {
            SyncError::RateLimited { attempts, .. } | SyncError::TransientNetwork { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// Short reason suitable for an error banner.
    pub fn user_reason(&self) -> String {
        match self {
            SyncError::Validation(e) => e.to_string(),
            SyncError::ConcurrentModification { branch, .. } => {
                format!("{} was changed elsewhere; reload before saving", branch)
            }
            SyncError::RateLimited { .. } => {
                "GitHub rate limit reached; try again later".to_string()
            }
            SyncError::TransientNetwork { .. } => {
                "could not reach GitHub; check your connection and retry".to_string()
            }
            SyncError::Offline => "offline".to_string(),
            SyncError::PermanentAuth { .. } => "session expired; sign in again".to_string(),
            SyncError::Conflict(report) => format!(
                "{} remote change(s) conflict with your edits",
                report.records.len()
            ),
            other => other.to_string(),
        }
    }
}

impl From<GateError> for SyncError {
    fn from(error: GateError) -> Self {
        match error {
            GateError::Remote { error, attempts } => SyncError::from_remote(error, attempts),
            GateError::WaitExceeded {
                waited,
                needed,
                attempts,
                last_error,
            } => SyncError::RateLimited {
                message: match last_error {
                    Some(e) => e.to_string(),
                    None => format!("quota exhausted, resets in {}s", needed.as_secs()),
                },
                waited,
                attempts,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RateLimitSignal;

    #[test]
    fn test_classification_keeps_original_status_and_message() {
        let err = SyncError::from_remote(RemoteError::status(503, "Service Unavailable"), 4);
        match err {
            SyncError::TransientNetwork {
                ref message,
                status,
                attempts,
            } => {
                assert_eq!(message, "Service Unavailable");
                assert_eq!(status, Some(503));
                assert_eq!(attempts, 4);
            }
            ref other => panic!("unexpected: {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_and_client_errors() {
        let auth = SyncError::from_remote(RemoteError::status(401, "Bad credentials"), 1);
        assert!(auth.requires_reauth());
        assert!(!auth.is_retryable());

        let invalid = SyncError::from_remote(RemoteError::status(422, "Invalid tree"), 1);
        assert!(matches!(invalid, SyncError::Remote { status: Some(422), .. }));

        let missing = SyncError::from_remote(RemoteError::not_found("Not Found"), 1);
        assert!(matches!(missing, SyncError::NotFound { .. }));

        assert!(SyncError::from_remote(RemoteError::Offline, 0).is_offline());
    }

    #[test]
    fn test_throttled_403_is_not_auth() {
        let err = SyncError::from_remote(
            RemoteError::Status {
                status: 403,
                message: "secondary rate limit".into(),
                rate_limit: Some(RateLimitSignal::Secondary { retry_after: None }),
                quota: None,
            },
            2,
        );
        assert!(matches!(err, SyncError::RateLimited { attempts: 2, .. }));
    }

    #[test]
    fn test_wait_exceeded_becomes_rate_limited() {
        let err = SyncError::from(GateError::WaitExceeded {
            waited: Duration::from_secs(900),
            needed: Duration::from_secs(60),
            attempts: 3,
            last_error: None,
        });
        assert!(matches!(
            err,
            SyncError::RateLimited { attempts: 3, .. }
        ));
        assert!(err.is_retryable());
    }
}
