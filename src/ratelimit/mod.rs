//! Quota tracking, retry decisions and the request gate.
//!
//! One [`RequestGate`] exists per credential. Every remote call made by the
//! commit pipeline and the conflict detector goes through
//! [`RequestGate::execute`], which holds calls while the quota is used up,
//! refreshes [`RateLimitState`] from each response and applies the
//! [`RetryPolicy`] to failures.

mod gate;
mod retry;
mod state;

pub use gate::{GateError, RequestGate};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{QuotaHeaders, RateLimitState};
