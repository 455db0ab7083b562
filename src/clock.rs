//! Wall-clock time anchored to the runtime's monotonic clock.
//!
//! Quota reset times arrive as UTC epoch seconds, but every wait in this
//! crate is a tokio timer. Deriving "now" from `tokio::time::Instant` keeps
//! both views consistent, including under a paused test runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_utc: DateTime<Utc>,
    anchor: Instant,
}

impl Clock {
    /// A clock anchored at the current system time.
    pub fn system() -> Self {
        Self::starting_at(Utc::now())
    }

    /// A clock that reads `start` right now and advances with the runtime.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            anchor_utc: start,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed()).unwrap_or_default();
        self.anchor_utc + elapsed
    }

    /// Time left until `deadline`, zero if it already passed.
    pub fn until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
