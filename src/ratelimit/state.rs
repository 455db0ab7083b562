//! Remaining-quota bookkeeping.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Quota metadata from a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaHeaders {
    pub const LIMIT: &'static str = "x-ratelimit-limit";
    pub const REMAINING: &'static str = "x-ratelimit-remaining";
    pub const RESET: &'static str = "x-ratelimit-reset";

    /// Parse the three quota headers through a name lookup.
    ///
    /// All three must be present and numeric, otherwise `None`. A negative
    /// remaining count is clamped to zero.
    pub fn from_lookup<'a, F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let limit = lookup(Self::LIMIT)?.trim().parse::<i64>().ok()?;
        let remaining = lookup(Self::REMAINING)?.trim().parse::<i64>().ok()?;
        let reset = lookup(Self::RESET)?.trim().parse::<i64>().ok()?;
        let reset_at = Utc.timestamp_opt(reset, 0).single()?;

        Some(Self {
            limit: limit.clamp(0, u32::MAX as i64) as u32,
            remaining: remaining.clamp(0, u32::MAX as i64) as u32,
            reset_at,
        })
    }
}

/// What the gate knows about the credential's quota.
///
/// Every field is `None` until a response supplies quota headers; with no
/// information the gate does not hold calls back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    /// set by a secondary rate limit signal
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the quota view with the latest response's headers.
    pub fn update(&mut self, quota: &QuotaHeaders) {
        self.limit = Some(quota.limit);
        self.remaining = Some(quota.remaining);
        self.reset_at = Some(quota.reset_at);
    }

    /// Account for a request leaving before its response refreshes the view.
    pub fn record_dispatch(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    /// Hold every call until `until` (secondary limit or a primary 403).
    pub fn block_until(&mut self, until: DateTime<Utc>) {
        self.blocked_until = Some(match self.blocked_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    /// Quota used up and the window not yet reset.
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        matches!(
            (self.remaining, self.reset_at),
            (Some(0), Some(reset_at)) if reset_at > now
        )
    }

    /// The moment calls may flow again, if they are currently held.
    pub fn resume_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let quota = if self.is_exhausted(now) { self.reset_at } else { None };
        let blocked = self.blocked_until.filter(|until| *until > now);
        match (quota, blocked) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// How long a call arriving at `now` has to wait.
    pub fn wait_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.resume_at(now)
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_parse_headers() {
        let headers: HashMap<&str, &str> = [
            ("x-ratelimit-limit", "5000"),
            ("x-ratelimit-remaining", "4999"),
            ("x-ratelimit-reset", "1700000000"),
        ]
        .into_iter()
        .collect();

        let quota = QuotaHeaders::from_lookup(|name| headers.get(name).copied()).unwrap();
        assert_eq!(quota.limit, 5000);
        assert_eq!(quota.remaining, 4999);
        assert_eq!(quota.reset_at, at(1_700_000_000));
    }

    #[test]
    fn test_missing_or_negative_headers() {
        assert_eq!(QuotaHeaders::from_lookup(|_| None), None);

        let headers: HashMap<&str, &str> = [
            ("x-ratelimit-limit", "60"),
            ("x-ratelimit-remaining", "-3"),
            ("x-ratelimit-reset", "1700000000"),
        ]
        .into_iter()
        .collect();
        let quota = QuotaHeaders::from_lookup(|name| headers.get(name).copied()).unwrap();
        assert_eq!(quota.remaining, 0);
    }

    #[test]
    fn test_unknown_state_is_unrestricted() {
        let state = RateLimitState::new();
        assert!(!state.is_exhausted(at(0)));
        assert_eq!(state.wait_duration(at(0)), None);
    }

    #[test]
    fn test_exhausted_until_reset() {
        let mut state = RateLimitState::new();
        state.update(&QuotaHeaders {
            limit: 60,
            remaining: 0,
            reset_at: at(1_000),
        });

        assert!(state.is_exhausted(at(900)));
        assert_eq!(state.wait_duration(at(900)), Some(Duration::from_secs(100)));
        assert!(!state.is_exhausted(at(1_000)));
        assert_eq!(state.wait_duration(at(1_001)), None);
    }

    #[test]
    fn test_dispatch_never_goes_negative() {
        let mut state = RateLimitState::new();
        state.update(&QuotaHeaders {
            limit: 60,
            remaining: 1,
            reset_at: at(1_000),
        });
        state.record_dispatch();
        state.record_dispatch();
        assert_eq!(state.remaining, Some(0));
    }

    #[test]
    fn test_secondary_block_takes_the_later_deadline() {
        let mut state = RateLimitState::new();
        state.block_until(at(500));
        state.block_until(at(300));
        assert_eq!(state.blocked_until, Some(at(500)));
        assert_eq!(state.wait_duration(at(440)), Some(Duration::from_secs(60)));
        assert_eq!(state.wait_duration(at(500)), None);
    }
}
