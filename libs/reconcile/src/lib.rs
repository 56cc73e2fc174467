//! Retry and reconciliation primitives.
//!
//! Two concerns live here, both free of any async runtime:
//!
//! - **Bounded retry**: how many times a transient provider failure may be
//!   retried, and how long to wait between attempts.
//! - **Staleness**: whether a record that should have left a transient
//!   status has been stuck there long enough to be swept.
//!
//! # Invariants
//!
//! - Backoff delays never exceed `max_backoff`
//! - An attempt budget is always at least one attempt
//! - Staleness is decided purely from timestamps passed in by the caller

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Default attempts for a provider call (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Default age after which a node in a transient status is considered stuck.
pub const DEFAULT_STUCK_AFTER: Duration = Duration::from_secs(15 * 60);

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: u32,

    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: 2,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A policy with the given attempt budget and no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
            jitter: false,
        }
    }

    /// Effective attempt budget.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Returns true if another attempt is allowed after `attempt` failed.
    ///
    /// `attempt` is 1-based.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Delay to wait after the 1-based `attempt` failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        let base = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);

        if !self.jitter || base.is_zero() {
            return base;
        }

        let max_jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=max_jitter_ms));
        (base + jitter).min(self.max_backoff)
    }
}

/// Decides when a record in a transient status counts as stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePolicy {
    /// Minimum time since the last update.
    pub stuck_after: Duration,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            stuck_after: DEFAULT_STUCK_AFTER,
        }
    }
}

impl StalePolicy {
    /// Create a policy with the given threshold.
    pub fn new(stuck_after: Duration) -> Self {
        Self { stuck_after }
    }

    /// Records last updated before this instant are stuck.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let threshold = chrono::Duration::from_std(self.stuck_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.checked_sub_signed(threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns true if a record last updated at `updated_at` is stuck at `now`.
    pub fn is_stale(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        updated_at < self.cutoff(now)
    }
}
