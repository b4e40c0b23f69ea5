//! Retry policy with exponential backoff
//!
//! [`RetryPolicy`] is a pure description of how long to wait before each
//! retry and when to give up. [`RetryState`] carries the attempt counter for
//! one logical operation (one HTTP call including its retries), and
//! [`wait`] performs the computed delay in a way a caller can cancel.
//!
//! The interval before retry `n` (1-based) is
//!
//! ```text
//! min(period * backoff_multiplier ^ (n - 1), max_period)
//! ```
//!
//! `max_attempts` counts retries after the initial try, so an operation is
//! tried at most `max_attempts + 1` times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};

const DEFAULT_PERIOD_MS: u64 = 10_000;
const DEFAULT_MAX_PERIOD_MS: u64 = 90_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff configuration shared by every retried call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Interval before the first retry, in milliseconds
    pub period_ms: u64,
    /// Upper bound for any single wait, in milliseconds
    pub max_period_ms: u64,
    /// Growth factor applied after each failed attempt
    pub backoff_multiplier: f64,
    /// Number of retries allowed after the initial try
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            max_period_ms: DEFAULT_MAX_PERIOD_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What to do before the next try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep for the given duration
    Sleep(Duration),
    /// Retry right away (e.g. the server's retry-after instant already passed)
    Immediate,
}

impl RetryPolicy {
    /// Create a policy from durations
    #[must_use]
    pub fn new(period: Duration, max_period: Duration, backoff_multiplier: f64, max_attempts: u32) -> Self {
        Self {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            max_period_ms: u64::try_from(max_period.as_millis()).unwrap_or(u64::MAX),
            backoff_multiplier,
            max_attempts,
        }
    }

    /// A policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Interval before the first retry
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Upper bound for any single wait
    #[must_use]
    pub fn max_period(&self) -> Duration {
        Duration::from_millis(self.max_period_ms)
    }

    /// Check the policy for values that make no sense
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` for a multiplier below 1.0 or
    /// non-finite, or a maximum period shorter than the initial period.
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SessionError::invalid_config(format!(
                "backoff multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_period_ms < self.period_ms {
            return Err(SessionError::invalid_config(format!(
                "max period ({} ms) is shorter than period ({} ms)",
                self.max_period_ms, self.period_ms
            )));
        }
        Ok(())
    }

    /// Interval to wait before retry number `attempt` (1-based)
    #[must_use]
    pub fn next_interval(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.period_ms as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = scaled.min(self.max_period_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// True once the attempt counter has passed the retry budget
    #[must_use]
    pub fn should_stop(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Decide how long to wait before retry `attempt`.
    ///
    /// A server hint replaces the computed interval with `not_before - now`,
    /// capped at `max_period`. A hint in the past means "go now".
    #[must_use]
    pub fn backoff_for(
        &self,
        attempt: u32,
        not_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Backoff {
        let delay = match not_before {
            Some(instant) => match (instant - now).to_std() {
                Ok(remaining) => remaining.min(self.max_period()),
                Err(_) => return Backoff::Immediate,
            },
            None => self.next_interval(attempt),
        };

        if delay.is_zero() {
            Backoff::Immediate
        } else {
            Backoff::Sleep(delay)
        }
    }
}

/// Attempt counter for one logical operation
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
}

impl<'a> RetryState<'a> {
    /// Start a fresh operation
    #[must_use]
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of failed tries recorded so far
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The policy this state counts against
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        self.policy
    }

    /// Record a failed try and compute the wait before the next one.
    ///
    /// Returns `None` when the retry budget is spent; the caller must then
    /// surface the last error without waiting again.
    pub fn record_failure(&mut self, not_before: Option<DateTime<Utc>>) -> Option<Backoff> {
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.should_stop(self.attempt) {
            return None;
        }
        Some(self.policy.backoff_for(self.attempt, not_before, Utc::now()))
    }
}

/// Perform a backoff, returning early with `SessionError::Cancelled` if
/// `cancel` fires first.
///
/// # Errors
///
/// Returns `SessionError::Cancelled` when the token is (or becomes) cancelled.
pub async fn wait(backoff: Backoff, cancel: &CancellationToken) -> Result<()> {
    match backoff {
        Backoff::Immediate => {
            if cancel.is_cancelled() {
                Err(SessionError::Cancelled)
            } else {
                Ok(())
            }
        }
        Backoff::Sleep(delay) => {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(SessionError::Cancelled),
                () = tokio::time::sleep(delay) => Ok(()),
            }
        }
    }
}
