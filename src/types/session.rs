//! In-memory session token and its freshness rules

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_REFRESH_WINDOW_SECS: u64 = 5 * 60;
const DEFAULT_EXPIRED_GRACE_SECS: u64 = 60;

/// Session token issued by a login or refresh call
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a session from a server response
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Opaque token value
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry instant reported by the server
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Time left before expiry, if any
    #[must_use]
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Freshness of the cached session at the moment a token is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No session yet; full login required
    NoToken,
    /// Comfortably before expiry; reuse as is
    Valid,
    /// Inside the refresh window, or just past expiry within the grace window
    NearExpiry,
    /// Expired for longer than the grace window; full login required
    StaleExpired,
}

/// Action the authenticator takes for a given [`TokenState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    /// Return the cached token
    Reuse,
    /// Call the cheaper refresh endpoint
    Refresh,
    /// Run the scheme's full login
    Authenticate,
}

impl TokenState {
    /// What to do in this state
    #[must_use]
    pub fn action(self) -> TokenAction {
        match self {
            Self::Valid => TokenAction::Reuse,
            Self::NearExpiry => TokenAction::Refresh,
            Self::NoToken | Self::StaleExpired => TokenAction::Authenticate,
        }
    }
}

/// Windows around the expiry instant that drive refresh and re-login.
///
/// The grace window tolerates clock skew between client and server: a
/// token that expired less than `expired_grace_secs` ago is still refreshed
/// rather than replaced by a full login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessWindows {
    /// Refresh once expiry is closer than this many seconds
    pub refresh_window_secs: u64,
    /// Tolerated seconds past expiry before a full login is required
    pub expired_grace_secs: u64,
}

impl Default for FreshnessWindows {
    fn default() -> Self {
        Self {
            refresh_window_secs: DEFAULT_REFRESH_WINDOW_SECS,
            expired_grace_secs: DEFAULT_EXPIRED_GRACE_SECS,
        }
    }
}

impl FreshnessWindows {
    /// Create windows from durations
    #[must_use]
    pub fn new(refresh_window: Duration, expired_grace: Duration) -> Self {
        Self {
            refresh_window_secs: refresh_window.as_secs(),
            expired_grace_secs: expired_grace.as_secs(),
        }
    }

    fn refresh_window(&self) -> TimeDelta {
        TimeDelta::try_seconds(i64::try_from(self.refresh_window_secs).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX)
    }

    fn expired_grace(&self) -> TimeDelta {
        TimeDelta::try_seconds(i64::try_from(self.expired_grace_secs).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX)
    }

    /// Classify a session expiring at `expires_at` as seen at `now`
    #[must_use]
    pub fn evaluate(&self, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> TokenState {
        if now - expires_at > self.expired_grace() {
            TokenState::StaleExpired
        } else if expires_at - now < self.refresh_window() {
            TokenState::NearExpiry
        } else {
            TokenState::Valid
        }
    }

    /// Classify an optional session
    #[must_use]
    pub fn state_of(&self, session: Option<&Session>, now: DateTime<Utc>) -> TokenState {
        match session {
            None => TokenState::NoToken,
            Some(session) => self.evaluate(now, session.expires_at()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(offset: TimeDelta) -> TokenAction {
        let now = Utc::now();
        FreshnessWindows::default().evaluate(now, now + offset).action()
    }

    #[test]
    fn test_far_from_expiry_reuses() {
        assert_eq!(decide(TimeDelta::minutes(33)), TokenAction::Reuse);
    }

    #[test]
    fn test_inside_refresh_window_refreshes() {
        assert_eq!(decide(TimeDelta::minutes(3)), TokenAction::Refresh);
    }

    #[test]
    fn test_just_expired_inside_grace_refreshes() {
        assert_eq!(decide(TimeDelta::seconds(-10)), TokenAction::Refresh);
    }

    #[test]
    fn test_expired_beyond_grace_authenticates() {
        assert_eq!(decide(TimeDelta::seconds(-70)), TokenAction::Authenticate);
    }

    #[test]
    fn test_window_boundaries() {
        let windows = FreshnessWindows::default();
        let now = Utc::now();
        // Exactly at the refresh boundary the token is still valid
        assert_eq!(windows.evaluate(now, now + TimeDelta::minutes(5)), TokenState::Valid);
        // Exactly at the end of grace it is still refreshable
        assert_eq!(windows.evaluate(now, now - TimeDelta::seconds(60)), TokenState::NearExpiry);
        assert_eq!(windows.evaluate(now, now - TimeDelta::seconds(61)), TokenState::StaleExpired);
    }

    #[test]
    fn test_windows_are_configurable() {
        let windows = FreshnessWindows::new(Duration::from_secs(60), Duration::from_secs(0));
        let now = Utc::now();
        assert_eq!(windows.evaluate(now, now + TimeDelta::minutes(3)), TokenState::Valid);
        assert_eq!(windows.evaluate(now, now - TimeDelta::seconds(1)), TokenState::StaleExpired);
    }

    #[test]
    fn test_no_session_authenticates() {
        let state = FreshnessWindows::default().state_of(None, Utc::now());
        assert_eq!(state, TokenState::NoToken);
        assert_eq!(state.action(), TokenAction::Authenticate);
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = Session::new("super-secret", Utc::now());
        let debug = format!("{session:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
