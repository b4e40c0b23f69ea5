//! Classification of failed HTTP calls
//!
//! The retry loop never inspects raw statuses itself; it asks an
//! [`ErrorClassifier`] what a failure means and pattern-matches on the
//! resulting [`ClassifiedError`].

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;

use crate::error::SessionError;
use crate::utils::truncate_for_display;

/// Epoch-seconds (or epoch-milliseconds) instant at which a rate limit resets
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Longest body excerpt carried inside an error message
const MAX_BODY_MESSAGE_BYTES: usize = 512;

/// Epoch values above this are taken as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// What the retry loop should do about a failure
#[derive(Debug)]
pub enum ClassifiedError {
    /// Transient; retry after the policy's backoff
    Retryable(SessionError),
    /// Transient; retry no earlier than `not_before`
    RetryableAfter {
        /// The failure
        cause: SessionError,
        /// Server-provided earliest retry instant
        not_before: DateTime<Utc>,
    },
    /// The session token was rejected; re-authenticate and retry
    Reauthenticate(SessionError),
    /// Stop and surface the error
    Fatal(SessionError),
}

impl ClassifiedError {
    /// The underlying error
    #[must_use]
    pub fn error(&self) -> &SessionError {
        match self {
            Self::Retryable(cause)
            | Self::RetryableAfter { cause, .. }
            | Self::Reauthenticate(cause)
            | Self::Fatal(cause) => cause,
        }
    }

    /// Consume the classification, keeping the underlying error
    #[must_use]
    pub fn into_error(self) -> SessionError {
        match self {
            Self::Retryable(cause)
            | Self::RetryableAfter { cause, .. }
            | Self::Reauthenticate(cause)
            | Self::Fatal(cause) => cause,
        }
    }

    /// Server retry hint, if any
    #[must_use]
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RetryableAfter { not_before, .. } => Some(*not_before),
            _ => None,
        }
    }

    /// HTTP status of a fatal classification
    #[must_use]
    pub fn fatal_status(&self) -> Option<u16> {
        match self {
            Self::Fatal(cause) => cause.status(),
            _ => None,
        }
    }
}

/// Maps a failed response or transport error to a [`ClassifiedError`]
#[derive(Debug, Clone, Copy)]
pub struct ErrorClassifier {
    authenticator_attached: bool,
}

impl ErrorClassifier {
    /// Classifier for calls made on behalf of an authenticator; a 401 asks
    /// for re-authentication
    #[must_use]
    pub fn with_authenticator() -> Self {
        Self {
            authenticator_attached: true,
        }
    }

    /// Classifier for calls with nobody to re-authenticate (login itself,
    /// or a second 401 after re-authentication); a 401 is fatal
    #[must_use]
    pub fn without_authenticator() -> Self {
        Self {
            authenticator_attached: false,
        }
    }

    /// Whether a 401 maps to [`ClassifiedError::Reauthenticate`]
    #[must_use]
    pub fn authenticator_attached(&self) -> bool {
        self.authenticator_attached
    }

    /// Classify a non-success response.
    #[must_use]
    pub fn classify(&self, status: StatusCode, headers: &HeaderMap, body: Option<&str>) -> ClassifiedError {
        self.classify_at(status, headers, body, Utc::now())
    }

    /// Classify a non-success response against an explicit `now`, which
    /// anchors relative retry-after values.
    #[must_use]
    pub fn classify_at(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: Option<&str>,
        now: DateTime<Utc>,
    ) -> ClassifiedError {
        let code = status.as_u16();
        let reason = reason_phrase(status);

        if status.is_server_error() {
            let message = body_message(body).unwrap_or(reason);
            return ClassifiedError::Retryable(SessionError::server_error(code, message));
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let message = body_message(body).unwrap_or(reason);
                match parse_rate_limit_reset(headers, now) {
                    Some(not_before) => ClassifiedError::RetryableAfter {
                        cause: SessionError::rate_limited(message, Some(not_before)),
                        not_before,
                    },
                    None => ClassifiedError::Retryable(SessionError::rate_limited(message, None)),
                }
            }
            StatusCode::BAD_REQUEST => {
                let message = body_message(body).unwrap_or(reason);
                ClassifiedError::Fatal(SessionError::bad_request(message))
            }
            StatusCode::UNAUTHORIZED => {
                let message = body_message(body).unwrap_or(reason);
                if self.authenticator_attached {
                    ClassifiedError::Reauthenticate(SessionError::unauthorized(message))
                } else {
                    ClassifiedError::Fatal(SessionError::unauthorized(message))
                }
            }
            _ => ClassifiedError::Fatal(SessionError::http(code, reason)),
        }
    }

    /// Classify a request that never produced a response.
    #[must_use]
    pub fn classify_transport(&self, error: &reqwest::Error) -> ClassifiedError {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            ClassifiedError::Retryable(SessionError::transport(error.to_string()))
        } else {
            ClassifiedError::Fatal(SessionError::transport(error.to_string()))
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_authenticator()
    }
}

fn reason_phrase(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("Unknown status")
        .to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Human-readable message from a response body.
///
/// JSON bodies contribute their `statusMessage`/`message`/
/// `error_description`/`error` field; anything else is used as text.
#[must_use]
pub fn body_message(body: Option<&str>) -> Option<String> {
    let text = body?.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(text) {
        let field = parsed
            .status_message
            .or(parsed.message)
            .or(parsed.error_description)
            .or(parsed.error)
            .filter(|m| !m.trim().is_empty());
        if let Some(message) = field {
            return Some(truncate_for_display(message.trim(), MAX_BODY_MESSAGE_BYTES));
        }
    }

    Some(truncate_for_display(text, MAX_BODY_MESSAGE_BYTES))
}

/// Parse the server's retry hint.
///
/// `Retry-After` may be delta-seconds or an HTTP-date;
/// `X-RateLimit-Reset` is an epoch timestamp in seconds or milliseconds.
#[must_use]
pub fn parse_rate_limit_reset(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(value) = header(RETRY_AFTER.as_str()) {
        if let Ok(seconds) = value.parse::<i64>() {
            return now.checked_add_signed(TimeDelta::try_seconds(seconds)?);
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            return Some(date.with_timezone(&Utc));
        }
    }

    if let Some(value) = header(RATE_LIMIT_RESET_HEADER) {
        let epoch = value.parse::<i64>().ok()?;
        return if epoch > EPOCH_MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(epoch)
        } else {
            DateTime::from_timestamp(epoch, 0)
        };
    }

    None
}
