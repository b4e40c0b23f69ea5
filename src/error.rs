//! Error types for bearer-session

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for session authentication and authenticated transport
#[derive(Error, Debug)]
pub enum SessionError {
    /// Connect/read timeout, DNS failure or another network-level failure
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Server answered with a 5xx status
    #[error("Server error ({status}): {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Message derived from the body or reason phrase
        message: String,
    },

    /// Server answered with 429
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Message derived from the body or reason phrase
        message: String,
        /// Earliest instant at which the server accepts a retry, if it said so
        retry_after: Option<DateTime<Utc>>,
    },

    /// Server answered with 400
    #[error("Bad request: {message}")]
    BadRequest {
        /// Message surfaced from the response body
        message: String,
    },

    /// Server answered with 401
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Message surfaced from the response body
        message: String,
    },

    /// Any other non-2xx status
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Reason phrase or body message
        message: String,
    },

    /// Login or refresh was denied, or exhausted its retries
    #[error("Authentication failed: {message}")]
    AuthenticationFailure {
        /// What went wrong, including the last underlying error
        message: String,
    },

    /// Private key or certificate could not be used
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// The refresh-token record could not be written
    #[error("Cannot persist refresh token to {}: {source}", path.display())]
    TokenPersistence {
        /// Configured store path
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// The refresh-token record exists but could not be read or decrypted
    #[error("Refresh token record at {} is unreadable: {reason}", path.display())]
    RecordUnreadable {
        /// Configured store path
        path: PathBuf,
        /// Why reading failed
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A response could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The caller cancelled the operation while it was waiting to retry
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking task offloaded from the runtime panicked or was cancelled
    #[error("Blocking task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bearer-session operations
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Create a transport failure
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a server error
    pub fn server_error(status: u16, msg: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: msg.into(),
        }
    }

    /// Create a rate-limited error
    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<DateTime<Utc>>) -> Self {
        Self::RateLimited {
            message: msg.into(),
            retry_after,
        }
    }

    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    /// Create an error for any other non-2xx status
    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    /// Create an authentication failure
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailure {
            message: msg.into(),
        }
    }

    /// Create a key material error
    pub fn key_material(msg: impl Into<String>) -> Self {
        Self::KeyMaterial(msg.into())
    }

    /// Create a token persistence error
    pub fn token_persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::TokenPersistence {
            path: path.into(),
            source,
        }
    }

    /// Create a record unreadable error
    pub fn record_unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RecordUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid response error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// HTTP status carried by this error, if it came from a response
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerError { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::BadRequest { .. } => Some(400),
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    /// Whether the retry layer repeats the call that produced this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ServerError { .. } | Self::RateLimited { .. }
        )
    }

    /// Turn the outcome of a login/refresh call into the error a caller sees.
    ///
    /// Retryable kinds only reach this point once the retry budget is spent
    /// (possibly zero retries), and 401/403 mean the credentials were
    /// refused; both become
    /// [`SessionError::AuthenticationFailure`]. Everything else is returned as is.
    #[must_use]
    pub fn into_authentication_failure(self, operation: &str) -> Self {
        if self.is_retryable() {
            return Self::authentication(format!("{operation} failed on a transient error: {self}"));
        }
        match self {
            Self::Unauthorized { message } => {
                Self::authentication(format!("{operation} rejected: {message}"))
            }
            Self::Http {
                status: 403,
                message,
            } => Self::authentication(format!("{operation} forbidden: {message}")),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accessor() {
        assert_eq!(SessionError::bad_request("x").status(), Some(400));
        assert_eq!(SessionError::unauthorized("x").status(), Some(401));
        assert_eq!(SessionError::rate_limited("x", None).status(), Some(429));
        assert_eq!(SessionError::server_error(503, "x").status(), Some(503));
        assert_eq!(SessionError::http(404, "x").status(), Some(404));
        assert_eq!(SessionError::transport("reset").status(), None);
    }

    #[test]
    fn test_only_network_and_server_side_errors_retry() {
        assert!(SessionError::transport("timeout").is_retryable());
        assert!(SessionError::server_error(500, "boom").is_retryable());
        assert!(SessionError::rate_limited("slow down", None).is_retryable());
        assert!(!SessionError::bad_request("nope").is_retryable());
        assert!(!SessionError::unauthorized("nope").is_retryable());
        assert!(!SessionError::key_material("bad key").is_retryable());
        assert!(!SessionError::Cancelled.is_retryable());
    }

    #[test]
    fn test_into_authentication_failure() {
        let exhausted = SessionError::server_error(502, "bad gateway").into_authentication_failure("login");
        assert!(matches!(exhausted, SessionError::AuthenticationFailure { .. }));
        assert!(exhausted.to_string().contains("bad gateway"));
        assert!(exhausted.to_string().contains("transient"));

        let denied = SessionError::unauthorized("wrong password").into_authentication_failure("login");
        assert!(matches!(denied, SessionError::AuthenticationFailure { .. }));

        let bad = SessionError::bad_request("missing field").into_authentication_failure("login");
        assert!(matches!(bad, SessionError::BadRequest { .. }));
    }
}
