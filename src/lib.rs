//! # bearer-session
//!
//! Session-token authentication for HTTP clients, with a shared retry and
//! backoff pipeline. Async/await, strong typing, tokio-based.
//!
//! Three credential schemes are supported:
//!
//! - **Password**: Basic login, or NTLM through a pluggable engine
//! - **Certificate**: a random challenge signed with an RSA client key
//! - **Device**: OAuth device authorization with an encrypted, persisted
//!   refresh token
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bearer_session::{
//!     AuthenticatedTransport, Authenticator, Credentials, HttpTransport, SessionConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::builder()
//!         .auth_url("https://auth.example.com/api/v1")
//!         .api_url("https://api.example.com/v2")
//!         .client_identifier("inventory-sync")
//!         .build();
//!
//!     let http = Arc::new(HttpTransport::new(config)?);
//!     let authenticator = Arc::new(Authenticator::from_credentials(
//!         Credentials::password("alice", "s3cret"),
//!         http,
//!     )?);
//!     let api = AuthenticatedTransport::new(authenticator);
//!
//!     let items: serde_json::Value = api.get_json("items").await?;
//!     println!("{items}");
//!     Ok(())
//! }
//! ```
//!
//! ## Token lifecycle
//!
//! Token freshness is evaluated lazily, whenever a token is requested:
//!
//! | Time to expiry                         | Action            |
//! |----------------------------------------|-------------------|
//! | more than the refresh window (5 min)   | reuse             |
//! | less than the refresh window           | refresh           |
//! | expired, within the grace window (60s) | refresh           |
//! | expired beyond the grace window        | full login        |
//!
//! ## Retries
//!
//! Network failures, 5xx and 429 responses are retried with exponential
//! backoff (see [`RetryPolicy`]). A 429 carrying `Retry-After` or
//! `X-RateLimit-Reset` waits until that instant instead. 400 and other 4xx
//! responses fail immediately. A 401 on an authenticated call triggers one
//! re-authentication. Waits can be cancelled with a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).
//!
//! ## Logging
//!
//! All logging goes through `tracing`; attach a subscriber to see it.
//! Tokens, passwords and keys are never logged.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod classify;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod retry;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use auth::{
    AuthScheme, Authenticator, CertificateScheme, DevicePrompt, DeviceScheme, FileRefreshTokenStore,
    NtlmEngine, PasswordScheme, RefreshTokenRecord, RefreshTokenStore,
};
pub use classify::{ClassifiedError, ErrorClassifier};
pub use crypto::{PassphraseCipher, RecordCipher};
pub use error::{Result, SessionError};
pub use keystore::{Certificate, CertificateMaterial, KeyStore};
pub use retry::{Backoff, RetryPolicy, RetryState};
pub use transport::{AuthenticatedTransport, HttpTransport, Transport};
pub use types::{
    Credentials, DeviceCredentials, FreshnessWindows, PasswordCredentials, RefreshPolicy, Session,
    SessionConfig, SessionConfigBuilder, TokenAction, TokenState,
};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
