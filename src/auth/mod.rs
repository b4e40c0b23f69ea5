//! Session-token authentication
//!
//! An [`Authenticator`] owns the current [`Session`] and decides, every time
//! a token is requested, whether to reuse it, refresh it, or log in again.
//! How logging in and refreshing work depends on the credential scheme,
//! abstracted by [`AuthScheme`]:
//!
//! - [`PasswordScheme`]: Basic login, or NTLM with a plugged-in [`NtlmEngine`]
//! - [`CertificateScheme`]: a random challenge signed with the client key
//! - [`DeviceScheme`]: OAuth device authorization with a persisted refresh token
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bearer_session::{Authenticator, Credentials, HttpTransport, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::builder()
//!         .auth_url("https://auth.example.com/api/v1")
//!         .build();
//!     let http = Arc::new(HttpTransport::new(config)?);
//!     let authenticator = Authenticator::from_credentials(
//!         Credentials::password("alice", "s3cret"),
//!         http,
//!     )?;
//!
//!     let token = authenticator.get_token().await?;
//!     println!("Authenticated, token is {} bytes", token.len());
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! The session sits behind an async mutex that is held for the whole
//! evaluate-and-renew step, so concurrent callers that all find the token
//! near expiry trigger a single refresh.

mod certificate;
mod device;
mod password;
mod store;
mod token;

pub use certificate::{
    CERTIFICATE_AUTH_SCHEME, CertificateScheme, ChallengeBody, challenge_body, decode_cert_hash,
    generate_cert_hash, random_challenge, sign_challenge,
};
pub use device::{DEVICE_CODE_GRANT, DeviceAuthorization, DevicePrompt, DeviceScheme, DeviceState, StderrPrompt};
pub use password::{NtlmEngine, PasswordScheme};
pub use store::{
    FileRefreshTokenStore, RefreshTokenRecord, RefreshTokenStore, default_passphrase, default_store_path,
};
pub use token::{TokenInfo, TokenResponse, expiry_from_millis};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::transport::HttpTransport;
use crate::types::{Credentials, Session, TokenAction, TokenState};

/// Login and refresh for one credential scheme
#[async_trait]
pub trait AuthScheme: Send + Sync + std::fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Full login
    ///
    /// # Errors
    /// Returns the failure of the login call as classified by the transport.
    async fn authenticate(&self, http: &HttpTransport, cancel: &CancellationToken) -> Result<Session>;

    /// Cheaper renewal of an existing session.
    ///
    /// The default posts the current token to `/token/refresh`. A
    /// `SessionError::Unauthorized` result makes the authenticator fall back
    /// to [`AuthScheme::authenticate`].
    ///
    /// # Errors
    /// Returns the failure of the refresh call.
    async fn refresh(&self, http: &HttpTransport, session: &Session, cancel: &CancellationToken) -> Result<Session> {
        token::refresh_session(http, session, cancel).await
    }

    /// End the session server-side
    ///
    /// # Errors
    /// Returns the failure of the logout call.
    async fn logout(&self, http: &HttpTransport, session: &Session) -> Result<()> {
        token::logout_session(http, session).await
    }

    /// Ask the server when the session expires
    ///
    /// # Errors
    /// Returns the failure of the validate call.
    async fn validate(&self, http: &HttpTransport, session: &Session) -> Result<DateTime<Utc>> {
        token::validate_session(http, session).await
    }

    /// Remove anything the scheme persisted locally
    ///
    /// # Errors
    /// Returns `SessionError::TokenPersistence` if removal fails.
    fn clear_persisted_state(&self) -> Result<()> {
        Ok(())
    }
}

/// Owns the session token and keeps it fresh
pub struct Authenticator {
    scheme: Box<dyn AuthScheme>,
    http: Arc<HttpTransport>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("scheme", &self.scheme.name())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Authenticator for an explicit scheme
    #[must_use]
    pub fn new(scheme: Box<dyn AuthScheme>, http: Arc<HttpTransport>) -> Self {
        Self {
            scheme,
            http,
            session: Mutex::new(None),
        }
    }

    /// Pick the scheme matching `credentials`.
    ///
    /// Device credentials persist their refresh token at the default store
    /// path; build a [`DeviceScheme`] with [`Authenticator::new`] to choose
    /// another store.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidConfig` if the default store location
    /// cannot be determined.
    pub fn from_credentials(credentials: Credentials, http: Arc<HttpTransport>) -> Result<Self> {
        let scheme: Box<dyn AuthScheme> = match credentials {
            Credentials::Password(password) => Box::new(PasswordScheme::new(password)),
            Credentials::Certificate(material) => Box::new(CertificateScheme::new(material)),
            Credentials::Device(device) => {
                let store = FileRefreshTokenStore::for_client(&device.client_id)?;
                Box::new(DeviceScheme::new(device, Arc::new(store)))
            }
        };
        Ok(Self::new(scheme, http))
    }

    /// Name of the active scheme
    #[must_use]
    pub fn scheme_name(&self) -> &'static str {
        self.scheme.name()
    }

    /// The transport used for login and refresh calls
    #[must_use]
    pub fn http(&self) -> &Arc<HttpTransport> {
        &self.http
    }

    /// A usable session token, renewing it first if needed
    ///
    /// # Errors
    /// Returns `SessionError::AuthenticationFailure` if login or refresh is
    /// refused or runs out of retries.
    pub async fn get_token(&self) -> Result<String> {
        self.token(false, &CancellationToken::new()).await
    }

    /// Discard the session and log in again
    ///
    /// # Errors
    /// See [`Authenticator::get_token`].
    pub async fn force_refresh(&self) -> Result<String> {
        self.token(true, &CancellationToken::new()).await
    }

    /// A usable session token; with `force` the current session is discarded
    /// and a full login runs regardless of its freshness.
    ///
    /// # Errors
    /// See [`Authenticator::get_token`]. Returns `SessionError::Cancelled`
    /// if `cancel` fires while a retry is pending.
    pub async fn token(&self, force: bool, cancel: &CancellationToken) -> Result<String> {
        let mut guard = self.session.lock().await;

        let state = self.http.config().freshness.state_of(guard.as_ref(), Utc::now());
        let action = if force { TokenAction::Authenticate } else { state.action() };
        tracing::debug!(scheme = self.scheme.name(), ?state, ?action, force, "Evaluating session");

        let renewed = match (action, guard.as_ref()) {
            (TokenAction::Reuse, Some(session)) => return Ok(session.token().to_string()),
            (TokenAction::Refresh, Some(current)) => self.refresh_session(current, cancel).await?,
            _ => {
                guard.take();
                self.authenticate_session(cancel).await?
            }
        };

        let token = renewed.token().to_string();
        *guard = Some(renewed);
        Ok(token)
    }

    /// Log in again unless another caller already replaced `rejected`
    pub(crate) async fn reauthenticate(&self, rejected: &str, cancel: &CancellationToken) -> Result<String> {
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref() {
            if current.token() != rejected {
                tracing::debug!("Session already renewed by another caller");
                return Ok(current.token().to_string());
            }
        }

        guard.take();
        let renewed = self.authenticate_session(cancel).await?;
        let token = renewed.token().to_string();
        *guard = Some(renewed);
        Ok(token)
    }

    async fn authenticate_session(&self, cancel: &CancellationToken) -> Result<Session> {
        tracing::info!(scheme = self.scheme.name(), "Authenticating");
        let session = self
            .scheme
            .authenticate(&self.http, cancel)
            .await
            .map_err(|e| e.into_authentication_failure("login"))?;
        tracing::info!(expires_at = %session.expires_at(), "Session established");
        Ok(session)
    }

    async fn refresh_session(&self, current: &Session, cancel: &CancellationToken) -> Result<Session> {
        tracing::info!(scheme = self.scheme.name(), "Refreshing session");
        match self.scheme.refresh(&self.http, current, cancel).await {
            Ok(session) => {
                tracing::info!(expires_at = %session.expires_at(), "Session refreshed");
                Ok(session)
            }
            Err(SessionError::Unauthorized { message }) => {
                tracing::warn!("Refresh rejected ({message}), logging in again");
                self.authenticate_session(cancel).await
            }
            Err(e) => Err(e.into_authentication_failure("refresh")),
        }
    }

    /// Freshness of the cached session right now
    pub async fn state(&self) -> TokenState {
        let guard = self.session.lock().await;
        self.http.config().freshness.state_of(guard.as_ref(), Utc::now())
    }

    /// Expiry of the cached session, if any
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.session.lock().await.as_ref().map(Session::expires_at)
    }

    /// End the session on the server and forget it locally.
    ///
    /// Does nothing if there is no session. The local session is discarded
    /// even when the server call fails.
    ///
    /// # Errors
    /// Returns the failure of the logout call.
    pub async fn logout(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        tracing::info!(scheme = self.scheme.name(), "Logging out");
        self.scheme.logout(&self.http, &session).await
    }

    /// Expiry of the current session as reported by the server
    ///
    /// # Errors
    /// Returns `SessionError::AuthenticationFailure` if there is no session,
    /// or the failure of the validate call.
    pub async fn validate(&self) -> Result<DateTime<Utc>> {
        let session = self
            .session
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::authentication("no session to validate"))?;
        self.scheme.validate(&self.http, &session).await
    }

    /// Delete the persisted refresh token; succeeds if there is none
    ///
    /// # Errors
    /// Returns `SessionError::TokenPersistence` if the record exists but
    /// cannot be removed.
    pub fn clear_refresh_token_entry(&self) -> Result<()> {
        self.scheme.clear_persisted_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionConfig;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct Calls {
        logins: AtomicU32,
        refreshes: AtomicU32,
    }

    impl Calls {
        fn get(&self) -> (u32, u32) {
            (
                self.logins.load(Ordering::SeqCst),
                self.refreshes.load(Ordering::SeqCst),
            )
        }
    }

    #[derive(Debug, Default)]
    struct CountingScheme {
        calls: Arc<Calls>,
        lifetime_secs: i64,
        reject_refresh: bool,
    }

    #[async_trait]
    impl AuthScheme for CountingScheme {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn authenticate(&self, _http: &HttpTransport, _cancel: &CancellationToken) -> Result<Session> {
            let n = self.calls.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Session::new(
                format!("login-{n}"),
                Utc::now() + TimeDelta::seconds(self.lifetime_secs),
            ))
        }

        async fn refresh(&self, _http: &HttpTransport, _session: &Session, _cancel: &CancellationToken) -> Result<Session> {
            if self.reject_refresh {
                return Err(SessionError::unauthorized("refresh token revoked"));
            }
            let n = self.calls.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Session::new(format!("refresh-{n}"), Utc::now() + TimeDelta::hours(1)))
        }
    }

    fn authenticator(lifetime_secs: i64, reject_refresh: bool) -> (Arc<Authenticator>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let scheme = CountingScheme {
            calls: Arc::clone(&calls),
            lifetime_secs,
            reject_refresh,
        };
        let http = HttpTransport::new(SessionConfig::builder().auth_url("http://localhost:1").build()).unwrap();
        (Arc::new(Authenticator::new(Box::new(scheme), Arc::new(http))), calls)
    }

    #[tokio::test]
    async fn test_first_call_authenticates_then_reuses() {
        let (auth, calls) = authenticator(3600, false);
        assert_eq!(auth.state().await, TokenState::NoToken);

        assert_eq!(auth.get_token().await.unwrap(), "login-1");
        assert_eq!(auth.get_token().await.unwrap(), "login-1");
        assert_eq!(auth.state().await, TokenState::Valid);
        assert_eq!(calls.get(), (1, 0));
    }

    #[tokio::test]
    async fn test_near_expiry_refreshes_once() {
        let (auth, calls) = authenticator(180, false);
        auth.get_token().await.unwrap();
        assert_eq!(auth.state().await, TokenState::NearExpiry);

        assert_eq!(auth.get_token().await.unwrap(), "refresh-1");
        assert_eq!(auth.get_token().await.unwrap(), "refresh-1");
        assert_eq!(calls.get(), (1, 1));
    }

    #[tokio::test]
    async fn test_stale_session_logs_in_again() {
        let (auth, calls) = authenticator(-120, false);
        auth.get_token().await.unwrap();
        assert_eq!(auth.state().await, TokenState::StaleExpired);

        assert_eq!(auth.get_token().await.unwrap(), "login-2");
        assert_eq!(calls.get(), (2, 0));
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_login() {
        let (auth, calls) = authenticator(60, true);
        auth.get_token().await.unwrap();
        assert_eq!(auth.get_token().await.unwrap(), "login-2");
        assert_eq!(calls.get(), (2, 0));
    }

    #[tokio::test]
    async fn test_force_refresh_always_logs_in() {
        let (auth, _) = authenticator(3600, false);
        auth.get_token().await.unwrap();
        assert_eq!(auth.force_refresh().await.unwrap(), "login-2");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let (auth, calls) = authenticator(120, false);
        auth.get_token().await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let auth = Arc::clone(&auth);
                tokio::spawn(async move { auth.get_token().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "refresh-1");
        }
        assert_eq!(calls.get(), (1, 1));
    }

    #[tokio::test]
    async fn test_reauthenticate_skips_if_already_renewed() {
        let (auth, calls) = authenticator(3600, false);
        auth.get_token().await.unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(auth.reauthenticate("login-1", &cancel).await.unwrap(), "login-2");
        assert_eq!(auth.reauthenticate("login-1", &cancel).await.unwrap(), "login-2");
        assert_eq!(calls.get(), (2, 0));
    }

    #[tokio::test]
    async fn test_logout_without_session_is_noop() {
        let (auth, _) = authenticator(3600, false);
        auth.logout().await.unwrap();
        assert!(auth.expires_at().await.is_none());
        assert!(auth.validate().await.is_err());
        auth.clear_refresh_token_entry().unwrap();
    }
}
