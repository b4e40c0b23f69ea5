//! Device/OAuth scheme with a persisted refresh token
//!
//! First use runs the device authorization ceremony: request a device
//! code, show the user code, and poll the token endpoint until the user
//! approves. The refresh token it yields is sealed into a
//! [`RefreshTokenStore`]; later logins and refreshes exchange it for new
//! access tokens without user interaction.
//!
//! Rotatable refresh tokens are replaced in the store after every
//! exchange. Non-rotatable ones are never rewritten.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Method, Response};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::AuthScheme;
use super::store::{RefreshTokenRecord, RefreshTokenStore};
use crate::classify::ErrorClassifier;
use crate::error::{Result, SessionError};
use crate::retry::{Backoff, wait};
use crate::transport::{HttpTransport, Transport};
use crate::types::{DeviceCredentials, Session};

/// OAuth 2.0 device code grant type
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Seconds added to the polling interval on `slow_down`
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// Upper bound on how long a device code is polled, whatever the server says
const MAX_DEVICE_CODE_LIFETIME_SECS: u64 = 24 * 60 * 60;

fn default_interval() -> u64 {
    5
}

/// Response of the device authorization endpoint
#[derive(Clone, Deserialize)]
pub struct DeviceAuthorization {
    /// Code the client polls with
    pub device_code: String,
    /// Code the user enters
    pub user_code: String,
    /// Where the user enters the code
    pub verification_uri: String,
    /// Verification URI with the user code embedded
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code in seconds
    pub expires_in: u64,
    /// Minimum polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
}

impl DeviceAuthorization {
    /// URI to show the user, preferring the one with the code embedded
    #[must_use]
    pub fn display_uri(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

impl std::fmt::Debug for DeviceAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAuthorization")
            .field("device_code", &"[REDACTED]")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("expires_in", &self.expires_in)
            .field("interval", &self.interval)
            .finish()
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum PollOutcome {
    Issued(OAuthTokenResponse),
    Pending,
    SlowDown,
}

/// Shows the user code and verification URI to a human
pub trait DevicePrompt: Send + Sync + std::fmt::Debug {
    /// Called once per ceremony, before polling starts
    fn show(&self, authorization: &DeviceAuthorization);
}

/// Prints the prompt to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrPrompt;

impl DevicePrompt for StderrPrompt {
    fn show(&self, authorization: &DeviceAuthorization) {
        tracing::info!(
            user_code = %authorization.user_code,
            uri = %authorization.display_uri(),
            "Waiting for device authorization"
        );
        eprintln!(
            "\nTo authorize this device, visit:\n\n  {}\n\nand enter the code: {}\n",
            authorization.display_uri(),
            authorization.user_code
        );
    }
}

/// Registration progress of a [`DeviceScheme`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No usable refresh token
    Unregistered,
    /// Device code requested, user not yet prompted
    DeviceCodeRequested,
    /// Polling while the user approves
    PendingUserAuthorization,
    /// A refresh token is stored
    Registered,
}

/// Device authorization with refresh-token persistence
#[derive(Debug)]
pub struct DeviceScheme {
    credentials: DeviceCredentials,
    store: Arc<dyn RefreshTokenStore>,
    prompt: Arc<dyn DevicePrompt>,
    force_pending: AtomicBool,
    state: Mutex<DeviceState>,
}

impl DeviceScheme {
    /// Scheme persisting into `store`, prompting on stderr
    pub fn new(credentials: DeviceCredentials, store: Arc<dyn RefreshTokenStore>) -> Self {
        let force_pending = AtomicBool::new(credentials.force_register);
        Self {
            credentials,
            store,
            prompt: Arc::new(StderrPrompt),
            force_pending,
            state: Mutex::new(DeviceState::Unregistered),
        }
    }

    /// Replace the user prompt
    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn DevicePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// The refresh-token store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RefreshTokenStore> {
        &self.store
    }

    /// Current registration progress
    #[must_use]
    pub fn registration_state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn endpoint<'a>(url: Option<&'a String>, name: &str) -> Result<&'a str> {
        url.map(String::as_str)
            .ok_or_else(|| SessionError::invalid_config(format!("{name} is required for the device scheme")))
    }

    /// The stored record; unreadable counts as absent
    async fn stored_record(&self) -> Option<RefreshTokenRecord> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.get()).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                tracing::warn!("Ignoring refresh token record, registering again: {e}");
                None
            }
            Err(e) => {
                tracing::warn!("Reading the refresh token record failed, registering again: {e}");
                None
            }
        }
    }

    /// Seal and write `record` off the async runtime
    async fn persist(&self, record: RefreshTokenRecord) -> Result<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.put(&record)).await?
    }

    async fn register(&self, http: &HttpTransport, cancel: &CancellationToken) -> Result<Session> {
        self.set_state(DeviceState::Unregistered);
        let authorization = self.request_device_code(http, cancel).await?;
        self.set_state(DeviceState::DeviceCodeRequested);

        self.prompt.show(&authorization);
        self.set_state(DeviceState::PendingUserAuthorization);

        let issued = self.poll_for_token(http, &authorization, cancel).await?;
        let refresh_token = issued
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SessionError::invalid_response("device token response has no refresh token"))?;

        self.persist(RefreshTokenRecord::new(
            refresh_token,
            self.credentials.refresh_policy.is_rotatable(),
        ))
        .await?;
        self.set_state(DeviceState::Registered);
        tracing::info!(client_id = %self.credentials.client_id, "Device registered");

        session_from(issued, Utc::now())
    }

    async fn request_device_code(
        &self,
        http: &HttpTransport,
        cancel: &CancellationToken,
    ) -> Result<DeviceAuthorization> {
        let url = Self::endpoint(http.config().device_code_url.as_ref(), "device_code_url")?;
        let request = http
            .request(Method::POST, url)
            .form(&[("client_id", self.credentials.client_id.as_str())]);
        let response = http.send_cancellable(request, cancel).await?;
        parse_json(response, "device authorization").await
    }

    async fn poll_for_token(
        &self,
        http: &HttpTransport,
        authorization: &DeviceAuthorization,
        cancel: &CancellationToken,
    ) -> Result<OAuthTokenResponse> {
        let lifetime = Duration::from_secs(authorization.expires_in.min(MAX_DEVICE_CODE_LIFETIME_SECS));
        let deadline = tokio::time::Instant::now() + lifetime;
        let mut interval = Duration::from_secs(authorization.interval.min(MAX_DEVICE_CODE_LIFETIME_SECS));

        loop {
            let backoff = if interval.is_zero() {
                Backoff::Immediate
            } else {
                Backoff::Sleep(interval)
            };
            wait(backoff, cancel).await?;

            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::authentication(
                    "device code expired before the user authorized it",
                ));
            }

            match self.poll_once(http, authorization, cancel).await? {
                PollOutcome::Issued(token) => return Ok(token),
                PollOutcome::Pending => tracing::debug!("Authorization pending"),
                PollOutcome::SlowDown => {
                    interval = slowed_down(interval);
                    tracing::debug!(interval_secs = interval.as_secs(), "Server asked to slow down");
                }
            }
        }
    }

    async fn poll_once(
        &self,
        http: &HttpTransport,
        authorization: &DeviceAuthorization,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome> {
        let url = Self::endpoint(http.config().device_token_url.as_ref(), "device_token_url")?;
        let request = http.request(Method::POST, url).form(&[
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", authorization.device_code.as_str()),
            ("client_id", self.credentials.client_id.as_str()),
        ]);
        let response = http.send_raw(request, cancel).await?;

        if response.status().is_success() {
            return parse_json(response, "device token").await.map(PollOutcome::Issued);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.ok();
        let oauth_error = body
            .as_deref()
            .and_then(|b| serde_json::from_str::<OAuthErrorResponse>(b).ok());

        match oauth_error {
            Some(e) if e.error == "authorization_pending" => Ok(PollOutcome::Pending),
            Some(e) if e.error == "slow_down" => Ok(PollOutcome::SlowDown),
            Some(e) if e.error == "access_denied" => Err(SessionError::authentication(format!(
                "user denied device authorization{}",
                describe(e.error_description.as_deref())
            ))),
            Some(e) if e.error == "expired_token" => Err(SessionError::authentication(format!(
                "device code expired{}",
                describe(e.error_description.as_deref())
            ))),
            _ => Err(ErrorClassifier::without_authenticator()
                .classify(status, &headers, body.as_deref())
                .into_error()),
        }
    }

    /// Exchange a stored refresh token, rewriting it only if it rotates
    async fn redeem(
        &self,
        http: &HttpTransport,
        record: &RefreshTokenRecord,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let url = Self::endpoint(http.config().device_token_url.as_ref(), "device_token_url")?;
        let request = http.request(Method::POST, url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", record.refresh_token.as_str()),
            ("client_id", self.credentials.client_id.as_str()),
        ]);
        let response = http.send_cancellable(request, cancel).await?;
        let issued: OAuthTokenResponse = parse_json(response, "refresh").await?;

        if record.rotatable {
            match issued.refresh_token.as_deref().filter(|t| !t.is_empty()) {
                Some(rotated) => {
                    self.persist(RefreshTokenRecord::new(rotated, true)).await?;
                    tracing::debug!("Rotated refresh token persisted");
                }
                None => tracing::warn!("Rotatable refresh returned no new refresh token, keeping the old one"),
            }
        }
        self.set_state(DeviceState::Registered);

        session_from(issued, Utc::now())
    }
}

#[async_trait]
impl AuthScheme for DeviceScheme {
    fn name(&self) -> &'static str {
        "device"
    }

    async fn authenticate(&self, http: &HttpTransport, cancel: &CancellationToken) -> Result<Session> {
        if self.force_pending.swap(false, Ordering::SeqCst) {
            tracing::info!("Forced device registration");
            return self.register(http, cancel).await;
        }

        let Some(record) = self.stored_record().await else {
            return self.register(http, cancel).await;
        };

        match self.redeem(http, &record, cancel).await {
            Err(SessionError::BadRequest { message } | SessionError::Unauthorized { message }) => {
                tracing::warn!("Stored refresh token rejected ({message}), registering again");
                self.register(http, cancel).await
            }
            other => other,
        }
    }

    async fn refresh(
        &self,
        http: &HttpTransport,
        _session: &Session,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let Some(record) = self.stored_record().await else {
            return Err(SessionError::unauthorized("no refresh token stored"));
        };
        match self.redeem(http, &record, cancel).await {
            // Revoked or expired refresh tokens come back as 400 invalid_grant
            Err(SessionError::BadRequest { message } | SessionError::Unauthorized { message }) => {
                Err(SessionError::unauthorized(format!("refresh token rejected: {message}")))
            }
            other => other,
        }
    }

    /// OAuth sessions end locally; the stored refresh token is kept
    async fn logout(&self, _http: &HttpTransport, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn clear_persisted_state(&self) -> Result<()> {
        self.store.clear()?;
        self.set_state(DeviceState::Unregistered);
        Ok(())
    }
}

/// Polling interval after a `slow_down` answer
fn slowed_down(interval: Duration) -> Duration {
    interval.saturating_add(Duration::from_secs(SLOW_DOWN_STEP_SECS))
}

fn describe(detail: Option<&str>) -> String {
    detail.map(|d| format!(": {d}")).unwrap_or_default()
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| SessionError::invalid_response(format!("Failed to read {what} response: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| SessionError::invalid_response(format!("Malformed {what} response: {e}")))
}

fn session_from(token: OAuthTokenResponse, now: DateTime<Utc>) -> Result<Session> {
    let expires_in = token
        .expires_in
        .ok_or_else(|| SessionError::invalid_response("token response has no expires_in"))?;
    let expires_at = TimeDelta::try_seconds(expires_in)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| SessionError::invalid_response(format!("expires_in {expires_in} is out of range")))?;
    Ok(Session::new(token.access_token, expires_at))
}
