//! HTTP transport with classified retries
//!
//! [`HttpTransport`] owns the `reqwest` client and runs every request
//! through the retry loop: each failure is turned into a
//! [`ClassifiedError`], transient ones are retried per the configured
//! [`RetryPolicy`](crate::retry::RetryPolicy), and everything else is
//! returned to the caller. [`AuthenticatedTransport`] layers session tokens
//! and re-authentication on top of it.

pub mod authenticated;

pub use authenticated::AuthenticatedTransport;

use async_trait::async_trait;
use reqwest::header::{ACCEPT_LANGUAGE, AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::classify::{ClassifiedError, ErrorClassifier};
use crate::error::{Result, SessionError};
use crate::retry::{RetryState, wait};
use crate::types::SessionConfig;

/// Header carrying the configured client identifier
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Anything that can execute a request on behalf of a caller
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `request`, retrying transient failures
    ///
    /// # Errors
    /// Returns the last classified error once retries are exhausted, or the
    /// first fatal one.
    async fn send(&self, request: RequestBuilder) -> Result<Response>;

    /// Like [`Transport::send`], but the caller can abort pending waits
    ///
    /// # Errors
    /// Returns `SessionError::Cancelled` if `cancel` fires first.
    async fn send_cancellable(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<Response>;
}

/// Plain HTTP transport with retry and backoff
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: Arc<SessionConfig>,
}

impl HttpTransport {
    /// Build a transport; headers common to every request are set on the client
    ///
    /// # Errors
    /// Returns `SessionError::InvalidConfig` if the configuration is invalid or
    /// a header value is not representable.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value("user agent", &config.user_agent)?);
        if let Some(client_id) = &config.client_identifier {
            headers.insert(
                HeaderName::from_static(CLIENT_ID_HEADER),
                header_value("client identifier", client_id)?,
            );
        }
        if let Some(locale) = &config.locale {
            headers.insert(ACCEPT_LANGUAGE, header_value("locale", locale)?);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SessionError::invalid_config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Shared configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a request on the underlying client
    #[must_use]
    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// `Authorization` value for a session token
    ///
    /// # Errors
    /// Returns `SessionError::InvalidResponse` if the token contains
    /// characters not allowed in a header.
    pub fn authorization_value(&self, token: &str) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("{} {token}", self.config.authorization_scheme))
            .map_err(|_| SessionError::invalid_response("session token is not a valid header value"))?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Attach the session token to a request
    ///
    /// # Errors
    /// See [`HttpTransport::authorization_value`].
    pub fn authorize(&self, request: RequestBuilder, token: &str) -> Result<RequestBuilder> {
        Ok(request.header(AUTHORIZATION, self.authorization_value(token)?))
    }

    /// Execute a request once and classify a failure
    pub(crate) async fn attempt(
        &self,
        request: RequestBuilder,
        classifier: &ErrorClassifier,
    ) -> std::result::Result<Response, ClassifiedError> {
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.text().await.ok();
                Err(classifier.classify(status, &headers, body.as_deref()))
            }
            Err(e) => Err(classifier.classify_transport(&e)),
        }
    }

    /// Execute a request, retrying only network failures, 5xx and 429.
    ///
    /// Every other response, including 4xx, is returned for the caller to
    /// interpret. The NTLM handshake and device-code polling use this since
    /// their protocol lives in 401/400 bodies and headers.
    ///
    /// # Errors
    /// Returns the last transient error once retries are exhausted.
    pub async fn send_raw(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<Response> {
        let classifier = ErrorClassifier::without_authenticator();
        let mut state = RetryState::new(&self.config.retry);

        loop {
            let attempt = replayable(&request)?;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SessionError::Cancelled),
                outcome = attempt.send() => outcome,
            };

            let classified = match outcome {
                Ok(response)
                    if !response.status().is_server_error()
                        && response.status() != StatusCode::TOO_MANY_REQUESTS =>
                {
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response.text().await.ok();
                    classifier.classify(status, &headers, body.as_deref())
                }
                Err(e) => classifier.classify_transport(&e),
            };

            match classified {
                ClassifiedError::Retryable(_) | ClassifiedError::RetryableAfter { .. } => {
                    back_off(&mut state, classified, cancel).await?;
                }
                other => return Err(other.into_error()),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.send_cancellable(request, &CancellationToken::new()).await
    }

    async fn send_cancellable(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<Response> {
        let classifier = ErrorClassifier::without_authenticator();
        let mut state = RetryState::new(&self.config.retry);

        loop {
            let attempt = replayable(&request)?;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SessionError::Cancelled),
                outcome = self.attempt(attempt, &classifier) => outcome,
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(ClassifiedError::Fatal(e) | ClassifiedError::Reauthenticate(e)) => return Err(e),
                Err(classified) => back_off(&mut state, classified, cancel).await?,
            }
        }
    }
}

/// Count a transient failure and wait before the next try.
///
/// Returns the failure itself once the retry budget is spent, without
/// waiting again.
pub(crate) async fn back_off(
    state: &mut RetryState<'_>,
    classified: ClassifiedError,
    cancel: &CancellationToken,
) -> Result<()> {
    let not_before = classified.not_before();
    let error = classified.into_error();

    match state.record_failure(not_before) {
        None => {
            tracing::warn!(attempts = state.attempt(), "Giving up after retries: {error}");
            Err(error)
        }
        Some(backoff) => {
            tracing::debug!(attempt = state.attempt(), ?backoff, "Retrying after: {error}");
            wait(backoff, cancel).await
        }
    }
}

/// Copy of a request for one attempt
pub(crate) fn replayable(request: &RequestBuilder) -> Result<RequestBuilder> {
    request
        .try_clone()
        .ok_or_else(|| SessionError::invalid_config("streaming request bodies cannot be retried"))
}

fn header_value(what: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SessionError::invalid_config(format!("{what} '{value}' is not a valid header value")))
}
