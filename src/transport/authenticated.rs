//! Transport that attaches the session token to every request

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{HttpTransport, Transport, back_off, replayable};
use crate::auth::Authenticator;
use crate::classify::{ClassifiedError, ErrorClassifier};
use crate::error::{Result, SessionError};
use crate::retry::RetryState;
use crate::types::options::join_url;

/// Executes business-API calls with a fresh session token.
///
/// A 401 triggers one re-authentication; the retried call counts as an
/// attempt but does not wait. A second 401 is returned to the caller.
#[derive(Debug, Clone)]
pub struct AuthenticatedTransport {
    http: Arc<HttpTransport>,
    authenticator: Arc<Authenticator>,
}

impl AuthenticatedTransport {
    /// Transport sharing the authenticator's HTTP client and configuration
    #[must_use]
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self {
            http: Arc::clone(authenticator.http()),
            authenticator,
        }
    }

    /// The authenticator supplying tokens
    #[must_use]
    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    /// Absolute URL for a path under the configured `api_url`
    ///
    /// # Errors
    /// Returns `SessionError::InvalidConfig` if no `api_url` is configured.
    pub fn url(&self, path: &str) -> Result<String> {
        let base = self
            .http
            .config()
            .api_url
            .as_deref()
            .ok_or_else(|| SessionError::invalid_config("api_url is not configured"))?;
        Ok(join_url(base, path))
    }

    /// Start a request; the token is attached when it is sent
    #[must_use]
    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// `GET` a path under `api_url` and decode the JSON body
    ///
    /// # Errors
    /// Returns the failure of the call, or `SessionError::InvalidResponse`
    /// if the body does not decode.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, self.url(path)?)).await?;
        response
            .json()
            .await
            .map_err(|e| SessionError::invalid_response(format!("Malformed response body: {e}")))
    }
}

#[async_trait]
impl Transport for AuthenticatedTransport {
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.send_cancellable(request, &CancellationToken::new()).await
    }

    async fn send_cancellable(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<Response> {
        let mut state = RetryState::new(&self.http.config().retry);
        let mut classifier = ErrorClassifier::with_authenticator();
        let mut token = self.authenticator.token(false, cancel).await?;

        loop {
            let attempt = self.http.authorize(replayable(&request)?, &token)?;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SessionError::Cancelled),
                outcome = self.http.attempt(attempt, &classifier) => outcome,
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(ClassifiedError::Fatal(e)) => return Err(e),
                Err(ClassifiedError::Reauthenticate(e)) => {
                    if state.record_failure(None).is_none() {
                        return Err(e);
                    }
                    tracing::info!(attempt = state.attempt(), "Session token rejected, re-authenticating");
                    token = self.authenticator.reauthenticate(&token, cancel).await?;
                    classifier = ErrorClassifier::without_authenticator();
                }
                Err(classified) => {
                    back_off(&mut state, classified, cancel).await?;
                    token = self.authenticator.token(false, cancel).await?;
                }
            }
        }
    }
}
