//! Session-token endpoint payloads and the calls shared by every scheme

use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::classify::ClassifiedError;
use crate::error::{Result, SessionError};
use crate::retry::RetryState;
use crate::transport::{HttpTransport, Transport, back_off, replayable};
use crate::types::options::{LOGOUT_PATH, REFRESH_PATH, VALIDATE_PATH};
use crate::types::Session;

/// Body returned by `/token/authenticate`, `/token/refresh` and `/token/validate`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    /// Server status word or code
    #[serde(default)]
    pub status: Option<serde_json::Value>,

    /// Human-readable status
    #[serde(default)]
    pub status_message: Option<String>,

    /// Issued token, absent on failure
    #[serde(default)]
    pub token_info: Option<TokenInfo>,
}

/// Token details inside a [`TokenResponse`]
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    /// Server-side token identifier
    #[serde(default)]
    pub token_id: Option<String>,

    /// Opaque token value sent in the `Authorization` header
    pub token_value: String,

    /// Expiry as epoch milliseconds
    pub expires_at: i64,

    /// Identifier of the associated refresh token, if any
    #[serde(default)]
    pub refresh_token_id: Option<String>,
}

impl std::fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInfo")
            .field("token_id", &self.token_id)
            .field("token_value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("refresh_token_id", &self.refresh_token_id)
            .finish()
    }
}

impl TokenResponse {
    /// The issued token, or an error quoting the server's status message
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidResponse` if there is no token.
    pub fn into_token_info(self) -> Result<TokenInfo> {
        match self.token_info {
            Some(info) if !info.token_value.is_empty() => Ok(info),
            _ => Err(SessionError::invalid_response(format!(
                "no token in response: {}",
                self.status_message.as_deref().unwrap_or("no status message")
            ))),
        }
    }

    /// Convert into a [`Session`]; expiry comes from the response only
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidResponse` if there is no token or its
    /// expiry is out of range.
    pub fn into_session(self) -> Result<Session> {
        let info = self.into_token_info()?;
        let expires_at = expiry_from_millis(info.expires_at)?;
        Ok(Session::new(info.token_value, expires_at))
    }
}

/// Parse an epoch-milliseconds expiry
///
/// # Errors
///
/// Returns `SessionError::InvalidResponse` for values chrono cannot represent.
pub fn expiry_from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SessionError::invalid_response(format!("expiresAt {millis} is out of range")))
}

/// Decode a successful token response into a session.
///
/// The body is read once; a failure here is not retried.
pub(crate) async fn read_session(response: Response) -> Result<Session> {
    let body = response
        .text()
        .await
        .map_err(|e| SessionError::invalid_response(format!("Token response body could not be read: {e}")))?;
    parse_session(&body)
}

fn parse_session(body: &str) -> Result<Session> {
    serde_json::from_str::<TokenResponse>(body)
        .map_err(|e| SessionError::invalid_response(format!("Malformed token response: {e}")))?
        .into_session()
}

/// Send a login request through the retry pipeline and read the session.
///
/// A body that breaks off mid-read counts as a transient failure and
/// replays the request under its own retry budget.
pub(crate) async fn exchange(
    http: &HttpTransport,
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Session> {
    let mut state = RetryState::new(&http.config().retry);
    loop {
        let response = http.send_cancellable(replayable(&request)?, cancel).await?;
        match response.text().await {
            Ok(body) => return parse_session(&body),
            Err(e) => {
                let cause = SessionError::transport(format!("Token response body could not be read: {e}"));
                back_off(&mut state, ClassifiedError::Retryable(cause), cancel).await?;
            }
        }
    }
}

/// `POST /token/refresh` bearing the current token
pub(crate) async fn refresh_session(
    http: &HttpTransport,
    session: &Session,
    cancel: &CancellationToken,
) -> Result<Session> {
    let request = http.authorize(
        http.request(Method::POST, http.config().auth_endpoint(REFRESH_PATH)),
        session.token(),
    )?;
    exchange(http, request, cancel).await
}

/// `POST /token/logout` bearing the current token
pub(crate) async fn logout_session(http: &HttpTransport, session: &Session) -> Result<()> {
    let request = http.authorize(
        http.request(Method::POST, http.config().auth_endpoint(LOGOUT_PATH)),
        session.token(),
    )?;
    http.send(request).await?;
    Ok(())
}

/// `GET /token/validate`, returning the expiry the server reports
pub(crate) async fn validate_session(http: &HttpTransport, session: &Session) -> Result<DateTime<Utc>> {
    let request = http.authorize(
        http.request(Method::GET, http.config().auth_endpoint(VALIDATE_PATH)),
        session.token(),
    )?;
    let response = http.send(request).await?;
    Ok(read_session(response).await?.expires_at())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_response() {
        let body = r#"{
            "status": "SUCCESS",
            "statusMessage": "Authenticated",
            "tokenInfo": {
                "tokenId": "t-1",
                "tokenValue": "abc.def",
                "expiresAt": 1767225600000,
                "refreshTokenId": "r-1"
            }
        }"#;
        let session = serde_json::from_str::<TokenResponse>(body)
            .unwrap()
            .into_session()
            .unwrap();
        assert_eq!(session.token(), "abc.def");
        assert_eq!(session.expires_at().timestamp(), 1_767_225_600);
    }

    #[test]
    fn test_missing_token_info_reports_status_message() {
        let body = r#"{"status": "FAILURE", "statusMessage": "Account locked"}"#;
        let err = serde_json::from_str::<TokenResponse>(body)
            .unwrap()
            .into_session()
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidResponse(_)));
        assert!(err.to_string().contains("Account locked"));
    }

    #[test]
    fn test_empty_token_value_is_rejected() {
        let body = r#"{"tokenInfo": {"tokenValue": "", "expiresAt": 0}}"#;
        let response: TokenResponse = serde_json::from_str(body).unwrap();
        assert!(response.into_session().is_err());
    }

    #[test]
    fn test_expiry_out_of_range() {
        assert!(expiry_from_millis(i64::MAX).is_err());
    }

    #[test]
    fn test_token_info_debug_redacts_value() {
        let info = TokenInfo {
            token_id: None,
            token_value: "very-secret".to_string(),
            expires_at: 0,
            refresh_token_id: None,
        };
        assert!(!format!("{info:?}").contains("very-secret"));
    }
}
