//! Password scheme: Basic login, or NTLM through a pluggable engine

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::AuthScheme;
use super::token::{exchange, read_session};
use crate::classify::ErrorClassifier;
use crate::error::{Result, SessionError};
use crate::transport::HttpTransport;
use crate::types::options::AUTHENTICATE_PATH;
use crate::types::{PasswordCredentials, Session};

/// NTLM message generator.
///
/// Implementations produce the raw (not base64) NTLM messages; the scheme
/// handles framing them into `Authorization` headers.
pub trait NtlmEngine: Send + Sync + std::fmt::Debug {
    /// Type 1 (negotiate) message
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the message cannot be built.
    fn negotiate(&self, domain: &str, workstation: Option<&str>) -> Result<Vec<u8>>;

    /// Type 3 (authenticate) message answering the server's type 2 challenge
    ///
    /// # Errors
    ///
    /// Returns `SessionError::KeyMaterial` if the challenge is malformed or
    /// the response cannot be computed.
    fn authenticate(&self, challenge: &[u8], credentials: &PasswordCredentials) -> Result<Vec<u8>>;
}

/// Username/password login against `/token/authenticate`
#[derive(Debug)]
pub struct PasswordScheme {
    credentials: PasswordCredentials,
    ntlm: Option<Arc<dyn NtlmEngine>>,
}

impl PasswordScheme {
    /// Basic login; NTLM is never attempted
    #[must_use]
    pub fn new(credentials: PasswordCredentials) -> Self {
        Self {
            credentials,
            ntlm: None,
        }
    }

    /// Use `engine` whenever the credentials carry a domain
    #[must_use]
    pub fn with_ntlm(mut self, engine: Arc<dyn NtlmEngine>) -> Self {
        self.ntlm = Some(engine);
        self
    }

    async fn basic_login(&self, http: &HttpTransport, cancel: &CancellationToken) -> Result<Session> {
        let request = http
            .request(Method::POST, http.config().auth_endpoint(AUTHENTICATE_PATH))
            .header(AUTHORIZATION, format!("Basic {}", self.credentials.basic_digest()));
        exchange(http, request, cancel).await
    }

    async fn ntlm_handshake(
        &self,
        engine: &dyn NtlmEngine,
        domain: &str,
        http: &HttpTransport,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let url = http.config().auth_endpoint(AUTHENTICATE_PATH);
        let classifier = ErrorClassifier::without_authenticator();

        let negotiate = engine.negotiate(domain, self.credentials.workstation.as_deref())?;
        let first = http
            .send_raw(
                http.request(Method::POST, &url)
                    .header(AUTHORIZATION, format!("NTLM {}", BASE64.encode(negotiate))),
                cancel,
            )
            .await?;

        if first.status().is_success() {
            return read_session(first).await;
        }
        let challenge = match (first.status(), ntlm_challenge(first.headers())) {
            (StatusCode::UNAUTHORIZED, Some(challenge)) => challenge?,
            (status, _) => {
                let headers = first.headers().clone();
                let body = first.text().await.ok();
                return Err(classifier.classify(status, &headers, body.as_deref()).into_error());
            }
        };

        tracing::debug!("NTLM challenge received");
        let answer = engine.authenticate(&challenge, &self.credentials)?;
        let second = http
            .send_raw(
                http.request(Method::POST, &url)
                    .header(AUTHORIZATION, format!("NTLM {}", BASE64.encode(answer))),
                cancel,
            )
            .await?;

        if second.status().is_success() {
            return read_session(second).await;
        }
        let status = second.status();
        let headers = second.headers().clone();
        let body = second.text().await.ok();
        Err(classifier.classify(status, &headers, body.as_deref()).into_error())
    }
}

#[async_trait]
impl AuthScheme for PasswordScheme {
    fn name(&self) -> &'static str {
        if self.credentials.domain.is_some() && self.ntlm.is_some() {
            "ntlm"
        } else {
            "basic"
        }
    }

    async fn authenticate(&self, http: &HttpTransport, cancel: &CancellationToken) -> Result<Session> {
        match (&self.ntlm, &self.credentials.domain) {
            (Some(engine), Some(domain)) => self.ntlm_handshake(engine.as_ref(), domain, http, cancel).await,
            (None, Some(_)) => {
                tracing::debug!("Domain set but no NTLM engine configured, using Basic");
                self.basic_login(http, cancel).await
            }
            _ => self.basic_login(http, cancel).await,
        }
    }
}

/// Base64 challenge from a `WWW-Authenticate: NTLM <challenge>` header
fn ntlm_challenge(headers: &reqwest::header::HeaderMap) -> Option<Result<Vec<u8>>> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("NTLM").then(|| token.trim())
        })
        .map(|token| {
            BASE64
                .decode(token)
                .map_err(|e| SessionError::invalid_response(format!("Malformed NTLM challenge: {e}")))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_ntlm_challenge_parsing() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
        headers.append(
            WWW_AUTHENTICATE,
            HeaderValue::from_str(&format!("NTLM {}", BASE64.encode(b"challenge"))).unwrap(),
        );

        let challenge = ntlm_challenge(&headers).unwrap().unwrap();
        assert_eq!(challenge, b"challenge");
    }

    #[test]
    fn test_bare_ntlm_header_has_no_challenge() {
        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
        assert!(ntlm_challenge(&headers).is_none());
    }

    #[test]
    fn test_scheme_name_depends_on_engine() {
        #[derive(Debug)]
        struct Unused;
        impl NtlmEngine for Unused {
            fn negotiate(&self, _: &str, _: Option<&str>) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn authenticate(&self, _: &[u8], _: &PasswordCredentials) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
        }

        let creds = PasswordCredentials {
            username: "u".to_string(),
            secret: "p".to_string(),
            domain: Some("CORP".to_string()),
            workstation: None,
        };
        assert_eq!(PasswordScheme::new(creds.clone()).name(), "basic");
        assert_eq!(
            PasswordScheme::new(creds).with_ntlm(Arc::new(Unused)).name(),
            "ntlm"
        );
    }
}
