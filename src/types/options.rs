//! Session configuration

use std::ops::RangeInclusive;
use std::time::Duration;
use typed_builder::TypedBuilder;

use super::session::FreshnessWindows;
use crate::error::{Result, SessionError};
use crate::retry::RetryPolicy;
use crate::utils::default_user_agent;

/// Prefix of every environment variable read by [`SessionConfig::from_env`]
pub const ENV_PREFIX: &str = "BEARER_SESSION_";

const DEFAULT_CHALLENGE_LEN: RangeInclusive<usize> = 100..=200;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Login endpoint for password and certificate schemes
pub const AUTHENTICATE_PATH: &str = "/token/authenticate";
/// Session refresh endpoint
pub const REFRESH_PATH: &str = "/token/refresh";
/// Session logout endpoint
pub const LOGOUT_PATH: &str = "/token/logout";
/// Session validation endpoint
pub const VALIDATE_PATH: &str = "/token/validate";

/// Configuration shared by the authenticator and the transport
#[derive(Debug, Clone, TypedBuilder)]
#[builder(
    builder_method(doc = "Create a new builder for SessionConfig"),
    builder_type(doc = "Builder for SessionConfig", vis = "pub"),
    build_method(doc = "Build the SessionConfig")
)]
pub struct SessionConfig {
    /// Base URL of the session-token service (`/token/*` lives under it)
    #[builder(setter(into))]
    pub auth_url: String,

    /// Base URL of the business API, used by [`crate::AuthenticatedTransport::url`]
    #[builder(default, setter(strip_option, into))]
    pub api_url: Option<String>,

    /// Device authorization endpoint (device scheme)
    #[builder(default, setter(strip_option, into))]
    pub device_code_url: Option<String>,

    /// OAuth token endpoint for polling and refresh (device scheme)
    #[builder(default, setter(strip_option, into))]
    pub device_token_url: Option<String>,

    /// Value of the client-identifier header sent with every request
    #[builder(default, setter(strip_option, into))]
    pub client_identifier: Option<String>,

    /// Locale sent as `Accept-Language`
    #[builder(default, setter(strip_option, into))]
    pub locale: Option<String>,

    /// `User-Agent` header value
    #[builder(default = default_user_agent(), setter(into))]
    pub user_agent: String,

    /// Scheme word placed before the session token in `Authorization`
    #[builder(default = "Bearer".to_string(), setter(into))]
    pub authorization_scheme: String,

    /// Timeout for each individual HTTP request
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,

    /// Backoff policy for every retried call
    #[builder(default)]
    pub retry: RetryPolicy,

    /// Refresh and grace windows around token expiry
    #[builder(default)]
    pub freshness: FreshnessWindows,

    /// Bounds for the random challenge length of the certificate scheme
    #[builder(default = DEFAULT_CHALLENGE_LEN)]
    pub challenge_len: RangeInclusive<usize>,
}

impl SessionConfig {
    /// Build a configuration from `BEARER_SESSION_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if `BEARER_SESSION_AUTH_URL` is
    /// missing or a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source
    ///
    /// # Errors
    ///
    /// See [`SessionConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty());

        fn parsed<T: std::str::FromStr>(name: &str, value: Option<String>) -> Result<Option<T>>
        where
            T::Err: std::fmt::Display,
        {
            value
                .map(|v| {
                    v.trim().parse::<T>().map_err(|e| {
                        SessionError::invalid_config(format!("{ENV_PREFIX}{name}: {e}"))
                    })
                })
                .transpose()
        }

        let auth_url = var("AUTH_URL").ok_or_else(|| {
            SessionError::invalid_config(format!("{ENV_PREFIX}AUTH_URL is not set"))
        })?;

        let mut config = Self::builder().auth_url(auth_url).build();
        config.api_url = var("API_URL");
        config.device_code_url = var("DEVICE_CODE_URL");
        config.device_token_url = var("DEVICE_TOKEN_URL");
        config.client_identifier = var("CLIENT_IDENTIFIER");
        config.locale = var("LOCALE");

        if let Some(period) = parsed("RETRY_PERIOD_MS", var("RETRY_PERIOD_MS"))? {
            config.retry.period_ms = period;
        }
        if let Some(max_period) = parsed("RETRY_MAX_PERIOD_MS", var("RETRY_MAX_PERIOD_MS"))? {
            config.retry.max_period_ms = max_period;
        }
        if let Some(multiplier) = parsed("RETRY_BACKOFF_MULTIPLIER", var("RETRY_BACKOFF_MULTIPLIER"))? {
            config.retry.backoff_multiplier = multiplier;
        }
        if let Some(attempts) = parsed("RETRY_MAX_ATTEMPTS", var("RETRY_MAX_ATTEMPTS"))? {
            config.retry.max_attempts = attempts;
        }
        if let Some(window) = parsed("REFRESH_WINDOW_SECS", var("REFRESH_WINDOW_SECS"))? {
            config.freshness.refresh_window_secs = window;
        }
        if let Some(grace) = parsed("EXPIRED_GRACE_SECS", var("EXPIRED_GRACE_SECS"))? {
            config.freshness.expired_grace_secs = grace;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check URLs, retry policy, and challenge bounds
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let urls = [
            Some(("auth_url", &self.auth_url)),
            self.api_url.as_ref().map(|u| ("api_url", u)),
            self.device_code_url.as_ref().map(|u| ("device_code_url", u)),
            self.device_token_url.as_ref().map(|u| ("device_token_url", u)),
        ];
        for (name, url) in urls.into_iter().flatten() {
            reqwest::Url::parse(url)
                .map_err(|e| SessionError::invalid_config(format!("{name} '{url}' is not a valid URL: {e}")))?;
        }

        self.retry.validate()?;

        if self.challenge_len.is_empty() || *self.challenge_len.start() == 0 {
            return Err(SessionError::invalid_config(format!(
                "challenge length range {:?} is empty",
                self.challenge_len
            )));
        }
        Ok(())
    }

    /// Full URL of a `/token/*` endpoint
    #[must_use]
    pub fn auth_endpoint(&self, path: &str) -> String {
        join_url(&self.auth_url, path)
    }
}

/// Join a base URL and a path without doubling or dropping the slash
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builder_defaults() {
        let config = SessionConfig::builder()
            .auth_url("https://auth.example.com")
            .build();
        assert_eq!(config.authorization_scheme, "Bearer");
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.freshness, FreshnessWindows::default());
        assert_eq!(config.challenge_len, 100..=200);
        assert!(config.user_agent.starts_with("bearer-session/"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auth_endpoint_joins_cleanly() {
        let config = SessionConfig::builder()
            .auth_url("https://auth.example.com/")
            .build();
        assert_eq!(
            config.auth_endpoint(AUTHENTICATE_PATH),
            "https://auth.example.com/token/authenticate"
        );
        assert_eq!(join_url("http://h/api", "v2/items"), "http://h/api/v2/items");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<String, String> = [
            ("BEARER_SESSION_AUTH_URL", "https://auth.example.com"),
            ("BEARER_SESSION_LOCALE", "de-DE"),
            ("BEARER_SESSION_RETRY_MAX_ATTEMPTS", "7"),
            ("BEARER_SESSION_RETRY_PERIOD_MS", "250"),
            ("BEARER_SESSION_EXPIRED_GRACE_SECS", "30"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = SessionConfig::from_lookup(|name| vars.get(name).cloned()).unwrap();
        assert_eq!(config.locale.as_deref(), Some("de-DE"));
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.period_ms, 250);
        assert_eq!(config.freshness.expired_grace_secs, 30);
    }

    #[test]
    fn test_from_lookup_requires_auth_url() {
        let result = SessionConfig::from_lookup(|_| None);
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let result = SessionConfig::from_lookup(|name| match name {
            "BEARER_SESSION_AUTH_URL" => Some("https://auth.example.com".to_string()),
            "BEARER_SESSION_RETRY_MAX_ATTEMPTS" => Some("many".to_string()),
            _ => None,
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_validate_rejects_bad_url_and_challenge() {
        let config = SessionConfig::builder().auth_url("not a url").build();
        assert!(config.validate().is_err());

        let config = SessionConfig::builder()
            .auth_url("https://auth.example.com")
            .challenge_len(0..=0)
            .build();
        assert!(config.validate().is_err());
    }
}
