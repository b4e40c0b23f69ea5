//! Shared fixtures for the integration tests

#![allow(dead_code)]

use bearer_session::{RetryPolicy, SessionConfig};
use chrono::{TimeDelta, Utc};
use serde_json::{Value, json};
use std::time::Duration;
use wiremock::MockServer;

pub const CERT_PEM: &str = include_str!("../fixtures/client_cert.pem");
pub const KEY_PEM: &str = include_str!("../fixtures/client_key.pem");

/// Millisecond backoff so suites run fast
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 2.0, max_attempts)
}

/// Configuration pointing every endpoint at `server`
pub fn config(server: &MockServer, retry: RetryPolicy) -> SessionConfig {
    SessionConfig::builder()
        .auth_url(server.uri())
        .api_url(format!("{}/api", server.uri()))
        .device_code_url(format!("{}/device/code", server.uri()))
        .device_token_url(format!("{}/oauth/token", server.uri()))
        .client_identifier("integration-tests")
        .locale("fr-CA")
        .retry(retry)
        .build()
}

/// Login/refresh body issuing `token` valid for `lifetime`
pub fn token_body(token: &str, lifetime: TimeDelta) -> Value {
    json!({
        "status": "SUCCESS",
        "statusMessage": "OK",
        "tokenInfo": {
            "tokenId": format!("id-{token}"),
            "tokenValue": token,
            "expiresAt": (Utc::now() + lifetime).timestamp_millis(),
        }
    })
}

/// Install a `tracing` subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
