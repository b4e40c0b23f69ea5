//! Integration tests for security features: timeouts, cancellation and
//! secret redaction
//!
//! These tests verify that the mechanisms actually bound the time spent
//! and are not false positives.

mod common;

use bearer_session::{
    Authenticator, CertificateMaterial, Credentials, HttpTransport, RetryPolicy, Session, SessionConfig,
    SessionError, Transport,
};
use chrono::{TimeDelta, Utc};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{CERT_PEM, KEY_PEM, fast_retry, init_tracing, token_body};

fn transport_with_timeout(server: &MockServer, timeout: Duration, retry: RetryPolicy) -> HttpTransport {
    init_tracing();
    let config = SessionConfig::builder()
        .auth_url(server.uri())
        .request_timeout(timeout)
        .retry(retry)
        .build();
    HttpTransport::new(config).unwrap()
}

// ============================================================================
// Timeout Tests - Verify timeouts actually prevent blocking
// ============================================================================

#[tokio::test]
async fn test_request_timeout_actually_prevents_blocking() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let http = transport_with_timeout(&server, Duration::from_millis(200), RetryPolicy::no_retry());

    let start = Instant::now();
    let err = http.send(http.request(Method::GET, server.uri())).await.unwrap_err();
    let elapsed = start.elapsed();

    // Without the timeout this would take ~10s
    assert!(elapsed < Duration::from_secs(2), "timeout failed, took {elapsed:?}");
    assert!(matches!(err, SessionError::Transport(_)), "got {err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_timed_out_attempt_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second try"))
        .mount(&server)
        .await;

    let http = transport_with_timeout(&server, Duration::from_millis(200), fast_retry(2));

    let start = Instant::now();
    let response = http.send(http.request(Method::GET, server.uri())).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "second try");
    assert!(start.elapsed() < Duration::from_secs(2));
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[tokio::test]
async fn test_cancellation_aborts_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let http = transport_with_timeout(&server, Duration::from_secs(30), RetryPolicy::no_retry());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = http
        .send_cancellable(http.request(Method::GET, server.uri()), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancelled_token_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let http = transport_with_timeout(&server, Duration::from_secs(5), fast_retry(3));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = http
        .send_cancellable(http.request(Method::GET, server.uri()), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Cancelled));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_cancelled_login_leaves_no_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/authenticate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("late", TimeDelta::hours(1)))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let http = Arc::new(transport_with_timeout(&server, Duration::from_secs(30), fast_retry(1)));
    let authenticator = Authenticator::from_credentials(Credentials::password("alice", "pw"), http).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = authenticator.token(false, &cancel).await.unwrap_err();
    assert!(matches!(err, SessionError::Cancelled), "got {err:?}");
    assert!(authenticator.expires_at().await.is_none());
}

// ============================================================================
// Redaction Tests - secrets never reach Debug output
// ============================================================================

#[test]
fn test_password_is_redacted() {
    let credentials = Credentials::password("alice", "hunter2-secret");
    let debug = format!("{credentials:?}");
    assert!(debug.contains("alice"));
    assert!(!debug.contains("hunter2-secret"));
}

#[test]
fn test_session_token_is_redacted() {
    let session = Session::new("eyJ-very-secret-token", Utc::now() + TimeDelta::hours(1));
    assert!(!format!("{session:?}").contains("very-secret"));
}

#[test]
fn test_private_key_is_redacted() {
    let material = CertificateMaterial::from_pem(CERT_PEM, KEY_PEM).unwrap();
    let debug = format!("{material:?}");
    assert!(!debug.contains("PRIVATE KEY"));
    assert!(debug.contains("REDACTED"));
}

#[tokio::test]
async fn test_authenticator_debug_hides_live_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("live-secret-token", TimeDelta::hours(1))))
        .mount(&server)
        .await;

    let http = Arc::new(transport_with_timeout(&server, Duration::from_secs(5), fast_retry(0)));
    let authenticator = Authenticator::from_credentials(Credentials::password("alice", "pw"), http).unwrap();
    assert_eq!(authenticator.get_token().await.unwrap(), "live-secret-token");

    let debug = format!("{authenticator:?}");
    assert!(debug.contains("basic"));
    assert!(!debug.contains("live-secret-token"));
}
