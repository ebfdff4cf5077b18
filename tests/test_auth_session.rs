//! Integration tests for the login handshake and token lifecycle
//!
//! The accounts service is simulated with wiremock. Tests assert on observable
//! outcomes: returned tokens, session state, error variants and the number of
//! requests each endpoint received.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use neasmart_bridge::auth::{AuthSession, AuthState, Credentials, TokenSet};
use neasmart_bridge::config::AuthSection;
use neasmart_bridge::error::BridgeError;
use neasmart_bridge::transport::TokenProvider;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EMAIL: &str = "user@example.com";
const PASSWORD: &str = "correct-horse";
const GOOD_CODE: &str = "123456";

fn jwt_with_sid(sid: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(json!({ "sid": sid, "sub": "sub-1" }).to_string());
    format!("{header}.{claims}.signature")
}

fn settings(server: &MockServer) -> AuthSection {
    AuthSection {
        base_url: server.uri(),
        ..AuthSection::default()
    }
}

fn redirect(location: &str) -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("Location", location)
}

/// Mount every endpoint of a successful password + email-code login
async fn mount_login_flow(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/authz-srv/authz"))
        .and(query_param("response_type", "code"))
        .and(query_param("code_challenge_method", "S256"))
        .respond_with(redirect("/login-ui?requestId=req-1"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login-srv/login"))
        .and(body_string_contains(format!("password={PASSWORD}")))
        .respond_with(redirect("/mfa?track_id=track-1&sub=sub-1&requestId=req-1"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login-srv/login"))
        .respond_with(redirect("/login-ui?requestId=req-1&error=true"))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/verification-srv/v2/setup/public/configured/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "sms-medium", "verification_type": "SMS" },
                { "id": "email-medium", "verification_type": "EMAIL" }
            ]
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/verification-srv/v2/authenticate/initiate/email"))
        .and(body_partial_json(json!({ "medium_id": "email-medium", "sub": "sub-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "exchange_id": { "exchange_id": "exchange-1" },
                "status_id": "status-1",
                "medium_text": "u***@example.com"
            }
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/verification-srv/v2/authenticate/authenticate/email"))
        .and(body_partial_json(json!({ "pass_code": GOOD_CODE })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/verification-srv/v2/authenticate/authenticate/email"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "success": false })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login-srv/precheck/continue/track-1"))
        .respond_with(redirect("https://app.example/callback?code=auth-code-1"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token-srv/token"))
        .and(body_partial_json(json!({
            "grant_type": "authorization_code",
            "code": "auth-code-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": jwt_with_sid("sid-login"),
            "refresh_token": "refresh-1",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

fn refresh_mock(expires_in: i64) -> Mock {
    Mock::given(method("POST"))
        .and(path("/token-srv/token"))
        .and(body_partial_json(json!({
            "grant_type": "refresh_token",
            "refresh_token": "refresh-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": jwt_with_sid("sid-refreshed"),
            "refresh_token": "refresh-2",
            "expires_in": expires_in
        })))
}

fn tokens_expiring_in(seconds: i64) -> TokenSet {
    TokenSet {
        access_token: jwt_with_sid("sid-old"),
        refresh_token: "refresh-1".to_string(),
        expires_at: Utc::now() + ChronoDuration::seconds(seconds),
        sid: "sid-old".to_string(),
    }
}

#[tokio::test]
async fn test_full_login_yields_tokens_and_session_id() {
    let server = MockServer::start().await;
    mount_login_flow(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    let challenge = session
        .begin_login(&Credentials::new(EMAIL, PASSWORD))
        .await
        .unwrap();

    assert_eq!(challenge.challenge_id, "exchange-1");
    assert_eq!(challenge.code_length, 6);
    assert_eq!(challenge.destination, "u***@example.com");
    assert!(challenge.deadline > Utc::now());
    assert_eq!(session.state().await, AuthState::AwaitingMfa);

    let tokens = session
        .submit_mfa_code(&challenge.challenge_id, GOOD_CODE)
        .await
        .unwrap();

    assert_eq!(tokens.refresh_token, "refresh-1");
    assert_eq!(tokens.sid, "sid-login");
    assert!(tokens.expires_at > Utc::now() + ChronoDuration::seconds(3500));
    assert_eq!(session.state().await, AuthState::Authenticated);
    assert!(session.pending_challenge().await.is_none());

    let grant = session.access_grant().await.unwrap();
    assert_eq!(grant.sid, "sid-login");
    assert_eq!(grant.access_token, tokens.access_token);
}

#[tokio::test]
async fn test_wrong_password_is_invalid_credentials() {
    let server = MockServer::start().await;
    mount_login_flow(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    let result = session
        .begin_login(&Credentials::new(EMAIL, "wrong-password"))
        .await;

    assert!(matches!(result, Err(BridgeError::InvalidCredentials { .. })));
    assert_eq!(session.state().await, AuthState::Unauthenticated);
    assert!(session.pending_challenge().await.is_none());
}

#[tokio::test]
async fn test_wrong_code_keeps_challenge_for_retry() {
    let server = MockServer::start().await;
    mount_login_flow(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    let challenge = session
        .begin_login(&Credentials::new(EMAIL, PASSWORD))
        .await
        .unwrap();

    let wrong = session
        .submit_mfa_code(&challenge.challenge_id, "000000")
        .await;
    assert!(matches!(wrong, Err(BridgeError::MfaInvalid { .. })));

    let malformed = session
        .submit_mfa_code(&challenge.challenge_id, "12ab")
        .await;
    assert!(matches!(malformed, Err(BridgeError::MfaInvalid { .. })));

    assert_eq!(session.state().await, AuthState::AwaitingMfa);
    assert!(session
        .submit_mfa_code(&challenge.challenge_id, GOOD_CODE)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_expired_challenge_is_distinct_from_wrong_code() {
    let server = MockServer::start().await;
    mount_login_flow(&server).await;

    let settings = AuthSection {
        mfa_timeout_secs: 0,
        ..settings(&server)
    };
    let session = AuthSession::new(&settings).unwrap();
    let challenge = session
        .begin_login(&Credentials::new(EMAIL, PASSWORD))
        .await
        .unwrap();

    let result = session
        .submit_mfa_code(&challenge.challenge_id, GOOD_CODE)
        .await;
    match result {
        Err(BridgeError::MfaExpired { challenge_id }) => {
            assert_eq!(challenge_id, "exchange-1")
        }
        other => panic!("expected MfaExpired, got {other:?}"),
    }

    // The expired challenge is gone; a fresh begin_login is required
    assert!(session.pending_challenge().await.is_none());
    let again = session
        .submit_mfa_code(&challenge.challenge_id, GOOD_CODE)
        .await;
    assert!(matches!(again, Err(BridgeError::AuthorizationFailed { .. })));
}

#[tokio::test]
async fn test_second_begin_login_replaces_pending_challenge() {
    let server = MockServer::start().await;
    mount_login_flow(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    let credentials = Credentials::new(EMAIL, PASSWORD);
    let first = session.begin_login(&credentials).await.unwrap();
    let second = session.begin_login(&credentials).await.unwrap();

    let pending = session.pending_challenge().await.unwrap();
    assert_eq!(pending.challenge_id, second.challenge_id);
    assert!(pending.deadline >= first.deadline);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    refresh_mock(3600).expect(1).mount(&server).await;

    let session = Arc::new(AuthSession::new(&settings(&server)).unwrap());
    session.restore(tokens_expiring_in(30)).await;

    let callers = (0..8).map(|_| {
        let session = session.clone();
        async move { session.get_valid_token().await }
    });
    let results = futures::future::join_all(callers).await;

    let expected = jwt_with_sid("sid-refreshed");
    for result in results {
        assert_eq!(result.unwrap(), expected);
    }

    let tokens = session.token_set().await.unwrap();
    assert_eq!(tokens.refresh_token, "refresh-2");
    assert_eq!(tokens.sid, "sid-refreshed");
    assert_eq!(session.state().await, AuthState::Authenticated);
}

#[tokio::test]
async fn test_token_outside_margin_is_returned_without_refresh() {
    let server = MockServer::start().await;
    refresh_mock(3600).expect(0).mount(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    let tokens = tokens_expiring_in(120);
    session.restore(tokens.clone()).await;

    assert_eq!(session.get_valid_token().await.unwrap(), tokens.access_token);
}

#[tokio::test]
async fn test_token_inside_margin_is_refreshed() {
    let server = MockServer::start().await;
    refresh_mock(3600).expect(1).mount(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    session.restore(tokens_expiring_in(30)).await;

    assert_eq!(
        session.get_valid_token().await.unwrap(),
        jwt_with_sid("sid-refreshed")
    );
}

#[tokio::test]
async fn test_rejected_refresh_token_expires_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token-srv/token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    session.restore(tokens_expiring_in(10)).await;

    let result = session.get_valid_token().await;
    assert!(matches!(result, Err(BridgeError::SessionExpired { .. })));
    assert_eq!(session.state().await, AuthState::Expired);
    assert!(session.token_set().await.is_none());

    // No refresh token left, so no further request is made
    assert!(matches!(
        session.get_valid_token().await,
        Err(BridgeError::SessionExpired { .. })
    ));
}

#[tokio::test]
async fn test_transient_refresh_failure_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token-srv/token"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    refresh_mock(3600).expect(1).mount(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    session.restore(tokens_expiring_in(5)).await;

    assert_eq!(
        session.get_valid_token().await.unwrap(),
        jwt_with_sid("sid-refreshed")
    );
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token_when_not_rotated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token-srv/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": jwt_with_sid("sid-refreshed"),
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    session.restore(tokens_expiring_in(5)).await;
    session.get_valid_token().await.unwrap();

    assert_eq!(session.token_set().await.unwrap().refresh_token, "refresh-1");
}

#[tokio::test]
async fn test_inactive_token_fails_introspection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token-srv/introspect"))
        .and(body_partial_json(json!({ "token": "revoked" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "active": false })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token-srv/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "active": true })))
        .mount(&server)
        .await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    assert!(matches!(
        session.introspect("revoked").await,
        Err(BridgeError::SessionExpired { .. })
    ));
    assert!(session.introspect("live").await.is_ok());
}

#[tokio::test]
async fn test_cancelled_refresh_does_not_leave_session_refreshing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token-srv/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "access_token": jwt_with_sid("sid-refreshed"),
                    "refresh_token": "refresh-2",
                    "expires_in": 3600
                }))
                .set_delay(std::time::Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let session = Arc::new(AuthSession::new(&settings(&server)).unwrap());
    let stale = tokens_expiring_in(5);
    session.restore(stale.clone()).await;

    let refresher = {
        let session = session.clone();
        tokio::spawn(async move { session.get_valid_token().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(session.state().await, AuthState::Refreshing);

    refresher.abort();
    let _ = refresher.await;

    assert_eq!(session.state().await, AuthState::Authenticated);
    assert_eq!(session.token_set().await.unwrap(), stale);
}

#[tokio::test]
async fn test_token_watch_follows_refresh() {
    let server = MockServer::start().await;
    refresh_mock(3600).up_to_n_times(1).mount(&server).await;

    let session = AuthSession::new(&settings(&server)).unwrap();
    session.restore(tokens_expiring_in(5)).await;
    let mut tokens = session.watch_tokens();
    assert_eq!(tokens.borrow().as_ref().unwrap().refresh_token, "refresh-1");

    session.get_valid_token().await.unwrap();
    assert!(tokens.has_changed().unwrap());
    let rotated = tokens.borrow_and_update().clone().unwrap();
    assert_eq!(rotated.refresh_token, "refresh-2");
    assert_eq!(rotated.sid, "sid-refreshed");

    // A fresh token is handed out without touching the watch
    session.get_valid_token().await.unwrap();
    assert!(!tokens.has_changed().unwrap());
}
