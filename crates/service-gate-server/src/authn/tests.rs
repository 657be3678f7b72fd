// crates/service-gate-server/src/authn/tests.rs
// ============================================================================
// Module: Authentication Chain Tests
// Description: Chain ordering, error kinds, and each authenticator.
// Purpose: Pin which identity wins and when the chain aborts.
// Dependencies: async-trait, axum, tokio, service-gate-core
// ============================================================================

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use serde_json::json;
use service_gate_config::OidcConfig;
use service_gate_core::FixedClock;
use service_gate_core::UserInfo;

use super::AuthnChain;
use super::AuthnError;
use super::Authenticator;
use super::CachedIdentityAuthenticator;
use super::NONCE_BACKEND_GROUP;
use super::NonceAuthenticator;
use super::OidcAuthenticator;
use super::TokenReviewAuthenticator;
use crate::jwt::sign_hs256;
use crate::nonce::NonceSource;
use crate::testing::json_server;

struct Fixed {
    label: &'static str,
    answer: Result<Option<UserInfo>, AuthnError>,
}

#[async_trait]
impl Authenticator for Fixed {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn authenticate(&self, _headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError> {
        self.answer.clone()
    }
}

fn fixed(label: &'static str, answer: Result<Option<UserInfo>, AuthnError>) -> Arc<dyn Authenticator> {
    Arc::new(Fixed {
        label,
        answer,
    })
}

fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    headers
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().timeout(Duration::from_secs(2)).build().unwrap()
}

fn user_token(name: &str) -> String {
    sign_hs256(&json!({"username": name, "groups": ["admins"], "mfa": 1}), b"unused")
}

#[tokio::test]
async fn first_identity_wins_and_failures_are_skipped() {
    let chain = AuthnChain::new(vec![
        fixed("none", Ok(None)),
        fixed("broken", Err(AuthnError::Unavailable("down".to_string()))),
        fixed("alice", Ok(Some(UserInfo::named("alice", Vec::new())))),
        fixed("bob", Ok(Some(UserInfo::named("bob", Vec::new())))),
    ]);
    let user = chain.authenticate(&HeaderMap::new()).await.unwrap().unwrap();
    assert_eq!(user.name, "alice");
}

#[tokio::test]
async fn terminal_error_aborts_the_chain() {
    let chain = AuthnChain::new(vec![
        fixed("reject", Err(AuthnError::Rejected("no".to_string()))),
        fixed("alice", Ok(Some(UserInfo::named("alice", Vec::new())))),
    ]);
    assert_eq!(
        chain.authenticate(&HeaderMap::new()).await,
        Err(AuthnError::Rejected("no".to_string()))
    );
}

#[tokio::test]
async fn unmatched_chain_reports_collected_failures() {
    let quiet = AuthnChain::new(vec![fixed("none", Ok(None))]);
    assert_eq!(quiet.authenticate(&HeaderMap::new()).await, Ok(None));

    let failing = AuthnChain::new(vec![
        fixed("a", Err(AuthnError::Invalid("bad token".to_string()))),
        fixed("b", Ok(None)),
    ]);
    match failing.authenticate(&HeaderMap::new()).await {
        Err(AuthnError::Invalid(detail)) => assert!(detail.contains("a: ")),
        _ => panic!("expected collected failures"),
    }
}

#[tokio::test]
async fn cached_identity_verifies_once() {
    let verifier = json_server(json!({"status": "ok"})).await;
    let member = CachedIdentityAuthenticator::new(
        Some(verifier.base_url.clone()),
        client(),
        Arc::new(FixedClock::at_unix(0)),
    );
    let token = user_token("alice");
    let request = headers(&[("x-authorization", token.as_str())]);

    let user = member.authenticate(&request).await.unwrap().unwrap();
    assert_eq!(user.name, "alice");
    assert_eq!(user.groups, ["admins"]);
    assert!(member.authenticate(&request).await.unwrap().is_some());

    let seen = verifier.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uri, "/auth/token/verify");
    assert_eq!(seen[0].json()["access_token"], token);
    assert_eq!(seen[0].header("authorization"), Some(format!("Bearer {token}")));
}

#[tokio::test]
async fn cached_identity_reads_cookie_and_rejects_invalid_tokens() {
    let verifier = json_server(json!({"status": "invalid token"})).await;
    let member = CachedIdentityAuthenticator::new(
        Some(verifier.base_url.clone()),
        client(),
        Arc::new(FixedClock::at_unix(0)),
    );
    let cookie = format!("theme=dark; auth_token={}", user_token("alice"));
    let request = headers(&[("cookie", cookie.as_str())]);
    assert!(matches!(member.authenticate(&request).await, Err(AuthnError::Invalid(_))));
    assert_eq!(verifier.requests().len(), 1);

    assert_eq!(member.authenticate(&HeaderMap::new()).await, Ok(None));
}

#[tokio::test]
async fn nonce_requires_match_and_trusted_user() {
    let nonce = Arc::new(NonceSource::new(Some("n0nce".to_string()), BTreeSet::new()));
    let member = NonceAuthenticator::new(nonce);

    let user = member
        .authenticate(&headers(&[("authelia-nonce", "n0nce"), ("x-bfl-user", "alice")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.name, "alice");
    assert!(user.in_group(NONCE_BACKEND_GROUP));

    assert!(matches!(
        member.authenticate(&headers(&[("authelia-nonce", "stale")])).await,
        Err(AuthnError::Invalid(_))
    ));
    let missing_user = member.authenticate(&headers(&[("authelia-nonce", "n0nce")])).await;
    assert!(missing_user.as_ref().is_err_and(AuthnError::is_terminal));
    assert_eq!(member.authenticate(&HeaderMap::new()).await, Ok(None));
}

#[tokio::test]
async fn token_review_maps_reviewed_user() {
    let review = json_server(json!({
        "status": {
            "authenticated": true,
            "user": {"username": "system:serviceaccount:ns:sa", "uid": "u-1", "groups": ["sa"]}
        }
    }))
    .await;
    let member = TokenReviewAuthenticator::new(
        format!("{}/review", review.base_url),
        vec!["gate".to_string()],
        client(),
    );

    let user = member
        .authenticate(&headers(&[("authorization", "Bearer sa-token")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.name, "system:serviceaccount:ns:sa");
    assert_eq!(user.uid, "u-1");

    let body = review.requests()[0].json();
    assert_eq!(body["kind"], "TokenReview");
    assert_eq!(body["spec"]["token"], "sa-token");
    assert_eq!(body["spec"]["audiences"][0], "gate");

    assert_eq!(member.authenticate(&headers(&[("authorization", "Basic x")])).await, Ok(None));
}

#[tokio::test]
async fn token_review_rejection_is_not_terminal() {
    let review = json_server(json!({"status": {"authenticated": false, "error": "expired"}})).await;
    let member = TokenReviewAuthenticator::new(review.base_url.clone(), Vec::new(), client());
    assert_eq!(
        member.authenticate(&headers(&[("authorization", "Bearer old")])).await,
        Err(AuthnError::Invalid("expired".to_string()))
    );
}

#[tokio::test]
async fn oidc_uses_discovered_userinfo_endpoint() {
    let userinfo = json_server(json!({"email": "carol@example.com", "roles": ["ops", 7]})).await;
    let issuer =
        json_server(json!({"userinfo_endpoint": format!("{}/userinfo", userinfo.base_url)})).await;
    let member = OidcAuthenticator::new(
        &OidcConfig {
            issuer_url: format!("{}/", issuer.base_url),
            username_claim: "email".to_string(),
            groups_claim: "roles".to_string(),
            refresh_secs: 300,
        },
        client(),
    );
    let request = headers(&[("authorization", "Bearer id-token")]);

    assert!(matches!(member.authenticate(&request).await, Err(AuthnError::Unavailable(_))));

    member.refresh().await.unwrap();
    assert_eq!(issuer.requests()[0].uri, "/.well-known/openid-configuration");
    let user = member.authenticate(&request).await.unwrap().unwrap();
    assert_eq!(user.name, "carol@example.com");
    assert_eq!(user.groups, ["ops"]);
    assert_eq!(userinfo.requests()[0].header("authorization").as_deref(), Some("Bearer id-token"));
}
