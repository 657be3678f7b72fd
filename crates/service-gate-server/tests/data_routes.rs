// crates/service-gate-server/tests/data_routes.rs
// ============================================================================
// Module: Data Route Suite
// Description: Registration, token issuance, and provider routing end to end.
// Purpose: Walk an app from registration to a scoped provider call.
// Dependencies: helpers, reqwest, service-gate-server
// ============================================================================

//! Registration-to-provider flow over the API listener.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

mod helpers;

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use service_gate_server::headers;
use service_gate_server::jwt::sign_hs256;

use helpers::NONCE;
use helpers::NOW;
use helpers::REGISTRAR_SECRET;

const TRIPLE: (&str, &str, &str) = ("calendar", "service.calendar", "v1");

fn provider_toml(endpoint: &str) -> String {
    format!(
        r#"
[[bootstrap.providers]]
name = "calendar-provider"
kind = "provider"
dataType = "calendar"
group = "service.calendar"
version = "v1"
endpoint = "{endpoint}"

[[bootstrap.providers.opApis]]
name = "List"
uri = "/api/list"

[[bootstrap.providers.opApis]]
name = "Delete"
uri = "/api/delete"
"#
    )
}

async fn register_app(base: &str) -> (String, String) {
    let owner = sign_hs256(&json!({"username": "alice", "exp": NOW + 60}), REGISTRAR_SECRET.as_bytes());
    let reply = reqwest::Client::new()
        .post(format!("{base}/permission/v1alpha1/register"))
        .header(headers::AUTHORIZATION_TOKEN, owner)
        .json(&json!({"app": "todo", "appid": "todo-1", "perm": [
            {"group": "service.calendar", "dataType": "calendar", "version": "v1", "ops": ["List"]}
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(reply.status(), StatusCode::OK);
    let body: Value = reply.json().await.unwrap();
    (
        body["data"]["app_key"].as_str().unwrap().to_string(),
        body["data"]["app_secret"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn registered_app_lists_through_its_provider() {
    let provider = helpers::upstream(reqwest::StatusCode::OK, json!({"items": ["standup"]})).await;
    let parts = helpers::state(&helpers::config(&provider_toml(&provider.base_url)));
    let (base, _shutdown) = helpers::serve_api(Arc::clone(&parts.state)).await;

    let (app_key, secret) = register_app(&base).await;
    let token = helpers::request_token(&base, &app_key, &secret, TRIPLE, &["List"]).await;
    let client = reqwest::Client::new();

    let listed = client
        .get(format!("{base}/calendar/service.calendar/v1?owner=alice"))
        .header(headers::ACCESS_TOKEN, &token)
        .send()
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let body: Value = listed.json().await.unwrap();
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"], json!({"items": ["standup"]}));

    let seen = provider.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uri, "/api/list");
    assert_eq!(seen[0].header(headers::BACKEND_NONCE).as_deref(), Some(NONCE));
    let payload = seen[0].json();
    assert_eq!(payload["appkey"], app_key.as_str());
    assert_eq!(payload["param"]["filters"]["owner"][0], "alice");

    let deleted = client
        .delete(format!("{base}/calendar/service.calendar/v1/1"))
        .header(headers::ACCESS_TOKEN, &token)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::FORBIDDEN);
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test]
async fn tokens_are_not_issued_beyond_the_registered_grant() {
    let provider = helpers::upstream(reqwest::StatusCode::OK, json!({})).await;
    let parts = helpers::state(&helpers::config(&provider_toml(&provider.base_url)));
    let (base, _shutdown) = helpers::serve_api(Arc::clone(&parts.state)).await;
    let (app_key, secret) = register_app(&base).await;

    let reply = reqwest::Client::new()
        .post(format!("{base}/permission/v1alpha1/access"))
        .json(&json!({
            "app_key": app_key,
            "timestamp": NOW,
            "token": helpers::access_digest(&app_key, NOW, &secret),
            "perm": {"group": "service.calendar", "dataType": "calendar", "version": "v1", "ops": ["Delete"]},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(reply.status(), StatusCode::FORBIDDEN);
    assert!(provider.requests().is_empty());
}
