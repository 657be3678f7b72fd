// crates/service-gate-server/tests/event_dispatch.rs
// ============================================================================
// Module: Event Dispatch Suite
// Description: Event module self-registration, storage, and watcher push.
// Purpose: Fire events through the data routes and observe fan-out.
// Dependencies: helpers, reqwest, tokio-util, service-gate-server
// ============================================================================

//! Event module round trip through the router and dispatcher.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

mod helpers;

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use service_gate_server::dispatcher::spawn_workers;
use service_gate_server::events::EVENT_GROUP;
use service_gate_server::events::EVENT_VERSION;
use service_gate_server::events::register_module;
use service_gate_server::headers;
use tokio_util::sync::CancellationToken;

use helpers::NONCE;

const APP_KEY: &str = "bytetrade_alerts_1";
const SECRET: &str = "0123456789abcdef";

fn alerts_credential(notification_url: &str) -> String {
    format!(
        r#"
[events]
notification_url = "{notification_url}"

[[bootstrap.credentials]]
app = "alerts"
key = "{APP_KEY}"
secret = "{SECRET}"

[[bootstrap.credentials.permissions]]
dataType = "event"
group = "{EVENT_GROUP}"
version = "{EVENT_VERSION}"
ops = ["Create", "List"]
"#
    )
}

fn event(kind: &str, message: &str) -> Value {
    json!({"type": kind, "version": "v1", "data": {"message": message, "payload": {"id": 1}}})
}

#[tokio::test]
async fn fired_events_are_stored_and_notifications_pushed() {
    let notifier = helpers::upstream(StatusCode::OK, json!({})).await;
    let parts = helpers::state(&helpers::config(&alerts_credential(&notifier.base_url)));
    let state = Arc::clone(&parts.state);
    let cancel = CancellationToken::new();
    let _workers = spawn_workers(parts.queue, parts.fanout, 1, None, &cancel);

    let (base, _shutdown) = helpers::serve(service_gate_server::api_router(Arc::clone(&state))).await;
    register_module(state.store.as_ref(), &state.tenant, &base).await.unwrap();
    state.directory.sync().await.unwrap();

    let triple = ("event", EVENT_GROUP, EVENT_VERSION);
    let create = helpers::request_token(&base, APP_KEY, SECRET, triple, &["Create"]).await;
    let list = helpers::request_token(&base, APP_KEY, SECRET, triple, &["List"]).await;
    let client = reqwest::Client::new();
    let route = format!("{base}/event/{EVENT_GROUP}/{EVENT_VERSION}");

    for body in [event("notification", "disk full"), event("audit", "login")] {
        let fired = client
            .post(&route)
            .header(headers::ACCESS_TOKEN, &create)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(fired.status(), StatusCode::OK);
    }

    let pushed = notifier.wait_for(1).await;
    cancel.cancel();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].method, "POST");
    let credentials = STANDARD.encode(format!("{}:{NONCE}", headers::BACKEND_NONCE));
    assert_eq!(pushed[0].header("authorization"), Some(format!("Basic {credentials}")));
    let alert = pushed[0].json();
    assert_eq!(alert["annotations"]["message"], "disk full");
    assert_eq!(alert["labels"]["type"], "notification");
    assert_eq!(alert["labels"]["namespace"], "user-system-alice");

    let listed = client
        .get(format!("{route}?event_type=audit"))
        .header(headers::ACCESS_TOKEN, &list)
        .send()
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let body: Value = listed.json().await.unwrap();
    let events = body["data"]["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "audit");
    assert_eq!(events[0]["data"]["message"], "login");
}

#[tokio::test]
async fn event_routes_reject_tokens_for_other_operations() {
    let notifier = helpers::upstream(StatusCode::OK, json!({})).await;
    let parts = helpers::state(&helpers::config(&alerts_credential(&notifier.base_url)));
    let state = Arc::clone(&parts.state);
    let (base, _shutdown) = helpers::serve(service_gate_server::api_router(Arc::clone(&state))).await;
    register_module(state.store.as_ref(), &state.tenant, &base).await.unwrap();
    state.directory.sync().await.unwrap();

    let list = helpers::request_token(&base, APP_KEY, SECRET, ("event", EVENT_GROUP, EVENT_VERSION), &[
        "List",
    ])
    .await;
    let reply = reqwest::Client::new()
        .post(format!("{base}/message-dispatcher/v1alpha1/fire-event"))
        .json(&json!({
            "op": "Create",
            "datatype": "event",
            "version": EVENT_VERSION,
            "group": EVENT_GROUP,
            "Token": list,
            "data": event("notification", "x"),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(reply.status(), StatusCode::FORBIDDEN);
    assert!(notifier.requests().is_empty());
}
