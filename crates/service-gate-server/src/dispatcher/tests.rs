// crates/service-gate-server/src/dispatcher/tests.rs
// ============================================================================
// Module: Event Dispatcher Tests
// Description: Filtered fanout, failure handling, and worker draining.
// Purpose: Confirm best-effort delivery to matching watcher callbacks.
// Dependencies: axum, tokio, service-gate-core
// ============================================================================

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;
use service_gate_core::InMemoryDirectoryStore;
use service_gate_core::ProviderDirectory;
use service_gate_core::ProviderKind;
use service_gate_core::ProviderRecord;
use service_gate_core::records::Callback;
use tokio_util::sync::CancellationToken;

use super::DispatchError;
use super::EventDispatcher;
use super::WatcherFanout;
use super::spawn_workers;
use crate::nonce::NonceSource;
use crate::router::DispatchRequest;
use crate::router::ProxyRequest;
use crate::testing::capture_server;
use crate::testing::json_server;

fn watcher(name: &str, endpoint: &str, filters: BTreeMap<String, Vec<String>>) -> ProviderRecord {
    ProviderRecord {
        name: name.to_string(),
        kind: ProviderKind::Watcher,
        group: "notif".to_string(),
        data_type: "event".to_string(),
        version: "v1".to_string(),
        endpoint: endpoint.to_string(),
        callbacks: vec![Callback {
            op: "Create".to_string(),
            uri: "/callback".to_string(),
            filters,
        }],
        ..ProviderRecord::default()
    }
}

fn item(op: &str, data: serde_json::Value) -> DispatchRequest {
    DispatchRequest {
        request: ProxyRequest {
            op: op.to_string(),
            data_type: "event".to_string(),
            version: "v1".to_string(),
            group: "notif".to_string(),
            app_key: "bytetrade_app_1".to_string(),
            param: None,
            data: Some(data),
            token: "tok".to_string(),
        },
        result: json!({"id": "1"}),
    }
}

async fn fanout(records: Vec<ProviderRecord>) -> WatcherFanout {
    let store = InMemoryDirectoryStore::seeded(records, Vec::new());
    let directory = Arc::new(ProviderDirectory::new(Arc::new(store)));
    directory.sync().await.expect("sync");
    let nonce = Arc::new(NonceSource::new(Some("n0nce".to_string()), BTreeSet::new()));
    WatcherFanout::new(directory, nonce, Duration::from_secs(2)).expect("fanout")
}

#[tokio::test]
async fn filtered_watcher_only_sees_matching_events() {
    let filtered = json_server(json!({})).await;
    let open = json_server(json!({})).await;
    let fanout = fanout(vec![
        watcher("filtered", &filtered.base_url, BTreeMap::from([(
            "type".to_string(),
            vec!["create".to_string()],
        )])),
        watcher("open", &open.base_url, BTreeMap::new()),
    ])
    .await;

    assert_eq!(fanout.deliver(&item("Create", json!({"type": "create"}))).await.unwrap(), 2);
    assert_eq!(fanout.deliver(&item("Create", json!({"type": "update"}))).await.unwrap(), 1);

    assert_eq!(filtered.requests().len(), 1);
    let seen = open.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].uri, "/callback");
    assert_eq!(seen[0].header("terminus-nonce").as_deref(), Some("n0nce"));
    let body = seen[1].json();
    assert_eq!(body["op"], "Create");
    assert_eq!(body["datatype"], "event");
    assert_eq!(body["data"]["type"], "update");
    assert_eq!(body["result"]["id"], "1");
}

#[tokio::test]
async fn events_without_data_reach_filtered_watchers() {
    let filtered = json_server(json!({})).await;
    let open = json_server(json!({})).await;
    let fanout = fanout(vec![
        watcher("filtered", &filtered.base_url, BTreeMap::from([(
            "type".to_string(),
            vec!["create".to_string()],
        )])),
        watcher("open", &open.base_url, BTreeMap::new()),
    ])
    .await;

    let mut missing = item("Create", json!(null));
    missing.request.data = None;
    assert_eq!(fanout.deliver(&missing).await.unwrap(), 2);
    assert_eq!(fanout.deliver(&item("Create", json!(null))).await.unwrap(), 2);
    assert_eq!(fanout.deliver(&item("Create", json!([1, 2]))).await.unwrap(), 1);

    assert_eq!(filtered.requests().len(), 2);
    assert!(filtered.requests()[0].json()["data"].is_null());
    assert_eq!(open.requests().len(), 3);
}

#[tokio::test]
async fn other_ops_and_unevaluable_filters_are_skipped() {
    let server = json_server(json!({})).await;
    let fanout = fanout(vec![watcher(
        "w",
        &server.base_url,
        BTreeMap::from([("type".to_string(), vec!["create".to_string()])]),
    )])
    .await;

    assert_eq!(fanout.deliver(&item("Delete", json!({"type": "create"}))).await.unwrap(), 0);
    assert_eq!(fanout.deliver(&item("Create", json!(["not", "object"]))).await.unwrap(), 0);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn failing_callback_aborts_the_item() {
    let failing = capture_server(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "boom").await;
    let fanout = fanout(vec![watcher("w", &failing.base_url, BTreeMap::new())]).await;

    let err = fanout.deliver(&item("Create", json!({}))).await.unwrap_err();
    match err {
        DispatchError::Upstream {
            status,
            body,
            ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(failing.requests().len(), 1);
}

#[tokio::test]
async fn workers_drain_queue_and_stop_on_cancel() {
    let server = json_server(json!({})).await;
    let fanout = Arc::new(fanout(vec![watcher("w", &server.base_url, BTreeMap::new())]).await);
    let (dispatcher, queue) = EventDispatcher::channel();
    let cancel = CancellationToken::new();
    let handles = spawn_workers(queue, fanout, 2, Some(100), &cancel);

    for index in 0 .. 3 {
        dispatcher.enqueue(item("Create", json!({ "n": index })));
    }
    for _ in 0 .. 100 {
        if server.requests().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.requests().len(), 3);

    cancel.cancel();
    for handle in handles {
        handle.await.expect("worker join");
    }
    dispatcher.enqueue(item("Create", json!({})));
}
