// crates/service-gate-server/tests/helpers/mod.rs
// ============================================================================
// Module: Integration Test Helpers
// Description: Shared fixtures for service-gate-server integration suites.
// Purpose: Build state from TOML, serve listeners, and capture upstream calls.
// Dependencies: axum, bcrypt, tokio, service-gate-server
// ============================================================================

//! ## Overview
//! Integration suites drive the public router builders over loopback HTTP.
//! Upstream providers, watchers, and notification servers are capture stubs
//! that record every request they receive.

#![allow(dead_code, reason = "Shared helpers are reused across multiple test suites.")]
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test-only fixtures use unwrap/expect for clarity."
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use service_gate_config::ServiceGateConfig;
use service_gate_core::FixedClock;
use service_gate_server::GateState;
use service_gate_server::StateParts;
use service_gate_server::api_router;
use service_gate_server::audit::NoopAuditSink;
use service_gate_server::gateway_router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Unix time the fixture clock is pinned at.
pub const NOW: i64 = 1_700_000_000;
/// Service nonce of every fixture config.
pub const NONCE: &str = "integration-nonce";
/// Registrar secret of every fixture config.
pub const REGISTRAR_SECRET: &str = "integration-registrar";

/// One request seen by an upstream stub.
#[derive(Debug, Clone)]
pub struct Seen {
    /// Request method.
    pub method: String,
    /// Path plus query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl Seen {
    /// Body parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("upstream json")
    }

    /// Header value as a string.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
    }
}

/// Stub state: fixed reply plus request log.
#[derive(Clone)]
struct Stub {
    /// Reply status.
    status: StatusCode,
    /// Reply JSON body.
    body: serde_json::Value,
    /// Received requests.
    log: Arc<Mutex<Vec<Seen>>>,
}

/// Running upstream stub.
pub struct Upstream {
    /// `http://127.0.0.1:<port>`.
    pub base_url: String,
    /// Received requests.
    log: Arc<Mutex<Vec<Seen>>>,
    /// Stops the stub when dropped.
    _shutdown: oneshot::Sender<()>,
}

impl Upstream {
    /// Snapshot of received requests.
    pub fn requests(&self) -> Vec<Seen> {
        self.log.lock().unwrap().clone()
    }

    /// Polls until at least `count` requests arrived or two seconds pass.
    pub async fn wait_for(&self, count: usize) -> Vec<Seen> {
        for _ in 0 .. 100 {
            let seen = self.requests();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.requests()
    }
}

/// Starts a stub answering every request with `status` and a JSON `body`.
pub async fn upstream(status: StatusCode, body: serde_json::Value) -> Upstream {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stub = Stub {
        status,
        body,
        log: Arc::clone(&log),
    };
    let (base_url, shutdown) = serve(Router::new().fallback(record).with_state(stub)).await;
    Upstream {
        base_url,
        log,
        _shutdown: shutdown,
    }
}

/// Records the request and returns the stub reply.
async fn record(State(stub): State<Stub>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    stub.log.lock().unwrap().push(Seen {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body,
    });
    (stub.status, axum::Json(stub.body)).into_response()
}

/// Serves `app` on an ephemeral loopback port.
pub async fn serve(app: Router) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    (format!("http://{addr}"), shutdown_tx)
}

/// Config for tenant `alice` with `extra` TOML appended.
pub fn config(extra: &str) -> ServiceGateConfig {
    let base = format!(
        "[identity]\nowner = \"alice\"\n\n[nonce]\nvalue = \"{NONCE}\"\nallowed_ips = [\"127.0.0.1\"]\n\n[registrar]\njwt_secret = \"{REGISTRAR_SECRET}\"\n\n"
    );
    ServiceGateConfig::from_toml(&format!("{base}{extra}")).expect("fixture config")
}

/// State on a clock pinned at [`NOW`].
pub fn state(config: &ServiceGateConfig) -> StateParts {
    let clock = Arc::new(FixedClock::at_unix(NOW));
    GateState::build(config, clock, Arc::new(NoopAuditSink)).expect("state")
}

/// Serves the API listener after a directory sync.
pub async fn serve_api(state: Arc<GateState>) -> (String, oneshot::Sender<()>) {
    state.directory.sync().await.expect("directory sync");
    serve(api_router(state)).await
}

/// Serves the gateway listener.
pub async fn serve_gateway(state: Arc<GateState>) -> (String, oneshot::Sender<()>) {
    serve(gateway_router(state)).await
}

/// Access digest an app presents with its request.
pub fn access_digest(app_key: &str, timestamp: i64, secret: &str) -> String {
    bcrypt::hash(format!("{app_key}{timestamp}{secret}"), 4).expect("bcrypt")
}

/// Requests an access token over HTTP and returns it.
pub async fn request_token(
    base: &str,
    app_key: &str,
    secret: &str,
    triple: (&str, &str, &str),
    ops: &[&str],
) -> String {
    let (data_type, group, version) = triple;
    let body = serde_json::json!({
        "app_key": app_key,
        "timestamp": NOW,
        "token": access_digest(app_key, NOW, secret),
        "perm": {"group": group, "dataType": data_type, "version": version, "ops": ops},
    });
    let reply = reqwest::Client::new()
        .post(format!("{base}/permission/v1alpha1/access"))
        .json(&body)
        .send()
        .await
        .expect("access call");
    assert_eq!(reply.status(), StatusCode::OK);
    let body: serde_json::Value = reply.json().await.expect("access reply");
    body["data"]["access_token"].as_str().expect("access token").to_string()
}
