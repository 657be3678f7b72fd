// crates/service-gate-server/src/testing.rs
// ============================================================================
// Module: Test Fixtures
// Description: Local capture servers and state builders for unit tests.
// Purpose: Share HTTP fixtures across module tests.
// Dependencies: axum, tokio, service-gate-core, service-gate-config
// ============================================================================

//! ## Overview
//! Capture servers record what the gateway sends upstream. The state helpers
//! build a [`GateState`] from a TOML snippet on a pinned clock.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test-only fixtures use unwrap/expect for clarity."
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use axum::Router;
use axum::body::Bytes;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use service_gate_config::ServiceGateConfig;
use service_gate_core::AccessTokenRequest;
use service_gate_core::ApplicationCredential;
use service_gate_core::FixedClock;
use service_gate_core::PermissionRequirement;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::audit::NoopAuditSink;
use crate::server::api_router;
use crate::server::gateway_router;
use crate::state::GateState;
use crate::state::StateParts;

/// Unix time the fixture clock is pinned at.
pub const NOW: i64 = 1_700_000_000;
/// Registrar secret of [`config`].
pub const REGISTRAR_SECRET: &str = "registrar-secret";
/// Service nonce of [`config`].
pub const NONCE: &str = "fixture-nonce";

/// One request seen by a capture server.
#[derive(Debug, Clone)]
pub struct Captured {
    /// Request method.
    pub method: String,
    /// Path plus query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl Captured {
    /// Body parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("captured json")
    }

    /// Header value as a string.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
    }
}

/// Shared capture log.
pub type CaptureLog = Arc<Mutex<Vec<Captured>>>;

/// Fixed reply of a capture server.
#[derive(Clone)]
struct Reply {
    /// Status to return.
    status: StatusCode,
    /// Content type to return.
    content_type: &'static str,
    /// Body to return.
    body: Bytes,
    /// Log of received requests.
    log: CaptureLog,
}

/// Handle to a running capture server.
pub struct CaptureServer {
    /// `http://127.0.0.1:<port>`.
    pub base_url: String,
    /// Requests received so far.
    pub log: CaptureLog,
    /// Stops the server when dropped or sent.
    _shutdown: oneshot::Sender<()>,
}

impl CaptureServer {
    /// Snapshot of received requests.
    pub fn requests(&self) -> Vec<Captured> {
        self.log.lock().unwrap().clone()
    }
}

/// Starts a server answering every request with `status`, `content_type`, `body`.
pub async fn capture_server(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> CaptureServer {
    let log: CaptureLog = Arc::new(Mutex::new(Vec::new()));
    let reply = Reply {
        status,
        content_type,
        body: body.into(),
        log: Arc::clone(&log),
    };
    let app = Router::new().fallback(respond).with_state(reply);
    let (base_url, shutdown) = serve(app).await;
    CaptureServer {
        base_url,
        log,
        _shutdown: shutdown,
    }
}

/// JSON capture server returning 200 and `body`.
pub async fn json_server(body: serde_json::Value) -> CaptureServer {
    capture_server(StatusCode::OK, "application/json", body.to_string()).await
}

/// Records the request and returns the fixed reply.
async fn respond(State(reply): State<Reply>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    reply.log.lock().unwrap().push(Captured {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body,
    });
    (reply.status, [("content-type", reply.content_type)], reply.body).into_response()
}

/// Serves `app` on an ephemeral port with connect info.
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
    build_config(r#"["127.0.0.1"]"#, extra)
}

/// Config for tenant `alice` with a custom nonce allowlist.
pub fn config_with_nonce(allowed_ips: &str) -> ServiceGateConfig {
    build_config(allowed_ips, "")
}

/// Fixture TOML with identity, nonce, and registrar sections.
fn build_config(allowed_ips: &str, extra: &str) -> ServiceGateConfig {
    let base = format!(
        "[identity]\nowner = \"alice\"\n\n[nonce]\nvalue = \"{NONCE}\"\nallowed_ips = {allowed_ips}\n\n[registrar]\njwt_secret = \"{REGISTRAR_SECRET}\"\n\n"
    );
    ServiceGateConfig::from_toml(&format!("{base}{extra}")).expect("fixture config")
}

/// State built from `config` on a clock pinned at [`NOW`].
pub fn state(config: &ServiceGateConfig) -> (StateParts, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::at_unix(NOW));
    let parts = GateState::build(config, clock.clone(), Arc::new(NoopAuditSink)).expect("state");
    (parts, clock)
}

/// Serves the API routes for `state`.
pub async fn serve_api(state: Arc<GateState>) -> (String, oneshot::Sender<()>) {
    state.directory.sync().await.expect("directory sync");
    serve(api_router(state)).await
}

/// Serves the gateway routes for `state`.
pub async fn serve_gateway(state: Arc<GateState>) -> (String, oneshot::Sender<()>) {
    serve(gateway_router(state)).await
}

/// App key used by [`grant_token`].
pub const APP_KEY: &str = "bytetrade_todo_1";

/// Issues a token for `ops` on the triple through the token service.
pub fn grant_token(state: &GateState, ops: &[&str], data_type: &str, group: &str, version: &str) -> String {
    let secret = "0123456789abcdef";
    let perm = PermissionRequirement {
        group: group.to_string(),
        data_type: data_type.to_string(),
        version: version.to_string(),
        ops: ops.iter().map(|op| (*op).to_string()).collect(),
        owner_app_key: String::new(),
    };
    let request = AccessTokenRequest {
        app_key: APP_KEY.to_string(),
        timestamp: NOW,
        token: bcrypt::hash(format!("{APP_KEY}{NOW}{secret}"), 4).expect("bcrypt"),
        perm: perm.clone(),
    };
    let credential = ApplicationCredential {
        app: "todo".to_string(),
        key: APP_KEY.to_string(),
        secret: secret.to_string(),
        permissions: vec![perm],
        ..ApplicationCredential::default()
    };
    state.tokens.grant(&request, &credential).expect("grant").access_token
}

/// `[[bootstrap.providers]]` TOML for one record; `apis` are op APIs or callbacks.
pub fn record_toml(
    name: &str,
    kind: &str,
    triple: (&str, &str, &str),
    endpoint: &str,
    apis: &[(&str, &str)],
) -> String {
    let (data_type, group, version) = triple;
    let mut out = format!(
        "[[bootstrap.providers]]\nname = \"{name}\"\nkind = \"{kind}\"\ndataType = \"{data_type}\"\ngroup = \"{group}\"\nversion = \"{version}\"\nendpoint = \"{endpoint}\"\n\n"
    );
    let table = if kind == "watcher" { "callbacks" } else { "opApis" };
    let key = if kind == "watcher" { "op" } else { "name" };
    for (name, uri) in apis {
        out.push_str(&format!(
            "[[bootstrap.providers.{table}]]\n{key} = \"{name}\"\nuri = \"{uri}\"\n\n"
        ));
    }
    out
}
