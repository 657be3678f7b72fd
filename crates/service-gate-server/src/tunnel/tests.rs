// crates/service-gate-server/src/tunnel/tests.rs
// ============================================================================
// Module: WebSocket Tunnel Tests
// Description: Header forwarding and end-to-end frame relay.
// Purpose: Exercise the tunnel against a local echo backend.
// Dependencies: axum, tokio, tokio-tungstenite
// ============================================================================

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

use std::net::SocketAddr;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::ws::Message as ClientMessage;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite;

use super::forwarded_headers;
use super::is_upgrade_request;
use super::open;
use super::truncate_reason;
use super::websocket_url;

async fn echo(upgrade: WebSocketUpgrade, headers: HeaderMap) -> Response {
    let tag = headers
        .get("x-tunnel-tag")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    upgrade.on_upgrade(move |mut socket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                ClientMessage::Text(text) => {
                    let reply = format!("{tag}:{}", text.as_str());
                    if socket.send(ClientMessage::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                ClientMessage::Close(_) => break,
                _ => {}
            }
        }
    })
}

async fn spawn(app: Router) -> (SocketAddr, oneshot::Sender<()>) {
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
    (addr, shutdown_tx)
}

fn front(backend: String) -> Router {
    Router::new().route(
        "/ws",
        get(move |ConnectInfo(peer): ConnectInfo<SocketAddr>, request: Request| {
            let backend = backend.clone();
            async move {
                let (mut parts, _) = request.into_parts();
                let mut extra = HeaderMap::new();
                extra.insert("x-tunnel-tag", HeaderValue::from_static("relayed"));
                match open(&mut parts, peer, &backend, extra).await {
                    Ok(response) => response,
                    Err(err) => err.into_response(),
                }
            }
        }),
    )
}

#[test]
fn rewrites_scheme_to_websocket() {
    assert_eq!(websocket_url("http://svc:80/ws"), "ws://svc:80/ws");
    assert_eq!(websocket_url("https://svc/ws"), "wss://svc/ws");
    assert_eq!(websocket_url("ws://svc/ws"), "ws://svc/ws");
}

#[test]
fn forwards_chain_and_subset() {
    let mut inbound = HeaderMap::new();
    inbound.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.9"));
    inbound.insert("origin", HeaderValue::from_static("https://app"));
    inbound.insert("authorization", HeaderValue::from_static("secret"));
    let peer: SocketAddr = "192.168.1.4:5555".parse().unwrap();
    let out = forwarded_headers(&inbound, peer);
    assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.9, 192.168.1.4");
    assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
    assert_eq!(out.get("origin").unwrap(), "https://app");
    assert!(out.get("authorization").is_none());
}

#[test]
fn detects_upgrade_and_truncates_reasons() {
    let mut headers = HeaderMap::new();
    assert!(!is_upgrade_request(&headers));
    headers.insert("upgrade", HeaderValue::from_static("WebSocket"));
    assert!(is_upgrade_request(&headers));
    let long = "é".repeat(100);
    let cut = truncate_reason(&long);
    assert!(cut.len() <= 123);
    assert!(long.starts_with(&cut));
}

#[tokio::test]
async fn relays_frames_both_ways() {
    let (backend_addr, backend_stop) = spawn(Router::new().route("/echo", get(echo))).await;
    let (front_addr, front_stop) = spawn(front(format!("http://{backend_addr}/echo"))).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{front_addr}/ws"))
        .await
        .expect("connect");
    client.send(tungstenite::Message::Text("hello".into())).await.expect("send");
    let reply = client.next().await.expect("frame").expect("message");
    assert_eq!(reply.into_text().expect("text").as_str(), "relayed:hello");

    client.send(tungstenite::Message::Close(None)).await.expect("close");
    let _ = backend_stop.send(());
    let _ = front_stop.send(());
}

#[tokio::test]
async fn unreachable_backend_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead = listener.local_addr().expect("addr");
    drop(listener);
    let (front_addr, front_stop) = spawn(front(format!("http://{dead}/echo"))).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{front_addr}/ws"))
        .await
        .expect_err("handshake should fail");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("unexpected error: {other}"),
    }
    let _ = front_stop.send(());
}

#[tokio::test]
async fn non_upgrade_request_is_rejected() {
    let (front_addr, front_stop) = spawn(front("http://127.0.0.1:1/echo".to_string())).await;
    let reply = reqwest::get(format!("http://{front_addr}/ws")).await.expect("get");
    assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
    let _ = front_stop.send(());
}
