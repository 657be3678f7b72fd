// crates/service-gate-server/src/tunnel.rs
// ============================================================================
// Module: WebSocket Tunnel
// Description: Full-duplex websocket bridge between a client and a backend.
// Purpose: Carry websocket traffic for legacy providers and gateway backends.
// Dependencies: axum (ws), tokio-tungstenite, futures, tokio-util, tracing
// ============================================================================

//! ## Overview
//! [`open`] dials the backend first, forwarding a fixed header subset plus
//! caller-supplied extras, and only then upgrades the inbound connection.
//! Once both sides are open two tasks copy frames, one per direction. They
//! share a cancellation token: when either side closes or fails, the other
//! side receives a close frame and both tasks stop. A close code received
//! from one peer is relayed to the other; a read failure closes with 1011.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::extract::ws::CloseFrame as ClientCloseFrame;
use axum::extract::ws::Message as ClientMessage;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::http::request::Parts;
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::headers;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;
/// Peer closed without a status code.
const CLOSE_NO_STATUS: u16 = 1005;
/// Unexpected condition on the proxy.
const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Longest close reason that fits a control frame.
const MAX_CLOSE_REASON: usize = 123;

/// Backend connection type.
type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Tunnel setup failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Inbound request is not a websocket upgrade.
    #[error("websocket upgrade required: {0}")]
    NotUpgrade(String),
    /// Backend URL or headers are invalid.
    #[error("invalid websocket target: {0}")]
    InvalidTarget(String),
    /// Backend refused the handshake with an HTTP reply.
    #[error("websocket backend replied {status}")]
    Rejected {
        /// Backend status.
        status: StatusCode,
        /// Backend body.
        body: Vec<u8>,
    },
    /// Backend could not be reached.
    #[error("websocket backend unavailable: {0}")]
    Unavailable(String),
}

impl TunnelError {
    /// Response relayed to the client for a failed setup.
    #[must_use]
    pub fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Rejected {
                status,
                body,
            } => (status, Body::from(body)),
            Self::NotUpgrade(message) => (StatusCode::BAD_REQUEST, Body::from(message)),
            Self::InvalidTarget(message) => (StatusCode::BAD_GATEWAY, Body::from(message)),
            Self::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Body::from(StatusCode::SERVICE_UNAVAILABLE.canonical_reason().unwrap_or_default()),
            ),
        };
        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
    }
}

// ============================================================================
// SECTION: Handshake
// ============================================================================

/// Returns true when the request asks for a websocket upgrade.
#[must_use]
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Rewrites an `http(s)` URL to `ws(s)`.
#[must_use]
pub fn websocket_url(backend_url: &str) -> String {
    if let Some(rest) = backend_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = backend_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        backend_url.to_string()
    }
}

/// Headers forwarded to the backend handshake.
#[must_use]
pub fn forwarded_headers(inbound: &HeaderMap, peer: SocketAddr) -> HeaderMap {
    let mut out = HeaderMap::new();
    if let Some(origin) = inbound.get(header::ORIGIN) {
        out.insert(header::ORIGIN, origin.clone());
    }
    for protocol in inbound.get_all(header::SEC_WEBSOCKET_PROTOCOL) {
        out.append(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    for cookie in inbound.get_all(header::COOKIE) {
        out.append(header::COOKIE, cookie.clone());
    }
    if let Some(host) = inbound.get(header::HOST) {
        out.insert(header::HOST, host.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&headers::forwarded_for(inbound, peer.ip())) {
        out.insert(headers::FORWARDED_FOR, value);
    }
    out.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    out
}

/// Dials `backend_url`, then upgrades the inbound request into a tunnel.
///
/// # Errors
///
/// Returns [`TunnelError`] when the request is not an upgrade or the backend
/// handshake fails. [`TunnelError::into_response`] renders the reply.
pub async fn open(
    parts: &mut Parts,
    peer: SocketAddr,
    backend_url: &str,
    extra: HeaderMap,
) -> Result<Response, TunnelError> {
    let upgrade = WebSocketUpgrade::from_request_parts(parts, &())
        .await
        .map_err(|rejection| TunnelError::NotUpgrade(rejection.to_string()))?;
    let target = websocket_url(backend_url);
    let mut request = target
        .as_str()
        .into_client_request()
        .map_err(|err| TunnelError::InvalidTarget(err.to_string()))?;
    let outbound = request.headers_mut();
    for (name, value) in &forwarded_headers(&parts.headers, peer) {
        outbound.insert(name.clone(), value.clone());
    }
    for (name, value) in &extra {
        outbound.append(name.clone(), value.clone());
    }
    let (backend, handshake) = match tokio_tungstenite::connect_async(request).await {
        Ok(connected) => connected,
        Err(tungstenite::Error::Http(response)) => {
            warn!(target = %target, status = response.status().as_u16(), "websocket backend refused");
            return Err(TunnelError::Rejected {
                status: response.status(),
                body: response.body().clone().unwrap_or_default(),
            });
        }
        Err(err) => {
            warn!(target = %target, error = %err, "couldn't dial websocket backend");
            return Err(TunnelError::Unavailable(err.to_string()));
        }
    };
    let mut upgrade = upgrade;
    if let Some(protocol) = handshake
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
    {
        upgrade = upgrade.protocols([protocol.to_string()]);
    }
    let set_cookie = handshake.headers().get(header::SET_COOKIE).cloned();
    debug!(target = %target, "websocket backend connected");
    let mut response = upgrade.on_upgrade(move |client| bridge(client, backend));
    if let Some(cookie) = set_cookie {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

// ============================================================================
// SECTION: Bridge
// ============================================================================

/// Copies frames both ways until either side closes.
async fn bridge(client: WebSocket, backend: BackendSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();
    let cancel = CancellationToken::new();

    let upstream = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => break,
                    next = client_rx.next() => next,
                };
                let forwarded = match next {
                    Some(Ok(ClientMessage::Close(frame))) => {
                        let (code, reason) = client_close(frame);
                        let _ = backend_tx.send(backend_close(code, &reason)).await;
                        break;
                    }
                    Some(Ok(message)) => match to_backend(message) {
                        Some(message) => backend_tx.send(message).await,
                        None => continue,
                    },
                    Some(Err(err)) => {
                        let reason = err.to_string();
                        let _ = backend_tx.send(backend_close(CLOSE_INTERNAL_ERROR, &reason)).await;
                        break;
                    }
                    None => {
                        let _ = backend_tx.send(backend_close(CLOSE_NORMAL, "")).await;
                        break;
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
            cancel.cancel();
        })
    };

    let downstream = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => break,
                    next = backend_rx.next() => next,
                };
                let forwarded = match next {
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = backend_close_parts(frame);
                        let _ = client_tx.send(client_close_message(code, &reason)).await;
                        break;
                    }
                    Some(Ok(message)) => match to_client(message) {
                        Some(message) => client_tx.send(message).await,
                        None => continue,
                    },
                    Some(Err(err)) => {
                        let reason = err.to_string();
                        let _ =
                            client_tx.send(client_close_message(CLOSE_INTERNAL_ERROR, &reason)).await;
                        break;
                    }
                    None => {
                        let _ = client_tx.send(client_close_message(CLOSE_NORMAL, "")).await;
                        break;
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
            cancel.cancel();
        })
    };

    let (up, down) = tokio::join!(upstream, downstream);
    if up.is_err() || down.is_err() {
        warn!("websocket tunnel task failed");
    }
    debug!("websocket tunnel closed");
}

// ============================================================================
// SECTION: Frame Conversion
// ============================================================================

/// Client frame to backend frame; close frames are handled by the caller.
fn to_backend(message: ClientMessage) -> Option<tungstenite::Message> {
    match message {
        ClientMessage::Text(text) => Some(tungstenite::Message::Text(text.as_str().into())),
        ClientMessage::Binary(bytes) => Some(tungstenite::Message::Binary(bytes)),
        ClientMessage::Ping(bytes) => Some(tungstenite::Message::Ping(bytes)),
        ClientMessage::Pong(bytes) => Some(tungstenite::Message::Pong(bytes)),
        ClientMessage::Close(_) => None,
    }
}

/// Backend frame to client frame; raw frames are dropped.
fn to_client(message: tungstenite::Message) -> Option<ClientMessage> {
    match message {
        tungstenite::Message::Text(text) => Some(ClientMessage::Text(text.as_str().into())),
        tungstenite::Message::Binary(bytes) => Some(ClientMessage::Binary(bytes)),
        tungstenite::Message::Ping(bytes) => Some(ClientMessage::Ping(bytes)),
        tungstenite::Message::Pong(bytes) => Some(ClientMessage::Pong(bytes)),
        tungstenite::Message::Close(_) | tungstenite::Message::Frame(_) => None,
    }
}

/// Close code and reason sent by the client.
fn client_close(frame: Option<ClientCloseFrame>) -> (u16, String) {
    frame.map_or((CLOSE_NORMAL, String::new()), |frame| {
        (normalize_code(frame.code), frame.reason.as_str().to_string())
    })
}

/// Close code and reason sent by the backend.
fn backend_close_parts(frame: Option<BackendCloseFrame>) -> (u16, String) {
    frame.map_or((CLOSE_NORMAL, String::new()), |frame| {
        (normalize_code(u16::from(frame.code)), frame.reason.as_str().to_string())
    })
}

/// Close frame toward the backend.
fn backend_close(code: u16, reason: &str) -> tungstenite::Message {
    tungstenite::Message::Close(Some(BackendCloseFrame {
        code: CloseCode::from(code),
        reason: truncate_reason(reason).into(),
    }))
}

/// Close frame toward the client.
fn client_close_message(code: u16, reason: &str) -> ClientMessage {
    ClientMessage::Close(Some(ClientCloseFrame {
        code,
        reason: truncate_reason(reason).into(),
    }))
}

/// Maps "no status" to a normal closure.
const fn normalize_code(code: u16) -> u16 {
    if code == CLOSE_NO_STATUS { CLOSE_NORMAL } else { code }
}

/// Cuts a close reason to the control-frame limit on a char boundary.
fn truncate_reason(reason: &str) -> String {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[.. end].to_string()
}

#[cfg(test)]
mod tests;
