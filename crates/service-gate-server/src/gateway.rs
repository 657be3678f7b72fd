// crates/service-gate-server/src/gateway.rs
// ============================================================================
// Module: Gateway Layer
// Description: Authenticated, RBAC-routed reverse proxy.
// Purpose: Front provider backends with the authn and authz chains.
// Dependencies: axum, reqwest, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! Every request on the gateway listener runs the same pipeline:
//! 1. authenticate; an error or no identity is 401,
//! 2. authorize against the binding key of the request host; a chain error
//!    is 500 and anything but `Allow` is 403,
//! 3. inject the trusted user and the service nonce,
//! 4. require the backend service bound by the deciding role (400 without),
//! 5. move `Temp-Authorization` to `Authorization`,
//! 6. proxy to the service, tunnelling websocket upgrades.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::response::Response;
use service_gate_core::Decision;
use service_gate_core::RequestAttributes;
use service_gate_core::TenantIdentity;
use service_gate_core::UserInfo;
use service_gate_core::identity::effective_user;
use tracing::info;
use tracing::warn;

use crate::audit::AccessAuditEvent;
use crate::authz::verb_for_method;
use crate::headers;
use crate::response::ApiError;
use crate::state::GateState;
use crate::tunnel;

// ============================================================================
// SECTION: Request Attributes
// ============================================================================

/// Host naming the target provider: `X-Provider-Proxy`, `X-Forwarded-Host`, `Host`.
///
/// Header values may be URLs; only their host and port are kept.
#[must_use]
pub fn binding_host(headers: &HeaderMap) -> Option<String> {
    [headers::PROVIDER_PROXY, headers::FORWARDED_HOST]
        .into_iter()
        .find_map(|name| headers::header_str(headers, name))
        .map(host_of)
        .or_else(|| headers::header_str(headers, header::HOST.as_str()).map(str::to_string))
}

/// Host and port of a URL, or the value itself when it has no scheme.
fn host_of(value: &str) -> String {
    let rest = value.split_once("://").map_or(value, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or_default().to_string()
}

/// Authorization attributes of an inbound request.
#[must_use]
pub fn request_attributes(tenant: &TenantIdentity, user: UserInfo, parts: &Parts) -> RequestAttributes {
    let path = match parts.uri.query() {
        Some(query) => format!("{}?{query}", parts.uri.path()),
        None => parts.uri.path().to_string(),
    };
    let binding_key = binding_host(&parts.headers)
        .map(|host| tenant.provider_ref_from_host(&host))
        .unwrap_or_default();
    RequestAttributes {
        user,
        verb: verb_for_method(&parts.method),
        path,
        binding_key,
    }
}

/// Base URL of a bound service, `http://` prefixed when unschemed.
#[must_use]
pub fn service_url(service: &str) -> String {
    let service = service.trim_end_matches('/');
    if service.contains("://") { service.to_string() } else { format!("http://{service}") }
}

// ============================================================================
// SECTION: Handler
// ============================================================================

/// Fallback handler of the gateway listener.
pub async fn gateway(
    State(state): State<Arc<GateState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match handle(&state, peer, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Runs the pipeline for one request.
async fn handle(state: &GateState, peer: SocketAddr, request: Request) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let target = parts.uri.path().to_string();

    let user = match state.authn.authenticate(&parts.headers).await {
        Ok(Some(user)) => user,
        Ok(None) | Err(_) => {
            state.audit.record(&AccessAuditEvent::denied(
                "gateway_authn",
                None,
                &target,
                "unauthenticated",
            ));
            return Err(ApiError::unauthorized("Unauthorized"));
        }
    };

    let attrs = request_attributes(&state.tenant, user, &parts);
    let outcome = state.authz.authorize(&attrs).await.map_err(|err| {
        warn!(user = %attrs.user.name, error = %err, "authorization failed");
        ApiError::internal(format!("Authorization error (user={}, verb={})", attrs.user.name, attrs.verb))
    })?;
    if outcome.decision != Decision::Allow {
        state.audit.record(&AccessAuditEvent::denied(
            "gateway_authz",
            Some(&attrs.user.name),
            &attrs.binding_key,
            outcome.reason.clone(),
        ));
        return Err(ApiError::forbidden(format!(
            "Forbidden (user={}, verb={})",
            attrs.user.name, attrs.verb
        )));
    }
    state.audit.record(&AccessAuditEvent::allowed(
        "gateway_authz",
        Some(&attrs.user.name),
        &attrs.binding_key,
    ));

    inject_identity(&mut parts.headers, effective_user(&attrs.user.name), &state.nonce.current());
    let Some(service) = outcome.service.filter(|service| !service.is_empty()) else {
        return Err(ApiError::bad_request("provider service not found"));
    };
    recover_authorization(&mut parts.headers);

    let base = service_url(&service);
    info!(user = %attrs.user.name, service = %base, path = %attrs.path, "gateway proxy");
    if tunnel::is_upgrade_request(&parts.headers) {
        let url = format!("{base}{}", parts.uri.path());
        let extra = tunnel_extras(&parts.headers);
        return Ok(match tunnel::open(&mut parts, peer, &url, extra).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "gateway tunnel setup failed");
                err.into_response()
            }
        });
    }
    forward(state, &base, parts, body, peer).await
}

/// Sets the trusted user and the service nonce.
fn inject_identity(headers: &mut HeaderMap, user: &str, nonce: &str) {
    if let Ok(value) = HeaderValue::from_str(user) {
        headers.insert(headers::BFL_USER, value);
    }
    if let Ok(value) = HeaderValue::from_str(nonce) {
        headers.insert(headers::BACKEND_NONCE, value);
    }
}

/// Moves `Temp-Authorization` to `Authorization`.
fn recover_authorization(headers: &mut HeaderMap) {
    if let Some(value) = headers.remove(headers::TEMP_AUTHORIZATION) {
        headers.insert(header::AUTHORIZATION, value);
    }
}

/// Identity headers forwarded on a tunnel handshake.
fn tunnel_extras(inbound: &HeaderMap) -> HeaderMap {
    let mut extra = HeaderMap::new();
    for name in [headers::BFL_USER, headers::BACKEND_NONCE, header::AUTHORIZATION.as_str()] {
        if let Some(value) = inbound.get(name)
            && let Ok(name) = header::HeaderName::from_bytes(name.as_bytes())
        {
            extra.insert(name, value.clone());
        }
    }
    extra
}

/// Streams the request to `base` and the reply back.
async fn forward(
    state: &GateState,
    base: &str,
    parts: Parts,
    body: Body,
    peer: SocketAddr,
) -> Result<Response, ApiError> {
    let path = parts.uri.path_and_query().map_or("/", |value| value.as_str());
    let url = format!("{base}{path}");
    let mut outbound = HeaderMap::new();
    for (name, value) in &parts.headers {
        if headers::is_hop_by_hop(name) || name == header::HOST {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&headers::forwarded_for(&parts.headers, peer.ip())) {
        outbound.insert(headers::FORWARDED_FOR, value);
    }
    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    let mut upstream = state.gateway_client.request(parts.method, &url).headers(outbound);
    if has_body {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let reply = upstream
        .send()
        .await
        .map_err(|err| {
            warn!(url = %url, error = %err, "gateway upstream failed");
            ApiError::new(StatusCode::BAD_GATEWAY, err.to_string())
        })?;

    let status = reply.status();
    let mut relayed = HeaderMap::new();
    for (name, value) in reply.headers() {
        if !headers::is_hop_by_hop(name) {
            relayed.append(name.clone(), value.clone());
        }
    }
    let mut response = Response::new(Body::from_stream(reply.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = relayed;
    Ok(response)
}
