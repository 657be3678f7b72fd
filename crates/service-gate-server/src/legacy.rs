// crates/service-gate-server/src/legacy.rs
// ============================================================================
// Module: Legacy Passthrough
// Description: Arbitrary-path proxying to legacy providers.
// Purpose: Relay raw HTTP, streamed replies, and websocket tunnels.
// Dependencies: axum, reqwest, flate2, futures, tokio-util, service-gate-core
// ============================================================================

//! ## Overview
//! Legacy providers expose arbitrary paths instead of structured op APIs.
//! Two surfaces reach them:
//! - v1 (`/legacy/v1alpha1/{group}/{version}/{*subpath}`) authenticates with
//!   an access token scoped to the HTTP method, uses the `legacy_api` data
//!   type, and enforces the provider's method and path list when it has one.
//! - v2 (`/system-server/v2/{datatype}/{group}/{version}/{*subpath}`)
//!   authenticates with a minute-bucket signature and allows long transfers.
//!
//! [`RequestRouter::proxy_legacy`] picks one of three branches: websocket
//! groups tunnel, event-stream and ndjson replies stream line by line, and
//! everything else is buffered with gzip bodies decoded before relaying.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io;
use std::io::Read as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Path;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::Method;
use axum::http::header;
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::response::Response;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::StreamExt;
use service_gate_core::DirectoryError;
use service_gate_core::ProviderRecord;
use service_gate_core::SignatureError;
use service_gate_core::capability::DATA_TYPE_LEGACY_API;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::audit::AccessAuditEvent;
use crate::headers;
use crate::response::ApiError;
use crate::router::ProxyReply;
use crate::router::RequestRouter;
use crate::router::RouterError;
use crate::state::GateState;
use crate::tunnel;

// ============================================================================
// SECTION: Call Shape
// ============================================================================

/// Passthrough flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyMode {
    /// Token-authenticated, short timeout, method/path list enforced.
    V1,
    /// Signature-authenticated, long timeout, `br` downgraded to `gzip`.
    V2,
}

/// One inbound legacy call.
pub struct LegacyCall<'a> {
    /// Request head; the upgrade extension is consumed by the tunnel branch.
    pub parts: &'a mut Parts,
    /// Client address, appended to `X-Forwarded-For` on tunnels.
    pub peer: SocketAddr,
    /// Path below the provider triple, without a leading slash.
    pub subpath: &'a str,
    /// Buffered request body.
    pub body: Bytes,
    /// Passthrough flavour.
    pub mode: LegacyMode,
}

/// Content types relayed line by line.
const STREAMING_CONTENT_TYPES: [&str; 2] = ["text/event-stream", "application/x-ndjson"];

// ============================================================================
// SECTION: Proxy
// ============================================================================

impl RequestRouter {
    /// Relays a legacy call to `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnsupportedApi`] when a v1 provider does not list
    /// the method and path, [`RouterError::Transport`] when the upstream call
    /// fails, and [`RouterError::Decode`] when a gzip body is corrupt.
    pub async fn proxy_legacy(
        &self,
        provider: &ProviderRecord,
        call: LegacyCall<'_>,
    ) -> Result<ProxyReply, RouterError> {
        let method = call.parts.method.clone();
        let path = format!("/{}", call.subpath.trim_start_matches('/'));
        if call.mode == LegacyMode::V1
            && !provider.op_apis.is_empty()
            && !provider
                .op_apis
                .iter()
                .any(|api| api.name.eq_ignore_ascii_case(method.as_str()) && api.uri == path)
        {
            warn!(provider = %provider.name, method = %method, path = %path, "unsupported api of provider");
            return Err(RouterError::UnsupportedApi);
        }
        let url = provider.url_for(&path);

        if method == Method::GET && provider.group.starts_with(headers::WEBSOCKET_GROUP_PREFIX) {
            info!(provider = %provider.name, url = %url, "proxy websocket");
            let extra = self.tunnel_headers(&call.parts.headers);
            let response = match tunnel::open(call.parts, call.peer, &url, extra).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(url = %url, error = %err, "websocket tunnel setup failed");
                    err.into_response()
                }
            };
            return Ok(ProxyReply::Tunnel(response));
        }

        let url = match call.parts.uri.query().filter(|query| !query.is_empty()) {
            Some(query) => format!("{url}?{query}"),
            None => url,
        };
        let timeout = match call.mode {
            LegacyMode::V1 => self.legacy_timeout,
            LegacyMode::V2 => self.legacy_stream_timeout,
        };
        info!(provider = %provider.name, method = %method, url = %url, "proxy legacy request");
        let reply = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .headers(self.outbound_headers(&call.parts.headers, call.mode))
            .body(call.body)
            .send()
            .await
            .map_err(|err| RouterError::Transport(err.to_string()))?;
        relay(reply).await.map(ProxyReply::Streamed)
    }

    /// Inbound headers minus hop-by-hop ones, plus service auth and user.
    fn outbound_headers(&self, inbound: &HeaderMap, mode: LegacyMode) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in inbound {
            if headers::is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        if mode == LegacyMode::V2
            && inbound
                .get_all(header::ACCEPT_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|value| value.contains("br"))
        {
            out.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        self.insert_service_headers(&mut out);
        out
    }

    /// Extra handshake headers for websocket tunnels.
    fn tunnel_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        self.insert_service_headers(&mut out);
        for value in inbound.get_all(header::AUTHORIZATION) {
            out.append(header::AUTHORIZATION, value.clone());
        }
        out
    }

    /// Adds the nonce and the tenant owner.
    fn insert_service_headers(&self, out: &mut HeaderMap) {
        if let Ok(nonce) = HeaderValue::from_str(&self.nonce.current()) {
            out.insert(headers::BACKEND_NONCE, nonce);
        }
        if let Ok(owner) = HeaderValue::from_str(&self.tenant.owner) {
            out.insert(headers::BFL_USER, owner);
        }
    }
}

/// Builds the client response from an upstream reply.
async fn relay(reply: reqwest::Response) -> Result<Response, RouterError> {
    let status = reply.status();
    let mut relayed = HeaderMap::new();
    for (name, value) in reply.headers() {
        if headers::is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }
    let content_type = headers::header_str(reply.headers(), header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let body = if STREAMING_CONTENT_TYPES.iter().any(|kind| content_type.contains(kind)) {
        debug!(content_type = %content_type, "streaming legacy reply");
        line_stream(reply)
    } else {
        let gzip = headers::header_str(reply.headers(), header::CONTENT_ENCODING.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));
        let bytes = reply.bytes().await.map_err(|err| RouterError::Transport(err.to_string()))?;
        if gzip && !bytes.is_empty() {
            relayed.remove(header::CONTENT_ENCODING);
            Body::from(gunzip(&bytes)?)
        } else {
            Body::from(bytes)
        }
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = relayed;
    Ok(response)
}

/// Body that yields the upstream reply one line at a time.
fn line_stream(reply: reqwest::Response) -> Body {
    let chunks = reply.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
    let reader = StreamReader::new(Box::pin(chunks));
    let lines = futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => None,
            Ok(_) => Some((Ok::<_, io::Error>(Bytes::from(line)), Some(reader))),
            Err(err) => {
                warn!(error = %err, "legacy stream interrupted");
                Some((Err(err), None))
            }
        }
    });
    Body::from_stream(lines)
}

/// Decodes a gzip body.
fn gunzip(body: &[u8]) -> Result<Vec<u8>, RouterError> {
    let mut out = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|err| RouterError::Decode(format!("gzip: {err}")))?;
    Ok(out)
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// `ANY /legacy/v1alpha1/{group}/{version}/{*subpath}`.
pub async fn legacy_v1(
    State(state): State<Arc<GateState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((group, version, subpath)): Path<(String, String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let target = format!("{DATA_TYPE_LEGACY_API}/{group}/{version}");
    let Some(token) = headers::header_str(&parts.headers, headers::ACCESS_TOKEN) else {
        state.audit.record(&AccessAuditEvent::denied(
            "legacy_token_validate",
            None,
            &target,
            "missing access token",
        ));
        return Err(ApiError::unauthorized("missing access token"));
    };
    let op = parts.method.as_str().to_ascii_uppercase();
    let app_key = state
        .tokens
        .validate(token, &op, DATA_TYPE_LEGACY_API, &version, &group)
        .map_err(|err| {
            state.audit.record(&AccessAuditEvent::denied(
                "legacy_token_validate",
                None,
                &target,
                err.to_string(),
            ));
            ApiError::forbidden(err.to_string())
        })?;
    state.audit.record(&AccessAuditEvent::allowed("legacy_token_validate", Some(&app_key), &target));

    let provider = state
        .directory
        .get_provider(DATA_TYPE_LEGACY_API, &group, &version)
        .map_err(|err| ApiError::from(RouterError::Lookup(err)))?;
    let body = read_body(body, state.max_body_bytes).await?;
    let reply = state
        .router
        .proxy_legacy(
            &provider,
            LegacyCall {
                parts: &mut parts,
                peer,
                subpath: &subpath,
                body,
                mode: LegacyMode::V1,
            },
        )
        .await?;
    Ok(reply.into_response())
}

/// `ANY /system-server/v2/{datatype}/{group}/{version}/{*subpath}`.
pub async fn legacy_v2(
    State(state): State<Arc<GateState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((datatype, group, version, subpath)): Path<(String, String, String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let target = format!("{datatype}/{group}/{version}");
    let Some(app_key) = headers::header_str(&parts.headers, headers::APP_KEY).map(str::to_string)
    else {
        return Err(ApiError::forbidden("empty X-App-Key"));
    };
    let Some(signature) =
        headers::header_str(&parts.headers, headers::AUTH_SIGNATURE).map(str::to_string)
    else {
        state.audit.record(&AccessAuditEvent::denied(
            "signature_validate",
            Some(&app_key),
            &target,
            "empty signature",
        ));
        return Err(ApiError::forbidden("invalid signature"));
    };
    if let Err(err) =
        state.signatures.validate(&app_key, &signature, &subpath, &datatype, &group, &version).await
    {
        state.audit.record(&AccessAuditEvent::denied(
            "signature_validate",
            Some(&app_key),
            &target,
            err.to_string(),
        ));
        return Err(signature_error(&err));
    }
    state.audit.record(&AccessAuditEvent::allowed("signature_validate", Some(&app_key), &target));

    let provider =
        state.directory.get_provider(&datatype, &group, &version).map_err(|err| match err {
            DirectoryError::ProviderNotFound => ApiError::not_found(err.to_string()),
            DirectoryError::Unavailable(_) => ApiError::internal(err.to_string()),
        })?;
    let body = read_body(body, state.max_body_bytes).await?;
    let reply = state
        .router
        .proxy_legacy(
            &provider,
            LegacyCall {
                parts: &mut parts,
                peer,
                subpath: &subpath,
                body,
                mode: LegacyMode::V2,
            },
        )
        .await?;
    Ok(reply.into_response())
}

/// Maps a signature failure: missing provider is 404, everything else 403.
fn signature_error(err: &SignatureError) -> ApiError {
    match err {
        SignatureError::ProviderNotFound => ApiError::not_found(err.to_string()),
        _ => ApiError::forbidden(format!("permission denied: err={err}")),
    }
}

/// Buffers the inbound body up to `limit` bytes.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, ApiError> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|err| ApiError::bad_request(format!("read request body: {err}")))
}
