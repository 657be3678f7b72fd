// crates/service-gate-server/src/router.rs
// ============================================================================
// Module: Request Router
// Description: Structured provider calls behind scoped access tokens.
// Purpose: Resolve the provider for a data route and forward the operation.
// Dependencies: axum, reqwest, serde, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! A data route call names `(datatype, group, version)` in its path and
//! carries an `X-Access-Token`. The token must cover the exact operation.
//! [`RequestRouter::do_request`] resolves the active provider, picks the op
//! API whose name matches the decoded op, and POSTs the proxy payload to it.
//! Mutating calls that succeed are handed to the event dispatcher.
//!
//! Reply shapes are modelled by [`ProxyReply`]: a JSON body from a structured
//! call, a relayed upstream response, or a websocket tunnel handshake.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::extract::RawQuery;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use service_gate_core::DirectoryError;
use service_gate_core::ProviderDirectory;
use service_gate_core::TenantIdentity;
use service_gate_core::capability::OP_CREATE;
use service_gate_core::capability::OP_DELETE;
use service_gate_core::capability::OP_GET;
use service_gate_core::capability::OP_LIST;
use service_gate_core::capability::OP_UPDATE;
use service_gate_core::capability::ROUTED_DATA_TYPES;
use service_gate_core::capability::decode_op;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::audit::AccessAuditEvent;
use crate::headers;
use crate::nonce::NonceSource;
use crate::response::ApiError;
use crate::response::success;
use crate::state::GateState;

// ============================================================================
// SECTION: Payloads
// ============================================================================

/// Body POSTed to a provider op API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Operation string, possibly with `?params`.
    pub op: String,
    /// Data type.
    #[serde(rename = "datatype")]
    pub data_type: String,
    /// API version.
    pub version: String,
    /// Provider group.
    pub group: String,
    /// Key of the calling application.
    #[serde(rename = "appkey", default)]
    pub app_key: String,
    /// Operation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<Value>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Access token the caller presented.
    #[serde(rename = "Token", default)]
    pub token: String,
}

/// Proxy payload plus the provider's reply, sent to watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Originating call.
    #[serde(flatten)]
    pub request: ProxyRequest,
    /// Provider reply.
    #[serde(default)]
    pub result: Value,
}

/// `param` of a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParam {
    /// Query filters, `offset` and `limit` excluded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Vec<String>>,
    /// Paging window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Pagination>,
}

/// Paging window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Records to skip.
    #[serde(default)]
    pub offset: usize,
    /// Records to return.
    #[serde(default)]
    pub limit: usize,
}

/// `param` of get, update, and delete calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataIdParam {
    /// Record id from the path.
    pub dataid: String,
}

/// Path triple of a data route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Triple {
    /// Data type.
    pub datatype: String,
    /// Provider group.
    pub group: String,
    /// API version.
    pub version: String,
}

/// Builds the list parameter from raw query pairs.
#[must_use]
pub fn list_param(query: &[(String, String)]) -> ListParam {
    let mut filters: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut offset = None;
    let mut limit = None;
    for (key, value) in query {
        match key.as_str() {
            "offset" => offset = offset.or(Some(value.as_str())),
            "limit" => limit = limit.or(Some(value.as_str())),
            _ => filters.entry(key.clone()).or_default().push(value.clone()),
        }
    }
    let page = match limit.map(str::parse::<usize>) {
        Some(Ok(limit)) => Some(Pagination {
            offset: offset.and_then(|value| value.parse().ok()).unwrap_or_default(),
            limit,
        }),
        Some(Err(_)) => {
            warn!(limit = limit.unwrap_or_default(), "query param limit is not numeric");
            None
        }
        None => None,
    };
    ListParam {
        filters,
        page,
    }
}

/// Parses `a=b&c=d` into decoded pairs.
#[must_use]
pub fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

// ============================================================================
// SECTION: Replies
// ============================================================================

/// Outcome of a routed call.
pub enum ProxyReply {
    /// Decoded JSON body of a structured provider call.
    Json(Value),
    /// Upstream response relayed as-is, buffered or streamed.
    Streamed(Response),
    /// Switching-protocols response that starts a websocket tunnel.
    Tunnel(Response),
}

impl IntoResponse for ProxyReply {
    fn into_response(self) -> Response {
        match self {
            Self::Json(value) => success(value),
            Self::Streamed(response) | Self::Tunnel(response) => response,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Routing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Provider lookup failed.
    #[error("{0}")]
    Lookup(#[from] DirectoryError),
    /// Provider exposes no op API for the operation.
    #[error("provider not found")]
    OpNotFound,
    /// Legacy provider does not expose the method and path.
    #[error("unsupported api of provider")]
    UnsupportedApi,
    /// Outbound request could not be built or sent.
    #[error("invoke provider err: {0}")]
    Transport(String),
    /// Provider answered with an error status.
    #[error("invoke provider err: code {status}, {body}")]
    Upstream {
        /// Upstream status.
        status: u16,
        /// Upstream body.
        body: String,
    },
    /// Provider reply is not JSON.
    #[error("decode provider reply: {0}")]
    Decode(String),
}

impl RouterError {
    /// Status for token-authenticated paths; lookup failures are 500 here.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Lookup(_) | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::OpNotFound => StatusCode::NOT_FOUND,
            Self::UnsupportedApi => StatusCode::BAD_REQUEST,
            Self::Upstream {
                status, ..
            } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Decode(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Forwards routed calls to directory-selected providers.
pub struct RequestRouter {
    /// Provider lookup.
    pub(crate) directory: Arc<ProviderDirectory>,
    /// Service-auth nonce.
    pub(crate) nonce: Arc<NonceSource>,
    /// Tenant served by this instance.
    pub(crate) tenant: TenantIdentity,
    /// Shared outbound client; timeouts are set per call.
    pub(crate) client: reqwest::Client,
    /// Structured call timeout.
    pub(crate) provider_timeout: Duration,
    /// Legacy v1 timeout.
    pub(crate) legacy_timeout: Duration,
    /// Legacy v2 timeout.
    pub(crate) legacy_stream_timeout: Duration,
}

/// Outbound timeouts used by the router.
#[derive(Debug, Clone, Copy)]
pub struct RouterTimeouts {
    /// Structured calls.
    pub provider: Duration,
    /// Legacy v1 passthrough.
    pub legacy: Duration,
    /// Legacy v2 passthrough.
    pub legacy_stream: Duration,
}

impl RequestRouter {
    /// Creates a router.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Transport`] when the HTTP client cannot be built.
    pub fn new(
        directory: Arc<ProviderDirectory>,
        nonce: Arc<NonceSource>,
        tenant: TenantIdentity,
        timeouts: RouterTimeouts,
    ) -> Result<Self, RouterError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| RouterError::Transport(err.to_string()))?;
        Ok(Self {
            directory,
            nonce,
            tenant,
            client,
            provider_timeout: timeouts.provider,
            legacy_timeout: timeouts.legacy,
            legacy_stream_timeout: timeouts.legacy_stream,
        })
    }

    /// Sends `request` to the provider op API matching `op`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] when no provider or op API matches, the call
    /// fails, the provider answers with status 400 or above, or the reply is
    /// not JSON.
    pub async fn do_request(
        &self,
        op: &str,
        request: &ProxyRequest,
        user_token: Option<&str>,
    ) -> Result<Value, RouterError> {
        if !ROUTED_DATA_TYPES.contains(&request.data_type.as_str()) {
            warn!(data_type = %request.data_type, "unsupported data type");
        }
        let provider =
            self.directory.get_provider(&request.data_type, &request.group, &request.version)?;
        let decoded = decode_op(op);
        let api = provider
            .op_apis
            .iter()
            .find(|api| api.name == decoded.name)
            .ok_or(RouterError::OpNotFound)?;
        let url = provider.url_for(&api.uri);
        info!(provider = %provider.name, url = %url, op, "send request to provider");
        let mut outbound = self
            .client
            .post(&url)
            .timeout(self.provider_timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(headers::BACKEND_NONCE, self.nonce.current())
            .header(headers::BFL_USER, &self.tenant.owner)
            .json(request);
        if let Some(token) = user_token {
            outbound = outbound.header(headers::AUTHORIZATION_TOKEN, token);
        }
        let reply = outbound.send().await.map_err(|err| RouterError::Transport(err.to_string()))?;
        let status = reply.status();
        let body = reply.bytes().await.map_err(|err| RouterError::Transport(err.to_string()))?;
        if status.as_u16() >= 400 {
            return Err(RouterError::Upstream {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|err| RouterError::Decode(err.to_string()))
    }
}

// ============================================================================
// SECTION: Data Route Handlers
// ============================================================================

/// `GET /{datatype}/{group}/{version}`.
pub async fn list(
    State(state): State<Arc<GateState>>,
    Path(triple): Path<Triple>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let param = list_param(&query_pairs(query.as_deref()));
    let param = serde_json::to_value(param).map_err(|err| ApiError::internal(err.to_string()))?;
    handle_proxy(&state, OP_LIST, &triple, &headers, Some(param), None).await
}

/// `GET /{datatype}/{group}/{version}/{id}`.
pub async fn get_one(
    State(state): State<Arc<GateState>>,
    Path((datatype, group, version, id)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let triple = Triple {
        datatype,
        group,
        version,
    };
    handle_proxy(&state, OP_GET, &triple, &headers, Some(data_id(id)), None).await
}

/// `POST /{datatype}/{group}/{version}`.
pub async fn create(
    State(state): State<Arc<GateState>>,
    Path(triple): Path<Triple>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let data = parse_body(&body)?;
    handle_proxy(&state, OP_CREATE, &triple, &headers, None, data).await
}

/// `PUT /{datatype}/{group}/{version}/{id}`.
pub async fn update(
    State(state): State<Arc<GateState>>,
    Path((datatype, group, version, id)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let triple = Triple {
        datatype,
        group,
        version,
    };
    let data = parse_body(&body)?;
    handle_proxy(&state, OP_UPDATE, &triple, &headers, Some(data_id(id)), data).await
}

/// `DELETE /{datatype}/{group}/{version}/{id}`.
pub async fn delete(
    State(state): State<Arc<GateState>>,
    Path((datatype, group, version, id)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let triple = Triple {
        datatype,
        group,
        version,
    };
    let data = parse_body(&body)?;
    handle_proxy(&state, OP_DELETE, &triple, &headers, Some(data_id(id)), data).await
}

/// `POST /{datatype}/{group}/{version}/{action}`; the raw query is appended to the op.
pub async fn action(
    State(state): State<Arc<GateState>>,
    Path((datatype, group, version, action)): Path<(String, String, String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let triple = Triple {
        datatype,
        group,
        version,
    };
    let op = match query.filter(|query| !query.is_empty()) {
        Some(query) => format!("{action}?{query}"),
        None => action,
    };
    let data = parse_body(&body)?;
    handle_proxy(&state, &op, &triple, &headers, None, data).await
}

/// Validates the access token, forwards the call, and enqueues mutations.
async fn handle_proxy(
    state: &GateState,
    op: &str,
    triple: &Triple,
    headers: &HeaderMap,
    param: Option<Value>,
    data: Option<Value>,
) -> Result<Response, ApiError> {
    let target = format!("{}/{}/{}", triple.datatype, triple.group, triple.version);
    let Some(token) = headers::header_str(headers, headers::ACCESS_TOKEN) else {
        state.audit.record(&AccessAuditEvent::denied(
            "access_token_validate",
            None,
            &target,
            "missing access token",
        ));
        return Err(ApiError::unauthorized("missing access token"));
    };
    let app_key = state
        .tokens
        .validate(token, op, &triple.datatype, &triple.version, &triple.group)
        .map_err(|err| {
            state.audit.record(&AccessAuditEvent::denied(
                "access_token_validate",
                None,
                &target,
                err.to_string(),
            ));
            ApiError::forbidden(err.to_string())
        })?;
    state.audit.record(&AccessAuditEvent::allowed("access_token_validate", Some(&app_key), &target));
    let request = ProxyRequest {
        op: op.to_string(),
        data_type: triple.datatype.clone(),
        version: triple.version.clone(),
        group: triple.group.clone(),
        app_key,
        param,
        data,
        token: token.to_string(),
    };
    let user_token = headers::header_str(headers, headers::AUTHORIZATION_TOKEN);
    let result = state.router.do_request(op, &request, user_token).await?;
    if matches!(op, OP_CREATE | OP_UPDATE | OP_DELETE) {
        debug!(op, target = %target, "enqueue watcher dispatch");
        state.dispatcher.enqueue(DispatchRequest {
            request,
            result: result.clone(),
        });
    }
    Ok(success(result))
}

/// `{"dataid": id}` parameter.
fn data_id(id: String) -> Value {
    serde_json::json!({ "dataid": id })
}

/// Parses an optional JSON request body.
fn parse_body(body: &Bytes) -> Result<Option<Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}
