// crates/service-gate-server/src/access.rs
// ============================================================================
// Module: Access-Control API
// Description: Token issuance, credential registration, and nonce handout.
// Purpose: Serve the `/permission/v1alpha1` endpoints.
// Dependencies: axum, time, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! Applications exchange a signed challenge for a short-lived access token at
//! `/access`. The tenant owner registers and unregisters application
//! credentials; that identity comes from an HS256 user token checked against
//! the registrar secret. `/nonce` hands the service nonce to allowlisted
//! peers only.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::ConnectInfo;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use service_gate_core::AccessTokenError;
use service_gate_core::AccessTokenRequest;
use service_gate_core::ApplicationCredential;
use service_gate_core::PermissionRequirement;
use service_gate_core::StoreError;
use service_gate_core::store::find_credential_by_key;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use tracing::warn;

use crate::audit::AccessAuditEvent;
use crate::headers;
use crate::jwt;
use crate::response::ApiError;
use crate::response::success;
use crate::response::success_empty;
use crate::state::GateState;

// ============================================================================
// SECTION: Payloads
// ============================================================================

/// Reply of `/access`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenReply {
    /// Bearer token.
    pub access_token: String,
    /// RFC 3339 expiry.
    pub expired_at: String,
}

/// Body of `/register` and `/unregister`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRegistration {
    /// Application name.
    #[serde(default)]
    pub app: String,
    /// Application id.
    #[serde(default)]
    pub appid: String,
    /// Requested grants.
    #[serde(default)]
    pub perm: Vec<PermissionRequirement>,
}

/// Reply of `/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReply {
    /// Public key.
    pub app_key: String,
    /// Private secret.
    pub app_secret: String,
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// `POST /permission/v1alpha1/access`.
pub async fn access(
    State(state): State<Arc<GateState>>,
    Json(request): Json<AccessTokenRequest>,
) -> Result<Response, ApiError> {
    let target = format!(
        "{}/{}/{}",
        request.perm.data_type, request.perm.group, request.perm.version
    );
    let credential = find_credential_by_key(state.store.as_ref(), &request.app_key)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::bad_request("app not found"))?;
    let issued = state.tokens.grant(&request, &credential).map_err(|err| {
        state.audit.record(&AccessAuditEvent::denied(
            "access_token_issue",
            Some(&request.app_key),
            &target,
            err.to_string(),
        ));
        match err {
            AccessTokenError::PermissionNotAllowed => ApiError::forbidden(err.to_string()),
            _ => ApiError::bad_request(err.to_string()),
        }
    })?;
    state.audit.record(&AccessAuditEvent::allowed(
        "access_token_issue",
        Some(&request.app_key),
        &target,
    ));
    let expired_at =
        issued.expires_at.format(&Rfc3339).map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(success(AccessTokenReply {
        access_token: issued.access_token,
        expired_at,
    }))
}

/// `POST /permission/v1alpha1/register`.
pub async fn register(
    State(state): State<Arc<GateState>>,
    headers: HeaderMap,
    Json(request): Json<CredentialRegistration>,
) -> Result<Response, ApiError> {
    let user = owner_identity(&state, &headers)?;
    if request.app.is_empty() {
        return Err(ApiError::bad_request("invalid app, app name is empty"));
    }
    let credential = match state.store.get_credential(&request.app).await.map_err(store_error)? {
        Some(mut existing) => {
            existing.permissions = request.perm;
            state.store.update_credential(existing.clone()).await.map_err(store_error)?;
            info!(app = %existing.app, user = %user, "application permissions replaced");
            existing
        }
        None => {
            let now = state.clock.now().unix_timestamp();
            let fresh =
                ApplicationCredential::generate(&request.app, &request.appid, request.perm, now);
            state.store.create_credential(fresh.clone()).await.map_err(store_error)?;
            info!(app = %fresh.app, user = %user, "application registered");
            fresh
        }
    };
    Ok(success(RegistrationReply {
        app_key: credential.key,
        app_secret: credential.secret,
    }))
}

/// `POST /permission/v1alpha1/unregister`.
pub async fn unregister(
    State(state): State<Arc<GateState>>,
    headers: HeaderMap,
    Json(request): Json<CredentialRegistration>,
) -> Result<Response, ApiError> {
    let user = owner_identity(&state, &headers)?;
    match state.store.delete_credential(&request.app).await {
        Ok(()) => info!(app = %request.app, user = %user, "application permission deleted"),
        Err(StoreError::NotFound(_)) => {
            info!(app = %request.app, "application already unregistered");
        }
        Err(err) => return Err(store_error(err)),
    }
    Ok(success_empty())
}

/// `GET /permission/v1alpha1/nonce`.
pub async fn nonce(
    State(state): State<Arc<GateState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    if !state.nonce.is_allowed(peer.ip()) {
        warn!(peer = %peer.ip(), "nonce requested by unlisted peer");
        return Err(ApiError::forbidden("forbidden"));
    }
    Ok((StatusCode::OK, [(CONTENT_TYPE, "text/plain; charset=utf-8")], state.nonce.current())
        .into_response())
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Verifies the registrar token and requires the tenant owner.
fn owner_identity(state: &GateState, headers: &HeaderMap) -> Result<String, ApiError> {
    let deny = |reason: String| {
        state.audit.record(&AccessAuditEvent::denied(
            "registrar_validate",
            None,
            &state.tenant.namespace,
            reason.clone(),
        ));
        ApiError::unauthorized(reason)
    };
    let token = headers::header_str(headers, headers::AUTHORIZATION_TOKEN)
        .ok_or_else(|| deny("missing user token".to_string()))?;
    let secret = state
        .registrar_secret
        .as_deref()
        .ok_or_else(|| deny("registrar secret not configured".to_string()))?;
    let now = state.clock.now().unix_timestamp();
    let claims = jwt::verify_hs256(token, secret.as_bytes(), now).map_err(|err| deny(err.to_string()))?;
    let user = claims
        .get("username")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
        .ok_or_else(|| deny("token has no username".to_string()))?;
    if !state.tenant.is_owned_by(user) {
        return Err(deny(format!("invalid user, {user}")));
    }
    state.audit.record(&AccessAuditEvent::allowed(
        "registrar_validate",
        Some(user),
        &state.tenant.namespace,
    ));
    Ok(user.to_string())
}

/// Store failures are internal errors.
fn store_error(err: StoreError) -> ApiError {
    ApiError::internal(err.to_string())
}
