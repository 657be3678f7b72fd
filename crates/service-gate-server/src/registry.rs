// crates/service-gate-server/src/registry.rs
// ============================================================================
// Module: Provider And Permission Registration
// Description: Role and binding maintenance for gateway-routed providers.
// Purpose: Let apps publish provider paths and grant them to service accounts.
// Dependencies: axum, serde, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! Provider registration turns each published provider into one cluster role
//! per binding key: `<app_namespace>/<name>` always, plus the key derived from
//! the provider's domain when it has one. Roles carry the binding key and the
//! backend service as annotations so the RBAC resolver can route without a
//! directory lookup.
//!
//! Permission registration binds the roles of a user's providers to an app's
//! service account living in `<app>-<user>`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use serde::Serialize;
use service_gate_core::TenantIdentity;
use service_gate_core::identity::parse_service_account;
use service_gate_core::identity::role_name_for_ref;
use service_gate_core::identity::user_of_namespace;
use service_gate_core::identity::user_provider_ref;
use service_gate_core::rbac::CLUSTER_ROLE_KIND;
use service_gate_core::rbac::ClusterRole;
use service_gate_core::rbac::PROVIDER_REF_ANNOTATION;
use service_gate_core::rbac::PROVIDER_SERVICE_ANNOTATION;
use service_gate_core::rbac::PolicyRule;
use service_gate_core::rbac::RbacError;
use service_gate_core::rbac::RbacStore;
use service_gate_core::rbac::RoleBinding;
use service_gate_core::rbac::RoleRef;
use service_gate_core::rbac::Subject;
use service_gate_core::rbac::SubjectKind;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::headers;
use crate::response::ApiError;
use crate::response::success;
use crate::response::success_empty;
use crate::state::GateState;

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Body of provider register and unregister calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRegistration {
    /// Publishing app.
    #[serde(default)]
    pub app_name: String,
    /// Namespace of the publishing app.
    #[serde(default)]
    pub app_namespace: String,
    /// Published providers.
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

/// One published provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider name.
    pub name: String,
    /// Public domain, `<app>.<user>.<zone>...`; optional.
    #[serde(default)]
    pub domain: String,
    /// Backend service, `host[:port]`.
    #[serde(default)]
    pub service: String,
    /// Non-resource URL patterns.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Allowed verbs.
    #[serde(default)]
    pub verbs: Vec<String>,
}

/// Body of permission register and unregister calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRegistration {
    /// Requesting app.
    #[serde(default)]
    pub app: String,
    /// App id.
    #[serde(default)]
    pub appid: String,
    /// Requested grants.
    #[serde(default)]
    pub perm: Vec<PermissionGrant>,
}

/// One requested grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Provider name in the caller's system namespace.
    #[serde(default)]
    pub provider_name: String,
    /// Service account to bind; `default` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Registration failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Provider domain has fewer than three labels.
    #[error("invalid provider domain: {0}")]
    InvalidDomain(String),
    /// Request body is incomplete.
    #[error("{0}")]
    InvalidRequest(String),
    /// Caller is missing or outside the tenant.
    #[error("{0}")]
    Unauthorized(String),
    /// Role store failure.
    #[error(transparent)]
    Store(#[from] RbacError),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidDomain(_) | RegistryError::InvalidRequest(_) => {
                Self::bad_request(err.to_string())
            }
            RegistryError::Unauthorized(_) => Self::unauthorized(err.to_string()),
            RegistryError::Store(_) => Self::internal(err.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Provider Roles
// ============================================================================

/// Binding keys a provider is reachable under.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidDomain`] when the domain has fewer than
/// three dot-separated labels.
pub fn provider_refs(
    tenant: &TenantIdentity,
    app_namespace: &str,
    provider: &ProviderSpec,
) -> Result<Vec<String>, RegistryError> {
    let own = if app_namespace.is_empty() {
        provider.name.clone()
    } else {
        format!("{app_namespace}/{}", provider.name)
    };
    let mut refs = vec![own];
    if !provider.domain.is_empty() {
        if provider.domain.split('.').count() < 3 {
            return Err(RegistryError::InvalidDomain(provider.domain.clone()));
        }
        refs.push(tenant.provider_ref_from_host(&provider.domain));
    }
    Ok(refs)
}

/// Role granting `provider`'s paths under `provider_ref`.
fn provider_role(provider_ref: &str, provider: &ProviderSpec) -> ClusterRole {
    ClusterRole {
        name: role_name_for_ref(provider_ref),
        annotations: BTreeMap::from([
            (PROVIDER_REF_ANNOTATION.to_string(), provider_ref.to_string()),
            (PROVIDER_SERVICE_ANNOTATION.to_string(), provider.service.clone()),
        ]),
        rules: vec![PolicyRule {
            verbs: provider.verbs.clone(),
            non_resource_urls: provider.paths.clone(),
        }],
    }
}

/// Creates or replaces the roles of every provider in `request`.
///
/// # Errors
///
/// Returns [`RegistryError`] on an invalid domain or a store failure.
pub async fn register_providers(
    rbac: &dyn RbacStore,
    tenant: &TenantIdentity,
    request: &ProviderRegistration,
) -> Result<(), RegistryError> {
    for provider in &request.providers {
        for provider_ref in provider_refs(tenant, &request.app_namespace, provider)? {
            let role = provider_role(&provider_ref, provider);
            if rbac.get_role(&role.name).await?.is_some() {
                info!(role = %role.name, "replacing existing provider role");
            }
            info!(role = %role.name, provider_ref = %provider_ref, paths = %provider.paths.join(","), "put provider role");
            rbac.put_role(role).await?;
        }
    }
    Ok(())
}

/// Deletes the roles of every provider in `request`; missing roles are skipped.
///
/// # Errors
///
/// Returns [`RegistryError`] on an invalid domain or a store failure.
pub async fn unregister_providers(
    rbac: &dyn RbacStore,
    tenant: &TenantIdentity,
    request: &ProviderRegistration,
) -> Result<(), RegistryError> {
    for provider in &request.providers {
        for provider_ref in provider_refs(tenant, &request.app_namespace, provider)? {
            let name = role_name_for_ref(&provider_ref);
            match rbac.delete_role(&name).await {
                Ok(()) => info!(role = %name, "deleted provider role"),
                Err(RbacError::NotFound(_)) => warn!(role = %name, "provider role already gone"),
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Permission Bindings
// ============================================================================

/// Resolves the calling user from the trusted user header.
///
/// A service account must live in a user namespace and maps to that user;
/// the resulting namespace must belong to `tenant`.
///
/// # Errors
///
/// Returns [`RegistryError::Unauthorized`] otherwise.
pub fn caller_user(tenant: &TenantIdentity, account: Option<&str>) -> Result<String, RegistryError> {
    let account = account
        .filter(|account| !account.is_empty())
        .ok_or_else(|| RegistryError::Unauthorized("user not found in request header".to_string()))?;
    let (user, namespace) = match parse_service_account(account) {
        Some((namespace, _)) => {
            let user = user_of_namespace(namespace).ok_or_else(|| {
                RegistryError::Unauthorized(format!("user is not found in namespace {namespace}"))
            })?;
            (user.to_string(), namespace.to_string())
        }
        None => (account.to_string(), TenantIdentity::for_owner(account).namespace),
    };
    if namespace != tenant.namespace && namespace != tenant.user_space() {
        return Err(RegistryError::Unauthorized(format!("invalid user, {user}")));
    }
    Ok(user)
}

/// Roles governing `user`'s provider `provider_name`.
async fn provider_roles(
    rbac: &dyn RbacStore,
    user: &str,
    provider_name: &str,
) -> Result<Vec<ClusterRole>, RegistryError> {
    let wanted = user_provider_ref(user, provider_name);
    Ok(rbac
        .list_roles()
        .await?
        .into_iter()
        .filter(|role| role.provider_ref() == Some(wanted.as_str()))
        .collect())
}

/// Name of the binding of `role` to `service_account` in `app_namespace`.
fn binding_name(app_namespace: &str, service_account: &str, role: &str) -> String {
    format!("{app_namespace}:{service_account}:{role}")
}

/// Calls `apply` for every (grant, role) pair of `request`.
async fn for_each_grant<F, Fut>(
    rbac: &dyn RbacStore,
    user: &str,
    request: &PermissionRegistration,
    mut apply: F,
) -> Result<(), RegistryError>
where
    F: FnMut(String, String, ClusterRole) -> Fut,
    Fut: Future<Output = Result<(), RegistryError>>,
{
    if request.app.is_empty() {
        return Err(RegistryError::InvalidRequest("invalid app, app name is empty".to_string()));
    }
    let app_namespace = format!("{}-{user}", request.app);
    for grant in request.perm.iter().filter(|grant| !grant.provider_name.is_empty()) {
        let service_account = grant.service_account.clone().unwrap_or_else(|| "default".to_string());
        let roles = provider_roles(rbac, user, &grant.provider_name).await?;
        if roles.is_empty() {
            warn!(user, provider = %grant.provider_name, "no roles found for provider");
        }
        for role in roles {
            apply(app_namespace.clone(), service_account.clone(), role).await?;
        }
    }
    Ok(())
}

/// Binds the requested providers' roles to the app's service accounts.
///
/// # Errors
///
/// Returns [`RegistryError`] on an empty app name or a store failure.
pub async fn bind_permissions(
    rbac: &dyn RbacStore,
    user: &str,
    request: &PermissionRegistration,
) -> Result<(), RegistryError> {
    for_each_grant(rbac, user, request, |app_namespace, service_account, role| async move {
        let binding = RoleBinding {
            name: binding_name(&app_namespace, &service_account, &role.name),
            namespace: String::new(),
            role_ref: RoleRef {
                kind: CLUSTER_ROLE_KIND.to_string(),
                name: role.name,
            },
            subjects: vec![Subject {
                kind: SubjectKind::ServiceAccount,
                name: service_account,
                namespace: app_namespace,
            }],
        };
        info!(binding = %binding.name, "put provider binding");
        rbac.put_binding(binding).await.map_err(RegistryError::from)
    })
    .await
}

/// Removes the bindings created by [`bind_permissions`]; failures are logged.
///
/// # Errors
///
/// Returns [`RegistryError`] on an empty app name or when roles cannot be listed.
pub async fn unbind_permissions(
    rbac: &dyn RbacStore,
    user: &str,
    request: &PermissionRegistration,
) -> Result<(), RegistryError> {
    for_each_grant(rbac, user, request, |app_namespace, service_account, role| async move {
        let name = binding_name(&app_namespace, &service_account, &role.name);
        match rbac.delete_binding(&name).await {
            Ok(()) => info!(binding = %name, "deleted provider binding"),
            Err(err) => warn!(binding = %name, error = %err, "failed to delete provider binding"),
        }
        Ok(())
    })
    .await
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// Trusted caller of a registration call.
fn header_user(state: &GateState, headers: &HeaderMap) -> Result<String, RegistryError> {
    caller_user(&state.tenant, headers::header_str(headers, headers::BFL_USER))
}

/// `POST /provider/v2alpha1/register`.
pub async fn provider_register(
    State(state): State<Arc<GateState>>,
    headers: HeaderMap,
    Json(request): Json<ProviderRegistration>,
) -> Result<Response, ApiError> {
    let user = header_user(&state, &headers)?;
    register_providers(state.rbac.as_ref(), &state.tenant, &request).await?;
    info!(user = %user, app = %request.app_name, "provider registered");
    Ok(success_empty())
}

/// `POST /provider/v2alpha1/unregister`.
pub async fn provider_unregister(
    State(state): State<Arc<GateState>>,
    headers: HeaderMap,
    Json(request): Json<ProviderRegistration>,
) -> Result<Response, ApiError> {
    let user = header_user(&state, &headers)?;
    unregister_providers(state.rbac.as_ref(), &state.tenant, &request).await?;
    info!(user = %user, app = %request.app_name, "provider unregistered");
    Ok(success_empty())
}

/// `POST /permission/v2alpha1/register`.
pub async fn permission_register(
    State(state): State<Arc<GateState>>,
    headers: HeaderMap,
    Json(request): Json<PermissionRegistration>,
) -> Result<Response, ApiError> {
    let user = header_user(&state, &headers)?;
    bind_permissions(state.rbac.as_ref(), &user, &request).await?;
    info!(user = %user, app = %request.app, "permission registered");
    Ok(success(serde_json::json!({})))
}

/// `POST /permission/v2alpha1/unregister`.
pub async fn permission_unregister(
    State(state): State<Arc<GateState>>,
    headers: HeaderMap,
    Json(request): Json<PermissionRegistration>,
) -> Result<Response, ApiError> {
    let user = header_user(&state, &headers)?;
    unbind_permissions(state.rbac.as_ref(), &user, &request).await?;
    info!(user = %user, app = %request.app, "permission unregistered");
    Ok(success_empty())
}
