// crates/service-gate-core/src/rbac.rs
// ============================================================================
// Module: Non-Resource RBAC
// Description: Cluster roles, role bindings, and the provider-bound resolver.
// Purpose: Authorize non-resource requests and surface the bound backend.
// Dependencies: async-trait, serde, crate::identity
// ============================================================================

//! ## Overview
//! Roles carry two annotations: the provider binding key they govern and the
//! backend service that serves it. [`RbacResolver::authorize`] walks every
//! role binding, keeps the ones whose subjects apply to the caller, and only
//! consults a referenced role when its binding-key annotation equals the key
//! derived from the request host. The first rule that allows the request
//! decides; its role's service annotation is returned so the proxy can pick
//! the backend without a second lookup.
//!
//! Only non-resource rules are evaluated. A URL pattern matches exactly, or
//! as a prefix when it ends in `*`. A verb matches exactly or via `*`.
//!
//! Security posture: anything other than an explicit allow is `NoOpinion`,
//! leaving the final deny to the surrounding authorizer chain.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::identity::UserInfo;
use crate::identity::service_account_user;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Annotation naming the provider binding key a role governs.
pub const PROVIDER_REF_ANNOTATION: &str = "provider-registry-ref";
/// Annotation naming the backend service a role routes to.
pub const PROVIDER_SERVICE_ANNOTATION: &str = "provider-service-ref";
/// Only role kind the resolver follows.
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";
/// Verb wildcard.
const WILDCARD: &str = "*";

// ============================================================================
// SECTION: Model
// ============================================================================

/// Non-resource policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Allowed verbs.
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Allowed URL patterns.
    #[serde(rename = "nonResourceURLs", default)]
    pub non_resource_urls: Vec<String>,
}

impl PolicyRule {
    /// Returns true when the rule covers `verb` on `path`.
    #[must_use]
    pub fn allows(&self, verb: &str, path: &str) -> bool {
        let verb_ok = self.verbs.iter().any(|candidate| candidate == WILDCARD || candidate == verb);
        verb_ok && self.non_resource_urls.iter().any(|pattern| url_matches(pattern, path))
    }
}

/// Matches a non-resource URL pattern.
fn url_matches(pattern: &str, path: &str) -> bool {
    if pattern == WILDCARD || pattern == path {
        return true;
    }
    pattern.strip_suffix('*').is_some_and(|prefix| path.starts_with(prefix))
}

/// Cluster-scoped role.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterRole {
    /// Role name.
    pub name: String,
    /// Role annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Policy rules.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl ClusterRole {
    /// Provider binding key the role governs.
    #[must_use]
    pub fn provider_ref(&self) -> Option<&str> {
        self.annotations.get(PROVIDER_REF_ANNOTATION).map(String::as_str)
    }

    /// Backend service the role routes to.
    #[must_use]
    pub fn provider_service(&self) -> Option<&str> {
        self.annotations.get(PROVIDER_SERVICE_ANNOTATION).map(String::as_str)
    }
}

/// Subject kinds a binding may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectKind {
    /// A user by name.
    User,
    /// Members of a group.
    Group,
    /// A service account.
    ServiceAccount,
}

/// Binding subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject kind.
    pub kind: SubjectKind,
    /// Subject name.
    pub name: String,
    /// Service-account namespace; defaults to the binding's namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Reference from a binding to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    /// Role kind.
    pub kind: String,
    /// Role name.
    pub name: String,
}

/// Binding of subjects to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    /// Binding name.
    pub name: String,
    /// Namespace; empty for cluster-wide bindings.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Referenced role.
    #[serde(rename = "roleRef")]
    pub role_ref: RoleRef,
    /// Subjects granted the role.
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl RoleBinding {
    /// Index of the first subject that applies to `user`.
    #[must_use]
    pub fn applies_to(&self, user: &UserInfo) -> Option<usize> {
        self.subjects.iter().position(|subject| subject_applies(subject, user, &self.namespace))
    }
}

/// Returns true when `subject` names `user`.
fn subject_applies(subject: &Subject, user: &UserInfo, binding_namespace: &str) -> bool {
    match subject.kind {
        SubjectKind::User => user.name == subject.name,
        SubjectKind::Group => user.in_group(&subject.name),
        SubjectKind::ServiceAccount => {
            let namespace =
                if subject.namespace.is_empty() { binding_namespace } else { &subject.namespace };
            !namespace.is_empty() && user.name == service_account_user(namespace, &subject.name)
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// RBAC store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RbacError {
    /// Named object does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Backend failure.
    #[error("rbac store error: {0}")]
    Backend(String),
}

/// Source of roles and bindings.
#[async_trait]
pub trait RbacStore: Send + Sync {
    /// Lists every role binding.
    async fn list_bindings(&self) -> Result<Vec<RoleBinding>, RbacError>;
    /// Fetches a binding by name.
    async fn get_binding(&self, name: &str) -> Result<Option<RoleBinding>, RbacError>;
    /// Creates or replaces a binding.
    async fn put_binding(&self, binding: RoleBinding) -> Result<(), RbacError>;
    /// Deletes a binding by name.
    async fn delete_binding(&self, name: &str) -> Result<(), RbacError>;
    /// Lists every cluster role.
    async fn list_roles(&self) -> Result<Vec<ClusterRole>, RbacError>;
    /// Fetches a role by name.
    async fn get_role(&self, name: &str) -> Result<Option<ClusterRole>, RbacError>;
    /// Creates or replaces a role.
    async fn put_role(&self, role: ClusterRole) -> Result<(), RbacError>;
    /// Deletes a role by name.
    async fn delete_role(&self, name: &str) -> Result<(), RbacError>;
}

/// Process-local RBAC store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRbacStore {
    /// Roles by name.
    roles: Arc<Mutex<BTreeMap<String, ClusterRole>>>,
    /// Bindings by name.
    bindings: Arc<Mutex<BTreeMap<String, RoleBinding>>>,
}

impl InMemoryRbacStore {
    /// Creates a store preloaded with roles and bindings.
    #[must_use]
    pub fn seeded(roles: Vec<ClusterRole>, bindings: Vec<RoleBinding>) -> Self {
        let store = Self::default();
        if let Ok(mut guard) = store.roles.lock() {
            guard.extend(roles.into_iter().map(|role| (role.name.clone(), role)));
        }
        if let Ok(mut guard) = store.bindings.lock() {
            guard.extend(bindings.into_iter().map(|binding| (binding.name.clone(), binding)));
        }
        store
    }
}

/// Maps a poisoned lock to a backend error.
fn poisoned<T>(_: T) -> RbacError {
    RbacError::Backend("rbac store mutex poisoned".to_string())
}

#[async_trait]
impl RbacStore for InMemoryRbacStore {
    async fn list_bindings(&self) -> Result<Vec<RoleBinding>, RbacError> {
        Ok(self.bindings.lock().map_err(poisoned)?.values().cloned().collect())
    }

    async fn get_binding(&self, name: &str) -> Result<Option<RoleBinding>, RbacError> {
        Ok(self.bindings.lock().map_err(poisoned)?.get(name).cloned())
    }

    async fn put_binding(&self, binding: RoleBinding) -> Result<(), RbacError> {
        self.bindings.lock().map_err(poisoned)?.insert(binding.name.clone(), binding);
        Ok(())
    }

    async fn delete_binding(&self, name: &str) -> Result<(), RbacError> {
        self.bindings
            .lock()
            .map_err(poisoned)?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RbacError::NotFound(format!("role binding {name}")))
    }

    async fn list_roles(&self) -> Result<Vec<ClusterRole>, RbacError> {
        Ok(self.roles.lock().map_err(poisoned)?.values().cloned().collect())
    }

    async fn get_role(&self, name: &str) -> Result<Option<ClusterRole>, RbacError> {
        Ok(self.roles.lock().map_err(poisoned)?.get(name).cloned())
    }

    async fn put_role(&self, role: ClusterRole) -> Result<(), RbacError> {
        self.roles.lock().map_err(poisoned)?.insert(role.name.clone(), role);
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<(), RbacError> {
        self.roles
            .lock()
            .map_err(poisoned)?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RbacError::NotFound(format!("cluster role {name}")))
    }
}

// ============================================================================
// SECTION: Decisions
// ============================================================================

/// Authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request is allowed.
    Allow,
    /// Request is denied.
    Deny,
    /// Authorizer has no opinion.
    NoOpinion,
}

/// Attributes of a request under authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttributes {
    /// Authenticated caller.
    pub user: UserInfo,
    /// Lowercase verb (`get`, `create`, ...).
    pub verb: String,
    /// Path, including `?query` when present.
    pub path: String,
    /// Provider binding key derived from the request host.
    pub binding_key: String,
}

/// Result of one authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationOutcome {
    /// Decision.
    pub decision: Decision,
    /// Human-readable reason.
    pub reason: String,
    /// Backend bound by the deciding role, if any.
    pub service: Option<String>,
}

impl AuthorizationOutcome {
    /// Outcome with no opinion.
    #[must_use]
    pub fn no_opinion(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::NoOpinion,
            reason: reason.into(),
            service: None,
        }
    }

    /// Allow without a bound service.
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
            service: None,
        }
    }
}

// ============================================================================
// SECTION: Resolver
// ============================================================================

/// Provider-bound non-resource RBAC resolver.
pub struct RbacResolver {
    /// Role and binding source.
    store: Arc<dyn RbacStore>,
}

impl RbacResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(store: Arc<dyn RbacStore>) -> Self {
        Self {
            store,
        }
    }

    /// Authorizes `attrs`.
    ///
    /// # Errors
    ///
    /// Returns [`RbacError`] when bindings cannot be listed.
    pub async fn authorize(
        &self,
        attrs: &RequestAttributes,
    ) -> Result<AuthorizationOutcome, RbacError> {
        let mut skipped = Vec::new();
        for binding in self.store.list_bindings().await? {
            let Some(subject_index) = binding.applies_to(&attrs.user) else {
                continue;
            };
            let role = match self.qualifying_role(&binding, &attrs.binding_key).await {
                Ok(role) => role,
                Err(detail) => {
                    skipped.push(detail);
                    continue;
                }
            };
            if !role.rules.iter().any(|rule| rule.allows(&attrs.verb, &attrs.path)) {
                continue;
            }
            let subject = binding.subjects.get(subject_index).map_or("", |s| s.name.as_str());
            let service = role.provider_service().map(str::to_string);
            debug!(
                binding = %binding.name,
                role = %role.name,
                service = service.as_deref().unwrap_or_default(),
                "rbac allowed"
            );
            return Ok(AuthorizationOutcome {
                decision: Decision::Allow,
                reason: format!(
                    "RBAC: allowed by RoleBinding \"{}\" of ClusterRole \"{}\" to \"{subject}\"",
                    binding.name, role.name
                ),
                service,
            });
        }
        let reason =
            if skipped.is_empty() { String::new() } else { format!("RBAC: {}", skipped.join(", ")) };
        Ok(AuthorizationOutcome::no_opinion(reason))
    }

    /// Resolves the binding's role when it governs `binding_key`.
    async fn qualifying_role(
        &self,
        binding: &RoleBinding,
        binding_key: &str,
    ) -> Result<ClusterRole, String> {
        if binding.role_ref.kind != CLUSTER_ROLE_KIND {
            return Err(format!("unsupported role reference kind {}", binding.role_ref.kind));
        }
        let role = self
            .store
            .get_role(&binding.role_ref.name)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("cluster role {} not found", binding.role_ref.name))?;
        if role.provider_ref() == Some(binding_key) {
            Ok(role)
        } else {
            Err(format!(
                "cluster role {} does not match binding provider {binding_key}",
                role.name
            ))
        }
    }
}

#[cfg(test)]
mod tests;
