// crates/service-gate-server/src/authz.rs
// ============================================================================
// Module: Authorization Chain
// Description: Ordered union of static, RBAC, and delegated authorizers.
// Purpose: Decide gateway requests and surface the bound backend service.
// Dependencies: async-trait, reqwest, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! [`AuthzChain`] consults each [`Authorizer`] in order. The first `Allow`
//! or `Deny` decides; `NoOpinion` reasons accumulate and the chain falls
//! back to `NoOpinion`, which the gateway treats as a denial. A member
//! error does not stop the chain; errors surface only when no member
//! decided.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use serde::Deserialize;
use serde_json::json;
use service_gate_config::AuthzConfig;
use service_gate_config::StaticRule;
use service_gate_core::Decision;
use service_gate_core::RbacResolver;
use service_gate_core::RequestAttributes;
use service_gate_core::rbac::AuthorizationOutcome;
use service_gate_core::rbac::RbacStore;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Authorization failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// Backing store or review service failed.
    #[error("authorization backend error: {0}")]
    Backend(String),
}

// ============================================================================
// SECTION: Contract
// ============================================================================

/// One authorization source.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    /// Decides `attrs`.
    async fn authorize(&self, attrs: &RequestAttributes) -> Result<AuthorizationOutcome, AuthzError>;
}

/// Lowercase verb for an HTTP method.
#[must_use]
pub fn verb_for_method(method: &Method) -> String {
    match *method {
        Method::GET | Method::HEAD => "get".to_string(),
        Method::POST => "create".to_string(),
        Method::PUT => "update".to_string(),
        Method::PATCH => "patch".to_string(),
        Method::DELETE => "delete".to_string(),
        _ => method.as_str().to_ascii_lowercase(),
    }
}

/// Ordered union of authorizers.
pub struct AuthzChain {
    /// Members in priority order.
    members: Vec<Arc<dyn Authorizer>>,
}

impl AuthzChain {
    /// Creates a chain.
    #[must_use]
    pub fn new(members: Vec<Arc<dyn Authorizer>>) -> Self {
        Self {
            members,
        }
    }

    /// Runs the members until one decides.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError`] when no member decided and at least one failed.
    pub async fn authorize(
        &self,
        attrs: &RequestAttributes,
    ) -> Result<AuthorizationOutcome, AuthzError> {
        let mut reasons = Vec::new();
        let mut errors = Vec::new();
        for member in &self.members {
            match member.authorize(attrs).await {
                Ok(outcome) if outcome.decision != Decision::NoOpinion => {
                    debug!(
                        authorizer = member.name(),
                        allowed = outcome.decision == Decision::Allow,
                        reason = %outcome.reason,
                        "authorization decided"
                    );
                    return Ok(outcome);
                }
                Ok(outcome) => {
                    if !outcome.reason.is_empty() {
                        reasons.push(outcome.reason);
                    }
                }
                Err(err) => errors.push(format!("{}: {err}", member.name())),
            }
        }
        if !errors.is_empty() {
            return Err(AuthzError::Backend(errors.join("; ")));
        }
        Ok(AuthorizationOutcome::no_opinion(reasons.join("; ")))
    }
}

/// Builds the chain from `[authz]` and the RBAC store.
///
/// # Errors
///
/// Returns [`AuthzError`] when the review client cannot be built.
pub fn build_chain(
    config: &AuthzConfig,
    rbac: Arc<dyn RbacStore>,
    timeout: Duration,
) -> Result<AuthzChain, AuthzError> {
    let mut members: Vec<Arc<dyn Authorizer>> = Vec::new();
    if !config.static_rules.is_empty() {
        members.push(Arc::new(StaticAuthorizer::new(config.static_rules.clone())));
    }
    members.push(Arc::new(RbacAuthorizer::new(RbacResolver::new(rbac))));
    if let Some(url) = &config.subject_access_review_url {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthzError::Backend(err.to_string()))?;
        members.push(Arc::new(SubjectAccessReviewAuthorizer::new(url.clone(), client)));
    }
    Ok(AuthzChain::new(members))
}

// ============================================================================
// SECTION: Static Rules
// ============================================================================

/// Allows requests matching configured rules.
pub struct StaticAuthorizer {
    /// Rules; unset fields match anything.
    rules: Vec<StaticRule>,
}

impl StaticAuthorizer {
    /// Creates the authorizer.
    #[must_use]
    pub const fn new(rules: Vec<StaticRule>) -> Self {
        Self {
            rules,
        }
    }
}

/// Unset or empty rule fields are wildcards.
fn wildcard(field: Option<&String>) -> Option<&str> {
    field.map(String::as_str).filter(|value| !value.is_empty() && *value != "*")
}

/// Returns true when `rule` covers `attrs`.
fn rule_matches(rule: &StaticRule, attrs: &RequestAttributes) -> bool {
    let user = wildcard(rule.user.as_ref()).is_none_or(|user| user == attrs.user.name);
    let group = wildcard(rule.group.as_ref()).is_none_or(|group| attrs.user.in_group(group));
    let verb = wildcard(rule.verb.as_ref()).is_none_or(|verb| verb == attrs.verb);
    let path = wildcard(rule.path.as_ref()).is_none_or(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => attrs.path.starts_with(prefix),
        None => pattern == attrs.path,
    });
    user && group && verb && path
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn authorize(&self, attrs: &RequestAttributes) -> Result<AuthorizationOutcome, AuthzError> {
        Ok(self.rules.iter().position(|rule| rule_matches(rule, attrs)).map_or_else(
            || AuthorizationOutcome::no_opinion(""),
            |index| AuthorizationOutcome::allow(format!("static rule {index}")),
        ))
    }
}

// ============================================================================
// SECTION: RBAC
// ============================================================================

/// Provider-bound RBAC member.
pub struct RbacAuthorizer {
    /// Resolver over the role store.
    resolver: RbacResolver,
}

impl RbacAuthorizer {
    /// Creates the authorizer.
    #[must_use]
    pub const fn new(resolver: RbacResolver) -> Self {
        Self {
            resolver,
        }
    }
}

#[async_trait]
impl Authorizer for RbacAuthorizer {
    fn name(&self) -> &'static str {
        "rbac"
    }

    async fn authorize(&self, attrs: &RequestAttributes) -> Result<AuthorizationOutcome, AuthzError> {
        self.resolver.authorize(attrs).await.map_err(|err| AuthzError::Backend(err.to_string()))
    }
}

// ============================================================================
// SECTION: Subject Access Review
// ============================================================================

/// Review reply.
#[derive(Debug, Default, Deserialize)]
struct ReviewReply {
    /// Review status.
    #[serde(default)]
    status: ReviewStatus,
}

/// Review status.
#[derive(Debug, Default, Deserialize)]
struct ReviewStatus {
    /// Explicit allow.
    #[serde(default)]
    allowed: bool,
    /// Explicit deny.
    #[serde(default)]
    denied: bool,
    /// Reason text.
    #[serde(default)]
    reason: String,
}

/// Delegates non-resource decisions to a subject access review endpoint.
pub struct SubjectAccessReviewAuthorizer {
    /// Review endpoint.
    url: String,
    /// Outbound client.
    client: reqwest::Client,
}

impl SubjectAccessReviewAuthorizer {
    /// Creates the authorizer.
    #[must_use]
    pub const fn new(url: String, client: reqwest::Client) -> Self {
        Self {
            url,
            client,
        }
    }
}

#[async_trait]
impl Authorizer for SubjectAccessReviewAuthorizer {
    fn name(&self) -> &'static str {
        "subject_access_review"
    }

    async fn authorize(&self, attrs: &RequestAttributes) -> Result<AuthorizationOutcome, AuthzError> {
        let review = json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SubjectAccessReview",
            "spec": {
                "user": attrs.user.name,
                "uid": attrs.user.uid,
                "groups": attrs.user.groups,
                "nonResourceAttributes": { "path": attrs.path, "verb": attrs.verb },
            },
        });
        let reply = self
            .client
            .post(&self.url)
            .json(&review)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| AuthzError::Backend(err.to_string()))?;
        let reply: ReviewReply =
            reply.json().await.map_err(|err| AuthzError::Backend(err.to_string()))?;
        let status = reply.status;
        let decision = if status.allowed {
            Decision::Allow
        } else if status.denied {
            Decision::Deny
        } else {
            Decision::NoOpinion
        };
        Ok(AuthorizationOutcome {
            decision,
            reason: status.reason,
            service: None,
        })
    }
}
