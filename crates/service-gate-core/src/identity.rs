// crates/service-gate-core/src/identity.rs
// ============================================================================
// Module: Identity
// Description: Tenant identity, authenticated users, and naming helpers.
// Purpose: Keep namespace and service-account conventions in one place.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A gateway instance serves exactly one tenant. [`TenantIdentity`] carries
//! its namespace (`user-system-<owner>`) and owner and is passed to every
//! component at construction. [`UserInfo`] is the identity the authn chain
//! establishes for a request.
//!
//! Service accounts are named `system:serviceaccount:<namespace>:<name>`.
//! Namespaces prefixed `user-system-` or `user-space-` belong to the user
//! named by the suffix.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Prefix of a user's system namespace.
pub const USER_SYSTEM_PREFIX: &str = "user-system-";
/// Prefix of a user's workload namespace.
pub const USER_SPACE_PREFIX: &str = "user-space-";
/// Prefix of service-account user names.
pub const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

// ============================================================================
// SECTION: Tenant Identity
// ============================================================================

/// Namespace and owner of the tenant this gateway serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantIdentity {
    /// Tenant system namespace.
    pub namespace: String,
    /// Owning user.
    pub owner: String,
}

impl TenantIdentity {
    /// Builds the identity for `owner` with its conventional namespace.
    #[must_use]
    pub fn for_owner(owner: &str) -> Self {
        Self {
            namespace: format!("{USER_SYSTEM_PREFIX}{owner}"),
            owner: owner.to_string(),
        }
    }

    /// The owner's workload namespace.
    #[must_use]
    pub fn user_space(&self) -> String {
        self.namespace.replacen(USER_SYSTEM_PREFIX, USER_SPACE_PREFIX, 1)
    }

    /// Returns true when `user` owns this tenant.
    #[must_use]
    pub fn is_owned_by(&self, user: &str) -> bool {
        self.namespace == format!("{USER_SYSTEM_PREFIX}{user}")
    }

    /// Binding key derived from a request host.
    ///
    /// `<app>.<namespace>[:port]` maps to `<namespace>/<app>`; a host without
    /// a dot maps to `<host>.user-space-<owner>`.
    #[must_use]
    pub fn provider_ref_from_host(&self, host: &str) -> String {
        let hostname = host.split(':').next().unwrap_or_default();
        let tokens: Vec<&str> = hostname.split('.').collect();
        match tokens.as_slice() {
            [app, namespace, ..] => format!("{namespace}/{app}"),
            _ => format!("{host}.{USER_SPACE_PREFIX}{}", self.owner),
        }
    }
}

/// Provider binding key for `provider` registered in `user`'s system namespace.
#[must_use]
pub fn user_provider_ref(user: &str, provider: &str) -> String {
    format!("{USER_SYSTEM_PREFIX}{user}/{provider}")
}

/// Role name for a provider binding key.
#[must_use]
pub fn role_name_for_ref(provider_ref: &str) -> String {
    provider_ref.replace('/', ":")
}

// ============================================================================
// SECTION: Users
// ============================================================================

/// Authenticated request identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    /// User or service-account name.
    pub name: String,
    /// Stable user id.
    #[serde(default)]
    pub uid: String,
    /// Group memberships.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserInfo {
    /// Builds an identity with name and uid set to `name`.
    #[must_use]
    pub fn named(name: &str, groups: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            uid: name.to_string(),
            groups,
        }
    }

    /// Returns true when the user belongs to `group`.
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|candidate| candidate == group)
    }
}

/// Splits a service-account user name into `(namespace, name)`.
#[must_use]
pub fn parse_service_account(user: &str) -> Option<(&str, &str)> {
    let rest = user.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
    let (namespace, name) = rest.split_once(':')?;
    Some((namespace, name))
}

/// Full user name of a service account.
#[must_use]
pub fn service_account_user(namespace: &str, name: &str) -> String {
    format!("{SERVICE_ACCOUNT_PREFIX}{namespace}:{name}")
}

/// Returns the owning user when `namespace` is a user namespace.
#[must_use]
pub fn user_of_namespace(namespace: &str) -> Option<&str> {
    namespace
        .strip_prefix(USER_SYSTEM_PREFIX)
        .or_else(|| namespace.strip_prefix(USER_SPACE_PREFIX))
}

/// Name to forward downstream: a service account in a user namespace maps to
/// that user, everything else passes through.
#[must_use]
pub fn effective_user(user: &str) -> &str {
    parse_service_account(user)
        .and_then(|(namespace, _)| user_of_namespace(namespace))
        .unwrap_or(user)
}

#[cfg(test)]
mod tests {
    use super::TenantIdentity;
    use super::effective_user;
    use super::parse_service_account;
    use super::role_name_for_ref;
    use super::user_of_namespace;

    #[test]
    fn provider_ref_from_host_variants() {
        let tenant = TenantIdentity::for_owner("alice");
        assert_eq!(
            tenant.provider_ref_from_host("calendarApp.user-system-alice:8080"),
            "user-system-alice/calendarApp"
        );
        assert_eq!(tenant.provider_ref_from_host("a.b.c.d"), "b/a");
        assert_eq!(tenant.provider_ref_from_host("files"), "files.user-space-alice");
    }

    #[test]
    fn tenant_namespaces() {
        let tenant = TenantIdentity::for_owner("alice");
        assert_eq!(tenant.namespace, "user-system-alice");
        assert_eq!(tenant.user_space(), "user-space-alice");
        assert!(tenant.is_owned_by("alice"));
        assert!(!tenant.is_owned_by("bob"));
    }

    #[test]
    fn service_account_parsing() {
        assert_eq!(
            parse_service_account("system:serviceaccount:user-space-bob:default"),
            Some(("user-space-bob", "default"))
        );
        assert_eq!(parse_service_account("system:serviceaccount:ns"), None);
        assert_eq!(parse_service_account("bob"), None);
    }

    #[test]
    fn effective_user_maps_user_namespace_accounts() {
        assert_eq!(effective_user("system:serviceaccount:user-space-bob:default"), "bob");
        assert_eq!(
            effective_user("system:serviceaccount:os-framework:default"),
            "system:serviceaccount:os-framework:default"
        );
        assert_eq!(effective_user("carol"), "carol");
        assert_eq!(user_of_namespace("kube-system"), None);
    }

    #[test]
    fn role_names_replace_slashes() {
        assert_eq!(role_name_for_ref("user-system-alice/cal"), "user-system-alice:cal");
    }
}
