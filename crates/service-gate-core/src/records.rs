// crates/service-gate-core/src/records.rs
// ============================================================================
// Module: Directory Records
// Description: Provider, watcher, and application credential records.
// Purpose: Shared wire shapes for the directory store and its consumers.
// Dependencies: serde, rand, md5
// ============================================================================

//! ## Overview
//! Records stored in the directory service. A [`ProviderRecord`] is either a
//! provider (exposes `op_apis`) or a watcher (exposes `callbacks`), keyed by
//! `(kind, group, data_type, version)` within a tenant namespace.
//! [`ApplicationCredential`] holds an application's key pair and grants.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::capability::PermissionRequirement;

// ============================================================================
// SECTION: Enumerations
// ============================================================================

/// Role of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Serves operations.
    #[default]
    Provider,
    /// Receives mutation callbacks.
    Watcher,
}

impl ProviderKind {
    /// Lowercase label used in record names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Watcher => "watcher",
        }
    }
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Visible to lookups.
    #[default]
    Active,
    /// Hidden from lookups.
    Suspended,
}

// ============================================================================
// SECTION: Provider Records
// ============================================================================

/// Operation exposed by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpApi {
    /// Operation base name, or an HTTP method for legacy providers.
    pub name: String,
    /// Path on the provider endpoint.
    pub uri: String,
}

/// Watcher callback for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Callback {
    /// Operation the callback fires on.
    pub op: String,
    /// Path on the watcher endpoint.
    pub uri: String,
    /// Field to allowed-values filter.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Vec<String>>,
}

/// Second-factor requirement attached to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct With2Fa {
    /// Path protected by the second factor.
    pub uri: String,
}

/// Extra access settings a provider may declare.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderPermission {
    /// Application names allowed without an explicit grant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acl: Vec<String>,
    /// Optional second-factor requirement.
    #[serde(rename = "with2FA", default, skip_serializing_if = "Option::is_none")]
    pub with_2fa: Option<With2Fa>,
}

/// Provider or watcher directory record.
///
/// # Invariants
/// - Providers carry `op_apis`; watchers carry `callbacks`.
/// - `(kind, group, data_type, version)` is unique within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Record name within the namespace.
    pub name: String,
    /// Owning namespace.
    #[serde(default)]
    pub namespace: String,
    /// Provider or watcher.
    pub kind: ProviderKind,
    /// Provider group.
    pub group: String,
    /// Data type served.
    #[serde(rename = "dataType")]
    pub data_type: String,
    /// API version.
    pub version: String,
    /// Backend address, with or without a scheme.
    pub endpoint: String,
    /// Deployment that serves the endpoint.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Lifecycle state.
    #[serde(default)]
    pub state: RecordState,
    /// Operations exposed by a provider.
    #[serde(rename = "opApis", default, skip_serializing_if = "Vec::is_empty")]
    pub op_apis: Vec<OpApi>,
    /// Callbacks declared by a watcher.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<Callback>,
    /// Optional access settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<ProviderPermission>,
}

impl ProviderRecord {
    /// Returns true when the record addresses `(data_type, group, version)`.
    #[must_use]
    pub fn serves(&self, data_type: &str, group: &str, version: &str) -> bool {
        self.data_type == data_type && self.group == group && self.version == version
    }

    /// Returns true when the record is visible to lookups.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == RecordState::Active
    }

    /// Endpoint with `http://` prepended when unschemed and trailing slashes removed.
    #[must_use]
    pub fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        }
    }

    /// Absolute URL for a path on the record's endpoint.
    #[must_use]
    pub fn url_for(&self, uri: &str) -> String {
        if uri.starts_with('/') {
            format!("{}{uri}", self.base_url())
        } else {
            format!("{}/{uri}", self.base_url())
        }
    }
}

// ============================================================================
// SECTION: Application Credentials
// ============================================================================

/// Upper bound (exclusive) of the random suffix in generated app keys.
const APP_KEY_SUFFIX_RANGE: u32 = 1_000_000;

/// Hex characters kept from the secret digest.
const APP_SECRET_LEN: usize = 16;

/// Registered application with its key pair and grants.
///
/// # Invariants
/// - `key` and `secret` never change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationCredential {
    /// Application name, unique per namespace.
    pub app: String,
    /// Application id.
    #[serde(default)]
    pub appid: String,
    /// Public application key.
    pub key: String,
    /// Private application secret.
    pub secret: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Granted capabilities.
    #[serde(default)]
    pub permissions: Vec<PermissionRequirement>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: RecordState,
}

impl ApplicationCredential {
    /// Creates a credential with a freshly generated key pair.
    #[must_use]
    pub fn generate(
        app: &str,
        appid: &str,
        permissions: Vec<PermissionRequirement>,
        unix_seconds: i64,
    ) -> Self {
        let suffix = rand::thread_rng().gen_range(0..APP_KEY_SUFFIX_RANGE);
        let key = format!("bytetrade_{app}_{suffix}");
        let secret = derive_secret(&key, unix_seconds);
        Self {
            app: app.to_string(),
            appid: appid.to_string(),
            key,
            secret,
            description: String::new(),
            permissions,
            state: RecordState::Active,
        }
    }

    /// Returns true when any grant includes `requested`.
    #[must_use]
    pub fn grants(&self, requested: &PermissionRequirement, full_match: bool) -> bool {
        crate::capability::any_includes(&self.permissions, requested, full_match)
    }
}

/// Secret derived from the key and creation time.
fn derive_secret(key: &str, unix_seconds: i64) -> String {
    let digest = format!("{:x}", md5::compute(format!("{key}|{unix_seconds}")));
    digest.chars().take(APP_SECRET_LEN).collect()
}
