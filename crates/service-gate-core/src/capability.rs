// crates/service-gate-core/src/capability.rs
// ============================================================================
// Module: Capability Model
// Description: Permission requirements and their matching algebra.
// Purpose: Scope application grants to (group, dataType, version, ops).
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A [`PermissionRequirement`] names a data triple and a set of operation
//! strings. Operation strings may carry query-style parameters
//! (`List?kind=todo&limit=5`), decoded by [`decode_op`].
//!
//! Two comparisons exist and they are not interchangeable:
//! - [`PermissionRequirement::compare_to`] is set equality, used when diffing
//!   registrations.
//! - [`PermissionRequirement::includes`] is a one-way grant check. With
//!   `full_match` off, a parameterized requested op is also satisfied by a
//!   grant of its bare base name.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Operation Names
// ============================================================================

/// Create operation.
pub const OP_CREATE: &str = "Create";
/// Update operation.
pub const OP_UPDATE: &str = "Update";
/// Delete operation.
pub const OP_DELETE: &str = "Delete";
/// Get-by-id operation.
pub const OP_GET: &str = "Get";
/// List operation.
pub const OP_LIST: &str = "List";

/// Operations that fan out to watchers after a successful provider call.
pub const WATCHER_SUPPORTED_OPS: [&str; 3] = [OP_CREATE, OP_UPDATE, OP_DELETE];

/// Returns true when `op` triggers watcher dispatch.
#[must_use]
pub fn is_watcher_supported(op: &str) -> bool {
    WATCHER_SUPPORTED_OPS.contains(&op)
}

// ============================================================================
// SECTION: Data Types
// ============================================================================

/// Data type used by arbitrary-path legacy providers.
pub const DATA_TYPE_LEGACY_API: &str = "legacy_api";
/// Data type used by the built-in event module.
pub const DATA_TYPE_EVENT: &str = "event";

/// Data types the structured router knows about. Others are forwarded with a warning.
pub const ROUTED_DATA_TYPES: [&str; 6] = ["event", "calendar", "contact", "key", "token", "message"];

/// Every data type a provider may register under.
pub const KNOWN_DATA_TYPES: [&str; 8] =
    ["event", "calendar", "key", "contact", DATA_TYPE_LEGACY_API, "token", "message", "intent"];

// ============================================================================
// SECTION: Operation Decoding
// ============================================================================

/// Operation string split into its base name and query-style parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedOp {
    /// Text before the first `?`.
    pub name: String,
    /// Parameters from the segment after the first `?`.
    pub params: BTreeMap<String, String>,
}

/// Decodes `Name?k=v&flag` into its base name and parameters.
///
/// Empty `&` segments are skipped. A parameter without `=` maps to an empty
/// value. Only the segment between the first and second `?` is read.
#[must_use]
pub fn decode_op(op: &str) -> DecodedOp {
    let mut pieces = op.split('?');
    let name = pieces.next().unwrap_or_default().to_string();
    let mut params = BTreeMap::new();
    if let Some(query) = pieces.next() {
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let mut kv = pair.split('=');
            let key = kv.next().unwrap_or_default();
            let value = kv.next().unwrap_or_default();
            params.insert(key.to_string(), value.to_string());
        }
    }
    DecodedOp {
        name,
        params,
    }
}

// ============================================================================
// SECTION: Permission Requirement
// ============================================================================

/// Capability grant or request over one data triple.
///
/// # Invariants
/// - Op order is not significant for equality checks.
/// - `owner_app_key` is stamped by the token service; clients never set it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionRequirement {
    /// Provider group.
    pub group: String,
    /// Data type served by the provider.
    #[serde(rename = "dataType")]
    pub data_type: String,
    /// Provider API version.
    pub version: String,
    /// Operation strings, possibly parameterized.
    #[serde(default)]
    pub ops: Vec<String>,
    /// App key of the credential that owns a cached token.
    #[serde(rename = "AppKey", default, skip_serializing_if = "String::is_empty")]
    pub owner_app_key: String,
}

impl PermissionRequirement {
    /// Builds a requirement for a single operation on a triple.
    #[must_use]
    pub fn single_op(op: &str, data_type: &str, version: &str, group: &str) -> Self {
        Self {
            group: group.to_string(),
            data_type: data_type.to_string(),
            version: version.to_string(),
            ops: vec![op.to_string()],
            owner_app_key: String::new(),
        }
    }

    /// Returns true when both requirements address the same triple.
    #[must_use]
    pub fn same_triple(&self, other: &Self) -> bool {
        self.group == other.group
            && self.data_type == other.data_type
            && self.version == other.version
    }

    /// Exact equality of triple and deduplicated op set.
    #[must_use]
    pub fn compare_to(&self, other: &Self) -> bool {
        self.same_triple(other) && op_set(&self.ops) == op_set(&other.ops)
    }

    /// Returns true when every op in `other` is granted by `self`.
    ///
    /// With `full_match` false, an op missing literally is accepted when its
    /// decoded base name is granted.
    #[must_use]
    pub fn includes(&self, other: &Self, full_match: bool) -> bool {
        if !self.same_triple(other) {
            return false;
        }
        other.ops.iter().all(|op| {
            if self.ops.contains(op) {
                return true;
            }
            !full_match && self.ops.contains(&decode_op(op).name)
        })
    }
}

/// Sorted, deduplicated view of an op list.
fn op_set(ops: &[String]) -> BTreeSet<&str> {
    ops.iter().map(String::as_str).collect()
}

/// Returns true when any grant in `granted` includes `requested`.
#[must_use]
pub fn any_includes(
    granted: &[PermissionRequirement],
    requested: &PermissionRequirement,
    full_match: bool,
) -> bool {
    granted.iter().any(|grant| grant.includes(requested, full_match))
}

#[cfg(test)]
mod tests;
