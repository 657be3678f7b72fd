// crates/service-gate-core/src/capability/tests.rs
// ============================================================================
// Module: Capability Model Tests
// Description: Unit tests for op decoding and permission matching.
// Purpose: Pin the asymmetric include relation and registration equality.
// Dependencies: service-gate-core
// ============================================================================

//! ## Overview
//! Covers op-string decoding edge cases and the two permission comparisons.

// ============================================================================
// SECTION: Lint Configuration
// ============================================================================

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use super::PermissionRequirement;
use super::any_includes;
use super::decode_op;
use super::is_watcher_supported;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

fn perm(ops: &[&str]) -> PermissionRequirement {
    PermissionRequirement {
        group: "cal".to_string(),
        data_type: "event".to_string(),
        version: "v1".to_string(),
        ops: ops.iter().map(ToString::to_string).collect(),
        owner_app_key: String::new(),
    }
}

// ============================================================================
// SECTION: Decoding
// ============================================================================

#[test]
fn decode_op_without_params() {
    let decoded = decode_op("List");
    assert_eq!(decoded.name, "List");
    assert!(decoded.params.is_empty());
}

#[test]
fn decode_op_with_params_and_flags() {
    let decoded = decode_op("Query?kind=todo&&verbose&a=b=c");
    assert_eq!(decoded.name, "Query");
    assert_eq!(decoded.params.get("kind").map(String::as_str), Some("todo"));
    assert_eq!(decoded.params.get("verbose").map(String::as_str), Some(""));
    assert_eq!(decoded.params.get("a").map(String::as_str), Some("b"));
    assert_eq!(decoded.params.len(), 3);
}

#[test]
fn decode_op_reads_only_first_query_segment() {
    let decoded = decode_op("Sync?x=1?y=2");
    assert_eq!(decoded.name, "Sync");
    assert_eq!(decoded.params.get("x").map(String::as_str), Some("1"));
    assert!(!decoded.params.contains_key("y"));
}

// ============================================================================
// SECTION: Matching
// ============================================================================

#[test]
fn compare_to_ignores_order_and_duplicates() {
    assert!(perm(&["List", "Get", "List"]).compare_to(&perm(&["Get", "List"])));
    assert!(!perm(&["List"]).compare_to(&perm(&["List", "Get"])));
}

#[test]
fn compare_to_requires_same_triple() {
    let mut other = perm(&["List"]);
    other.version = "v2".to_string();
    assert!(!perm(&["List"]).compare_to(&other));
}

#[test]
fn includes_full_match_requires_literal_ops() {
    let grant = perm(&["List", "Get"]);
    assert!(grant.includes(&perm(&["List"]), true));
    assert!(!grant.includes(&perm(&["List?kind=todo"]), true));
    assert!(!grant.includes(&perm(&["Delete"]), true));
}

#[test]
fn includes_partial_match_accepts_base_name() {
    let grant = perm(&["List"]);
    assert!(grant.includes(&perm(&["List?kind=todo"]), false));
    assert!(!grant.includes(&perm(&["Delete?id=1"]), false));
}

#[test]
fn includes_is_one_way() {
    let narrow = perm(&["List?kind=todo"]);
    assert!(!narrow.includes(&perm(&["List"]), false));
}

#[test]
fn includes_rejects_other_group() {
    let mut request = perm(&["List"]);
    request.group = "mail".to_string();
    assert!(!perm(&["List"]).includes(&request, false));
}

#[test]
fn any_includes_scans_all_grants() {
    let mut mail = perm(&["Create"]);
    mail.group = "mail".to_string();
    let grants = vec![mail, perm(&["Get"])];
    assert!(any_includes(&grants, &perm(&["Get"]), true));
    assert!(!any_includes(&grants, &perm(&["Create"]), true));
}

#[test]
fn permission_json_uses_wire_names() {
    let mut grant = perm(&["List"]);
    grant.owner_app_key = "bytetrade_cal_7".to_string();
    let value = serde_json::to_value(&grant).expect("serialize");
    assert_eq!(value["dataType"], "event");
    assert_eq!(value["AppKey"], "bytetrade_cal_7");
    let parsed: PermissionRequirement =
        serde_json::from_str(r#"{"group":"cal","dataType":"event","version":"v1","ops":["Get"]}"#)
            .expect("parse");
    assert!(parsed.owner_app_key.is_empty());
}

#[test]
fn watcher_supported_ops_are_mutations() {
    assert!(is_watcher_supported("Create"));
    assert!(is_watcher_supported("Delete"));
    assert!(!is_watcher_supported("List"));
}
