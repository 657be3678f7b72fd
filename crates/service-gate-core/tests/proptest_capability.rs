// crates/service-gate-core/tests/proptest_capability.rs
// ============================================================================
// Module: Capability Property-Based Tests
// Description: Property tests for the permission include relation.
// Purpose: Check literal and base-name inclusion across random op sets.
// ============================================================================

//! Property-based tests for capability matching invariants.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use proptest::prelude::*;
use service_gate_core::PermissionRequirement;
use service_gate_core::decode_op;

fn requirement(ops: Vec<String>) -> PermissionRequirement {
    PermissionRequirement {
        group: "cal".to_string(),
        data_type: "event".to_string(),
        version: "v1".to_string(),
        ops,
        owner_app_key: String::new(),
    }
}

fn op_strategy() -> impl Strategy<Value = String> {
    ("[A-D]", proptest::option::of("[a-c]=[0-2]")).prop_map(|(name, param)| match param {
        Some(param) => format!("{name}?{param}"),
        None => name,
    })
}

proptest! {
    #[test]
    fn full_match_implies_literal_membership(
        granted in prop::collection::vec(op_strategy(), 0 .. 6),
        requested in prop::collection::vec(op_strategy(), 0 .. 4),
    ) {
        let grant = requirement(granted);
        let request = requirement(requested);
        if grant.includes(&request, true) {
            for op in &request.ops {
                prop_assert!(grant.ops.contains(op));
            }
        }
    }

    #[test]
    fn full_match_implies_partial_match(
        granted in prop::collection::vec(op_strategy(), 0 .. 6),
        requested in prop::collection::vec(op_strategy(), 0 .. 4),
    ) {
        let grant = requirement(granted);
        let request = requirement(requested);
        if grant.includes(&request, true) {
            prop_assert!(grant.includes(&request, false));
        }
    }

    #[test]
    fn partial_match_accepts_granted_base_names(
        granted in prop::collection::vec(op_strategy(), 1 .. 6),
        param in "[a-c]=[0-2]",
    ) {
        let grant = requirement(granted);
        let base = decode_op(&grant.ops[0]).name;
        if grant.ops.contains(&base) {
            let request = requirement(vec![format!("{base}?{param}")]);
            prop_assert!(grant.includes(&request, false));
        }
    }

    #[test]
    fn compare_to_is_symmetric(
        left in prop::collection::vec(op_strategy(), 0 .. 5),
        right in prop::collection::vec(op_strategy(), 0 .. 5),
    ) {
        let left = requirement(left);
        let right = requirement(right);
        prop_assert_eq!(left.compare_to(&right), right.compare_to(&left));
    }

    #[test]
    fn decode_op_base_name_never_contains_question_mark(op in ".{0,24}") {
        prop_assert!(!decode_op(&op).name.contains('?'));
    }
}
