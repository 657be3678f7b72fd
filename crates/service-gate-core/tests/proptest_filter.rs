// crates/service-gate-core/tests/proptest_filter.rs
// ============================================================================
// Module: Filter Property-Based Tests
// Description: Property tests for callback filter matching.
// Purpose: Check vacuous pass and rejection rules over random payloads.
// ============================================================================

//! Property-based tests for filter matching invariants.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::Map;
use serde_json::Value;
use service_gate_core::matches_filters;

fn payload_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-d]", "[a-z]{0,3}", 0 .. 4).prop_map(|fields| {
        fields.into_iter().map(|(key, value)| (key, Value::String(value))).collect()
    })
}

proptest! {
    #[test]
    fn empty_filters_always_match(payload in payload_strategy()) {
        prop_assert!(matches_filters(&Value::Object(payload), &BTreeMap::new()));
    }

    #[test]
    fn absent_fields_always_pass(
        payload in payload_strategy(),
        allowed in prop::collection::vec("[a-z]{1,3}", 0 .. 3),
    ) {
        let filters = BTreeMap::from([("zz".to_string(), allowed)]);
        prop_assert!(matches_filters(&Value::Object(payload), &filters));
    }

    #[test]
    fn present_field_matches_iff_listed(
        value in "[a-z]{0,3}",
        allowed in prop::collection::vec("[a-z]{0,3}", 0 .. 3),
    ) {
        let payload = serde_json::json!({ "type": value.clone() });
        let filters = BTreeMap::from([("type".to_string(), allowed.clone())]);
        prop_assert_eq!(matches_filters(&payload, &filters), allowed.contains(&value));
    }
}
