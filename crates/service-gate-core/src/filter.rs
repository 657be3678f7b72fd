// crates/service-gate-core/src/filter.rs
// ============================================================================
// Module: Callback Filter Matching
// Description: Field filters evaluated against event payloads.
// Purpose: Gate watcher callbacks on shallow payload field values.
// Dependencies: serde_json
// ============================================================================

//! ## Overview
//! A watcher callback carries a `field -> allowed values` map. The payload is
//! read as a shallow JSON object. Fields the payload lacks are treated as
//! satisfied, so a caller can pass a filter by omitting the field. A `null`
//! payload has no fields and passes every filter. Numbers
//! are compared in their `{:.6}` rendering (`1` becomes `1.000000`) and
//! values that are neither strings nor numbers compare as the empty string.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Filter evaluation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    /// Payload is not a JSON object.
    #[error("filter payload is not an object")]
    NotAnObject,
}

// ============================================================================
// SECTION: Matching
// ============================================================================

/// Evaluates `filters` against `payload`.
///
/// # Errors
///
/// Returns [`FilterError::NotAnObject`] when filters are present and the
/// payload is neither an object nor `null`.
pub fn evaluate_filters(
    payload: &Value,
    filters: &BTreeMap<String, Vec<String>>,
) -> Result<bool, FilterError> {
    if filters.is_empty() {
        return Ok(true);
    }
    let fields = match payload {
        Value::Object(fields) => fields,
        Value::Null => return Ok(true),
        _ => return Err(FilterError::NotAnObject),
    };
    for (field, allowed) in filters {
        let Some(value) = fields.get(field) else {
            continue;
        };
        let rendered = render_value(value);
        if !allowed.iter().any(|candidate| candidate == &rendered) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Boolean form of [`evaluate_filters`]; evaluation errors reject.
#[must_use]
pub fn matches_filters(payload: &Value, filters: &BTreeMap<String, Vec<String>>) -> bool {
    evaluate_filters(payload, filters).unwrap_or(false)
}

/// Comparison form of a payload value.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => {
            number.as_f64().map_or_else(String::new, |float| format!("{float:.6}"))
        }
        _ => String::new(),
    }
}
