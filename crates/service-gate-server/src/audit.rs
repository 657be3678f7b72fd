// crates/service-gate-server/src/audit.rs
// ============================================================================
// Module: Access Audit
// Description: Structured audit events for security-relevant decisions.
// Purpose: Record token issuance, signature checks, and gateway decisions.
// Dependencies: serde, serde_json, tracing
// ============================================================================

//! ## Overview
//! Every allow or deny taken on an access path is reported to an
//! [`AccessAuditSink`]. The tracing sink emits one JSON payload per event
//! under the `audit` target; the no-op sink is for tests.

use serde::Serialize;
use tracing::info;

/// Access decision record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// `allow` or `deny`.
    pub decision: &'static str,
    /// Caller label (app key or user name), when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Target of the decision (triple, path, or binding key).
    pub target: String,
    /// Failure reason on deny.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessAuditEvent {
    /// Builds an allow event.
    #[must_use]
    pub fn allowed(event: &'static str, subject: Option<&str>, target: impl Into<String>) -> Self {
        Self {
            event,
            decision: "allow",
            subject: subject.map(str::to_string),
            target: target.into(),
            reason: None,
        }
    }

    /// Builds a deny event.
    #[must_use]
    pub fn denied(
        event: &'static str,
        subject: Option<&str>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event,
            decision: "deny",
            subject: subject.map(str::to_string),
            target: target.into(),
            reason: Some(reason.into()),
        }
    }
}

/// Receiver of access decisions.
pub trait AccessAuditSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: &AccessAuditEvent);
}

/// Sink that logs JSON payloads through `tracing`.
pub struct TracingAuditSink;

impl AccessAuditSink for TracingAuditSink {
    fn record(&self, event: &AccessAuditEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            info!(target: "audit", decision = event.decision, "{payload}");
        }
    }
}

/// Sink that drops every event.
pub struct NoopAuditSink;

impl AccessAuditSink for NoopAuditSink {
    fn record(&self, _event: &AccessAuditEvent) {}
}
