// crates/service-gate-core/src/rbac/tests.rs
// ============================================================================
// Module: RBAC Resolver Tests
// Description: Unit tests for subject matching, rules, and provider binding.
// Purpose: Confirm allow decisions surface the bound service.
// Dependencies: service-gate-core, tokio
// ============================================================================

//! ## Overview
//! Builds small role/binding sets in memory and resolves requests against
//! them.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test-only assertions use unwrap/expect for clarity."
)]

use std::collections::BTreeMap;
use std::sync::Arc;

use super::AuthorizationOutcome;
use super::ClusterRole;
use super::Decision;
use super::InMemoryRbacStore;
use super::PROVIDER_REF_ANNOTATION;
use super::PROVIDER_SERVICE_ANNOTATION;
use super::PolicyRule;
use super::RbacResolver;
use super::RequestAttributes;
use super::RoleBinding;
use super::RoleRef;
use super::Subject;
use super::SubjectKind;
use crate::identity::UserInfo;

const CAL_REF: &str = "user-system-alice/calendarApp";

fn calendar_role() -> ClusterRole {
    ClusterRole {
        name: "user-system-alice:calendarApp".to_string(),
        annotations: BTreeMap::from([
            (PROVIDER_REF_ANNOTATION.to_string(), CAL_REF.to_string()),
            (PROVIDER_SERVICE_ANNOTATION.to_string(), "calendar-svc:8080".to_string()),
        ]),
        rules: vec![PolicyRule {
            verbs: vec!["get".to_string()],
            non_resource_urls: vec!["/events/*".to_string()],
        }],
    }
}

fn binding(name: &str, subject: Subject) -> RoleBinding {
    RoleBinding {
        name: name.to_string(),
        namespace: String::new(),
        role_ref: RoleRef {
            kind: "ClusterRole".to_string(),
            name: "user-system-alice:calendarApp".to_string(),
        },
        subjects: vec![subject],
    }
}

fn user_subject(name: &str) -> Subject {
    Subject {
        kind: SubjectKind::User,
        name: name.to_string(),
        namespace: String::new(),
    }
}

fn attrs(user: &str, verb: &str, path: &str) -> RequestAttributes {
    RequestAttributes {
        user: UserInfo::named(user, Vec::new()),
        verb: verb.to_string(),
        path: path.to_string(),
        binding_key: CAL_REF.to_string(),
    }
}

async fn resolve(bindings: Vec<RoleBinding>, request: &RequestAttributes) -> AuthorizationOutcome {
    let store = InMemoryRbacStore::seeded(vec![calendar_role()], bindings);
    RbacResolver::new(Arc::new(store)).authorize(request).await.expect("authorize")
}

#[tokio::test]
async fn bound_user_is_allowed_with_service() {
    let outcome =
        resolve(vec![binding("alice-cal", user_subject("alice"))], &attrs("alice", "get", "/events/123"))
            .await;
    assert_eq!(outcome.decision, Decision::Allow);
    assert_eq!(outcome.service.as_deref(), Some("calendar-svc:8080"));
    assert!(outcome.reason.starts_with("RBAC: allowed by"));
}

#[tokio::test]
async fn unbound_user_has_no_opinion() {
    let outcome =
        resolve(vec![binding("alice-cal", user_subject("alice"))], &attrs("bob", "get", "/events/123"))
            .await;
    assert_eq!(outcome.decision, Decision::NoOpinion);
    assert_eq!(outcome.service, None);
}

#[tokio::test]
async fn verb_and_path_must_match_a_rule() {
    let bindings = vec![binding("alice-cal", user_subject("alice"))];
    let outcome = resolve(bindings.clone(), &attrs("alice", "delete", "/events/123")).await;
    assert_eq!(outcome.decision, Decision::NoOpinion);
    let outcome = resolve(bindings, &attrs("alice", "get", "/calendars")).await;
    assert_eq!(outcome.decision, Decision::NoOpinion);
}

#[tokio::test]
async fn mismatched_binding_key_is_skipped() {
    let mut request = attrs("alice", "get", "/events/1");
    request.binding_key = "user-system-alice/mail".to_string();
    let outcome = resolve(vec![binding("alice-cal", user_subject("alice"))], &request).await;
    assert_eq!(outcome.decision, Decision::NoOpinion);
    assert!(outcome.reason.contains("does not match binding provider"));
}

#[tokio::test]
async fn group_subjects_match_membership() {
    let subject = Subject {
        kind: SubjectKind::Group,
        name: "family".to_string(),
        namespace: String::new(),
    };
    let mut request = attrs("carol", "get", "/events/9");
    request.user.groups = vec!["family".to_string()];
    let outcome = resolve(vec![binding("family-cal", subject)], &request).await;
    assert_eq!(outcome.decision, Decision::Allow);
}

#[tokio::test]
async fn service_account_namespace_defaults_to_binding() {
    let subject = Subject {
        kind: SubjectKind::ServiceAccount,
        name: "default".to_string(),
        namespace: String::new(),
    };
    let user = "system:serviceaccount:todo-alice:default";
    let mut namespaced = binding("todo-sa", subject.clone());
    namespaced.namespace = "todo-alice".to_string();
    let outcome = resolve(vec![namespaced], &attrs(user, "get", "/events/1")).await;
    assert_eq!(outcome.decision, Decision::Allow);

    let outcome = resolve(vec![binding("todo-sa", subject)], &attrs(user, "get", "/events/1")).await;
    assert_eq!(outcome.decision, Decision::NoOpinion);
}

#[tokio::test]
async fn non_cluster_role_refs_are_ignored() {
    let mut bad = binding("alice-cal", user_subject("alice"));
    bad.role_ref.kind = "Role".to_string();
    let outcome = resolve(vec![bad], &attrs("alice", "get", "/events/1")).await;
    assert_eq!(outcome.decision, Decision::NoOpinion);
    assert!(outcome.reason.contains("unsupported role reference kind"));
}

#[test]
fn url_patterns_and_wildcard_verbs() {
    let rule = PolicyRule {
        verbs: vec!["*".to_string()],
        non_resource_urls: vec!["/api/v1".to_string(), "/files/*".to_string()],
    };
    assert!(rule.allows("patch", "/api/v1"));
    assert!(!rule.allows("get", "/api/v1/x"));
    assert!(rule.allows("get", "/files/a/b?x=1"));
    assert!(!rule.allows("get", "/file"));
}
