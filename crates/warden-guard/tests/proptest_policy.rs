//! Property tests for permission evaluation and audit integrity.
//!
//! Verifies:
//! - Unregistered agents are always denied
//! - Paths under an allowed tree are granted unless blocked
//! - Blocked patterns always win over allow patterns
//! - Literal patterns match exactly themselves
//! - Any mutation of a stored event invalidates its signature

use std::sync::Arc;

use proptest::prelude::*;
use warden_guard::audit::verify_events;
use warden_guard::{
    glob_match, Action, Actor, AgentPermissionSet, AuditLogger, EventDraft, EventSigner,
    FilesystemPermissions, PatternKind, PermissionEngine, ReasonCode, RequestContext, Resource,
};

// ============================================
// Arbitrary generators
// ============================================

fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,8}(\\.[a-z]{1,3})?"
}

fn arb_relative_path() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_segment(), 1..5)
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Read),
        Just(Action::Write),
        Just(Action::Execute),
        Just(Action::Delete),
    ]
}

fn engine() -> PermissionEngine {
    PermissionEngine::new(Arc::new(AuditLogger::in_memory("proptest").unwrap()))
}

fn tree_set(root: &str, blocked: Vec<String>) -> AgentPermissionSet {
    let pattern = format!("{root}/**");
    AgentPermissionSet {
        filesystem: FilesystemPermissions {
            read: vec![pattern.clone()],
            write: vec![pattern.clone()],
            execute: vec![pattern.clone()],
            delete: vec![pattern],
            blocked,
            ..Default::default()
        },
        ..Default::default()
    }
}

// ============================================
// Evaluation properties
// ============================================

proptest! {
    #[test]
    fn unregistered_agent_always_denied(
        agent in "[a-z][a-z0-9-]{0,12}",
        path in arb_relative_path(),
        action in arb_action(),
    ) {
        let e = engine();
        let d = e
            .evaluate(&agent, &Resource::File(path.join("/")), action, &RequestContext::new())
            .unwrap();
        prop_assert!(!d.allowed);
        prop_assert_eq!(d.reason, ReasonCode::NoPermissions);
    }

    #[test]
    fn paths_under_allowed_tree_granted(
        root in arb_segment(),
        rest in arb_relative_path(),
        action in arb_action(),
        dot_prefix in any::<bool>(),
    ) {
        let e = engine();
        e.set_agent_permissions("a", tree_set(&root, vec![])).unwrap();

        let prefix = if dot_prefix { "./" } else { "" };
        let path = format!("{prefix}{root}/{}", rest.join("/"));
        let d = e
            .evaluate("a", &Resource::File(path.clone()), action, &RequestContext::new())
            .unwrap();
        prop_assert!(d.allowed, "{} denied with {}", path, d.reason);
    }

    #[test]
    fn blocked_always_wins(
        root in arb_segment(),
        rest in arb_relative_path(),
        action in arb_action(),
    ) {
        let e = engine();
        let path = format!("{root}/{}", rest.join("/"));
        e.set_agent_permissions("a", tree_set(&root, vec![path.clone()])).unwrap();

        let d = e
            .evaluate("a", &Resource::File(path), action, &RequestContext::new())
            .unwrap();
        prop_assert!(!d.allowed);
        prop_assert_eq!(d.reason, ReasonCode::PathNotAllowed);
    }

    #[test]
    fn literal_pattern_matches_itself(s in "[a-zA-Z0-9 .+()\\[\\]{}|^$=-]{1,24}") {
        let s = s.trim();
        prop_assume!(!s.is_empty());
        prop_assert!(glob_match(s, s, PatternKind::Command));
        let mut other = s.to_string();
        other.push('x');
        prop_assert!(!glob_match(s, &other, PatternKind::Command));
    }

    #[test]
    fn hosts_match_case_insensitively(labels in prop::collection::vec("[a-z]{1,8}", 2..4)) {
        let host = labels.join(".");
        prop_assert!(glob_match(&host, &host.to_ascii_uppercase(), PatternKind::Host));
        prop_assert!(!glob_match(&host, &host.to_ascii_uppercase(), PatternKind::Path));
    }
}

// ============================================
// Audit integrity properties
// ============================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_mutation_invalidates_signature(
        target in "[a-z/._]{1,20}",
        detail in "[a-zA-Z0-9 ]{0,20}",
        field in 0usize..4,
    ) {
        let log = AuditLogger::in_memory("integrity").unwrap();
        log.log_event(
            EventDraft::new(Actor::agent("a1"), "file.read", target)
                .detail("note", detail),
        )
        .unwrap();

        let signer = EventSigner::new("integrity").unwrap();
        let mut events = log.events().unwrap();
        prop_assert!(verify_events(&events, &signer).is_ok());

        let event = &mut events[0];
        match field {
            0 => event.action.target.push('!'),
            1 => event.actor.id.push('!'),
            2 => { event.action.details.insert("extra".into(), true.into()); }
            _ => event.security.risk = warden_guard::RiskLevel::Critical,
        }
        prop_assert!(verify_events(&events, &signer).is_err());
    }
}
