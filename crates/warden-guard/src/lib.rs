//! # Warden Guard
//!
//! The synchronous policy layer of the agent trust core: it decides whether an
//! agent may touch a resource and keeps a signed record of every decision.
//!
//! ## Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Pattern matcher | [`pattern`], [`command`] | anchored globs over paths, hosts, commands |
//! | Rate limiter | [`rate_limit`] | sliding window per (agent, resource class) |
//! | Permission engine | [`engine`] | blocked → allowed → rate → request checks |
//! | Audit logger | [`audit`] | HMAC-signed, hash-chained, optionally encrypted events |
//! | Compliance engine | [`compliance`] | declarative rules scored over the audit stream |
//!
//! Evaluation holds only in-memory locks and performs no I/O apart from the
//! audit append, which is mandatory: when it fails the evaluation fails.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use warden_guard::{
//!     Action, AgentPermissionSet, AuditLogger, PermissionEngine, ReasonCode, RequestContext,
//!     Resource,
//! };
//!
//! let audit = Arc::new(AuditLogger::in_memory("audit-secret").unwrap());
//! let engine = PermissionEngine::new(audit);
//!
//! let mut perms = AgentPermissionSet::default();
//! perms.filesystem.read = vec!["./src/**".into()];
//! perms.filesystem.blocked = vec!["**/.git/**".into()];
//! engine.set_agent_permissions("a1", perms).unwrap();
//!
//! let ctx = RequestContext::new();
//! let ok = engine
//!     .evaluate("a1", &Resource::File("./src/index.ts".into()), Action::Read, &ctx)
//!     .unwrap();
//! assert!(ok.allowed);
//!
//! let denied = engine
//!     .evaluate("a1", &Resource::File("./src/.git/config".into()), Action::Read, &ctx)
//!     .unwrap();
//! assert_eq!(denied.reason, ReasonCode::PathNotAllowed);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod audit;
pub mod audit_backend;
pub mod audit_crypto;
pub mod command;
pub mod compliance;
pub mod decision;
pub mod engine;
mod error;
pub mod pattern;
pub mod permissions;
pub mod rate_limit;
pub mod risk;

pub use audit::{
    Actor, ActorType, AlertSink, AuditConfig, AuditEvent, AuditFilter, AuditLogger,
    AuditSubscriber, EventAction, EventContext, EventDraft, EventResult, Outcome, SecurityInfo,
    TracingAlertSink,
};
pub use audit_backend::{AuditBackend, FileAuditBackend, MemoryAuditBackend};
pub use audit_crypto::{DetailCipher, EventSigner};
pub use command::{CommandMatch, CommandMatcher};
pub use compliance::{
    ComplianceEngine, ComplianceReport, ComplianceRule, ComplianceStandard, ComplianceViolation,
    RuleCheck, TimeRange,
};
pub use decision::{Action, Condition, PermissionDecision, ReasonCode, RequestContext, Resource};
pub use engine::PermissionEngine;
pub use error::{AuditError, GuardError, Result};
pub use pattern::{glob_match, Pattern, PatternKind, PatternSet};
pub use permissions::{
    AgentPermissionSet, Classification, DataPermissions, FilesystemPermissions, LlmPermissions,
    NetworkPermissions, ShellPermissions,
};
pub use rate_limit::{RateClass, RateLimit, RateLimiter};
pub use risk::{ComplianceTag, RiskLevel};
