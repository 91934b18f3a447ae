//! The permission engine.
//!
//! Evaluation order for every resource type:
//!
//! 1. blocked patterns: any match denies with the category's reason
//! 2. allow patterns (plus port and protocol for network): a match is required
//! 3. rate limit for the (agent, class) pair
//! 4. request-specific checks: extension and size for writes, tokens for models
//!
//! The rate slot is reserved only after step 4 passes, so denied requests never
//! consume quota. Each evaluation appends exactly one `permission.check` event
//! before returning; if that append fails the evaluation fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::audit::{Actor, AuditLogger, EventContext, EventDraft, Outcome};
use crate::command::CommandMatch;
use crate::decision::{Action, Condition, PermissionDecision, ReasonCode, RequestContext, Resource};
use crate::error::{AuditError, GuardError, Result};
use crate::permissions::{AgentPermissionSet, CompiledPermissions};
use crate::rate_limit::{RateClass, RateLimit, RateLimiter};

/// Outcome of steps 1 and 2.
struct Grant {
    pattern: String,
    conditions: Vec<Condition>,
    /// Step 4 failure, reported only if the rate limit admits.
    late_deny: Option<ReasonCode>,
}

type Stage = std::result::Result<Grant, PermissionDecision>;

/// Evaluates requests against registered permission sets.
#[derive(Debug)]
pub struct PermissionEngine {
    permissions: RwLock<HashMap<String, Arc<CompiledPermissions>>>,
    limiter: RateLimiter,
    audit: Arc<AuditLogger>,
}

impl PermissionEngine {
    /// Engine with a system-clock rate limiter.
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self::with_rate_limiter(audit, RateLimiter::new())
    }

    /// Engine with a caller-supplied rate limiter.
    pub fn with_rate_limiter(audit: Arc<AuditLogger>, limiter: RateLimiter) -> Self {
        Self {
            permissions: RwLock::new(HashMap::new()),
            limiter,
            audit,
        }
    }

    /// The audit logger this engine writes to.
    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Register or replace an agent's permission set.
    ///
    /// Every pattern is compiled first; an invalid one rejects the whole set.
    /// Replacement also clears the agent's rate-limit windows.
    pub fn set_agent_permissions(&self, agent_id: &str, set: AgentPermissionSet) -> Result<()> {
        validate_agent(agent_id)?;
        let compiled = CompiledPermissions::compile(set)?;

        self.audit.log_event(
            EventDraft::new(Actor::system(), "permission.update", agent_id)
                .detail("agent_id", agent_id),
        )?;

        self.permissions
            .write()
            .insert(agent_id.to_string(), Arc::new(compiled));
        self.limiter.reset(agent_id);
        tracing::info!(agent_id, "permission set registered");
        Ok(())
    }

    /// Remove an agent's permission set. Returns whether one existed.
    pub fn remove_agent_permissions(&self, agent_id: &str) -> Result<bool> {
        validate_agent(agent_id)?;
        let existed = self.permissions.read().contains_key(agent_id);
        if existed {
            self.audit.log_event(
                EventDraft::new(Actor::system(), "permission.remove", agent_id)
                    .detail("agent_id", agent_id),
            )?;
            self.permissions.write().remove(agent_id);
            self.limiter.reset(agent_id);
            tracing::info!(agent_id, "permission set removed");
        }
        Ok(existed)
    }

    /// The registered permission set, if any.
    pub fn agent_permissions(&self, agent_id: &str) -> Option<AgentPermissionSet> {
        self.permissions
            .read()
            .get(agent_id)
            .map(|p| p.source.clone())
    }

    /// Decide whether `agent_id` may perform `action` on `resource`.
    ///
    /// Denials are returned as decisions. `Err` means malformed input or a
    /// failed audit write.
    pub fn evaluate(
        &self,
        agent_id: &str,
        resource: &Resource,
        action: Action,
        ctx: &RequestContext,
    ) -> Result<PermissionDecision> {
        validate_agent(agent_id)?;
        if resource.id().trim().is_empty() {
            return Err(GuardError::Validation(format!(
                "empty {} resource identifier",
                resource.kind()
            )));
        }
        resource.validate_action(action)?;

        let perms = self.permissions.read().get(agent_id).cloned();
        let (decision, reserved) = match &perms {
            None => (PermissionDecision::deny(ReasonCode::NoPermissions), None),
            Some(perms) => self.decide(agent_id, perms, resource, action, ctx),
        };

        if decision.allowed {
            tracing::debug!(
                agent_id,
                resource = %resource,
                action = %action,
                pattern = decision.matched_pattern.as_deref().unwrap_or(""),
                "permission granted"
            );
        } else {
            tracing::info!(
                agent_id,
                resource = %resource,
                action = %action,
                reason = %decision.reason,
                "permission denied"
            );
        }

        let pii = ctx.pii
            || perms
                .as_ref()
                .is_some_and(|p| p.source.data.pii_detection);
        if let Err(e) = self.record(agent_id, resource, action, ctx, pii, &decision) {
            // an unaudited grant must not spend quota
            if let Some(class) = reserved {
                self.limiter.release(agent_id, class);
            }
            return Err(e);
        }
        Ok(decision)
    }

    fn record(
        &self,
        agent_id: &str,
        resource: &Resource,
        action: Action,
        ctx: &RequestContext,
        pii: bool,
        decision: &PermissionDecision,
    ) -> Result<()> {
        let mut draft = EventDraft::new(Actor::agent(agent_id), "permission.check", resource.to_string())
            .context(EventContext {
                session_id: ctx.session_id.clone(),
                request_id: ctx.request_id.clone(),
                pii,
            })
            .detail("resource_type", resource.kind())
            .detail("action", action.as_str())
            .detail("allowed", decision.allowed)
            .detail("reason", decision.reason.as_str());
        if let Some(pattern) = &decision.matched_pattern {
            draft = draft.detail("matched_pattern", pattern.as_str());
        }
        if !decision.conditions.is_empty() {
            let conditions = serde_json::to_value(&decision.conditions).map_err(AuditError::from)?;
            draft = draft.detail("conditions", conditions);
        }
        if !ctx.attributes.is_empty() {
            let attributes = serde_json::to_value(&ctx.attributes).map_err(AuditError::from)?;
            draft = draft.detail("attributes", attributes);
        }
        draft = if decision.allowed {
            draft.outcome(Outcome::Success, "granted")
        } else {
            draft.outcome(Outcome::Failure, decision.reason.as_str())
        };

        self.audit.log_event(draft)?;
        Ok(())
    }

    fn decide(
        &self,
        agent_id: &str,
        perms: &CompiledPermissions,
        resource: &Resource,
        action: Action,
        ctx: &RequestContext,
    ) -> (PermissionDecision, Option<RateClass>) {
        let (stage, class) = match resource {
            Resource::File(path) => (check_file(perms, path, action, ctx), RateClass::File),
            Resource::Network(target) => (check_network(perms, target, ctx), RateClass::Network),
            Resource::Shell(command) => (check_shell(perms, command), RateClass::Shell),
            Resource::Llm(model) => (check_llm(perms, model, ctx), RateClass::Llm),
        };

        let grant = match stage {
            Ok(grant) => grant,
            Err(deny) => return (deny, None),
        };

        let limit = rate_limit_for(&perms.source, class);
        if let Some(limit) = limit {
            if !self.limiter.would_admit(agent_id, class, limit) {
                return (PermissionDecision::deny(ReasonCode::RateLimitExceeded), None);
            }
        }
        if let Some(reason) = grant.late_deny {
            return (PermissionDecision::deny_by(reason, grant.pattern), None);
        }
        let mut reserved = None;
        if let Some(limit) = limit {
            if !self.limiter.try_acquire(agent_id, class, limit) {
                return (PermissionDecision::deny(ReasonCode::RateLimitExceeded), None);
            }
            reserved = Some(class);
        }
        (PermissionDecision::allow(grant.pattern, grant.conditions), reserved)
    }
}

fn validate_agent(agent_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() {
        return Err(GuardError::Validation("empty agent id".into()));
    }
    Ok(())
}

/// Configured rate for a class; `None` means unlimited.
fn rate_limit_for(set: &AgentPermissionSet, class: RateClass) -> Option<RateLimit> {
    match class {
        RateClass::File => set.filesystem.requests_per_minute.map(RateLimit::per_minute),
        RateClass::Network => set.network.requests_per_minute.map(RateLimit::per_minute),
        RateClass::Shell => set.shell.requests_per_minute.map(RateLimit::per_minute),
        RateClass::Llm => set.llm.max_requests_per_hour.map(RateLimit::per_hour),
    }
}

fn check_file(perms: &CompiledPermissions, path: &str, action: Action, ctx: &RequestContext) -> Stage {
    if let Some(blocked) = perms.fs_blocked.first_match(path) {
        return Err(PermissionDecision::deny_by(
            ReasonCode::PathNotAllowed,
            blocked.as_str(),
        ));
    }

    let allow = match action {
        Action::Read => &perms.fs_read,
        Action::Write => &perms.fs_write,
        Action::Execute => &perms.fs_execute,
        Action::Delete => &perms.fs_delete,
        _ => return Err(PermissionDecision::deny(ReasonCode::PathNotAllowed)),
    };
    let pattern = allow
        .first_match(path)
        .ok_or_else(|| PermissionDecision::deny(ReasonCode::PathNotAllowed))?
        .as_str()
        .to_string();

    let mut conditions = Vec::new();
    let mut late_deny = None;
    if action == Action::Write {
        let max = perms.source.filesystem.max_file_size;
        if !perms.extensions.is_empty() && !extension_allowed(&perms.extensions, path) {
            late_deny = Some(ReasonCode::ExtensionNotAllowed);
        } else if let (Some(size), Some(max)) = (ctx.size, max) {
            if size > max {
                late_deny = Some(ReasonCode::FileTooLarge);
            }
        }
        if let Some(max) = max {
            conditions.push(Condition::MaxBytes(max));
        }
    }

    Ok(Grant {
        pattern,
        conditions,
        late_deny,
    })
}

fn extension_allowed(allowed: &std::collections::BTreeSet<String>, path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => allowed.contains(&ext.to_ascii_lowercase()),
        _ => false,
    }
}

/// Split `scheme://host:port/path` into its parts.
fn parse_target(target: &str) -> (Option<&str>, &str, Option<u16>) {
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, target),
    };
    let authority = rest.split('/').next().unwrap_or(rest);

    if let Some(inner) = authority.strip_prefix('[') {
        // [v6]:port
        if let Some((host, tail)) = inner.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (scheme, host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (scheme, host, Some(port)),
            Err(_) => (scheme, authority, None),
        },
        _ => (scheme, authority, None),
    }
}

fn default_port(protocol: &str) -> Option<u16> {
    match protocol {
        "https" | "wss" => Some(443),
        "http" | "ws" => Some(80),
        "ssh" => Some(22),
        _ => None,
    }
}

fn check_network(perms: &CompiledPermissions, target: &str, ctx: &RequestContext) -> Stage {
    let (scheme, host, port) = parse_target(target);

    if let Some(blocked) = perms.hosts_blocked.first_match(host) {
        return Err(PermissionDecision::deny_by(
            ReasonCode::HostNotAllowed,
            blocked.as_str(),
        ));
    }
    let pattern = perms
        .hosts_allowed
        .first_match(host)
        .ok_or_else(|| PermissionDecision::deny(ReasonCode::HostNotAllowed))?
        .as_str()
        .to_string();

    let protocol = ctx
        .protocol
        .as_deref()
        .or(scheme)
        .map(str::to_ascii_lowercase);

    let allowed_ports = &perms.source.network.allowed_ports;
    let port = port.or_else(|| protocol.as_deref().and_then(default_port));
    if let Some(port) = port {
        if !allowed_ports.is_empty() && !allowed_ports.contains(&port) {
            return Err(PermissionDecision::deny_by(ReasonCode::PortNotAllowed, pattern));
        }
    }
    if let Some(protocol) = &protocol {
        if !perms.protocols.is_empty() && !perms.protocols.contains(protocol) {
            return Err(PermissionDecision::deny_by(
                ReasonCode::ProtocolNotAllowed,
                pattern,
            ));
        }
    }

    Ok(Grant {
        pattern,
        conditions: Vec::new(),
        late_deny: None,
    })
}

fn check_shell(perms: &CompiledPermissions, command: &str) -> Stage {
    match perms.commands.check(command) {
        CommandMatch::Blocked { pattern } => Err(PermissionDecision::deny_by(
            ReasonCode::DangerousCommand,
            pattern,
        )),
        CommandMatch::InterpreterNotAllowed { interpreter } => Err(PermissionDecision::deny_by(
            ReasonCode::CommandNotAllowed,
            interpreter,
        )),
        CommandMatch::NotAllowed | CommandMatch::Malformed => {
            Err(PermissionDecision::deny(ReasonCode::CommandNotAllowed))
        }
        CommandMatch::Allowed { pattern } => {
            let shell = &perms.source.shell;
            let mut conditions = Vec::new();
            if let Some(secs) = shell.max_execution_time_secs {
                conditions.push(Condition::Timeout(Duration::from_secs(secs)));
            }
            if let Some(bytes) = shell.max_memory_bytes {
                conditions.push(Condition::MaxMemory(bytes));
            }
            Ok(Grant {
                pattern,
                conditions,
                late_deny: None,
            })
        }
    }
}

fn check_llm(perms: &CompiledPermissions, model: &str, ctx: &RequestContext) -> Stage {
    if let Some(blocked) = perms.models_blocked.first_match(model) {
        return Err(PermissionDecision::deny_by(
            ReasonCode::ModelNotAllowed,
            blocked.as_str(),
        ));
    }
    let pattern = perms
        .models_allowed
        .first_match(model)
        .ok_or_else(|| PermissionDecision::deny(ReasonCode::ModelNotAllowed))?
        .as_str()
        .to_string();

    let max = perms.source.llm.max_tokens_per_request;
    let late_deny = match (ctx.tokens, max) {
        (Some(tokens), Some(max)) if tokens > max => Some(ReasonCode::TokenLimitExceeded),
        _ => None,
    };

    Ok(Grant {
        pattern,
        conditions: max.map(Condition::MaxTokens).into_iter().collect(),
        late_deny,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::permissions::{FilesystemPermissions, LlmPermissions, NetworkPermissions, ShellPermissions};
    use quanta::Clock;

    fn engine() -> PermissionEngine {
        PermissionEngine::new(Arc::new(AuditLogger::in_memory("engine-test").unwrap()))
    }

    fn file(p: &str) -> Resource {
        Resource::File(p.into())
    }

    fn ctx() -> RequestContext {
        RequestContext::new()
    }

    #[test]
    fn test_no_permissions() {
        let e = engine();
        let d = e.evaluate("ghost", &file("./a"), Action::Read, &ctx()).unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reason, ReasonCode::NoPermissions);
    }

    #[test]
    fn test_blocked_path_overrides_allow() {
        let e = engine();
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                filesystem: FilesystemPermissions {
                    read: vec!["./src/**".into()],
                    blocked: vec!["**/.git/**".into()],
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        let d = e
            .evaluate("a1", &file("./src/.git/config"), Action::Read, &ctx())
            .unwrap();
        assert_eq!(d.reason, ReasonCode::PathNotAllowed);
        assert_eq!(d.matched_pattern.as_deref(), Some("**/.git/**"));

        let d = e
            .evaluate("a1", &file("./src/index.ts"), Action::Read, &ctx())
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.matched_pattern.as_deref(), Some("./src/**"));

        let d = e
            .evaluate("a1", &file("./src/index.ts"), Action::Write, &ctx())
            .unwrap();
        assert_eq!(d.reason, ReasonCode::PathNotAllowed);
    }

    #[test]
    fn test_dangerous_command() {
        let e = engine();
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                shell: ShellPermissions {
                    allowed_commands: vec!["git status".into()],
                    blocked_commands: vec!["rm -rf *".into()],
                    max_execution_time_secs: Some(30),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        let d = e
            .evaluate("a1", &Resource::Shell("rm -rf /tmp".into()), Action::Execute, &ctx())
            .unwrap();
        assert_eq!(d.reason, ReasonCode::DangerousCommand);

        let d = e
            .evaluate("a1", &Resource::Shell("git status".into()), Action::Execute, &ctx())
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.timeout(), Some(Duration::from_secs(30)));

        let d = e
            .evaluate("a1", &Resource::Shell("ls".into()), Action::Execute, &ctx())
            .unwrap();
        assert_eq!(d.reason, ReasonCode::CommandNotAllowed);
    }

    #[test]
    fn test_extension_and_size_on_write() {
        let e = engine();
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                filesystem: FilesystemPermissions {
                    write: vec!["out/**".into()],
                    allowed_extensions: vec!["md".into(), ".txt".into()],
                    max_file_size: Some(100),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        let w = |p: &str, c: &RequestContext| e.evaluate("a1", &file(p), Action::Write, c).unwrap();
        assert_eq!(w("out/a.exe", &ctx()).reason, ReasonCode::ExtensionNotAllowed);
        assert_eq!(w("out/Makefile", &ctx()).reason, ReasonCode::ExtensionNotAllowed);
        assert_eq!(
            w("out/a.md", &ctx().with_size(101)).reason,
            ReasonCode::FileTooLarge
        );
        let d = w("out/notes.TXT", &ctx().with_size(10));
        assert!(d.allowed);
        assert_eq!(d.conditions, vec![Condition::MaxBytes(100)]);
    }

    #[test]
    fn test_network_checks() {
        let e = engine();
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                network: NetworkPermissions {
                    allowed_hosts: vec!["*.example.com".into()],
                    blocked_hosts: vec!["evil.example.com".into()],
                    allowed_ports: vec![443],
                    protocols: vec!["https".into()],
                    requests_per_minute: None,
                },
                ..Default::default()
            },
        )
        .unwrap();

        let net = |t: &str, c: &RequestContext| {
            e.evaluate("a1", &Resource::Network(t.into()), Action::Connect, c)
                .unwrap()
        };
        assert!(net("api.example.com:443", &ctx()).allowed);
        assert!(net("https://API.example.com/v1", &ctx()).allowed);
        assert_eq!(net("evil.example.com", &ctx()).reason, ReasonCode::HostNotAllowed);
        assert_eq!(net("example.org", &ctx()).reason, ReasonCode::HostNotAllowed);
        assert_eq!(net("api.example.com:22", &ctx()).reason, ReasonCode::PortNotAllowed);
        assert_eq!(
            net("http://api.example.com", &ctx()).reason,
            ReasonCode::PortNotAllowed
        );
        assert_eq!(
            net("api.example.com:443", &ctx().with_protocol("ftp")).reason,
            ReasonCode::ProtocolNotAllowed
        );
    }

    #[test]
    fn test_llm_checks() {
        let e = engine();
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                llm: LlmPermissions {
                    max_tokens_per_request: Some(1000),
                    max_requests_per_hour: Some(2),
                    allowed_models: vec!["claude-*".into()],
                    blocked_models: vec!["*-preview".into()],
                },
                ..Default::default()
            },
        )
        .unwrap();

        let llm = |m: &str, c: &RequestContext| {
            e.evaluate("a1", &Resource::Llm(m.into()), Action::Invoke, c)
                .unwrap()
        };
        assert_eq!(llm("claude-x-preview", &ctx()).reason, ReasonCode::ModelNotAllowed);
        assert_eq!(llm("gpt-4", &ctx()).reason, ReasonCode::ModelNotAllowed);
        assert_eq!(
            llm("claude-sonnet", &ctx().with_tokens(5000)).reason,
            ReasonCode::TokenLimitExceeded
        );
        let d = llm("claude-sonnet", &ctx().with_tokens(10));
        assert!(d.allowed);
        assert_eq!(d.conditions, vec![Condition::MaxTokens(1000)]);
        assert!(llm("claude-sonnet", &ctx()).allowed);
        assert_eq!(llm("claude-sonnet", &ctx()).reason, ReasonCode::RateLimitExceeded);
    }

    #[test]
    fn test_rate_limit_boundary_and_window() {
        let (clock, mock) = Clock::mock();
        let e = PermissionEngine::with_rate_limiter(
            Arc::new(AuditLogger::in_memory("engine-test").unwrap()),
            RateLimiter::with_clock(clock),
        );
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                filesystem: FilesystemPermissions {
                    read: vec!["**".into()],
                    requests_per_minute: Some(3),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        for _ in 0..3 {
            assert!(e.evaluate("a1", &file("a.txt"), Action::Read, &ctx()).unwrap().allowed);
        }
        let d = e.evaluate("a1", &file("a.txt"), Action::Read, &ctx()).unwrap();
        assert_eq!(d.reason, ReasonCode::RateLimitExceeded);

        mock.increment(Duration::from_secs(60));
        assert!(e.evaluate("a1", &file("a.txt"), Action::Read, &ctx()).unwrap().allowed);
    }

    #[test]
    fn test_denials_do_not_consume_quota() {
        let e = engine();
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                filesystem: FilesystemPermissions {
                    read: vec!["src/**".into()],
                    requests_per_minute: Some(1),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        for _ in 0..5 {
            let d = e.evaluate("a1", &file("secret/x"), Action::Read, &ctx()).unwrap();
            assert_eq!(d.reason, ReasonCode::PathNotAllowed);
        }
        assert!(e.evaluate("a1", &file("src/x"), Action::Read, &ctx()).unwrap().allowed);
    }

    #[test]
    fn test_replacement_resets_rate_windows() {
        let e = engine();
        let set = AgentPermissionSet {
            filesystem: FilesystemPermissions {
                read: vec!["**".into()],
                requests_per_minute: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        e.set_agent_permissions("a1", set.clone()).unwrap();
        assert!(e.evaluate("a1", &file("x"), Action::Read, &ctx()).unwrap().allowed);
        assert!(!e.evaluate("a1", &file("x"), Action::Read, &ctx()).unwrap().allowed);

        e.set_agent_permissions("a1", set).unwrap();
        assert!(e.evaluate("a1", &file("x"), Action::Read, &ctx()).unwrap().allowed);

        assert!(e.remove_agent_permissions("a1").unwrap());
        assert!(e.agent_permissions("a1").is_none());
        assert_eq!(
            e.evaluate("a1", &file("x"), Action::Read, &ctx()).unwrap().reason,
            ReasonCode::NoPermissions
        );
    }

    #[test]
    fn test_validation_errors() {
        let e = engine();
        assert!(matches!(
            e.evaluate("", &file("x"), Action::Read, &ctx()),
            Err(GuardError::Validation(_))
        ));
        assert!(matches!(
            e.evaluate("a1", &file(" "), Action::Read, &ctx()),
            Err(GuardError::Validation(_))
        ));
        assert!(matches!(
            e.evaluate("a1", &file("x"), Action::Connect, &ctx()),
            Err(GuardError::Validation(_))
        ));
    }

    #[test]
    fn test_every_evaluation_is_audited() {
        let e = engine();
        e.set_agent_permissions("a1", AgentPermissionSet::read_only("."))
            .unwrap();
        e.evaluate("a1", &file("README.md"), Action::Read, &ctx().with_session("s1"))
            .unwrap();
        e.evaluate("a1", &file(".env"), Action::Read, &ctx()).unwrap();
        e.evaluate("nobody", &file("x"), Action::Read, &ctx()).unwrap();

        let checks = e
            .audit()
            .query(&AuditFilter {
                action_prefix: Some("permission.check".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].result.status, Outcome::Success);
        assert_eq!(checks[0].context.session_id.as_deref(), Some("s1"));
        assert_eq!(checks[1].result.status, Outcome::Failure);
        assert_eq!(checks[1].security.risk, crate::RiskLevel::Critical);
        assert_eq!(checks[2].action.details["reason"], "NO_PERMISSIONS");
    }

    /// Backend whose appends start failing once `broken` is set.
    #[derive(Debug)]
    struct FlakyBackend {
        inner: crate::audit_backend::MemoryAuditBackend,
        broken: Arc<std::sync::atomic::AtomicBool>,
    }

    impl crate::audit_backend::AuditBackend for FlakyBackend {
        fn append(&mut self, event: &crate::audit::AuditEvent) -> std::result::Result<(), AuditError> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AuditError::Backend(std::io::Error::other("disk full")));
            }
            self.inner.append(event)
        }

        fn load_all(&self) -> std::result::Result<Vec<crate::audit::AuditEvent>, AuditError> {
            self.inner.load_all()
        }

        fn count(&self) -> std::result::Result<usize, AuditError> {
            self.inner.count()
        }

        fn remove_prefix_before(
            &mut self,
            cutoff: chrono::DateTime<chrono::Utc>,
        ) -> std::result::Result<usize, AuditError> {
            self.inner.remove_prefix_before(cutoff)
        }
    }

    #[test]
    fn test_audit_failure_fails_evaluation_and_returns_quota() {
        let broken = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let backend = FlakyBackend {
            inner: Default::default(),
            broken: broken.clone(),
        };
        let config = crate::audit::AuditConfig {
            secret: "flaky".into(),
            encryption_key: None,
        };
        let e = PermissionEngine::new(Arc::new(AuditLogger::open(&config, Box::new(backend)).unwrap()));
        e.set_agent_permissions(
            "a1",
            AgentPermissionSet {
                filesystem: FilesystemPermissions {
                    read: vec!["src/**".into()],
                    requests_per_minute: Some(1),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        broken.store(true, std::sync::atomic::Ordering::SeqCst);
        for _ in 0..3 {
            let err = e.evaluate("a1", &file("src/x"), Action::Read, &ctx()).unwrap_err();
            assert!(matches!(err, GuardError::Audit(_)));
        }
        assert_eq!(
            e.limiter.usage("a1", RateClass::File, Duration::from_secs(60)),
            0
        );

        broken.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(e.evaluate("a1", &file("src/x"), Action::Read, &ctx()).unwrap().allowed);
        assert_eq!(
            e.limiter.usage("a1", RateClass::File, Duration::from_secs(60)),
            1
        );
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("example.com"), (None, "example.com", None));
        assert_eq!(parse_target("example.com:8080"), (None, "example.com", Some(8080)));
        assert_eq!(
            parse_target("https://example.com/path"),
            (Some("https"), "example.com", None)
        );
        assert_eq!(parse_target("[::1]:443"), (None, "::1", Some(443)));
    }
}
