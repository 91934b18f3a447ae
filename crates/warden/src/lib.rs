//! # Warden
//!
//! Runtime enforcement of `warden-guard` decisions.
//!
//! While `warden-guard` decides what SHOULD be allowed and records it,
//! `warden` runs what IS allowed: each agent command executes in an isolated,
//! resource-limited sandbox that is watched while it runs.
//!
//! | Aspect | warden-guard | warden |
//! |--------|--------------|--------|
//! | Purpose | Policy decision + audit | Enforcement at runtime |
//! | Commands | `PermissionEngine::evaluate` predicate | `SandboxManager::execute_in_sandbox` spawns processes |
//! | Limits | `timeout` / `max_memory` conditions | polled usage, kill / throttle / record |
//! | Concurrency | synchronous, in-memory locks | tokio tasks, one live instance per agent |
//!
//! ## Example
//!
//! ```ignore
//! use warden::{ProcessBackend, SandboxConfig, TrustCore};
//! use warden_guard::{AgentPermissionSet, RequestContext};
//!
//! let core = TrustCore::in_memory("audit-secret", std::sync::Arc::new(ProcessBackend::new()))?;
//! core.set_agent_permissions("a1", AgentPermissionSet::developer("."))?;
//! core.create_sandbox("a1", SandboxConfig::default())?;
//!
//! let result = core
//!     .execute_in_sandbox("a1", "cargo test", &RequestContext::new())
//!     .await?
//!     .wait()
//!     .await?;
//! assert!(result.success());
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod error;
mod isolation;
mod monitor;
mod sandbox;

use std::sync::Arc;

use warden_guard::{
    Action, AgentPermissionSet, AuditBackend, AuditConfig, AuditEvent, AuditFilter, AuditLogger,
    ComplianceEngine, ComplianceReport, PermissionDecision, PermissionEngine, RequestContext,
    Resource, TimeRange,
};

pub use config::{
    EnforcementMode, FilesystemMode, NetworkMode, ResourceKind, ResourceLimit, ResourceLimits,
    SandboxConfig, DEFAULT_POLL_INTERVAL,
};
pub use error::{Result, Unavailable, WardenError};
pub use isolation::{BackendCapabilities, CgroupBackend, IsolationBackend, IsolationHandle, ProcessBackend};
pub use monitor::{Breach, LimitAction, ResourceMonitor, ResourceUsage};
pub use sandbox::{ExecutionHandle, ExecutionResult, SandboxManager, SandboxState, TerminationCause};

// Re-export warden-guard for convenience
pub use warden_guard;

/// The agent trust core: permission engine, audit logger, compliance engine
/// and sandbox manager wired together.
///
/// Independent instances share no state.
#[derive(Debug)]
pub struct TrustCore {
    engine: Arc<PermissionEngine>,
    compliance: Arc<ComplianceEngine>,
    sandboxes: SandboxManager,
}

impl TrustCore {
    /// Build a core persisting audit events to `backend`.
    ///
    /// The compliance engine (built-in `gdpr` and `soc2` standards) subscribes
    /// to the audit stream; events already in the backend are scored first.
    pub fn new(
        audit: &AuditConfig,
        backend: Box<dyn AuditBackend>,
        isolation: Arc<dyn IsolationBackend>,
    ) -> Result<Self> {
        let logger = AuditLogger::open(audit, backend)?;
        Self::assemble(logger, ComplianceEngine::new(), isolation)
    }

    /// Build a core with an in-memory audit log.
    pub fn in_memory(secret: &str, isolation: Arc<dyn IsolationBackend>) -> Result<Self> {
        let logger = AuditLogger::in_memory(secret)?;
        Self::assemble(logger, ComplianceEngine::new(), isolation)
    }

    /// Build a core around existing components.
    pub fn assemble(
        audit: AuditLogger,
        compliance: ComplianceEngine,
        isolation: Arc<dyn IsolationBackend>,
    ) -> Result<Self> {
        let audit = Arc::new(audit);
        let compliance = Arc::new(compliance);
        compliance.evaluate_all(&audit.events()?);
        audit.subscribe(compliance.clone());

        let engine = Arc::new(PermissionEngine::new(audit));
        let sandboxes = SandboxManager::new(engine.clone(), isolation);
        Ok(Self {
            engine,
            compliance,
            sandboxes,
        })
    }

    /// Decide whether `agent_id` may perform `action` on `resource`.
    pub fn evaluate(
        &self,
        agent_id: &str,
        resource: &Resource,
        action: Action,
        ctx: &RequestContext,
    ) -> Result<PermissionDecision> {
        Ok(self.engine.evaluate(agent_id, resource, action, ctx)?)
    }

    /// Register or wholesale replace an agent's permission set.
    pub fn set_agent_permissions(&self, agent_id: &str, permissions: AgentPermissionSet) -> Result<()> {
        self.engine.set_agent_permissions(agent_id, permissions)?;
        Ok(())
    }

    /// Register or replace an agent's sandbox configuration.
    pub fn create_sandbox(&self, agent_id: &str, config: SandboxConfig) -> Result<()> {
        self.sandboxes.create_sandbox(agent_id, config)
    }

    /// Run `command` for `agent_id` in its sandbox.
    pub async fn execute_in_sandbox(
        &self,
        agent_id: &str,
        command: &str,
        ctx: &RequestContext,
    ) -> Result<ExecutionHandle> {
        self.sandboxes.execute_in_sandbox(agent_id, command, ctx).await
    }

    /// Score one compliance standard over a window.
    pub fn generate_compliance_report(&self, standard: &str, range: TimeRange) -> Result<ComplianceReport> {
        Ok(self.compliance.generate_report(standard, range)?)
    }

    /// Stored events matching `filter`.
    pub fn query_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        Ok(self.engine.audit().query(filter)?)
    }

    /// The permission engine.
    pub fn engine(&self) -> &Arc<PermissionEngine> {
        &self.engine
    }

    /// The audit logger.
    pub fn audit(&self) -> &Arc<AuditLogger> {
        self.engine.audit()
    }

    /// The compliance engine.
    pub fn compliance(&self) -> &Arc<ComplianceEngine> {
        &self.compliance
    }

    /// The sandbox manager.
    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }
}
