//! Sandbox lifecycle and live supervision.
//!
//! Each agent has at most one live instance. An execution request is checked
//! against the permission engine, then the manager reserves the agent's slot,
//! asks the isolation backend for a fresh instance, starts the process and
//! hands it to a supervisor task. The supervisor samples usage every poll
//! interval, enforces limits, and always tears the instance down.
//!
//! ```text
//! Created ──▶ Running ──▶ Completed
//!    │           │
//!    └───────────┴──────▶ Terminated
//! ```
//!
//! The slot reservation is a guard: however the supervisor ends, dropping it
//! frees the slot and wakes callers waiting in [`SandboxManager::wait_for_idle`].

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use warden_guard::{
    Action, Actor, AuditError, AuditLogger, EventDraft, Outcome, PermissionDecision,
    PermissionEngine, RequestContext, Resource,
};

use crate::config::{EnforcementMode, ResourceKind, ResourceLimit, SandboxConfig};
use crate::error::{Result, Unavailable, WardenError};
use crate::isolation::{IsolationBackend, IsolationHandle};
use crate::monitor::{Breach, LimitAction, ResourceMonitor, ResourceUsage};

/// Captured output per stream is truncated to this many bytes.
const MAX_CAPTURE: usize = 1024 * 1024;

/// How long to wait for output pipes after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of an agent's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Configured, no process yet.
    Created,
    /// A process is executing under supervision.
    Running,
    /// The process exited on its own.
    Completed,
    /// The process was killed.
    Terminated,
}

impl SandboxState {
    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(self, to: SandboxState) -> bool {
        matches!(
            (self, to),
            (SandboxState::Created, SandboxState::Running)
                | (SandboxState::Created, SandboxState::Terminated)
                | (SandboxState::Running, SandboxState::Completed)
                | (SandboxState::Running, SandboxState::Terminated)
        )
    }

    /// `Completed` or `Terminated`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxState::Completed | SandboxState::Terminated)
    }

    fn as_str(self) -> &'static str {
        match self {
            SandboxState::Created => "created",
            SandboxState::Running => "running",
            SandboxState::Completed => "completed",
            SandboxState::Terminated => "terminated",
        }
    }
}

/// Why a run was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// A hard resource limit was breached.
    ResourceLimit,
    /// The permission timeout elapsed.
    Timeout,
    /// [`ExecutionHandle::terminate`] or [`SandboxManager::terminate`].
    Cancelled,
}

impl TerminationCause {
    fn as_str(self) -> &'static str {
        match self {
            TerminationCause::ResourceLimit => "resource_limit",
            TerminationCause::Timeout => "timeout",
            TerminationCause::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one supervised execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// The agent.
    pub agent_id: String,
    /// `Completed` or `Terminated`.
    pub state: SandboxState,
    /// Exit code, when the process exited on its own.
    pub exit_code: Option<i32>,
    /// Captured standard output (lossy UTF-8, truncated).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8, truncated).
    pub stderr: String,
    /// Wall time from start to exit.
    pub duration: Duration,
    /// Per-field maximum over all samples.
    pub peak_usage: ResourceUsage,
    /// Why the run was terminated, if it was.
    pub cause: Option<TerminationCause>,
    /// The hard breach that killed the process.
    pub violation: Option<Breach>,
}

impl ExecutionResult {
    /// Completed with exit code zero.
    pub fn success(&self) -> bool {
        self.state == SandboxState::Completed && self.exit_code == Some(0)
    }

    /// Turn a hard-limit termination into [`WardenError::ResourceViolation`].
    pub fn into_result(self) -> Result<Self> {
        match self.violation {
            Some(b) => Err(WardenError::ResourceViolation {
                kind: b.kind,
                mode: b.mode,
            }),
            None => Ok(self),
        }
    }
}

/// A running execution.
///
/// Dropping the handle detaches from the run; it keeps being supervised.
#[derive(Debug)]
pub struct ExecutionHandle {
    agent_id: String,
    cancel: Arc<watch::Sender<bool>>,
    join: JoinHandle<Result<ExecutionResult>>,
}

impl ExecutionHandle {
    /// The agent this run belongs to.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Ask the supervisor to kill the process. Takes effect within one poll.
    pub fn terminate(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the supervisor has finished.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> Result<ExecutionResult> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(WardenError::TaskFailed {
                agent_id: self.agent_id,
                message: e.to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct Slot {
    config: SandboxConfig,
    state: SandboxState,
    running: bool,
    cancel: Option<Arc<watch::Sender<bool>>>,
    usage: Option<ResourceUsage>,
}

impl Slot {
    fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            state: SandboxState::Created,
            running: false,
            cancel: None,
            usage: None,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    slots: Mutex<HashMap<String, Slot>>,
    idle: Notify,
}

impl Registry {
    fn transition(&self, agent_id: &str, to: SandboxState) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(agent_id)
            .ok_or_else(|| WardenError::Validation(format!("no sandbox for agent '{agent_id}'")))?;
        if !slot.state.can_transition(to) {
            return Err(WardenError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from: slot.state,
                to,
            });
        }
        slot.state = to;
        Ok(())
    }

    fn record_usage(&self, agent_id: &str, usage: &ResourceUsage) {
        if let Some(slot) = self.slots.lock().get_mut(agent_id) {
            slot.usage = Some(usage.clone());
        }
    }

    fn is_running(&self, agent_id: &str) -> bool {
        self.slots.lock().get(agent_id).is_some_and(|s| s.running)
    }
}

/// Holds an agent's slot for the duration of one execution.
#[derive(Debug)]
struct RunGuard {
    registry: Arc<Registry>,
    agent_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        {
            let mut slots = self.registry.slots.lock();
            if let Some(slot) = slots.get_mut(&self.agent_id) {
                if slot.state == SandboxState::Running {
                    tracing::error!(agent_id = %self.agent_id, "supervisor ended without finishing the run");
                    slot.state = SandboxState::Terminated;
                }
                slot.running = false;
                slot.cancel = None;
            }
        }
        self.registry.idle.notify_waiters();
    }
}

/// Creates sandboxes and supervises executions inside them.
#[derive(Debug)]
pub struct SandboxManager {
    engine: Arc<PermissionEngine>,
    backend: Arc<dyn IsolationBackend>,
    registry: Arc<Registry>,
}

impl SandboxManager {
    /// Manager checking executions against `engine` and isolating them with `backend`.
    pub fn new(engine: Arc<PermissionEngine>, backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            engine,
            backend,
            registry: Arc::new(Registry::default()),
        }
    }

    /// The isolation backend.
    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    /// Register (or replace) the sandbox configuration for `agent_id`.
    ///
    /// Fails with `AlreadyRunning` while the agent has a live instance, and
    /// with `SetupFailed` when enforced isolation is required but the backend
    /// cannot provide the requested modes.
    pub fn create_sandbox(&self, agent_id: &str, config: SandboxConfig) -> Result<()> {
        validate_agent(agent_id)?;
        config.validate()?;
        if config.require_enforced_isolation {
            self.backend
                .capabilities()
                .check(&config)
                .map_err(|msg| WardenError::setup_failed(agent_id, msg))?;
        }
        if self.registry.is_running(agent_id) {
            return Err(already_running(agent_id));
        }

        self.engine.audit().log_event(
            EventDraft::new(Actor::system(), "sandbox.create", agent_id)
                .detail("agent_id", agent_id)
                .detail("network", format!("{:?}", config.network).to_lowercase())
                .detail("filesystem", format!("{:?}", config.filesystem).to_lowercase())
                .detail("limits", to_value(&config.limits)?),
        )?;

        let mut slots = self.registry.slots.lock();
        if slots.get(agent_id).is_some_and(|s| s.running) {
            return Err(already_running(agent_id));
        }
        slots.insert(agent_id.to_string(), Slot::new(config));
        tracing::info!(agent_id, "sandbox created");
        Ok(())
    }

    /// Forget an idle agent's sandbox configuration.
    pub fn remove_sandbox(&self, agent_id: &str) -> Result<bool> {
        let mut slots = self.registry.slots.lock();
        if slots.get(agent_id).is_some_and(|s| s.running) {
            return Err(already_running(agent_id));
        }
        Ok(slots.remove(agent_id).is_some())
    }

    /// Current lifecycle state, if the agent has a sandbox.
    pub fn state(&self, agent_id: &str) -> Option<SandboxState> {
        self.registry.slots.lock().get(agent_id).map(|s| s.state)
    }

    /// Most recent usage sample of the current or last run.
    pub fn usage(&self, agent_id: &str) -> Option<ResourceUsage> {
        self.registry
            .slots
            .lock()
            .get(agent_id)
            .and_then(|s| s.usage.clone())
    }

    /// Whether the agent has a live instance.
    pub fn is_running(&self, agent_id: &str) -> bool {
        self.registry.is_running(agent_id)
    }

    /// Permission check for an operation issued from inside a running command.
    ///
    /// No sandbox lock is held across the engine call.
    pub fn check_operation(
        &self,
        agent_id: &str,
        resource: &Resource,
        action: Action,
        ctx: &RequestContext,
    ) -> Result<PermissionDecision> {
        Ok(self.engine.evaluate(agent_id, resource, action, ctx)?)
    }

    /// Start `command` in the agent's sandbox.
    ///
    /// A denied pre-flight check returns `PermissionDenied` before anything is
    /// started. A second request while the agent is running returns
    /// `SandboxUnavailable` with [`Unavailable::AlreadyRunning`]. Agents
    /// without a configured sandbox get [`SandboxConfig::default`].
    pub async fn execute_in_sandbox(
        &self,
        agent_id: &str,
        command: &str,
        ctx: &RequestContext,
    ) -> Result<ExecutionHandle> {
        if command.trim().is_empty() {
            return Err(WardenError::Validation("command must not be empty".into()));
        }
        let decision = self.engine.evaluate(
            agent_id,
            &Resource::Shell(command.to_string()),
            Action::Execute,
            ctx,
        )?;
        if !decision.allowed {
            tracing::info!(agent_id, reason = %decision.reason, "sandbox execution denied");
            return Err(WardenError::PermissionDenied {
                reason: decision.reason,
            });
        }
        let argv = shell_words::split(command)
            .map_err(|e| WardenError::Validation(format!("malformed command: {e}")))?;

        let (mut config, cancel, cancel_rx, guard) = self.reserve(agent_id)?;
        if let Some(max) = decision.max_memory() {
            config.limits.or_insert(ResourceKind::Memory, ResourceLimit::hard(max));
        }
        let limits = to_value(&config.limits)?;

        let mut handle = self.backend.setup(agent_id, &config).await.map_err(|e| match e {
            e @ WardenError::SandboxUnavailable { .. } => e,
            other => WardenError::setup_failed(agent_id, other.to_string()),
        })?;

        let mut child = match spawn(&argv, &config) {
            Ok(child) => child,
            Err(e) => {
                self.abandon(handle, None).await;
                return Err(WardenError::setup_failed(agent_id, format!("spawn failed: {e}")));
            }
        };
        let pid = child.id().unwrap_or_default();

        if let Err(e) = self.backend.attach(&mut handle, pid).await {
            self.abandon(handle, Some(&mut child)).await;
            return Err(WardenError::setup_failed(agent_id, format!("attach failed: {e}")));
        }
        if let Err(e) = self.registry.transition(agent_id, SandboxState::Running) {
            self.abandon(handle, Some(&mut child)).await;
            return Err(e);
        }

        let started = self.engine.audit().log_event(
            EventDraft::new(Actor::agent(agent_id), "sandbox.start", handle.id.as_str())
                .session(ctx.session_id.clone())
                .detail("command", command)
                .detail("pid", pid)
                .detail("backend", self.backend.capabilities().name)
                .detail("limits", limits),
        );
        if let Err(e) = started {
            self.abandon(handle, Some(&mut child)).await;
            return Err(e.into());
        }
        tracing::info!(agent_id, pid, instance = %handle.id, "sandbox running");

        let supervisor = Supervisor {
            agent_id: agent_id.to_string(),
            session_id: ctx.session_id.clone(),
            audit: self.engine.audit().clone(),
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            throttle: self.backend.capabilities().throttle,
            enforced: self.backend.capabilities().enforced_limits,
            monitor: ResourceMonitor::new(config.limits.clone()),
            poll_interval: config.poll_interval,
            timeout: decision.timeout(),
            peak: ResourceUsage::default(),
            handle,
            _guard: guard,
        };
        let join = tokio::spawn(supervisor.run(child, cancel_rx));

        Ok(ExecutionHandle {
            agent_id: agent_id.to_string(),
            cancel,
            join,
        })
    }

    /// Start `command` and wait for it to finish.
    pub async fn run(&self, agent_id: &str, command: &str, ctx: &RequestContext) -> Result<ExecutionResult> {
        self.execute_in_sandbox(agent_id, command, ctx).await?.wait().await
    }

    /// Start `command` once the agent's current run, if any, has finished.
    ///
    /// Gives up with `AlreadyRunning` after `timeout`.
    pub async fn execute_when_idle(
        &self,
        agent_id: &str,
        command: &str,
        ctx: &RequestContext,
        timeout: Duration,
    ) -> Result<ExecutionHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.wait_for_idle(agent_id, remaining).await {
                return Err(already_running(agent_id));
            }
            match self.execute_in_sandbox(agent_id, command, ctx).await {
                Err(WardenError::SandboxUnavailable {
                    reason: Unavailable::AlreadyRunning,
                    ..
                }) if Instant::now() < deadline => continue,
                other => return other,
            }
        }
    }

    /// Kill the agent's running process. Returns whether one was running.
    pub fn terminate(&self, agent_id: &str) -> Result<bool> {
        validate_agent(agent_id)?;
        let slots = self.registry.slots.lock();
        match slots.get(agent_id).and_then(|s| s.cancel.as_ref()) {
            Some(cancel) => {
                cancel.send_replace(true);
                tracing::info!(agent_id, "termination requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait until the agent has no live instance. Returns `false` on timeout.
    pub async fn wait_for_idle(&self, agent_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.registry.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.registry.is_running(agent_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.registry.is_running(agent_id);
            }
        }
    }

    fn reserve(
        &self,
        agent_id: &str,
    ) -> Result<(SandboxConfig, Arc<watch::Sender<bool>>, watch::Receiver<bool>, RunGuard)> {
        let mut slots = self.registry.slots.lock();
        let slot = slots
            .entry(agent_id.to_string())
            .or_insert_with(|| Slot::new(SandboxConfig::default()));
        if slot.running {
            return Err(already_running(agent_id));
        }

        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        slot.running = true;
        slot.state = SandboxState::Created;
        slot.cancel = Some(tx.clone());
        slot.usage = None;

        let guard = RunGuard {
            registry: self.registry.clone(),
            agent_id: agent_id.to_string(),
        };
        Ok((slot.config.clone(), tx, rx, guard))
    }

    async fn abandon(&self, handle: IsolationHandle, child: Option<&mut Child>) {
        if let Some(child) = child {
            kill(child).await;
        }
        let agent_id = handle.agent_id.clone();
        if let Err(e) = self.backend.teardown(handle).await {
            tracing::warn!(agent_id, error = %e, "teardown after failed start");
        }
    }
}

struct Ended {
    state: SandboxState,
    exit: Option<ExitStatus>,
    cause: Option<TerminationCause>,
    violation: Option<Breach>,
}

impl Ended {
    fn terminated(cause: TerminationCause, violation: Option<Breach>) -> Self {
        Self {
            state: SandboxState::Terminated,
            exit: None,
            cause: Some(cause),
            violation,
        }
    }
}

enum Step {
    Exited(std::io::Result<ExitStatus>),
    Cancel(bool),
    Deadline,
    Tick,
}

struct Supervisor {
    agent_id: String,
    session_id: Option<String>,
    audit: Arc<AuditLogger>,
    backend: Arc<dyn IsolationBackend>,
    registry: Arc<Registry>,
    throttle: Vec<ResourceKind>,
    enforced: Vec<ResourceKind>,
    monitor: ResourceMonitor,
    poll_interval: Duration,
    timeout: Option<Duration>,
    peak: ResourceUsage,
    handle: IsolationHandle,
    _guard: RunGuard,
}

impl Supervisor {
    async fn run(mut self, mut child: Child, mut cancel: watch::Receiver<bool>) -> Result<ExecutionResult> {
        let started = Instant::now();
        let stdout = child.stdout.take().map(|s| tokio::spawn(drain(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain(s)));

        let ended = self.supervise(&mut child, &mut cancel).await;
        if !matches!(&ended, Ok(e) if e.state == SandboxState::Completed) {
            kill(&mut child).await;
        }
        let duration = started.elapsed();
        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        if let Err(e) = self.backend.teardown(self.handle.clone()).await {
            tracing::warn!(agent_id = %self.agent_id, error = %e, "sandbox teardown failed");
        }

        let ended = match ended {
            Ok(ended) => ended,
            Err(e) => {
                let _ = self.registry.transition(&self.agent_id, SandboxState::Terminated);
                tracing::error!(agent_id = %self.agent_id, error = %e, "sandbox supervision failed");
                return Err(e);
            }
        };
        self.registry.transition(&self.agent_id, ended.state)?;

        let result = ExecutionResult {
            agent_id: self.agent_id.clone(),
            state: ended.state,
            exit_code: ended.exit.and_then(|s| s.code()),
            stdout,
            stderr,
            duration,
            peak_usage: self.peak.clone(),
            cause: ended.cause,
            violation: ended.violation,
        };

        let outcome = if result.success() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let mut draft = self
            .draft("sandbox.complete")
            .detail("state", result.state.as_str())
            .detail("duration_ms", u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .detail("peak_usage", to_value(&result.peak_usage)?)
            .outcome(outcome, result.state.as_str());
        if let Some(code) = result.exit_code {
            draft = draft.detail("exit_code", code);
        }
        if let Some(cause) = result.cause {
            draft = draft.detail("cause", cause.as_str());
        }
        self.audit.log_event(draft)?;

        tracing::info!(
            agent_id = %self.agent_id,
            state = result.state.as_str(),
            exit_code = ?result.exit_code,
            duration_ms = duration.as_millis() as u64,
            "sandbox finished"
        );
        Ok(result)
    }

    async fn supervise(&mut self, child: &mut Child, cancel: &mut watch::Receiver<bool>) -> Result<Ended> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut cancel_open = true;

        loop {
            let step = tokio::select! {
                status = child.wait() => Step::Exited(status),
                changed = cancel.changed(), if cancel_open => Step::Cancel(changed.is_ok()),
                _ = sleep_until(deadline) => Step::Deadline,
                _ = ticker.tick() => Step::Tick,
            };

            match step {
                Step::Exited(status) => {
                    let status = status?;
                    if !status.success() {
                        if let Some(breach) = self.enforced_breach().await {
                            tracing::error!(
                                agent_id = %self.agent_id,
                                resource = %breach.kind,
                                observed = breach.observed,
                                limit = breach.limit,
                                "hard limit enforced by the kernel, process killed"
                            );
                            self.audit.log_event(
                                self.breach_draft("sandbox.violation.hard", &breach)
                                    .detail("enforced_by", "kernel")
                                    .outcome(Outcome::Failure, format!("{} limit exceeded", breach.kind)),
                            )?;
                            return Ok(Ended {
                                exit: Some(status),
                                ..Ended::terminated(TerminationCause::ResourceLimit, Some(breach))
                            });
                        }
                    }
                    return Ok(Ended {
                        state: SandboxState::Completed,
                        exit: Some(status),
                        cause: None,
                        violation: None,
                    });
                }
                Step::Cancel(false) => cancel_open = false,
                Step::Cancel(true) => {
                    if *cancel.borrow_and_update() {
                        kill(child).await;
                        tracing::info!(agent_id = %self.agent_id, "sandbox cancelled");
                        return Ok(Ended::terminated(TerminationCause::Cancelled, None));
                    }
                }
                Step::Deadline => {
                    kill(child).await;
                    tracing::warn!(agent_id = %self.agent_id, timeout = ?self.timeout, "sandbox timed out");
                    self.audit.log_event(
                        self.draft("sandbox.timeout")
                            .detail("timeout_ms", self.timeout.map_or(0, |t| t.as_millis() as u64))
                            .outcome(Outcome::Failure, "execution time exceeded"),
                    )?;
                    return Ok(Ended::terminated(TerminationCause::Timeout, None));
                }
                Step::Tick => {
                    if let Some(breach) = self.poll().await? {
                        kill(child).await;
                        tracing::error!(
                            agent_id = %self.agent_id,
                            resource = %breach.kind,
                            observed = breach.observed,
                            limit = breach.limit,
                            "hard limit exceeded, process killed"
                        );
                        self.audit.log_event(
                            self.breach_draft("sandbox.violation.hard", &breach)
                                .outcome(Outcome::Failure, format!("{} limit exceeded", breach.kind)),
                        )?;
                        return Ok(Ended::terminated(TerminationCause::ResourceLimit, Some(breach)));
                    }
                }
            }
        }
    }

    /// One sample. Returns the hard breach, if any; handles everything else.
    async fn poll(&mut self) -> Result<Option<Breach>> {
        let usage = match tokio::time::timeout(self.poll_interval, self.backend.sample(&self.handle)).await {
            Ok(Ok(usage)) => usage,
            Ok(Err(e)) => {
                self.monitor_error(&e.to_string())?;
                return Ok(None);
            }
            Err(_) => {
                self.monitor_error("sample timed out")?;
                return Ok(None);
            }
        };
        self.peak.merge_peak(&usage);
        self.registry.record_usage(&self.agent_id, &usage);

        for action in self.monitor.observe(&usage) {
            match action {
                LimitAction::Kill(breach) => return Ok(Some(breach)),
                LimitAction::Throttle(breach) => {
                    if self.throttle.contains(&breach.kind) {
                        if let Err(e) = self.backend.throttle(&self.handle, &breach).await {
                            tracing::warn!(agent_id = %self.agent_id, resource = %breach.kind, error = %e, "throttle failed");
                        }
                    }
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        resource = %breach.kind,
                        observed = breach.observed,
                        limit = breach.limit,
                        "soft limit exceeded"
                    );
                    self.audit.log_event(
                        self.breach_draft("sandbox.violation.soft", &breach)
                            .detail("throttled", self.throttle.contains(&breach.kind))
                            .outcome(Outcome::Warning, format!("{} over soft limit", breach.kind)),
                    )?;
                }
                LimitAction::Release(kind) => {
                    if self.throttle.contains(&kind) {
                        if let Err(e) = self.backend.release(&self.handle, kind).await {
                            tracing::warn!(agent_id = %self.agent_id, resource = %kind, error = %e, "throttle release failed");
                        }
                    }
                    self.audit.log_event(
                        self.draft("sandbox.throttle.lifted")
                            .detail("resource", kind.as_str())
                            .outcome(Outcome::Success, format!("{kind} back under soft limit")),
                    )?;
                }
                LimitAction::Notify(breach) => {
                    tracing::info!(agent_id = %self.agent_id, resource = %breach.kind, observed = breach.observed, "monitored limit exceeded");
                    self.audit.log_event(
                        self.breach_draft("sandbox.limit.observed", &breach)
                            .outcome(Outcome::Success, format!("{} over monitored limit", breach.kind)),
                    )?;
                }
            }
        }
        Ok(None)
    }

    /// A hard limit the backend enforced itself, if that is what ended the process.
    async fn enforced_breach(&self) -> Option<Breach> {
        if self.enforced.is_empty() {
            return None;
        }
        match self.backend.enforced_kill(&self.handle).await {
            Ok(Some((kind, observed))) if self.enforced.contains(&kind) => {
                let limit = self.monitor.hard_limit(kind)?;
                Some(Breach {
                    kind,
                    mode: EnforcementMode::Hard,
                    observed: observed.max(self.peak.value(kind)),
                    limit,
                })
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, error = %e, "could not read kernel limit events");
                None
            }
        }
    }

    fn monitor_error(&self, message: &str) -> std::result::Result<(), AuditError> {
        tracing::warn!(agent_id = %self.agent_id, error = message, "usage sample failed");
        self.audit
            .log_event(self.draft("sandbox.monitor.error").outcome(Outcome::Warning, message))
            .map(|_| ())
    }

    fn draft(&self, kind: &str) -> EventDraft {
        EventDraft::new(Actor::agent(&self.agent_id), kind, self.handle.id.as_str())
            .session(self.session_id.clone())
    }

    fn breach_draft(&self, kind: &str, breach: &Breach) -> EventDraft {
        self.draft(kind)
            .detail("resource", breach.kind.as_str())
            .detail("mode", breach.mode.to_string())
            .detail("observed", breach.observed)
            .detail("limit", breach.limit)
    }
}

fn spawn(argv: &[String], config: &SandboxConfig) -> std::io::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.work_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn()
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        // already reaped
        tracing::debug!(error = %e, "kill");
    }
    let _ = child.wait().await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURE.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    captured
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, AuditError> {
    serde_json::to_value(value).map_err(AuditError::from)
}

fn validate_agent(agent_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() {
        return Err(WardenError::Validation("agent id must not be empty".into()));
    }
    Ok(())
}

fn already_running(agent_id: &str) -> WardenError {
    WardenError::SandboxUnavailable {
        agent_id: agent_id.to_string(),
        reason: Unavailable::AlreadyRunning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use SandboxState::*;
        assert!(Created.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Terminated));
        assert!(Created.can_transition(Terminated));
        assert!(!Terminated.can_transition(Terminated));
        assert!(!Completed.can_transition(Running));
        assert!(!Created.can_transition(Completed));
        assert!(Terminated.is_terminal() && !Running.is_terminal());
    }

    #[test]
    fn test_double_termination_rejected() {
        let registry = Registry::default();
        registry
            .slots
            .lock()
            .insert("a1".into(), Slot::new(SandboxConfig::default()));

        registry.transition("a1", SandboxState::Running).unwrap();
        registry.transition("a1", SandboxState::Terminated).unwrap();
        let err = registry.transition("a1", SandboxState::Terminated).unwrap_err();
        assert!(matches!(
            err,
            WardenError::InvalidTransition {
                from: SandboxState::Terminated,
                to: SandboxState::Terminated,
                ..
            }
        ));
        // confined to the slot: other agents are unaffected
        assert!(registry.transition("a2", SandboxState::Running).is_err());
    }

    #[test]
    fn test_guard_drop_releases_slot() {
        let registry = Arc::new(Registry::default());
        let mut slot = Slot::new(SandboxConfig::default());
        slot.running = true;
        slot.state = SandboxState::Running;
        registry.slots.lock().insert("a1".into(), slot);

        drop(RunGuard {
            registry: registry.clone(),
            agent_id: "a1".into(),
        });
        let slots = registry.slots.lock();
        let slot = &slots["a1"];
        assert!(!slot.running);
        assert_eq!(slot.state, SandboxState::Terminated);
    }

    #[tokio::test]
    async fn test_drain_truncates() {
        let data = vec![b'x'; MAX_CAPTURE + 100];
        let captured = drain(&data[..]).await;
        assert_eq!(captured.len(), MAX_CAPTURE);
    }

    #[test]
    fn test_violation_into_result() {
        let result = ExecutionResult {
            agent_id: "a1".into(),
            state: SandboxState::Terminated,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
            peak_usage: ResourceUsage::default(),
            cause: Some(TerminationCause::ResourceLimit),
            violation: Some(Breach {
                kind: ResourceKind::Memory,
                mode: crate::config::EnforcementMode::Hard,
                observed: 2,
                limit: 1,
            }),
        };
        assert!(!result.success());
        assert!(matches!(
            result.into_result(),
            Err(WardenError::ResourceViolation {
                kind: ResourceKind::Memory,
                ..
            })
        ));
    }
}
