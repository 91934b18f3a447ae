//! Error types for sandboxed execution.

use thiserror::Error;
use warden_guard::{AuditError, GuardError, ReasonCode};

use crate::config::{EnforcementMode, ResourceKind};
use crate::sandbox::SandboxState;

/// Result type for warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Why a sandbox could not be provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// The agent already has a live instance. Retry after it finishes.
    AlreadyRunning,
    /// Isolation could not be established. Nothing was left behind.
    SetupFailed(String),
}

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unavailable::AlreadyRunning => f.write_str("agent already has a running sandbox"),
            Unavailable::SetupFailed(msg) => write!(f, "isolation setup failed: {msg}"),
        }
    }
}

/// Errors that can occur during sandboxed execution.
#[derive(Error, Debug)]
pub enum WardenError {
    /// The pre-flight permission check denied the operation.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Stable reason code.
        reason: ReasonCode,
    },

    /// A run ended because a resource limit was breached.
    #[error("resource violation: {kind} limit exceeded ({mode})")]
    ResourceViolation {
        /// Resource that breached.
        kind: ResourceKind,
        /// Enforcement mode of the limit.
        mode: EnforcementMode,
    },

    /// No sandbox could be provided for the agent.
    #[error("sandbox unavailable for agent '{agent_id}': {reason}")]
    SandboxUnavailable {
        /// The agent.
        agent_id: String,
        /// What went wrong.
        reason: Unavailable,
    },

    /// The audit trail could not be written; the guarded operation failed with it.
    #[error("audit write failed: {0}")]
    AuditWriteFailure(#[from] AuditError),

    /// Malformed input to a public call.
    #[error("validation error: {0}")]
    Validation(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid sandbox transition for agent '{agent_id}': {from:?} -> {to:?}")]
    InvalidTransition {
        /// The agent.
        agent_id: String,
        /// Current state.
        from: SandboxState,
        /// Requested state.
        to: SandboxState,
    },

    /// The supervising task ended without producing a result.
    #[error("execution task for agent '{agent_id}' failed: {message}")]
    TaskFailed {
        /// The agent.
        agent_id: String,
        /// Join error text.
        message: String,
    },

    /// IO error from underlying operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    pub(crate) fn setup_failed(agent_id: &str, message: impl Into<String>) -> Self {
        WardenError::SandboxUnavailable {
            agent_id: agent_id.to_string(),
            reason: Unavailable::SetupFailed(message.into()),
        }
    }
}

impl From<GuardError> for WardenError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Validation(msg) => WardenError::Validation(msg),
            GuardError::Audit(e) => WardenError::AuditWriteFailure(e),
        }
    }
}
