//! Error types for the policy layer.

use thiserror::Error;

/// Result type for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Errors returned by the permission engine and its collaborators.
///
/// Denials are not errors: they come back as a
/// [`PermissionDecision`](crate::PermissionDecision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Malformed input to a public call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The audit trail could not be written; the guarded action must fail.
    #[error("audit write failed: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the audit logger and its backends.
#[derive(Error, Debug)]
pub enum AuditError {
    /// I/O failure in the storage backend.
    #[error("audit backend I/O error: {0}")]
    Backend(#[from] std::io::Error),

    /// An event could not be serialized or parsed.
    #[error("audit serialization error: {0}")]
    Serialization(String),

    /// Sealing or opening encrypted details failed.
    #[error("audit encryption error: {0}")]
    Encryption(String),

    /// A persisted event failed signature or chain verification.
    #[error("audit integrity violation at seq={sequence}: {message}")]
    Integrity {
        /// Sequence number of the offending event.
        sequence: u64,
        /// What went wrong.
        message: String,
    },
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
