//! Request and decision types for permission evaluation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// A typed resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Resource {
    /// A filesystem path.
    File(String),
    /// A host, optionally with `:port`.
    Network(String),
    /// A shell command line.
    Shell(String),
    /// A model name.
    Llm(String),
}

impl Resource {
    /// The resource type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::File(_) => "file",
            Resource::Network(_) => "network",
            Resource::Shell(_) => "shell",
            Resource::Llm(_) => "llm",
        }
    }

    /// The resource-specific identifier.
    pub fn id(&self) -> &str {
        match self {
            Resource::File(s) | Resource::Network(s) | Resource::Shell(s) | Resource::Llm(s) => s,
        }
    }

    /// Check that the action is valid for this resource type.
    pub fn validate_action(&self, action: Action) -> Result<(), GuardError> {
        let ok = match self {
            Resource::File(_) => matches!(
                action,
                Action::Read | Action::Write | Action::Execute | Action::Delete
            ),
            Resource::Network(_) => action == Action::Connect,
            Resource::Shell(_) => action == Action::Execute,
            Resource::Llm(_) => action == Action::Invoke,
        };
        if ok {
            Ok(())
        } else {
            Err(GuardError::Validation(format!(
                "action '{action}' is not valid for {} resources",
                self.kind()
            )))
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for Resource {
    type Err = GuardError;

    /// Parse `file:./src/lib.rs`, `network:api.example.com:443`, and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| GuardError::Validation(format!("resource '{s}' has no type tag")))?;
        let id = id.to_string();
        match kind {
            "file" => Ok(Resource::File(id)),
            "network" => Ok(Resource::Network(id)),
            "shell" => Ok(Resource::Shell(id)),
            "llm" => Ok(Resource::Llm(id)),
            other => Err(GuardError::Validation(format!(
                "unknown resource type '{other}'"
            ))),
        }
    }
}

/// An operation on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read a file.
    Read,
    /// Write or create a file.
    Write,
    /// Execute a file or command.
    Execute,
    /// Delete a file.
    Delete,
    /// Open a network connection.
    Connect,
    /// Invoke a model.
    Invoke,
}

impl Action {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Execute => "execute",
            Action::Delete => "delete",
            Action::Connect => "connect",
            Action::Invoke => "invoke",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "execute" => Ok(Action::Execute),
            "delete" => Ok(Action::Delete),
            "connect" => Ok(Action::Connect),
            "invoke" => Ok(Action::Invoke),
            other => Err(GuardError::Validation(format!("unknown action '{other}'"))),
        }
    }
}

/// Caller-supplied context for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    /// Session the request belongs to.
    pub session_id: Option<String>,
    /// Caller's request identifier.
    pub request_id: Option<String>,
    /// Bytes to be written (file writes).
    pub size: Option<u64>,
    /// Protocol for network requests (`https`, `wss`, ...).
    pub protocol: Option<String>,
    /// Requested tokens (llm invocations).
    pub tokens: Option<u64>,
    /// The request touches personal data.
    pub pii: bool,
    /// Free-form attributes copied into the audit event.
    pub attributes: BTreeMap<String, String>,
}

impl RequestContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session id.
    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the request id.
    pub fn with_request(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the write size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the network protocol.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Set the requested token count.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Mark the request as touching personal data.
    pub fn with_pii(mut self) -> Self {
        self.pii = true;
        self
    }
}

/// Machine-readable reason for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Allowed by a matching pattern.
    Granted,
    /// No permission set registered for the agent.
    NoPermissions,
    /// Path not allowed, or matched a blocked path.
    PathNotAllowed,
    /// Host not allowed, or matched a blocked host.
    HostNotAllowed,
    /// Command matched no allow pattern.
    CommandNotAllowed,
    /// Command matched a blocked pattern.
    DangerousCommand,
    /// Rate limit for the resource class exceeded.
    RateLimitExceeded,
    /// File extension not in the allow-list.
    ExtensionNotAllowed,
    /// Model not allowed, or matched a blocked model.
    ModelNotAllowed,
    /// Requested tokens above the per-request limit.
    TokenLimitExceeded,
    /// Port not in the allowed list.
    PortNotAllowed,
    /// Protocol not in the allowed list.
    ProtocolNotAllowed,
    /// Write larger than the maximum file size.
    FileTooLarge,
}

impl ReasonCode {
    /// Stable wire name (`PATH_NOT_ALLOWED`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Granted => "GRANTED",
            ReasonCode::NoPermissions => "NO_PERMISSIONS",
            ReasonCode::PathNotAllowed => "PATH_NOT_ALLOWED",
            ReasonCode::HostNotAllowed => "HOST_NOT_ALLOWED",
            ReasonCode::CommandNotAllowed => "COMMAND_NOT_ALLOWED",
            ReasonCode::DangerousCommand => "DANGEROUS_COMMAND",
            ReasonCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ReasonCode::ExtensionNotAllowed => "EXTENSION_NOT_ALLOWED",
            ReasonCode::ModelNotAllowed => "MODEL_NOT_ALLOWED",
            ReasonCode::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            ReasonCode::PortNotAllowed => "PORT_NOT_ALLOWED",
            ReasonCode::ProtocolNotAllowed => "PROTOCOL_NOT_ALLOWED",
            ReasonCode::FileTooLarge => "FILE_TOO_LARGE",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A narrowing attached to an allowed decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// At most this many bytes may be written.
    MaxBytes(u64),
    /// The command must finish within this duration.
    Timeout(Duration),
    /// The command may use at most this much memory.
    MaxMemory(u64),
    /// At most this many tokens per request.
    MaxTokens(u64),
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Why.
    pub reason: ReasonCode,
    /// Narrowings the caller must honor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// The pattern that decided the outcome, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
}

impl PermissionDecision {
    /// An allow decision.
    pub fn allow(matched_pattern: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Granted,
            conditions,
            matched_pattern: Some(matched_pattern.into()),
        }
    }

    /// A deny decision.
    pub fn deny(reason: ReasonCode) -> Self {
        Self {
            allowed: false,
            reason,
            conditions: Vec::new(),
            matched_pattern: None,
        }
    }

    /// A deny decision caused by a specific pattern.
    pub fn deny_by(reason: ReasonCode, pattern: impl Into<String>) -> Self {
        Self {
            matched_pattern: Some(pattern.into()),
            ..Self::deny(reason)
        }
    }

    /// The timeout condition, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.conditions.iter().find_map(|c| match c {
            Condition::Timeout(d) => Some(*d),
            _ => None,
        })
    }

    /// The memory condition, if any.
    pub fn max_memory(&self) -> Option<u64> {
        self.conditions.iter().find_map(|c| match c {
            Condition::MaxMemory(m) => Some(*m),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_parse() {
        let r: Resource = "file:./src/lib.rs".parse().unwrap();
        assert_eq!(r, Resource::File("./src/lib.rs".into()));
        let r: Resource = "network:api.example.com:443".parse().unwrap();
        assert_eq!(r.id(), "api.example.com:443");
        assert!("disk:/dev/sda".parse::<Resource>().is_err());
        assert!("nothing".parse::<Resource>().is_err());
    }

    #[test]
    fn test_action_validation() {
        let file = Resource::File("a".into());
        assert!(file.validate_action(Action::Delete).is_ok());
        assert!(file.validate_action(Action::Connect).is_err());
        assert!(Resource::Shell("ls".into())
            .validate_action(Action::Read)
            .is_err());
        assert!(Resource::Llm("gpt".into())
            .validate_action(Action::Invoke)
            .is_ok());
    }

    #[test]
    fn test_reason_code_wire_format() {
        let json = serde_json::to_string(&ReasonCode::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_EXCEEDED\"");
        assert_eq!(ReasonCode::DangerousCommand.to_string(), "DANGEROUS_COMMAND");
    }

    #[test]
    fn test_decision_conditions() {
        let d = PermissionDecision::allow(
            "git *",
            vec![
                Condition::Timeout(Duration::from_secs(30)),
                Condition::MaxMemory(1024),
            ],
        );
        assert_eq!(d.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(d.max_memory(), Some(1024));
        assert!(PermissionDecision::deny(ReasonCode::NoPermissions)
            .timeout()
            .is_none());
    }
}
