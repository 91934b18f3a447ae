//! Per-agent permission sets.
//!
//! An [`AgentPermissionSet`] is plain data supplied by a configuration loader.
//! The engine compiles it once into [`CompiledPermissions`] when it is
//! registered, so evaluation never parses patterns.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::command::CommandMatcher;
use crate::error::GuardError;
use crate::pattern::{PatternKind, PatternSet};

/// Filesystem permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemPermissions {
    /// Readable path patterns.
    pub read: Vec<String>,
    /// Writable path patterns.
    pub write: Vec<String>,
    /// Executable path patterns.
    pub execute: Vec<String>,
    /// Deletable path patterns.
    pub delete: Vec<String>,
    /// Paths denied for every action.
    pub blocked: Vec<String>,
    /// Largest write in bytes.
    pub max_file_size: Option<u64>,
    /// Extensions writes may target (without the dot). Empty means any.
    pub allowed_extensions: Vec<String>,
    /// File operations per minute.
    pub requests_per_minute: Option<u32>,
}

/// Network permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPermissions {
    /// Host patterns that may be contacted.
    pub allowed_hosts: Vec<String>,
    /// Host patterns that may never be contacted.
    pub blocked_hosts: Vec<String>,
    /// Permitted ports. Empty means any.
    pub allowed_ports: Vec<u16>,
    /// Permitted protocols. Empty means any.
    pub protocols: Vec<String>,
    /// Connections per minute.
    pub requests_per_minute: Option<u32>,
}

/// Shell permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellPermissions {
    /// Command patterns that may run.
    pub allowed_commands: Vec<String>,
    /// Command patterns that may never run.
    pub blocked_commands: Vec<String>,
    /// Interpreters that may be invoked. Empty means none.
    pub allowed_interpreters: Vec<String>,
    /// Wall-clock limit per command, in seconds.
    pub max_execution_time_secs: Option<u64>,
    /// Memory limit per command, in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Commands per minute.
    pub requests_per_minute: Option<u32>,
}

/// Model invocation permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmPermissions {
    /// Largest token count per request.
    pub max_tokens_per_request: Option<u64>,
    /// Requests per rolling hour.
    pub max_requests_per_hour: Option<u32>,
    /// Model name patterns that may be invoked.
    pub allowed_models: Vec<String>,
    /// Model name patterns that may never be invoked.
    pub blocked_models: Vec<String>,
}

/// Data classification level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Public data.
    Public,
    /// Internal data.
    #[default]
    Internal,
    /// Confidential data.
    Confidential,
    /// Restricted data.
    Restricted,
}

/// Data handling permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPermissions {
    /// Treat every request from this agent as touching personal data.
    pub pii_detection: bool,
    /// Highest classification the agent handles.
    pub classification: Classification,
    /// Audit details for this agent must be encrypted at rest.
    pub encryption_required: bool,
}

/// Everything one agent may do. Replaced wholesale on update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPermissionSet {
    /// Filesystem access.
    pub filesystem: FilesystemPermissions,
    /// Network access.
    pub network: NetworkPermissions,
    /// Shell access.
    pub shell: ShellPermissions,
    /// Model access.
    pub llm: LlmPermissions,
    /// Data handling.
    pub data: DataPermissions,
}

fn default_blocked_paths() -> Vec<String> {
    [
        "**/.env",
        "**/.env.*",
        "**/.git/**",
        "**/.ssh/**",
        "**/*.pem",
        "**/*.key",
        "**/id_rsa*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_blocked_commands() -> Vec<String> {
    [
        "rm -rf *", "sudo", "chmod *", "chown *", "mkfs*", "dd if=*", "eval *", "curl * | sh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn under(root: &str, suffix: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() || root == "." {
        suffix.to_string()
    } else {
        format!("{root}/{suffix}")
    }
}

impl AgentPermissionSet {
    /// Read anything under `root`, write nothing, no shell or network.
    pub fn read_only(root: &str) -> Self {
        Self {
            filesystem: FilesystemPermissions {
                read: vec![under(root, "**")],
                blocked: default_blocked_paths(),
                requests_per_minute: Some(600),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Read and write under `root`, common build and VCS commands.
    pub fn developer(root: &str) -> Self {
        Self {
            filesystem: FilesystemPermissions {
                read: vec![under(root, "**")],
                write: vec![under(root, "**")],
                execute: vec![],
                delete: vec![under(root, "tmp/**")],
                blocked: default_blocked_paths(),
                max_file_size: Some(10 * 1024 * 1024),
                allowed_extensions: vec![],
                requests_per_minute: Some(600),
            },
            network: NetworkPermissions {
                allowed_hosts: vec![
                    "crates.io".into(),
                    "*.crates.io".into(),
                    "github.com".into(),
                    "*.github.com".into(),
                ],
                blocked_hosts: vec!["169.254.169.254".into(), "metadata.google.internal".into()],
                allowed_ports: vec![443],
                protocols: vec!["https".into()],
                requests_per_minute: Some(60),
            },
            shell: ShellPermissions {
                allowed_commands: vec![
                    "cargo build".into(),
                    "cargo test".into(),
                    "cargo check".into(),
                    "cargo clippy".into(),
                    "cargo fmt".into(),
                    "git status".into(),
                    "git diff".into(),
                    "git log".into(),
                    "ls".into(),
                    "cat *".into(),
                ],
                blocked_commands: default_blocked_commands(),
                allowed_interpreters: vec![],
                max_execution_time_secs: Some(300),
                max_memory_bytes: Some(2 * 1024 * 1024 * 1024),
                requests_per_minute: Some(30),
            },
            llm: LlmPermissions {
                max_tokens_per_request: Some(8192),
                max_requests_per_hour: Some(100),
                allowed_models: vec!["*".into()],
                blocked_models: vec![],
            },
            data: DataPermissions::default(),
        }
    }

    /// Nothing is allowed; only the block lists are populated.
    pub fn restricted() -> Self {
        Self {
            filesystem: FilesystemPermissions {
                blocked: default_blocked_paths(),
                ..Default::default()
            },
            shell: ShellPermissions {
                blocked_commands: default_blocked_commands(),
                ..Default::default()
            },
            data: DataPermissions {
                pii_detection: true,
                classification: Classification::Restricted,
                encryption_required: true,
            },
            ..Default::default()
        }
    }
}

/// A permission set with every pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledPermissions {
    /// The source set, kept for inspection.
    pub source: AgentPermissionSet,
    pub(crate) fs_read: PatternSet,
    pub(crate) fs_write: PatternSet,
    pub(crate) fs_execute: PatternSet,
    pub(crate) fs_delete: PatternSet,
    pub(crate) fs_blocked: PatternSet,
    pub(crate) extensions: BTreeSet<String>,
    pub(crate) hosts_allowed: PatternSet,
    pub(crate) hosts_blocked: PatternSet,
    pub(crate) protocols: BTreeSet<String>,
    pub(crate) commands: CommandMatcher,
    pub(crate) models_allowed: PatternSet,
    pub(crate) models_blocked: PatternSet,
}

impl CompiledPermissions {
    /// Compile every pattern list, failing on the first invalid pattern.
    pub fn compile(source: AgentPermissionSet) -> Result<Self, GuardError> {
        let fs = &source.filesystem;
        let net = &source.network;
        let shell = &source.shell;
        let llm = &source.llm;

        Ok(Self {
            fs_read: PatternSet::compile(&fs.read, PatternKind::Path)?,
            fs_write: PatternSet::compile(&fs.write, PatternKind::Path)?,
            fs_execute: PatternSet::compile(&fs.execute, PatternKind::Path)?,
            fs_delete: PatternSet::compile(&fs.delete, PatternKind::Path)?,
            fs_blocked: PatternSet::compile(&fs.blocked, PatternKind::Path)?,
            extensions: fs
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            hosts_allowed: PatternSet::compile(&net.allowed_hosts, PatternKind::Host)?,
            hosts_blocked: PatternSet::compile(&net.blocked_hosts, PatternKind::Host)?,
            protocols: net.protocols.iter().map(|p| p.to_ascii_lowercase()).collect(),
            commands: CommandMatcher::new(
                &shell.allowed_commands,
                &shell.blocked_commands,
                &shell.allowed_interpreters,
            )?,
            // Model names are matched like commands: no separator.
            models_allowed: PatternSet::compile(&llm.allowed_models, PatternKind::Command)?,
            models_blocked: PatternSet::compile(&llm.blocked_models, PatternKind::Command)?,
            source,
        })
    }
}
