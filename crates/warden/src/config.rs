//! Sandbox configuration.
//!
//! Everything here deserializes from YAML or JSON with defaults for omitted
//! fields, so external loaders can hand over parsed documents directly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Default interval between usage samples.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Network isolation requested for an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network at all.
    #[default]
    None,
    /// Only destinations the permission engine allows.
    Restricted,
    /// Shared host network.
    Bridge,
}

/// Filesystem isolation requested for an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemMode {
    /// Nothing writable.
    Readonly,
    /// Writable only where the permission engine allows.
    #[default]
    Restricted,
    /// Unrestricted host filesystem.
    Full,
}

/// A monitored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// CPU in percent of one core.
    Cpu,
    /// Resident memory in bytes.
    Memory,
    /// Disk bytes read plus written.
    DiskIo,
    /// Network bytes received plus sent.
    Network,
    /// Open network connections.
    Connections,
}

impl ResourceKind {
    /// Every kind, in sampling order.
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::DiskIo,
        ResourceKind::Network,
        ResourceKind::Connections,
    ];

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::DiskIo => "disk_io",
            ResourceKind::Network => "network",
            ResourceKind::Connections => "connections",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to a breached limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Kill the process and terminate the instance.
    #[default]
    Hard,
    /// Warn and throttle while over the limit.
    Soft,
    /// Record only.
    Monitoring,
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnforcementMode::Hard => "hard",
            EnforcementMode::Soft => "soft",
            EnforcementMode::Monitoring => "monitoring",
        })
    }
}

/// A ceiling on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Largest acceptable value, in the resource's unit.
    pub max: u64,
    /// What happens above it.
    #[serde(default)]
    pub mode: EnforcementMode,
}

impl ResourceLimit {
    /// Kill above `max`.
    pub fn hard(max: u64) -> Self {
        Self {
            max,
            mode: EnforcementMode::Hard,
        }
    }

    /// Throttle above `max`.
    pub fn soft(max: u64) -> Self {
        Self {
            max,
            mode: EnforcementMode::Soft,
        }
    }

    /// Record when above `max`.
    pub fn monitoring(max: u64) -> Self {
        Self {
            max,
            mode: EnforcementMode::Monitoring,
        }
    }
}

/// Per-resource limits. Unset resources are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU percent of one core.
    pub cpu: Option<ResourceLimit>,
    /// Resident bytes.
    pub memory: Option<ResourceLimit>,
    /// Disk bytes.
    pub disk_io: Option<ResourceLimit>,
    /// Network bytes.
    pub network: Option<ResourceLimit>,
    /// Open connections.
    pub connections: Option<ResourceLimit>,
}

impl ResourceLimits {
    /// The limit for `kind`.
    pub fn get(&self, kind: ResourceKind) -> Option<ResourceLimit> {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::DiskIo => self.disk_io,
            ResourceKind::Network => self.network,
            ResourceKind::Connections => self.connections,
        }
    }

    fn slot(&mut self, kind: ResourceKind) -> &mut Option<ResourceLimit> {
        match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Memory => &mut self.memory,
            ResourceKind::DiskIo => &mut self.disk_io,
            ResourceKind::Network => &mut self.network,
            ResourceKind::Connections => &mut self.connections,
        }
    }

    /// Set the limit for `kind`.
    pub fn with(mut self, kind: ResourceKind, limit: ResourceLimit) -> Self {
        *self.slot(kind) = Some(limit);
        self
    }

    /// Set the limit for `kind` only when none is configured.
    pub fn or_insert(&mut self, kind: ResourceKind, limit: ResourceLimit) {
        self.slot(kind).get_or_insert(limit);
    }

    /// Configured limits in [`ResourceKind::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, ResourceLimit)> + '_ {
        ResourceKind::ALL
            .into_iter()
            .filter_map(|k| self.get(k).map(|l| (k, l)))
    }
}

/// Isolation and limits for one agent's sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Network isolation.
    pub network: NetworkMode,
    /// Filesystem isolation.
    pub filesystem: FilesystemMode,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Interval between usage samples.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Working directory of the executed command.
    pub work_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Refuse to run when the backend cannot enforce the requested modes.
    pub require_enforced_isolation: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network: NetworkMode::default(),
            filesystem: FilesystemMode::default(),
            limits: ResourceLimits::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            work_dir: None,
            env: BTreeMap::new(),
            require_enforced_isolation: false,
        }
    }
}

impl SandboxConfig {
    /// Reject configurations that cannot be enforced meaningfully.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(WardenError::Validation(
                "poll interval must be greater than zero".into(),
            ));
        }
        if let Some((kind, _)) = self.limits.iter().find(|(_, l)| l.max == 0) {
            return Err(WardenError::Validation(format!(
                "{kind} limit must be greater than zero"
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.network, NetworkMode::None);
        assert_eq!(config.filesystem, FilesystemMode::Restricted);
        assert!(config.limits.iter().next().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
network: restricted
filesystem: readonly
poll_interval_ms: 250
limits:
  memory: { max: 536870912 }
  cpu: { max: 150, mode: soft }
  connections: { max: 8, mode: monitoring }
env:
  RUST_LOG: info
"#;
        let config: SandboxConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network, NetworkMode::Restricted);
        assert_eq!(config.filesystem, FilesystemMode::Readonly);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.limits.memory, Some(ResourceLimit::hard(512 * 1024 * 1024)));
        assert_eq!(config.limits.cpu, Some(ResourceLimit::soft(150)));

        let kinds: Vec<_> = config.limits.iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![ResourceKind::Cpu, ResourceKind::Memory, ResourceKind::Connections]
        );
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = SandboxConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SandboxConfig {
            limits: ResourceLimits::default().with(ResourceKind::Memory, ResourceLimit::hard(0)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_or_insert_keeps_configured() {
        let mut limits = ResourceLimits::default().with(ResourceKind::Memory, ResourceLimit::soft(10));
        limits.or_insert(ResourceKind::Memory, ResourceLimit::hard(5));
        limits.or_insert(ResourceKind::Cpu, ResourceLimit::hard(50));
        assert_eq!(limits.memory, Some(ResourceLimit::soft(10)));
        assert_eq!(limits.cpu, Some(ResourceLimit::hard(50)));
    }
}
