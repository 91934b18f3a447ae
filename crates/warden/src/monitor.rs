//! Resource usage snapshots and limit evaluation.
//!
//! [`ResourceMonitor`] is a pure state machine: it receives samples and answers
//! what the supervisor must do. It never touches the process itself.
//!
//! | Mode | Entering breach | While breached | Leaving breach |
//! |------|-----------------|----------------|----------------|
//! | hard | kill | | |
//! | soft | throttle + warning | nothing | lift throttle |
//! | monitoring | informational event | nothing | re-armed |

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{EnforcementMode, ResourceKind, ResourceLimits};

/// Point-in-time usage of one sandboxed process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU in percent of one core since the previous sample.
    pub cpu_percent: f64,
    /// Resident memory.
    pub memory_bytes: u64,
    /// Read operations.
    pub disk_read_ops: u64,
    /// Write operations.
    pub disk_write_ops: u64,
    /// Bytes read from storage.
    pub disk_read_bytes: u64,
    /// Bytes written to storage.
    pub disk_write_bytes: u64,
    /// Bytes received.
    pub net_rx_bytes: u64,
    /// Bytes sent.
    pub net_tx_bytes: u64,
    /// Open network connections.
    pub connections: u64,
}

impl ResourceUsage {
    /// The value compared against the limit for `kind`.
    pub fn value(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpu_percent.max(0.0).round() as u64,
            ResourceKind::Memory => self.memory_bytes,
            ResourceKind::DiskIo => self.disk_read_bytes.saturating_add(self.disk_write_bytes),
            ResourceKind::Network => self.net_rx_bytes.saturating_add(self.net_tx_bytes),
            ResourceKind::Connections => self.connections,
        }
    }

    /// Keep the per-field maximum of `self` and `other`.
    pub fn merge_peak(&mut self, other: &ResourceUsage) {
        self.cpu_percent = self.cpu_percent.max(other.cpu_percent);
        self.memory_bytes = self.memory_bytes.max(other.memory_bytes);
        self.disk_read_ops = self.disk_read_ops.max(other.disk_read_ops);
        self.disk_write_ops = self.disk_write_ops.max(other.disk_write_ops);
        self.disk_read_bytes = self.disk_read_bytes.max(other.disk_read_bytes);
        self.disk_write_bytes = self.disk_write_bytes.max(other.disk_write_bytes);
        self.net_rx_bytes = self.net_rx_bytes.max(other.net_rx_bytes);
        self.net_tx_bytes = self.net_tx_bytes.max(other.net_tx_bytes);
        self.connections = self.connections.max(other.connections);
    }
}

/// A limit observed above its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breach {
    /// The resource.
    pub kind: ResourceKind,
    /// Its enforcement mode.
    pub mode: EnforcementMode,
    /// Sampled value.
    pub observed: u64,
    /// Configured ceiling.
    pub limit: u64,
}

/// What the supervisor must do after a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAction {
    /// Kill the process and terminate the instance.
    Kill(Breach),
    /// Reduce the allotted share and warn.
    Throttle(Breach),
    /// Usage fell back under a soft limit; restore the share.
    Release(ResourceKind),
    /// Record an informational event.
    Notify(Breach),
}

/// Compares samples against configured limits, remembering which are breached.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    limits: ResourceLimits,
    breached: BTreeSet<ResourceKind>,
}

impl ResourceMonitor {
    /// Monitor for `limits`.
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            breached: BTreeSet::new(),
        }
    }

    /// Resources currently above their limit.
    pub fn breached(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.breached.iter().copied()
    }

    /// The hard ceiling configured for `kind`, if any.
    pub fn hard_limit(&self, kind: ResourceKind) -> Option<u64> {
        self.limits
            .get(kind)
            .filter(|l| l.mode == EnforcementMode::Hard)
            .map(|l| l.max)
    }

    /// Evaluate one sample. A hard breach is returned alone.
    pub fn observe(&mut self, usage: &ResourceUsage) -> Vec<LimitAction> {
        let mut actions = Vec::new();

        for (kind, limit) in self.limits.iter() {
            let observed = usage.value(kind);
            let breach = Breach {
                kind,
                mode: limit.mode,
                observed,
                limit: limit.max,
            };

            if observed <= limit.max {
                if self.breached.remove(&kind) && limit.mode == EnforcementMode::Soft {
                    actions.push(LimitAction::Release(kind));
                }
                continue;
            }

            match limit.mode {
                EnforcementMode::Hard => return vec![LimitAction::Kill(breach)],
                EnforcementMode::Soft => {
                    if self.breached.insert(kind) {
                        actions.push(LimitAction::Throttle(breach));
                    }
                }
                EnforcementMode::Monitoring => {
                    if self.breached.insert(kind) {
                        actions.push(LimitAction::Notify(breach));
                    }
                }
            }
        }
        actions
    }
}
