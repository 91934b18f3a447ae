//! Isolation backends.
//!
//! A backend owns the kernel-side resources of one sandbox instance: it sets
//! them up before the process starts, places the process inside, samples its
//! usage, applies throttles and tears everything down afterwards.
//!
//! - [`ProcessBackend`]: plain child process, usage read from `/proc/<pid>`.
//! - [`CgroupBackend`]: one cgroup v2 directory per instance; hard memory
//!   ceilings are enforced by the kernel OOM killer and throttles adjust
//!   `cpu.weight` and `memory.high`. Hard CPU limits stay with the poller,
//!   since `cpu.max` would only cap the process and never end it.
//!
//! Neither backend creates namespaces, so both report only the `bridge`
//! network mode and the `full` filesystem mode as enforced.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{EnforcementMode, FilesystemMode, NetworkMode, ResourceKind, SandboxConfig};
use crate::error::{Result, WardenError};
use crate::monitor::{Breach, ResourceUsage};

/// What a backend can enforce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Backend name.
    pub name: String,
    /// Network modes the backend enforces.
    pub network_modes: Vec<NetworkMode>,
    /// Filesystem modes the backend enforces.
    pub filesystem_modes: Vec<FilesystemMode>,
    /// Resources whose hard limits the kernel enforces independently of polling.
    pub enforced_limits: Vec<ResourceKind>,
    /// Resources the backend can throttle.
    pub throttle: Vec<ResourceKind>,
}

impl BackendCapabilities {
    /// Whether the requested isolation modes are enforced.
    pub fn check(&self, config: &SandboxConfig) -> std::result::Result<(), String> {
        if !self.network_modes.contains(&config.network) {
            return Err(format!(
                "backend '{}' cannot enforce network mode {:?}",
                self.name, config.network
            ));
        }
        if !self.filesystem_modes.contains(&config.filesystem) {
            return Err(format!(
                "backend '{}' cannot enforce filesystem mode {:?}",
                self.name, config.filesystem
            ));
        }
        Ok(())
    }
}

/// Backend state for one live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationHandle {
    /// Unique instance id.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Process placed inside, once attached.
    pub pid: Option<u32>,
    /// Control directory, for backends that have one.
    pub path: Option<PathBuf>,
}

impl IsolationHandle {
    /// A fresh handle for `agent_id`.
    pub fn new(agent_id: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}", sanitize(agent_id), &id[..12]),
            agent_id: agent_id.to_string(),
            pid: None,
            path: None,
        }
    }

    fn pid(&self) -> Result<u32> {
        self.pid
            .ok_or_else(|| WardenError::Validation(format!("instance {} has no process", self.id)))
    }
}

fn sanitize(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Kernel-side isolation for sandbox instances.
#[async_trait]
pub trait IsolationBackend: Send + Sync + fmt::Debug {
    /// What this backend enforces.
    fn capabilities(&self) -> BackendCapabilities;

    /// Allocate isolation for a new instance. On error nothing is left behind.
    async fn setup(&self, agent_id: &str, config: &SandboxConfig) -> Result<IsolationHandle>;

    /// Place a started process inside the instance.
    async fn attach(&self, handle: &mut IsolationHandle, pid: u32) -> Result<()>;

    /// Current usage of the instance.
    async fn sample(&self, handle: &IsolationHandle) -> Result<ResourceUsage>;

    /// Reduce the instance's share of a soft-limited resource.
    async fn throttle(&self, _handle: &IsolationHandle, _breach: &Breach) -> Result<()> {
        Ok(())
    }

    /// Restore the share reduced by [`IsolationBackend::throttle`].
    async fn release(&self, _handle: &IsolationHandle, _kind: ResourceKind) -> Result<()> {
        Ok(())
    }

    /// After the process died on its own: the resource whose kernel-enforced
    /// ceiling killed it, with the highest usage the kernel recorded.
    async fn enforced_kill(&self, _handle: &IsolationHandle) -> Result<Option<(ResourceKind, u64)>> {
        Ok(None)
    }

    /// Free everything `setup` allocated.
    async fn teardown(&self, handle: IsolationHandle) -> Result<()>;
}

/// Converts cumulative CPU time into percent of one core between samples.
#[derive(Debug, Default)]
struct CpuTracker {
    last: Mutex<HashMap<String, (u64, Instant)>>,
}

impl CpuTracker {
    fn percent(&self, id: &str, cpu_micros: u64) -> f64 {
        let now = Instant::now();
        let prev = self.last.lock().insert(id.to_string(), (cpu_micros, now));
        match prev {
            Some((before, at)) => {
                let wall = now.duration_since(at).as_micros() as f64;
                if wall <= 0.0 {
                    return 0.0;
                }
                cpu_micros.saturating_sub(before) as f64 / wall * 100.0
            }
            None => 0.0,
        }
    }

    fn forget(&self, id: &str) {
        self.last.lock().remove(id);
    }
}

// ============================================================================
// /proc parsing
// ============================================================================

/// Clock ticks per second used by `/proc/<pid>/stat`.
const USER_HZ: u64 = 100;

fn parse_status_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

fn parse_stat_cpu_micros(stat: &str) -> Option<u64> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1_000_000 / USER_HZ)
}

fn parse_proc_io(io: &str, usage: &mut ResourceUsage) {
    for line in io.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key {
            "syscr" => usage.disk_read_ops = value,
            "syscw" => usage.disk_write_ops = value,
            "read_bytes" => usage.disk_read_bytes = value,
            "write_bytes" => usage.disk_write_bytes = value,
            _ => {}
        }
    }
}

fn parse_cpu_stat_micros(cpu_stat: &str) -> Option<u64> {
    cpu_stat
        .lines()
        .find_map(|l| l.strip_prefix("usage_usec "))
        .and_then(|v| v.trim().parse().ok())
}

fn parse_io_stat(io_stat: &str, usage: &mut ResourceUsage) {
    for line in io_stat.lines() {
        for field in line.split_whitespace().skip(1) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "rbytes" => usage.disk_read_bytes += value,
                "wbytes" => usage.disk_write_bytes += value,
                "rios" => usage.disk_read_ops += value,
                "wios" => usage.disk_write_ops += value,
                _ => {}
            }
        }
    }
}

fn parse_oom_kills(memory_events: &str) -> u64 {
    memory_events
        .lines()
        .find_map(|l| l.strip_prefix("oom_kill "))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

async fn count_sockets(pid: u32) -> Result<u64> {
    let mut entries = tokio::fs::read_dir(format!("/proc/{pid}/fd")).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if let Ok(target) = tokio::fs::read_link(entry.path()).await {
            if target.to_string_lossy().starts_with("socket:") {
                count += 1;
            }
        }
    }
    Ok(count)
}

// ============================================================================
// ProcessBackend
// ============================================================================

/// Plain child processes, sampled from `/proc`.
///
/// Limits are enforced only by polling and nothing can be throttled. Network
/// byte counters are not attributed per process and stay zero; open sockets
/// are counted as connections.
#[derive(Debug, Default)]
pub struct ProcessBackend {
    cpu: CpuTracker,
}

impl ProcessBackend {
    /// New backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "process".into(),
            network_modes: vec![NetworkMode::Bridge],
            filesystem_modes: vec![FilesystemMode::Full],
            enforced_limits: vec![],
            throttle: vec![],
        }
    }

    async fn setup(&self, agent_id: &str, _config: &SandboxConfig) -> Result<IsolationHandle> {
        Ok(IsolationHandle::new(agent_id))
    }

    async fn attach(&self, handle: &mut IsolationHandle, pid: u32) -> Result<()> {
        handle.pid = Some(pid);
        Ok(())
    }

    async fn sample(&self, handle: &IsolationHandle) -> Result<ResourceUsage> {
        let pid = handle.pid()?;
        if !cfg!(target_os = "linux") {
            return Err(WardenError::Validation(
                "process sampling requires /proc".into(),
            ));
        }

        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await?;
        let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;

        let mut usage = ResourceUsage {
            memory_bytes: parse_status_rss(&status).unwrap_or(0),
            ..Default::default()
        };
        if let Some(micros) = parse_stat_cpu_micros(&stat) {
            usage.cpu_percent = self.cpu.percent(&handle.id, micros);
        }
        // io counters need ptrace access; missing is not an error
        if let Ok(io) = tokio::fs::read_to_string(format!("/proc/{pid}/io")).await {
            parse_proc_io(&io, &mut usage);
        }
        usage.connections = count_sockets(pid).await.unwrap_or(0);
        Ok(usage)
    }

    async fn teardown(&self, handle: IsolationHandle) -> Result<()> {
        self.cpu.forget(&handle.id);
        Ok(())
    }
}

// ============================================================================
// CgroupBackend
// ============================================================================

const CPU_WEIGHT_DEFAULT: &str = "100";
const CPU_WEIGHT_THROTTLED: &str = "1";

/// One cgroup v2 directory per instance under a delegated root.
#[derive(Debug)]
pub struct CgroupBackend {
    root: PathBuf,
    cpu: CpuTracker,
}

impl CgroupBackend {
    /// Backend creating instance groups under `root` (for example
    /// `/sys/fs/cgroup/warden`). The root must be delegated to this process.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cpu: CpuTracker::default(),
        }
    }

    /// The delegated root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir<'a>(&self, handle: &'a IsolationHandle) -> Result<&'a Path> {
        handle
            .path
            .as_deref()
            .ok_or_else(|| WardenError::Validation(format!("instance {} has no cgroup", handle.id)))
    }

    async fn write_limits(&self, dir: &Path, config: &SandboxConfig) -> Result<()> {
        for (kind, limit) in config.limits.iter() {
            if limit.mode != EnforcementMode::Hard {
                continue;
            }
            if kind == ResourceKind::Memory {
                write(dir, "memory.max", &limit.max.to_string()).await?;
                write(dir, "memory.oom.group", "1").await?;
            }
        }
        Ok(())
    }
}

async fn write(dir: &Path, file: &str, value: &str) -> Result<()> {
    tokio::fs::write(dir.join(file), value.as_bytes()).await?;
    Ok(())
}

async fn read(dir: &Path, file: &str) -> Result<String> {
    Ok(tokio::fs::read_to_string(dir.join(file)).await?)
}

fn procs_file(dir: &Path) -> PathBuf {
    let procs = dir.join("cgroup.procs");
    if procs.exists() {
        return procs;
    }
    dir.join("tasks")
}

#[async_trait]
impl IsolationBackend for CgroupBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "cgroup".into(),
            network_modes: vec![NetworkMode::Bridge],
            filesystem_modes: vec![FilesystemMode::Full],
            enforced_limits: vec![ResourceKind::Memory],
            throttle: vec![ResourceKind::Cpu, ResourceKind::Memory],
        }
    }

    async fn setup(&self, agent_id: &str, config: &SandboxConfig) -> Result<IsolationHandle> {
        let mut handle = IsolationHandle::new(agent_id);
        let dir = self.root.join(&handle.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WardenError::setup_failed(agent_id, format!("{}: {e}", dir.display())))?;

        if let Err(e) = self.write_limits(&dir, config).await {
            let _ = remove_group(&dir).await;
            return Err(WardenError::setup_failed(agent_id, e.to_string()));
        }

        tracing::debug!(agent_id, cgroup = %dir.display(), "cgroup created");
        handle.path = Some(dir);
        Ok(handle)
    }

    async fn attach(&self, handle: &mut IsolationHandle, pid: u32) -> Result<()> {
        let dir = self.dir(handle)?;
        tokio::fs::write(procs_file(dir), pid.to_string()).await?;
        handle.pid = Some(pid);
        Ok(())
    }

    async fn sample(&self, handle: &IsolationHandle) -> Result<ResourceUsage> {
        let dir = self.dir(handle)?;
        let mut usage = ResourceUsage {
            memory_bytes: read(dir, "memory.current").await?.trim().parse().unwrap_or(0),
            ..Default::default()
        };
        if let Some(micros) = parse_cpu_stat_micros(&read(dir, "cpu.stat").await?) {
            usage.cpu_percent = self.cpu.percent(&handle.id, micros);
        }
        if let Ok(io) = read(dir, "io.stat").await {
            parse_io_stat(&io, &mut usage);
        }
        if let Some(pid) = handle.pid {
            usage.connections = count_sockets(pid).await.unwrap_or(0);
        }
        Ok(usage)
    }

    async fn throttle(&self, handle: &IsolationHandle, breach: &Breach) -> Result<()> {
        let dir = self.dir(handle)?;
        match breach.kind {
            ResourceKind::Cpu => write(dir, "cpu.weight", CPU_WEIGHT_THROTTLED).await,
            ResourceKind::Memory => write(dir, "memory.high", &breach.limit.to_string()).await,
            _ => Ok(()),
        }
    }

    async fn release(&self, handle: &IsolationHandle, kind: ResourceKind) -> Result<()> {
        let dir = self.dir(handle)?;
        match kind {
            ResourceKind::Cpu => write(dir, "cpu.weight", CPU_WEIGHT_DEFAULT).await,
            ResourceKind::Memory => write(dir, "memory.high", "max").await,
            _ => Ok(()),
        }
    }

    async fn enforced_kill(&self, handle: &IsolationHandle) -> Result<Option<(ResourceKind, u64)>> {
        let dir = self.dir(handle)?;
        let events = match read(dir, "memory.events").await {
            Ok(events) => events,
            Err(WardenError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if parse_oom_kills(&events) == 0 {
            return Ok(None);
        }
        // memory.peak needs a 5.19+ kernel
        let peak = match read(dir, "memory.peak").await {
            Ok(peak) => peak.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };
        Ok(Some((ResourceKind::Memory, peak)))
    }

    async fn teardown(&self, handle: IsolationHandle) -> Result<()> {
        self.cpu.forget(&handle.id);
        if let Some(dir) = &handle.path {
            remove_group(dir).await?;
            tracing::debug!(agent_id = %handle.agent_id, cgroup = %dir.display(), "cgroup removed");
        }
        Ok(())
    }
}

async fn remove_group(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        // outside cgroupfs the control files are ordinary files
        Err(_) => Ok(tokio::fs::remove_dir_all(dir).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceLimit, ResourceLimits};

    #[test]
    fn test_parse_status_rss() {
        let status = "Name:\tsleep\nVmPeak:\t  8000 kB\nVmRSS:\t  1024 kB\nThreads:\t1\n";
        assert_eq!(parse_status_rss(status), Some(1024 * 1024));
        assert_eq!(parse_status_rss("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn test_parse_stat_with_odd_comm() {
        let stat = "4242 (my (weird) prog) S 1 4242 4242 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0 1000 1000 100";
        // (250 + 50) ticks at 100 Hz = 3 s
        assert_eq!(parse_stat_cpu_micros(stat), Some(3_000_000));
        assert_eq!(parse_stat_cpu_micros("garbage"), None);
    }

    #[test]
    fn test_parse_io() {
        let mut usage = ResourceUsage::default();
        parse_proc_io(
            "rchar: 10\nwchar: 20\nsyscr: 3\nsyscw: 4\nread_bytes: 4096\nwrite_bytes: 8192\n",
            &mut usage,
        );
        assert_eq!(usage.disk_read_ops, 3);
        assert_eq!(usage.disk_write_bytes, 8192);

        let mut usage = ResourceUsage::default();
        parse_io_stat(
            "8:0 rbytes=100 wbytes=200 rios=1 wios=2 dbytes=0 dios=0\n259:0 rbytes=1 wbytes=2 rios=3 wios=4\n",
            &mut usage,
        );
        assert_eq!(usage.disk_read_bytes, 101);
        assert_eq!(usage.disk_write_ops, 6);
        assert_eq!(parse_cpu_stat_micros("usage_usec 1500\nuser_usec 1000\n"), Some(1500));
    }

    #[test]
    fn test_capabilities_check() {
        let caps = ProcessBackend::new().capabilities();
        assert!(caps.check(&SandboxConfig::default()).is_err());
        let bridge = SandboxConfig {
            network: NetworkMode::Bridge,
            filesystem: FilesystemMode::Full,
            ..Default::default()
        };
        assert!(caps.check(&bridge).is_ok());
    }

    #[test]
    fn test_handle_ids_are_unique_and_safe() {
        let a = IsolationHandle::new("team/agent 1");
        let b = IsolationHandle::new("team/agent 1");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("team_agent_1-"));
    }

    #[tokio::test]
    async fn test_cgroup_lifecycle_on_plain_directory() {
        let root = tempfile::tempdir().unwrap();
        let backend = CgroupBackend::new(root.path());
        let config = SandboxConfig {
            limits: ResourceLimits::default()
                .with(ResourceKind::Cpu, ResourceLimit::hard(50))
                .with(ResourceKind::Memory, ResourceLimit::hard(64 * 1024 * 1024))
                .with(ResourceKind::DiskIo, ResourceLimit::soft(1024)),
            ..Default::default()
        };

        let mut handle = backend.setup("a1", &config).await.unwrap();
        let dir = handle.path.clone().unwrap();
        assert!(!dir.join("cpu.max").exists());
        assert_eq!(std::fs::read_to_string(dir.join("memory.max")).unwrap(), "67108864");
        assert_eq!(std::fs::read_to_string(dir.join("memory.oom.group")).unwrap(), "1");

        std::fs::write(dir.join("cgroup.procs"), "").unwrap();
        backend.attach(&mut handle, 4242).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("cgroup.procs")).unwrap(), "4242");

        std::fs::write(dir.join("memory.current"), "1048576\n").unwrap();
        std::fs::write(dir.join("cpu.stat"), "usage_usec 500\n").unwrap();
        std::fs::write(dir.join("io.stat"), "8:0 rbytes=10 wbytes=20 rios=1 wios=1\n").unwrap();
        let usage = backend.sample(&handle).await.unwrap();
        assert_eq!(usage.memory_bytes, 1024 * 1024);
        assert_eq!(usage.value(ResourceKind::DiskIo), 30);

        let breach = Breach {
            kind: ResourceKind::Memory,
            mode: EnforcementMode::Soft,
            observed: 2048,
            limit: 1024,
        };
        backend.throttle(&handle, &breach).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("memory.high")).unwrap(), "1024");
        backend.release(&handle, ResourceKind::Memory).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("memory.high")).unwrap(), "max");

        assert_eq!(backend.enforced_kill(&handle).await.unwrap(), None);
        std::fs::write(dir.join("memory.events"), "low 0\nhigh 0\nmax 3\noom 1\noom_kill 0\n").unwrap();
        assert_eq!(backend.enforced_kill(&handle).await.unwrap(), None);
        std::fs::write(dir.join("memory.events"), "low 0\nhigh 0\nmax 9\noom 1\noom_kill 1\n").unwrap();
        std::fs::write(dir.join("memory.peak"), "67112960\n").unwrap();
        assert_eq!(
            backend.enforced_kill(&handle).await.unwrap(),
            Some((ResourceKind::Memory, 67_112_960))
        );

        backend.teardown(handle).await.unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_parse_oom_kills() {
        assert_eq!(parse_oom_kills("low 0\nhigh 2\nmax 5\noom 2\noom_kill 2\noom_group_kill 1\n"), 2);
        assert_eq!(parse_oom_kills("oom_group_kill 1\n"), 0);
        assert_eq!(parse_oom_kills(""), 0);
    }

    #[tokio::test]
    async fn test_cgroup_setup_failure_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let backend = CgroupBackend::new(&blocker);
        let err = backend.setup("a1", &SandboxConfig::default()).await.unwrap_err();
        assert!(matches!(err, WardenError::SandboxUnavailable { .. }));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }
}
