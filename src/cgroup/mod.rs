//! Cgroup adapter: one interface over the legacy per-controller hierarchies (v1)
//! and the unified hierarchy (v2).
//!
//! The backend is picked once by [`detect`]; callers only see [`CgroupBackend`]
//! and the backend-independent [`Scope`] handle.

pub mod probe;
pub mod v1;
pub mod v2;

use crate::config::ExecutorConfig;
use crate::types::{BenchError, Result};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Prefix of every scope directory created by this crate
pub const SCOPE_PREFIX: &str = "benchmark_";

/// Resource controllers the adapter knows about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Controller {
    /// CPU time accounting
    Cpu,
    Cpuset,
    Memory,
    Freezer,
    /// Block I/O accounting
    Io,
    Pids,
}

impl Controller {
    pub const ALL: [Controller; 6] = [
        Controller::Cpu,
        Controller::Cpuset,
        Controller::Memory,
        Controller::Freezer,
        Controller::Io,
        Controller::Pids,
    ];

    /// Name of the hierarchy in cgroup v1
    pub fn v1_name(self) -> &'static str {
        match self {
            Controller::Cpu => "cpuacct",
            Controller::Cpuset => "cpuset",
            Controller::Memory => "memory",
            Controller::Freezer => "freezer",
            Controller::Io => "blkio",
            Controller::Pids => "pids",
        }
    }

    /// Name in `cgroup.controllers` of cgroup v2, if it is a real controller there
    pub fn v2_name(self) -> Option<&'static str> {
        match self {
            Controller::Cpu => Some("cpu"),
            Controller::Cpuset => Some("cpuset"),
            Controller::Memory => Some("memory"),
            Controller::Freezer => None,
            Controller::Io => Some("io"),
            Controller::Pids => Some("pids"),
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.v1_name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => f.write_str("v1"),
            CgroupVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Kernel-side accounting unit of one run
#[derive(Clone, Debug)]
pub struct Scope {
    name: String,
    version: CgroupVersion,
    paths: BTreeMap<Controller, PathBuf>,
    created_at: DateTime<Local>,
}

impl Scope {
    pub(crate) fn new(
        name: String,
        version: CgroupVersion,
        paths: BTreeMap<Controller, PathBuf>,
    ) -> Self {
        Self {
            name,
            version,
            paths,
            created_at: Local::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn has(&self, controller: Controller) -> bool {
        self.paths.contains_key(&controller)
    }

    pub fn path(&self, controller: Controller) -> Option<&Path> {
        self.paths.get(&controller).map(PathBuf::as_path)
    }

    /// Distinct directories backing this scope (one for v2)
    pub fn dirs(&self) -> Vec<&Path> {
        let unique: BTreeSet<&Path> = self.paths.values().map(PathBuf::as_path).collect();
        unique.into_iter().collect()
    }

    pub fn controllers(&self) -> impl Iterator<Item = Controller> + '_ {
        self.paths.keys().copied()
    }
}

/// Counters of a scope at one point in time
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Usage {
    /// CPU time in seconds
    pub cpu_time: Option<f64>,
    pub cpu_time_per_core: BTreeMap<usize, f64>,
    pub memory_current: Option<u64>,
    pub memory_peak: Option<u64>,
    pub io_read_bytes: Option<u64>,
    pub io_write_bytes: Option<u64>,
}

/// A limit that can be written to a scope
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceLimit {
    Memory(u64),
    Cores(BTreeSet<usize>),
    MemoryNodes(BTreeSet<usize>),
    Processes(u64),
}

impl ResourceLimit {
    pub fn controller(&self) -> Controller {
        match self {
            ResourceLimit::Memory(_) => Controller::Memory,
            ResourceLimit::Cores(_) | ResourceLimit::MemoryNodes(_) => Controller::Cpuset,
            ResourceLimit::Processes(_) => Controller::Pids,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitOutcome {
    Applied,
    Unsupported(String),
}

/// Bounded retry for removing cgroup directories
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            attempts: config.rmdir_attempts,
            backoff: config.rmdir_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&ExecutorConfig::default())
    }
}

/// Operations every cgroup backend provides
pub trait CgroupBackend: Send + Sync + fmt::Debug {
    fn version(&self) -> CgroupVersion;

    /// Controllers that new scopes will get
    fn controllers(&self) -> &BTreeSet<Controller>;

    /// Degradations found while probing
    fn degradations(&self) -> &[String];

    fn create_scope(&self) -> Result<Scope>;

    /// Move a process into the scope
    fn enter(&self, scope: &Scope, pid: Pid) -> Result<()>;

    /// Files a process writes "0" into to enter the scope itself
    fn membership_files(&self, scope: &Scope) -> Vec<PathBuf>;

    fn set_limit(&self, scope: &Scope, limit: &ResourceLimit) -> Result<LimitOutcome>;

    /// Cumulative CPU time in seconds, if accounted
    fn read_cpu_time(&self, scope: &Scope) -> Result<Option<f64>>;

    fn read_usage(&self, scope: &Scope) -> Result<Usage>;

    /// Number of processes killed by the kernel OOM killer in this scope
    fn oom_kill_count(&self, scope: &Scope) -> Result<u64>;

    /// Cores and memory nodes usable by scopes of this backend
    fn allowed_cpus(&self) -> Result<BTreeSet<usize>>;
    fn allowed_memory_nodes(&self) -> Result<BTreeSet<usize>>;

    /// All processes in the scope including child cgroups
    fn tasks(&self, scope: &Scope) -> Result<Vec<Pid>>;

    /// Kill everything via the kernel's atomic primitive; `false` if unavailable
    fn kill_atomically(&self, scope: &Scope) -> Result<bool>;

    /// Freeze or thaw the scope; `false` if there is no freezer
    fn set_frozen(&self, scope: &Scope, frozen: bool) -> Result<bool>;

    fn destroy_scope(&self, scope: &Scope) -> Result<()>;
}

/// Probe the system and pick the matching backend
pub fn detect(config: &ExecutorConfig) -> Result<Arc<dyn CgroupBackend>> {
    let mounts = probe::read_mounts(config.cgroup_root.as_deref())?;
    let own = probe::read_own_cgroups()?;
    let policy = RetryPolicy::from(config);

    match probe::select_version(&mounts, &own) {
        Some(CgroupVersion::V2) => {
            let backend = v2::UnifiedBackend::new(&mounts, &own, policy)?;
            log::debug!("Using cgroup v2 with controllers {:?}", backend.controllers());
            Ok(Arc::new(backend))
        }
        Some(CgroupVersion::V1) => {
            let backend = v1::LegacyBackend::new(&mounts, &own, policy)?;
            log::debug!("Using cgroup v1 with controllers {:?}", backend.controllers());
            Ok(Arc::new(backend))
        }
        None => Err(BenchError::Cgroup(
            "No cgroup file system is mounted, cannot measure resource usage".to_string(),
        )),
    }
}

pub(crate) fn new_scope_name() -> String {
    format!("{}{}", SCOPE_PREFIX, uuid::Uuid::new_v4().simple())
}

pub(crate) fn read_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|content| content.trim().to_string())
        .map_err(|e| BenchError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))
}

pub(crate) fn read_u64(path: &Path) -> Result<u64> {
    let value = read_value(path)?;
    value.parse().map_err(|e| {
        BenchError::Cgroup(format!(
            "Unexpected value '{}' in {}: {}",
            value,
            path.display(),
            e
        ))
    })
}

pub(crate) fn write_value(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| BenchError::Cgroup(format!("Failed to write {}: {}", path.display(), e)))
}

/// Parse files of the form "key value" per line
pub(crate) fn parse_key_values(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse kernel lists such as "0-3,8,10-11"
pub fn parse_int_list(list: &str) -> Result<BTreeSet<usize>> {
    let mut result = BTreeSet::new();
    for part in list.trim().split(',').filter(|part| !part.is_empty()) {
        let parse = |value: &str| -> Result<usize> {
            value.trim().parse().map_err(|_| {
                BenchError::Cgroup(format!("Invalid entry '{}' in list '{}'", part, list))
            })
        };
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(BenchError::Cgroup(format!("Invalid range '{}'", part)));
                }
                result.extend(start..=end);
            }
            None => {
                result.insert(parse(part)?);
            }
        }
    }
    Ok(result)
}

pub fn format_int_list(values: &BTreeSet<usize>) -> String {
    values
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Directories below `root` (inclusive), children after their parents
pub(crate) fn cgroup_tree(root: &Path) -> Vec<PathBuf> {
    let mut result = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    pending.push(entry.path());
                }
            }
        }
        result.push(dir);
    }
    result
}

/// Read pids from a membership file; vanished cgroups count as empty
pub(crate) fn read_pids(file: &Path) -> Result<Vec<Pid>> {
    match fs::read_to_string(file) {
        Ok(content) => Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(BenchError::Cgroup(format!(
            "Failed to read {}: {}",
            file.display(),
            e
        ))),
    }
}

/// Remove a cgroup directory and its children, retrying while the kernel
/// still drains the tasks. A missing directory counts as removed.
pub(crate) fn remove_cgroup_dir(root: &Path, policy: RetryPolicy) -> Result<()> {
    let mut dirs = cgroup_tree(root);
    dirs.reverse();
    for dir in dirs {
        remove_single_dir(&dir, policy)?;
    }
    Ok(())
}

fn remove_single_dir(dir: &Path, policy: RetryPolicy) -> Result<()> {
    let mut delay = policy.backoff;
    for attempt in 1..=policy.attempts {
        match fs::remove_dir(dir) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                let errno = e.raw_os_error().map(Errno::from_i32);
                let retryable = matches!(errno, Some(Errno::EBUSY) | Some(Errno::ENOTEMPTY));
                if !retryable {
                    return Err(BenchError::CleanupRace(format!(
                        "Failed to remove cgroup {}: {}",
                        dir.display(),
                        e
                    )));
                }
                if attempt == policy.attempts {
                    break;
                }
                log::debug!(
                    "Removing cgroup {} failed ({}), retry {} of {}",
                    dir.display(),
                    e,
                    attempt,
                    policy.attempts
                );
                // jitter keeps concurrent runs from retrying in lockstep
                let jitter = Duration::from_micros(fastrand::u64(0..1000));
                thread::sleep(delay + jitter);
                delay *= 2;
            }
        }
    }
    Err(BenchError::CleanupRace(format!(
        "Cgroup {} still busy after {} attempts",
        dir.display(),
        policy.attempts
    )))
}

/// Enter the calling process into the given membership files.
///
/// Runs between fork and exec, so it only uses raw syscalls on
/// pre-allocated paths.
pub fn enter_self(files: &[CString]) -> io::Result<()> {
    for file in files {
        // SAFETY: `file` is a valid NUL-terminated path and the buffer is static.
        unsafe {
            let fd = libc::open(file.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let written = libc::write(fd, b"0".as_ptr().cast(), 1);
            let error = io::Error::last_os_error();
            libc::close(fd);
            if written != 1 {
                return Err(error);
            }
        }
    }
    Ok(())
}

pub fn to_cstrings(paths: &[PathBuf]) -> Result<Vec<CString>> {
    paths
        .iter()
        .map(|path| {
            CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                BenchError::Cgroup(format!("Path {} contains a NUL byte", path.display()))
            })
        })
        .collect()
}
