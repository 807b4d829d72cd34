/// Core types and structures shared by the measurement pipeline
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Resource limits of one run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// CPU time after which the tool is asked to terminate (SIGTERM)
    pub cpu_time_soft: Option<Duration>,
    /// CPU time after which the tool is killed
    pub cpu_time_hard: Option<Duration>,
    /// Wall time after which the tool is killed
    pub wall_time: Option<Duration>,
    /// Memory limit in bytes (RAM + swap where the kernel accounts swap)
    pub memory: Option<u64>,
    /// CPU cores the run may execute on
    pub cores: Option<BTreeSet<usize>>,
    /// NUMA memory nodes the run may allocate from
    pub memory_nodes: Option<BTreeSet<usize>>,
    /// Maximum number of files in the writable layer of the container
    pub files_count: Option<u64>,
    /// Maximum total size of files in the writable layer of the container
    pub files_size: Option<u64>,
    /// Maximum number of tasks in the scope
    pub max_processes: Option<u64>,
}

impl Limits {
    pub fn has_cpu_limit(&self) -> bool {
        self.cpu_time_soft.is_some() || self.cpu_time_hard.is_some()
    }
}

/// Where standard input of the tool comes from
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinSource {
    /// `/dev/null`
    #[default]
    Null,
    File(PathBuf),
}

/// Environment handling of the tool process.
///
/// If `keep` is non-empty the tool starts from an empty environment and only
/// the listed variables are copied from the host, otherwise the whole host
/// environment is inherited. `set` overrides values, `append` appends a suffix to
/// the host value and `remove` deletes variables.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub keep: BTreeSet<String>,
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub append: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: BTreeSet<String>,
}

impl Environment {
    /// Compute the environment of the tool from the given host environment
    pub fn resolve<I>(&self, host: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let host: BTreeMap<String, String> = host.into_iter().collect();
        let mut env = if self.keep.is_empty() {
            host.clone()
        } else {
            host.iter()
                .filter(|(key, _)| self.keep.contains(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        for (key, value) in &self.set {
            env.insert(key.clone(), value.clone());
        }
        for (key, suffix) in &self.append {
            let base = host.get(key).map(String::as_str).unwrap_or("");
            env.insert(key.clone(), format!("{}{}", base, suffix));
        }
        for key in &self.remove {
            env.remove(key);
        }
        env
    }
}

/// How a directory of the host is visible inside the container
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirMode {
    /// Empty, memory-backed directory; the host content is not visible
    Hidden,
    /// Host content visible, writes are refused
    ReadOnly,
    /// Host content visible, writes go to a private upper layer
    Overlay,
    /// Host content visible and writable
    FullAccess,
}

impl fmt::Display for DirMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirMode::Hidden => "hidden",
            DirMode::ReadOnly => "read-only",
            DirMode::Overlay => "overlay",
            DirMode::FullAccess => "full-access",
        };
        f.write_str(name)
    }
}

/// Isolation settings of a containerized run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Directory rules, keyed by absolute path. Ordered so that ancestors come first.
    pub dir_rules: BTreeMap<PathBuf, DirMode>,
    /// Keep the host network instead of a loopback-only namespace
    pub network_access: bool,
    /// Present a synthetic user, hostname and /etc files to the tool
    pub system_config: bool,
    /// Keep the writable layers of the container in a tmpfs
    pub use_tmpfs: bool,
    /// Patterns of files to retrieve from the writable layers after the run
    pub result_files: Vec<String>,
    /// Host directory receiving the retrieved files
    pub output_dir: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let mut dir_rules = BTreeMap::new();
        dir_rules.insert(PathBuf::from("/"), DirMode::Overlay);
        for hidden in ["/run", "/tmp", "/var/lock", "/var/run"] {
            dir_rules.insert(PathBuf::from(hidden), DirMode::Hidden);
        }
        Self {
            dir_rules,
            network_access: false,
            system_config: true,
            use_tmpfs: true,
            result_files: Vec::new(),
            output_dir: PathBuf::from("output.files"),
        }
    }
}

/// Immutable description of one execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub stdin: StdinSource,
    /// File receiving stdout and stderr of the tool
    pub output_file: PathBuf,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub container: Option<ContainerConfig>,
}

impl Run {
    pub fn new<S: Into<String>>(args: impl IntoIterator<Item = S>, output_file: PathBuf) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            environment: Environment::default(),
            stdin: StdinSource::Null,
            output_file,
            limits: Limits::default(),
            container: None,
        }
    }
}

/// Why a run was terminated by us
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    Memory,
    #[serde(rename = "cputime")]
    CpuTime,
    #[serde(rename = "cputime-soft")]
    CpuTimeSoft,
    FilesCount,
    FilesSize,
    #[serde(rename = "walltime")]
    WallTime,
    Killed,
    SetupFailed,
}

impl TerminationReason {
    /// Rank used when several reasons compete for the same run.
    ///
    /// memory > cputime > cputime-soft > files-count > files-size > walltime > killed
    pub fn priority(self) -> u8 {
        match self {
            TerminationReason::SetupFailed => 8,
            TerminationReason::Memory => 7,
            TerminationReason::CpuTime => 6,
            TerminationReason::CpuTimeSoft => 5,
            TerminationReason::FilesCount => 4,
            TerminationReason::FilesSize => 3,
            TerminationReason::WallTime => 2,
            TerminationReason::Killed => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Memory => "memory",
            TerminationReason::CpuTime => "cputime",
            TerminationReason::CpuTimeSoft => "cputime-soft",
            TerminationReason::FilesCount => "files-count",
            TerminationReason::FilesSize => "files-size",
            TerminationReason::WallTime => "walltime",
            TerminationReason::Killed => "killed",
            TerminationReason::SetupFailed => "setup-failed",
        }
    }

    /// Pick the winning reason out of several simultaneous ones
    pub fn resolve<I: IntoIterator<Item = TerminationReason>>(reasons: I) -> Option<Self> {
        reasons.into_iter().max_by_key(|reason| reason.priority())
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a run inside the executor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    ScopeAllocated,
    Spawned,
    Running,
    Completed,
    LimitViolated,
    Interrupted,
    SetupFailed,
    CleanedUp,
}

impl RunState {
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::LimitViolated
                | RunState::Interrupted
                | RunState::SetupFailed
        )
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Created, ScopeAllocated) | (Created, SetupFailed) => true,
            (ScopeAllocated, Spawned) | (ScopeAllocated, SetupFailed) => true,
            (ScopeAllocated, Interrupted) => true,
            (Spawned, Running) | (Spawned, SetupFailed) | (Spawned, Interrupted) => true,
            (Running, Completed) | (Running, LimitViolated) | (Running, Interrupted) => true,
            // exec itself may still fail after the start signal
            (Running, SetupFailed) => true,
            _ => false,
        }
    }
}

/// How the tool process ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }

    /// Decode a raw wait status as returned by waitpid
    pub fn from_raw(status: i32) -> Self {
        if libc::WIFSIGNALED(status) {
            Self::signaled(libc::WTERMSIG(status))
        } else {
            Self::exited(libc::WEXITSTATUS(status))
        }
    }
}

/// Measured resource consumption of a run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time in seconds
    pub cpu_time: f64,
    /// CPU time in seconds per core, empty if the kernel does not report it
    pub cpu_time_per_core: BTreeMap<usize, f64>,
    /// Wall time in seconds
    pub wall_time: f64,
    /// Peak memory usage in bytes
    pub memory_peak: Option<u64>,
    pub io_read_bytes: Option<u64>,
    pub io_write_bytes: Option<u64>,
    /// Energy consumed by the CPU packages in joules
    pub energy: Option<f64>,
}

/// Final record of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub termination_reason: Option<TerminationReason>,
    pub state: RunState,
    pub exit: ExitStatus,
    pub usage: ResourceUsage,
    pub result_files: Vec<PathBuf>,
    pub setup_error: Option<String>,
    pub warnings: Vec<String>,
    pub started_at: chrono::DateTime<chrono::Local>,
}

/// Shared sink for non-fatal problems of one run
#[derive(Clone, Debug, Default)]
pub struct WarningLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Errors of the measurement pipeline
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Container setup failed: {0}")]
    Setup(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Cleanup did not finish: {0}")]
    CleanupRace(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl BenchError {
    /// Errors that happen while building the execution environment,
    /// before the tool ever ran
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            BenchError::Namespace(_)
                | BenchError::Mount(_)
                | BenchError::Seccomp(_)
                | BenchError::Handshake(_)
                | BenchError::Process(_)
                | BenchError::Setup(_)
        )
    }
}

impl From<nix::Error> for BenchError {
    fn from(errno: nix::Error) -> Self {
        BenchError::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_priority_order() {
        let reason = TerminationReason::resolve([
            TerminationReason::WallTime,
            TerminationReason::Memory,
            TerminationReason::Killed,
        ]);
        assert_eq!(reason, Some(TerminationReason::Memory));

        let reason = TerminationReason::resolve([
            TerminationReason::WallTime,
            TerminationReason::FilesSize,
        ]);
        assert_eq!(reason, Some(TerminationReason::FilesSize));
        assert_eq!(TerminationReason::resolve([]), None);
    }

    #[test]
    fn test_reason_names() {
        assert_eq!(TerminationReason::CpuTime.to_string(), "cputime");
        assert_eq!(
            serde_json::to_string(&TerminationReason::CpuTimeSoft).unwrap(),
            "\"cputime-soft\""
        );
        assert_eq!(
            serde_json::to_string(&TerminationReason::FilesCount).unwrap(),
            "\"files-count\""
        );
    }

    #[test]
    fn test_state_transitions() {
        use RunState::*;
        assert!(Created.can_advance_to(ScopeAllocated));
        assert!(Running.can_advance_to(LimitViolated));
        assert!(SetupFailed.can_advance_to(CleanedUp));
        assert!(!Created.can_advance_to(Running));
        assert!(!CleanedUp.can_advance_to(CleanedUp));
        assert!(!Completed.can_advance_to(Running));
        assert!(Running.can_advance_to(SetupFailed));
        assert!(!Spawned.can_advance_to(Completed));
    }

    #[test]
    fn test_environment_resolution() {
        let host = vec![
            ("PATH".to_string(), "/bin".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("LANG".to_string(), "C".to_string()),
        ];

        let mut env = Environment::default();
        env.set.insert("FOO".into(), "bar".into());
        env.append.insert("PATH".into(), ":/opt/bin".into());
        env.remove.insert("LANG".into());
        let resolved = env.resolve(host.clone());
        assert_eq!(resolved.get("PATH").map(String::as_str), Some("/bin:/opt/bin"));
        assert_eq!(resolved.get("FOO").map(String::as_str), Some("bar"));
        assert!(resolved.contains_key("HOME"));
        assert!(!resolved.contains_key("LANG"));

        let mut env = Environment::default();
        env.keep.insert("PATH".into());
        let resolved = env.resolve(host);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_exit_status_decoding() {
        assert_eq!(ExitStatus::from_raw(0), ExitStatus::exited(0));
        assert_eq!(ExitStatus::from_raw(1 << 8), ExitStatus::exited(1));
        assert_eq!(ExitStatus::from_raw(9), ExitStatus::signaled(9));
    }

    #[test]
    fn test_default_container_rules() {
        let config = ContainerConfig::default();
        assert_eq!(config.dir_rules.get(&PathBuf::from("/")), Some(&DirMode::Overlay));
        assert_eq!(config.dir_rules.get(&PathBuf::from("/tmp")), Some(&DirMode::Hidden));
        let ordered: Vec<_> = config.dir_rules.keys().collect();
        assert_eq!(ordered[0], &PathBuf::from("/"));
    }
}
