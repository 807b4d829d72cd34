/// Execution of one run from scope creation to teardown
///
/// `RunExecutor::execute` walks each run through
/// `Created → ScopeAllocated → Spawned → Running → outcome → CleanedUp`.
/// Cleanup happens on every path, including setup failures and interrupts.
use crate::cgroup::{self, CgroupBackend, LimitOutcome, ResourceLimit, Scope};
use crate::config::ExecutorConfig;
use crate::container::{build_container, Container, ContainerRequest, CONTAINER_DIR_PREFIX};
use crate::files_limit::FileHierarchyLimit;
use crate::killer;
use crate::namespace::ContainerIdentity;
use crate::process::{spawn_plain, PlainChild, ToolCommand};
use crate::registry::{Registration, RunRegistry};
use crate::resource_limits::ProcessLimits;
use crate::retrieval::RetrievalPlan;
use crate::seccomp::{self, SyscallFilter};
use crate::system::{EnergyMeter, SwapCheck, ThrottleCheck};
use crate::types::{
    BenchError, ExitStatus, ResourceUsage, Result, Run, RunResult, RunState, StdinSource,
    TerminationReason, WarningLog,
};
use crate::watchdog::{ReasonCell, Watchdog, WatchdogLimits};
use chrono::{DateTime, Local};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Separator between the command line and the tool output in the output file
const OUTPUT_SEPARATOR_WIDTH: usize = 80;

/// Output files are shrunk only if they exceed the maximum by this much
const OUTPUT_SIZE_SLACK: u64 = 500;

const TRUNCATION_NOTICE: &[u8] =
    b"\n\n\nWARNING: YOUR LOGFILE WAS TOO LONG, SOME LINES IN THE MIDDLE WERE REMOVED.\n\n\n\n";

const EXACT_CPU_INTERVAL: Duration = Duration::from_millis(100);
const EXACT_CPU_ATTEMPTS: u32 = 20;

/// Runs tools under resource limits, one cgroup scope per run
#[derive(Debug, Clone)]
pub struct RunExecutor {
    backend: Arc<dyn CgroupBackend>,
    config: ExecutorConfig,
    registry: Arc<RunRegistry>,
}

/// How the tool is started
enum Launch {
    Plain(ToolCommand),
    Container(ContainerRequest),
}

/// The started tool, blocked before exec until `start`
enum Child {
    Plain(PlainChild),
    Container(Container),
}

/// What the tool left behind when it ended
#[derive(Debug, Default)]
struct Finished {
    status: ExitStatus,
    rusage_cpu_time: Option<f64>,
    result_files: Vec<PathBuf>,
    setup_error: Option<String>,
}

impl Child {
    fn pid(&self) -> Pid {
        match self {
            Child::Plain(child) => child.pid(),
            Child::Container(container) => container.tool_pid(),
        }
    }

    fn start(&mut self) -> Result<()> {
        match self {
            Child::Plain(child) => child.start(),
            Child::Container(container) => container.start(),
        }
    }

    /// Wait for the tool. A container is handed back so its directory can
    /// be removed during cleanup.
    fn wait(self, warnings: &WarningLog) -> (Result<Finished>, Option<Container>) {
        match self {
            Child::Plain(child) => {
                let finished = child.wait().map(|exit| Finished {
                    status: exit.status,
                    rusage_cpu_time: Some(exit.cpu_time),
                    result_files: Vec::new(),
                    setup_error: exit.setup_error,
                });
                (finished, None)
            }
            Child::Container(mut container) => {
                let finished = container.wait().map(|exit| {
                    for warning in exit.warnings {
                        warnings.push(warning);
                    }
                    Finished {
                        status: exit.status,
                        rusage_cpu_time: None,
                        result_files: exit.result_files,
                        setup_error: exit.setup_error,
                    }
                });
                (finished, Some(container))
            }
        }
    }
}

/// Mutable state of one execution
struct Session<'a> {
    backend: &'a Arc<dyn CgroupBackend>,
    registration: Registration,
    state: RunState,
    warnings: WarningLog,
    reason: Arc<ReasonCell>,
    scope: Option<Arc<Scope>>,
    container: Option<Container>,
    watchdog: Option<Watchdog>,
    home: Option<TempDir>,
    cleaned_up: bool,
}

impl<'a> Session<'a> {
    fn advance(&mut self, next: RunState) {
        if self.state.can_advance_to(next) {
            log::debug!(
                "Run {}: {:?} -> {:?}",
                self.registration.handle().name(),
                self.state,
                next
            );
            self.state = next;
        } else {
            log::error!(
                "Run {}: ignoring illegal transition {:?} -> {:?}",
                self.registration.handle().name(),
                self.state,
                next
            );
        }
    }

    fn stop_requested(&self) -> bool {
        self.registration.handle().is_stop_requested()
    }

    /// Release everything the run holds. Safe to call more than once.
    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.registration.handle().clear_stop_action();

        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        if let Some(scope) = self.scope.take() {
            if let Err(e) = killer::kill_tree(self.backend.as_ref(), &scope, &self.warnings) {
                self.warnings
                    .push(format!("Killing remaining processes of {} failed: {}", scope.name(), e));
            }
            match self.backend.destroy_scope(&scope) {
                Ok(()) => {}
                Err(BenchError::CleanupRace(detail)) => self.warnings.push(format!(
                    "Cgroup {} could not be removed: {}",
                    scope.name(),
                    detail
                )),
                Err(e) => self
                    .warnings
                    .push(format!("Removing cgroup {} failed: {}", scope.name(), e)),
            }
        }
        if let Some(mut container) = self.container.take() {
            if let Err(e) = container.cleanup() {
                self.warnings
                    .push(format!("Removing container directory failed: {}", e));
            }
        }
        if let Some(home) = self.home.take() {
            if let Err(e) = home.close() {
                self.warnings
                    .push(format!("Removing temporary home directory failed: {}", e));
            }
        }
        self.advance(RunState::CleanedUp);
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl RunExecutor {
    /// Probe the cgroup hierarchy and use the process-wide registry
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let backend = cgroup::detect(&config)?;
        Ok(Self::with_backend(backend, config, RunRegistry::global()))
    }

    pub fn with_backend(
        backend: Arc<dyn CgroupBackend>,
        config: ExecutorConfig,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            backend,
            config,
            registry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CgroupBackend> {
        &self.backend
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Execute one run and measure it.
    ///
    /// Limit violations, interrupts and setup failures are reported in the
    /// result. Errors are returned for invalid runs, for missing kernel
    /// support, and for failures after the tool was started.
    pub fn execute(&self, run: &Run) -> Result<RunResult> {
        let started_at = Local::now();
        let limits = WatchdogLimits::derive(&run.limits, &self.config)?;
        let working_dir = absolute(run.working_dir.as_deref())?;
        let registration = self.registry.register(run.args.first().cloned().unwrap_or_default());

        let mut session = Session {
            backend: &self.backend,
            registration,
            state: RunState::Created,
            warnings: WarningLog::new(),
            reason: Arc::new(ReasonCell::new()),
            scope: None,
            container: None,
            watchdog: None,
            home: None,
            cleaned_up: false,
        };
        for degradation in self.backend.degradations() {
            session.warnings.push(degradation.clone());
        }

        // prepare errors are classified together with those of supervise
        let outcome = self
            .prepare(run, &limits, &working_dir, &mut session)
            .and_then(|launch| self.supervise(run, limits, launch, &mut session));

        let result = match outcome {
            Ok((finished, usage)) => {
                let (state, reason) = if finished.setup_error.is_some() {
                    (RunState::SetupFailed, Some(TerminationReason::SetupFailed))
                } else {
                    match session.reason.get() {
                        Some(TerminationReason::Killed) => {
                            (RunState::Interrupted, Some(TerminationReason::Killed))
                        }
                        Some(reason) => (RunState::LimitViolated, Some(reason)),
                        None => (RunState::Completed, None),
                    }
                };
                session.advance(state);
                session.cleanup();
                self.limit_output_size(run, &session.warnings);
                RunResult {
                    termination_reason: reason,
                    state,
                    exit: finished.status,
                    usage,
                    result_files: finished.result_files,
                    setup_error: finished.setup_error,
                    warnings: session.warnings.snapshot(),
                    started_at,
                }
            }
            Err(e @ (BenchError::Config(_) | BenchError::Unsupported(_))) => return Err(e),
            Err(e) if session.state == RunState::Running => {
                log::error!("Run {} failed: {}", session.registration.handle().name(), e);
                return Err(e);
            }
            Err(e) if session.stop_requested() && session.state != RunState::Created => {
                log::info!("Run {} was interrupted during setup: {}", run.args[0], e);
                session.advance(RunState::Interrupted);
                session.cleanup();
                interrupted_result(&session, started_at)
            }
            Err(e) => {
                log::warn!("Setting up run {} failed: {}", run.args[0], e);
                session.advance(RunState::SetupFailed);
                session.cleanup();
                setup_failed_result(e.to_string(), &session, started_at)
            }
        };
        log::info!(
            "Run {} finished: {:?}, reason {}",
            run.args[0],
            result.state,
            result
                .termination_reason
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(result)
    }

    /// Open files and assemble the command. Nothing here needs the scope yet.
    fn prepare(
        &self,
        run: &Run,
        limits: &WatchdogLimits,
        working_dir: &Path,
        session: &mut Session<'_>,
    ) -> Result<Launch> {
        if run.args.is_empty() {
            return Err(BenchError::Config("Empty command line".to_string()));
        }
        if run.container.is_none()
            && (run.limits.files_count.is_some() || run.limits.files_size.is_some())
        {
            session.warnings.push(
                "File count and size limits are only enforced in container mode".to_string(),
            );
        }

        let stdin = match &run.stdin {
            StdinSource::Null => File::open("/dev/null")?,
            StdinSource::File(path) => File::open(path).map_err(|e| {
                BenchError::Config(format!("Cannot open input file {}: {}", path.display(), e))
            })?,
        };
        let output = open_output(&run.output_file, &run.args)?;

        let mut env = run.environment.resolve(std::env::vars());
        let (home, tmp) = match &run.container {
            Some(container) => (
                PathBuf::from(ContainerIdentity::new(container.system_config).home),
                PathBuf::from("/tmp"),
            ),
            None => {
                let dir = tempfile::Builder::new().prefix(CONTAINER_DIR_PREFIX).tempdir()?;
                let home = dir.path().join("home");
                let tmp = dir.path().join("tmp");
                fs::create_dir(&home)?;
                fs::create_dir(&tmp)?;
                session.home = Some(dir);
                (home, tmp)
            }
        };
        for (key, value) in [("HOME", home), ("TMPDIR", tmp)] {
            if !run.environment.set.contains_key(key) {
                env.insert(key.to_string(), value.to_string_lossy().into_owned());
            }
        }

        let process_limits = ProcessLimits::new(limits.cpu_hard, &self.config);
        let tool = ToolCommand::new(
            &run.args,
            &env,
            Some(working_dir.to_path_buf()),
            stdin,
            output,
            process_limits,
        )?;

        let Some(container) = &run.container else {
            return Ok(Launch::Plain(tool));
        };
        let retrieval = if container.result_files.is_empty() {
            None
        } else {
            let plan = RetrievalPlan::new(&container.result_files, working_dir)?;
            let output_dir = absolute(Some(&container.output_dir))?;
            Some((plan, output_dir))
        };
        let filter = if seccomp::is_available() {
            match SyscallFilter::compile() {
                Ok(filter) => Some(filter),
                Err(e) => {
                    session
                        .warnings
                        .push(format!("Syscall filter not installed: {}", e));
                    None
                }
            }
        } else {
            session
                .warnings
                .push("Seccomp is not available, the tool may access the host keyring".to_string());
            None
        };
        Ok(Launch::Container(ContainerRequest {
            tool,
            config: container.clone(),
            retrieval,
            filter,
        }))
    }

    /// Allocate the scope, start the tool and wait for it
    fn supervise(
        &self,
        run: &Run,
        mut limits: WatchdogLimits,
        launch: Launch,
        session: &mut Session<'_>,
    ) -> Result<(Finished, ResourceUsage)> {
        let scope = Arc::new(self.backend.create_scope()?);
        session.scope = Some(Arc::clone(&scope));
        session.advance(RunState::ScopeAllocated);
        self.apply_limits(run, &scope, &session.warnings)?;

        {
            let backend = Arc::clone(&self.backend);
            let scope = Arc::clone(&scope);
            let reason = Arc::clone(&session.reason);
            let warnings = session.warnings.clone();
            session.registration.handle().set_stop_action(move || {
                reason.offer(TerminationReason::Killed);
                if let Err(e) = killer::kill_tree(backend.as_ref(), &scope, &warnings) {
                    warnings.push(format!("Killing {} failed: {}", scope.name(), e));
                }
            });
        }
        if session.stop_requested() {
            return Err(BenchError::Process("Run was stopped before start".to_string()));
        }

        let mut child = match launch {
            Launch::Plain(tool) => {
                let membership = cgroup::to_cstrings(&self.backend.membership_files(&scope))?;
                Child::Plain(spawn_plain(tool, &membership)?)
            }
            Launch::Container(request) => {
                let container = build_container(request)?;
                self.backend.enter(&scope, container.tool_pid())?;
                if let Some(files) = file_limit(run, &container) {
                    limits.files = Some(files);
                }
                Child::Container(container)
            }
        };
        session.advance(RunState::Spawned);
        log::debug!("Tool process of {} is {}", scope.name(), child.pid());

        let reason = Arc::clone(&session.reason);
        session.watchdog = Some(Watchdog::watch(
            Arc::clone(&self.backend),
            Arc::clone(&scope),
            limits,
            &self.config,
            session.warnings.clone(),
            move |violation| {
                reason.offer(violation);
            },
        )?);

        if session.stop_requested() {
            abort(child, session);
            return Err(BenchError::Process("Run was stopped before start".to_string()));
        }

        let throttle = ThrottleCheck::new(run.limits.cores.as_ref());
        let swap = SwapCheck::new();
        let energy = EnergyMeter::start();
        let wall_start = Instant::now();
        if let Err(e) = child.start() {
            abort(child, session);
            return Err(e);
        }
        session.advance(RunState::Running);

        let (finished, container) = child.wait(&session.warnings);
        session.container = container;
        let wall_time = wall_start.elapsed();
        let energy = energy.finish();
        let finished = finished?;

        if let Some(mut watchdog) = session.watchdog.take() {
            watchdog.stop();
        }
        // daemons the tool left behind
        if let Err(e) = killer::kill_tree(self.backend.as_ref(), &scope, &session.warnings) {
            session
                .warnings
                .push(format!("Killing remaining processes of {} failed: {}", scope.name(), e));
        }

        let mut usage = self.measure(&scope, &finished, &session.warnings);
        usage.wall_time = wall_time.as_secs_f64();
        usage.energy = energy;

        if let Some(limit) = run.limits.memory {
            if self.memory_exhausted(&scope, limit, &finished, &usage) {
                session.reason.offer(TerminationReason::Memory);
            }
        }
        if throttle.has_throttled() {
            session
                .warnings
                .push("CPU throttled itself during benchmarking due to overheating. Benchmark results are unreliable!");
        }
        if swap.has_swapped() {
            session
                .warnings
                .push("System has swapped during benchmarking. Benchmark results are unreliable!");
        }
        Ok((finished, usage))
    }

    fn apply_limits(&self, run: &Run, scope: &Scope, warnings: &WarningLog) -> Result<()> {
        let mut requested = Vec::new();
        if let Some(memory) = run.limits.memory {
            requested.push(ResourceLimit::Memory(memory));
        }
        if let Some(cores) = &run.limits.cores {
            requested.push(ResourceLimit::Cores(cores.clone()));
        }
        if let Some(nodes) = &run.limits.memory_nodes {
            requested.push(ResourceLimit::MemoryNodes(nodes.clone()));
        }
        if let Some(processes) = run.limits.max_processes {
            requested.push(ResourceLimit::Processes(processes));
        }

        for limit in &requested {
            match self.backend.set_limit(scope, limit)? {
                LimitOutcome::Applied => log::debug!("Applied {:?} to {}", limit, scope.name()),
                LimitOutcome::Unsupported(detail) if self.config.strict_mode => {
                    return Err(BenchError::ResourceLimit(detail));
                }
                LimitOutcome::Unsupported(detail) => warnings.push(detail),
            }
        }
        Ok(())
    }

    /// Final usage of the scope, preferring the kernel's accounting
    fn measure(&self, scope: &Scope, finished: &Finished, warnings: &WarningLog) -> ResourceUsage {
        let counters = match self.backend.read_usage(scope) {
            Ok(counters) => counters,
            Err(e) => {
                warnings.push(format!("Reading resource usage of {} failed: {}", scope.name(), e));
                cgroup::Usage::default()
            }
        };
        let cpu_time = exact_cpu_time(self.backend.as_ref(), scope)
            .or(counters.cpu_time)
            .or(finished.rusage_cpu_time)
            .unwrap_or_else(|| {
                warnings.push("CPU time of the run is unknown".to_string());
                0.0
            });

        ResourceUsage {
            cpu_time,
            cpu_time_per_core: counters.cpu_time_per_core,
            wall_time: 0.0,
            memory_peak: counters.memory_peak,
            io_read_bytes: counters.io_read_bytes,
            io_write_bytes: counters.io_write_bytes,
            energy: None,
        }
    }

    /// Whether the kernel killed the tool for lack of memory
    fn memory_exhausted(
        &self,
        scope: &Scope,
        limit: u64,
        finished: &Finished,
        usage: &ResourceUsage,
    ) -> bool {
        match self.backend.oom_kill_count(scope) {
            Ok(count) if count > 0 => return true,
            Ok(_) => {}
            Err(e) => log::debug!("Reading OOM counter of {} failed: {}", scope.name(), e),
        }
        finished.status.signal == Some(libc::SIGKILL)
            && usage.memory_peak.is_some_and(|peak| peak >= limit)
    }

    fn limit_output_size(&self, run: &Run, warnings: &WarningLog) {
        let Some(max_size) = self.config.max_output_size else {
            return;
        };
        match shrink_output(&run.output_file, max_size) {
            Ok(true) => warnings.push(format!(
                "Output file {} was too large, its middle part was removed",
                run.output_file.display()
            )),
            Ok(false) => {}
            Err(e) => warnings.push(format!(
                "Shrinking output file {} failed: {}",
                run.output_file.display(),
                e
            )),
        }
    }
}

fn abort(child: Child, session: &mut Session<'_>) {
    match child {
        Child::Plain(mut child) => child.abort(),
        Child::Container(mut container) => {
            container.abort();
            session.container = Some(container);
        }
    }
}

fn file_limit(run: &Run, container: &Container) -> Option<FileHierarchyLimit> {
    if run.limits.files_count.is_none() && run.limits.files_size.is_none() {
        return None;
    }
    Some(FileHierarchyLimit {
        root: container.writable_layer(),
        max_count: run.limits.files_count,
        max_size: run.limits.files_size,
    })
}

fn interrupted_result(session: &Session<'_>, started_at: DateTime<Local>) -> RunResult {
    RunResult {
        termination_reason: Some(TerminationReason::Killed),
        state: RunState::Interrupted,
        exit: ExitStatus::default(),
        usage: ResourceUsage::default(),
        result_files: Vec::new(),
        setup_error: None,
        warnings: session.warnings.snapshot(),
        started_at,
    }
}

fn setup_failed_result(
    detail: String,
    session: &Session<'_>,
    started_at: DateTime<Local>,
) -> RunResult {
    RunResult {
        termination_reason: Some(TerminationReason::SetupFailed),
        state: RunState::SetupFailed,
        exit: ExitStatus::default(),
        usage: ResourceUsage::default(),
        result_files: Vec::new(),
        setup_error: Some(detail),
        warnings: session.warnings.snapshot(),
        started_at,
    }
}

/// Resolve against the current directory; `None` means the current directory
fn absolute(path: Option<&Path>) -> Result<PathBuf> {
    let current = std::env::current_dir()?;
    Ok(match path {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => current.join(path),
        None => current,
    })
}

/// Create the output file and write the command line header
fn open_output(path: &Path, args: &[String]) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path).map_err(|e| {
        BenchError::Config(format!("Cannot create output file {}: {}", path.display(), e))
    })?;
    write!(
        file,
        "{}\n\n\n{}\n\n\n",
        args.join(" "),
        "-".repeat(OUTPUT_SEPARATOR_WIDTH)
    )?;
    file.flush()?;
    Ok(file)
}

/// Re-read the CPU time until the kernel has settled on a value
fn exact_cpu_time(backend: &dyn CgroupBackend, scope: &Scope) -> Option<f64> {
    let mut last = backend.read_cpu_time(scope).ok().flatten()?;
    for _ in 0..EXACT_CPU_ATTEMPTS {
        thread::sleep(EXACT_CPU_INTERVAL);
        let current = backend.read_cpu_time(scope).ok().flatten()?;
        if current == last {
            return Some(current);
        }
        last = current;
    }
    Some(last)
}

/// Remove the middle of an output file larger than `max_size` plus some
/// slack, keeping `max_size / 2` bytes at each end cut at line boundaries.
/// Returns whether the file was changed.
pub fn shrink_output(path: &Path, max_size: u64) -> io::Result<bool> {
    let size = fs::metadata(path)?.len();
    if size < max_size + OUTPUT_SIZE_SLACK {
        return Ok(false);
    }
    let half = max_size / 2;
    let mut reader = BufReader::new(File::open(path)?);
    let mut discarded = Vec::new();

    reader.seek(SeekFrom::Start(half))?;
    let head_end = half + reader.read_until(b'\n', &mut discarded)? as u64;
    discarded.clear();
    reader.seek(SeekFrom::Start(size - half))?;
    let tail_start = size - half + reader.read_until(b'\n', &mut discarded)? as u64;
    if head_end + TRUNCATION_NOTICE.len() as u64 >= tail_start {
        return Ok(false);
    }

    let mut writer = OpenOptions::new().write(true).open(path)?;
    writer.seek(SeekFrom::Start(head_end))?;
    writer.write_all(TRUNCATION_NOTICE)?;
    reader.seek(SeekFrom::Start(tail_start))?;
    io::copy(&mut reader, &mut writer)?;
    let end = writer.stream_position()?;
    writer.set_len(end)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_output_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("output.log");
        let args = vec!["echo".to_string(), "hi".to_string()];
        drop(open_output(&path, &args).unwrap());

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("echo hi\n\n\n{}\n\n\n", "-".repeat(80)));
    }

    #[test]
    fn test_small_output_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        fs::write(&path, "line\n".repeat(200)).unwrap();
        assert!(!shrink_output(&path, 1000).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 1000);
    }

    #[test]
    fn test_large_output_keeps_head_and_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        let content: String = (0..2000).map(|i| format!("line {:05}\n", i)).collect();
        fs::write(&path, &content).unwrap();

        assert!(shrink_output(&path, 1000).unwrap());
        let mut shrunk = String::new();
        File::open(&path).unwrap().read_to_string(&mut shrunk).unwrap();

        assert!(shrunk.len() < 1200);
        assert!(shrunk.starts_with("line 00000\n"));
        assert!(shrunk.ends_with("line 01999\n"));
        assert!(shrunk.contains("SOME LINES IN THE MIDDLE WERE REMOVED"));
        assert!(!shrunk.contains("line 01000\n"));
        // cuts happen at line boundaries
        for line in shrunk.lines().filter(|l| l.starts_with("line")) {
            assert_eq!(line.len(), 10);
        }
    }

    #[test]
    fn test_absolute_paths() {
        let current = std::env::current_dir().unwrap();
        assert_eq!(absolute(None).unwrap(), current);
        assert_eq!(absolute(Some(Path::new("a/b"))).unwrap(), current.join("a/b"));
        assert_eq!(absolute(Some(Path::new("/x"))).unwrap(), PathBuf::from("/x"));
    }
}
