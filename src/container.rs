/// Containerized execution of the tool
///
/// Three processes take part besides the executor:
///
/// * a helper that creates the namespaces and waits for the id maps,
/// * the container init (pid 1 of the new PID namespace), which builds the
///   mount tree, waits for the tool and retrieves result files afterwards,
/// * the tool itself, which pivots into the mount tree, drops all privileges
///   and blocks right before exec until the executor has moved it into the
///   cgroup scope.
///
/// The init stays outside the scope, so killing the scope never prevents
/// result retrieval.
use crate::filesystem::{
    bind_system_config, duplicate_mount_hierarchy, make_mounts_private, make_removable,
    mount_proc, mount_tmpfs, pivot_into, validate_dir_rules, write_system_config,
    ContainerLayout,
};
use crate::ipc::{Handshake, HandshakeMessage};
use crate::namespace::{self, ContainerIdentity, NamespaceIsolation};
use crate::process::{report_failure, wait_child, ToolCommand};
use crate::registry::reset_signal_mask;
use crate::retrieval::{retrieve, RetrievalPlan};
use crate::seccomp::SyscallFilter;
use crate::types::{BenchError, ContainerConfig, ExitStatus, Result};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Prefix of the private directory that holds the container's file systems
pub const CONTAINER_DIR_PREFIX: &str = "BenchExec_run_";

/// Everything needed to start a tool inside a container
#[derive(Debug)]
pub struct ContainerRequest {
    pub tool: ToolCommand,
    pub config: ContainerConfig,
    /// Files to copy out after the run and the host directory receiving them
    pub retrieval: Option<(RetrievalPlan, PathBuf)>,
    /// Syscall filter; `None` if seccomp is unavailable
    pub filter: Option<SyscallFilter>,
}

/// How the tool in a container ended
#[derive(Debug, Default)]
pub struct ContainerExit {
    pub status: ExitStatus,
    pub result_files: Vec<PathBuf>,
    pub warnings: Vec<String>,
    /// Set if the tool could not be executed after all
    pub setup_error: Option<String>,
}

/// A container whose tool is blocked before exec
#[derive(Debug)]
pub struct Container {
    helper: Pid,
    tool_pid: Pid,
    init_pid: Pid,
    handshake: Handshake,
    layout: ContainerLayout,
    root: Option<TempDir>,
    reaped: bool,
}

fn setup_error(error: BenchError) -> BenchError {
    match error {
        BenchError::Handshake(detail) => BenchError::Setup(detail),
        other => other,
    }
}

/// Create namespaces and mount tree and start the tool up to the point
/// right before exec
pub fn build_container(request: ContainerRequest) -> Result<Container> {
    validate_dir_rules(&request.config.dir_rules)?;
    let support = NamespaceIsolation::is_supported();
    if !support.user_namespaces {
        return Err(BenchError::Unsupported(format!(
            "Containers need user namespaces, which are {}",
            support
        )));
    }

    let root = tempfile::Builder::new()
        .prefix(CONTAINER_DIR_PREFIX)
        .tempdir()
        .map_err(|e| BenchError::Setup(format!("Cannot create container directory: {}", e)))?;
    let layout = ContainerLayout::new(root.path());
    let isolation = NamespaceIsolation::new(
        request.config.network_access,
        ContainerIdentity::new(request.config.system_config),
    );
    log::debug!(
        "Building container in {} with namespaces {:?}",
        layout.root.display(),
        isolation.clone_flags()
    );

    let (parent_end, child_end) = Handshake::pair()?;
    // SAFETY: the child only runs `helper_main` and leaves with _exit.
    match unsafe { fork() }.map_err(|e| BenchError::Process(format!("Cannot fork: {}", e)))? {
        ForkResult::Child => {
            drop(parent_end);
            let code = helper_main(&request, &layout, &isolation, child_end);
            // SAFETY: terminate without running destructors of the parent's state.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(child_end);
            // closes our copies of the tool's standard streams
            drop(request);
            let mut container = Container {
                helper: child,
                tool_pid: child,
                init_pid: child,
                handshake: parent_end,
                layout,
                root: Some(root),
                reaped: false,
            };
            let mapped = container
                .handshake
                .expect(&HandshakeMessage::Unshared)
                .and_then(|()| isolation.write_id_maps(child))
                .and_then(|()| container.handshake.send(&HandshakeMessage::Go));
            if let Err(e) = mapped {
                container.abort();
                return Err(setup_error(e));
            }

            match container.handshake.recv() {
                Ok(Some(HandshakeMessage::Ready { tool_pid, init_pid })) => {
                    container.tool_pid = Pid::from_raw(tool_pid);
                    container.init_pid = Pid::from_raw(init_pid);
                    log::debug!("Container ready: init {}, tool {}", init_pid, tool_pid);
                    Ok(container)
                }
                Ok(Some(HandshakeMessage::SetupFailed { detail })) => {
                    container.abort();
                    Err(BenchError::Setup(detail))
                }
                Ok(other) => {
                    container.abort();
                    Err(BenchError::Setup(format!(
                        "Container ended its setup unexpectedly: {:?}",
                        other
                    )))
                }
                Err(e) => {
                    container.abort();
                    Err(setup_error(e))
                }
            }
        }
    }
}

/// Namespace creator; waits for the container init and passes its status on
fn helper_main(
    request: &ContainerRequest,
    layout: &ContainerLayout,
    isolation: &NamespaceIsolation,
    mut handshake: Handshake,
) -> i32 {
    if let Err(e) = namespace::die_with_parent() {
        return report_failure(&mut handshake, e.to_string());
    }
    if let Err(e) = isolation.unshare() {
        return report_failure(&mut handshake, e.to_string());
    }
    if handshake.send(&HandshakeMessage::Unshared).is_err()
        || handshake.expect(&HandshakeMessage::Go).is_err()
    {
        return 1;
    }

    // SAFETY: the child only runs `init_main` and leaves with _exit.
    match unsafe { fork() } {
        Err(e) => report_failure(&mut handshake, format!("Cannot fork container init: {}", e)),
        Ok(ForkResult::Child) => {
            let code = init_main(request, layout, isolation, handshake);
            // SAFETY: see above.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(handshake);
            match wait_child(child) {
                Ok((status, _)) => status.code.unwrap_or(1),
                Err(_) => 1,
            }
        }
    }
}

/// Mount tree of the container, built in the mount namespace of the init
fn build_mount_tree(
    config: &ContainerConfig,
    layout: &ContainerLayout,
    isolation: &NamespaceIsolation,
) -> Result<Vec<String>> {
    make_mounts_private()?;
    if config.use_tmpfs {
        mount_tmpfs(&layout.root)?;
    }
    layout.create_dirs()?;
    if config.system_config {
        write_system_config(layout, isolation.identity())?;
    }
    let mut warnings = duplicate_mount_hierarchy(layout, &config.dir_rules)?.warnings;
    if config.system_config {
        warnings.extend(bind_system_config(layout, &config.dir_rules, isolation.identity())?);
    }
    isolation.configure_inside()?;
    Ok(warnings)
}

/// PID 1 of the container
fn init_main(
    request: &ContainerRequest,
    layout: &ContainerLayout,
    isolation: &NamespaceIsolation,
    mut handshake: Handshake,
) -> i32 {
    if let Err(e) = namespace::die_with_parent() {
        return report_failure(&mut handshake, e.to_string());
    }
    let mut warnings = match build_mount_tree(&request.config, layout, isolation) {
        Ok(warnings) => warnings,
        Err(e) => return report_failure(&mut handshake, e.to_string()),
    };

    // SAFETY: the child only runs `tool_main` and leaves with _exit.
    let tool = match unsafe { fork() } {
        Err(e) => return report_failure(&mut handshake, format!("Cannot fork tool: {}", e)),
        Ok(ForkResult::Child) => {
            let code = tool_main(request, layout, handshake);
            // SAFETY: see above.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => child,
    };

    let status = match reap_until(tool) {
        Ok(status) => status,
        Err(e) => return report_failure(&mut handshake, e.to_string()),
    };

    let mut result_files = Vec::new();
    if let Some((plan, output_dir)) = &request.retrieval {
        let retrieved = retrieve(plan, &layout.temp_base, output_dir);
        result_files = retrieved.files;
        warnings.extend(retrieved.warnings);
    }
    let exited = HandshakeMessage::Exited {
        exit_code: status.code,
        signal: status.signal,
        result_files,
        warnings,
    };
    if handshake.send(&exited).is_err() {
        return 1;
    }
    0
}

/// As PID 1, reap every orphan until the tool itself is gone
fn reap_until(tool: Pid) -> Result<ExitStatus> {
    loop {
        let mut status = 0;
        // SAFETY: valid pointer to a local.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid == tool.as_raw() {
            return Ok(ExitStatus::from_raw(status));
        }
        if pid < 0 {
            let error = std::io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::EINTR) {
                return Err(BenchError::Process(format!("Lost track of the tool: {}", error)));
            }
        }
    }
}

/// Host PIDs of the calling process and its parent, read from the host
/// /proc before it is replaced
fn host_pids() -> std::result::Result<(i32, i32), String> {
    let own = fs::read_link("/proc/self")
        .ok()
        .and_then(|link| link.to_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| "Cannot determine own host PID".to_string())?;
    let status = fs::read_to_string("/proc/self/status")
        .map_err(|e| format!("Cannot read /proc/self/status: {}", e))?;
    let parent = status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| "Cannot determine host PID of container init".to_string())?;
    Ok((own, parent))
}

/// The tool process up to exec
fn tool_main(request: &ContainerRequest, layout: &ContainerLayout, mut handshake: Handshake) -> i32 {
    let prepared = (|| -> std::result::Result<(i32, i32), String> {
        namespace::die_with_parent().map_err(|e| e.to_string())?;
        reset_signal_mask().map_err(|e| e.to_string())?;
        setpgid(Pid::from_raw(0), Pid::from_raw(0))
            .map_err(|e| format!("Cannot create process group: {}", e))?;
        let pids = host_pids()?;
        // private copy, so the init keeps its view for result retrieval
        unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|e| format!("Cannot create mount namespace for tool: {}", e))?;
        pivot_into(&layout.mount_base).map_err(|e| e.to_string())?;
        mount_proc().map_err(|e| e.to_string())?;
        Ok(pids)
    })();
    let (tool_pid, init_pid) = match prepared {
        Ok(pids) => pids,
        Err(detail) => return report_failure(&mut handshake, detail),
    };

    // relative commands are found from the working directory
    if let Err(detail) = request.tool.prepare() {
        return report_failure(&mut handshake, detail);
    }
    let executable = match request.tool.resolve_executable() {
        Ok(executable) => executable,
        Err(detail) => return report_failure(&mut handshake, detail),
    };

    let hardened = namespace::drop_capabilities()
        .and_then(|()| namespace::set_no_new_privileges())
        .and_then(|()| match &request.filter {
            Some(filter) => filter.install(),
            None => Ok(()),
        });
    if let Err(e) = hardened {
        return report_failure(&mut handshake, e.to_string());
    }

    let ready = HandshakeMessage::Ready { tool_pid, init_pid };
    if handshake.send(&ready).is_err() || handshake.expect(&HandshakeMessage::Start).is_err() {
        return 1;
    }
    let detail = request.tool.exec(&executable);
    report_failure(&mut handshake, detail)
}

impl Container {
    pub fn tool_pid(&self) -> Pid {
        self.tool_pid
    }

    pub fn init_pid(&self) -> Pid {
        self.init_pid
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    /// Writable layer of the container as the executor sees it. The layer may
    /// live in a tmpfs that only exists in the container's mount namespace.
    pub fn writable_layer(&self) -> PathBuf {
        let temp = self
            .layout
            .temp_base
            .strip_prefix("/")
            .unwrap_or(&self.layout.temp_base);
        Path::new("/proc")
            .join(self.init_pid.as_raw().to_string())
            .join("root")
            .join(temp)
    }

    /// Let the tool exec
    pub fn start(&mut self) -> Result<()> {
        self.handshake.send(&HandshakeMessage::Start)
    }

    /// Block until the tool has ended and the result files are retrieved
    pub fn wait(&mut self) -> Result<ContainerExit> {
        let mut exit = None;
        let mut setup_error = None;
        loop {
            match self.handshake.recv()? {
                Some(HandshakeMessage::Exited {
                    exit_code,
                    signal,
                    result_files,
                    warnings,
                }) => {
                    exit = Some(ContainerExit {
                        status: ExitStatus {
                            code: exit_code,
                            signal,
                        },
                        result_files,
                        warnings,
                        setup_error: None,
                    });
                }
                Some(HandshakeMessage::SetupFailed { detail }) => setup_error = Some(detail),
                Some(other) => log::debug!("Ignoring message {:?} from container", other),
                None => break,
            }
        }
        let (helper_status, _) = wait_child(self.helper)?;
        self.reaped = true;

        match exit {
            Some(mut exit) => {
                exit.setup_error = setup_error;
                Ok(exit)
            }
            None => Err(BenchError::Process(format!(
                "Container ended without reporting the tool's status ({:?}){}",
                helper_status,
                setup_error.map(|e| format!(": {}", e)).unwrap_or_default()
            ))),
        }
    }

    /// Kill the container before or instead of waiting for it
    pub fn abort(&mut self) {
        if self.reaped {
            return;
        }
        // the init and the tool die with the helper
        let _ = kill(self.helper, Signal::SIGKILL);
        let _ = wait_child(self.helper);
        self.reaped = true;
    }

    /// Remove the private directory of the container
    pub fn cleanup(&mut self) -> Result<()> {
        self.abort();
        if let Some(root) = self.root.take() {
            make_removable(root.path())?;
            root.close()?;
        }
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("Failed to remove container directory: {}", e);
        }
    }
}
