/// Starting the tool process
///
/// Everything that happens between fork and exec lives here. Children never
/// log and leave with `_exit`; problems travel to the parent as handshake
/// messages instead.
use crate::cgroup::enter_self;
use crate::ipc::{Handshake, HandshakeMessage};
use crate::namespace;
use crate::registry::reset_signal_mask;
use crate::resource_limits::ProcessLimits;
use crate::types::{BenchError, ExitStatus, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{access, dup2, execve, fork, getpid, setpgid, AccessFlags, ForkResult, Pid};
use std::collections::BTreeMap;
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Search path used when the tool environment has no PATH
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Exit code of a child that could not exec the tool
pub const SETUP_FAILED_CODE: i32 = 127;

/// Fully prepared command line and environment of the tool
#[derive(Debug)]
pub struct ToolCommand {
    argv: Vec<CString>,
    envp: Vec<CString>,
    search_path: Vec<PathBuf>,
    working_dir: Option<PathBuf>,
    stdin: File,
    output: File,
    limits: ProcessLimits,
}

fn to_cstring(value: &str, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| BenchError::Config(format!("{} contains a NUL byte: {:?}", what, value)))
}

impl ToolCommand {
    pub fn new(
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<PathBuf>,
        stdin: File,
        output: File,
        limits: ProcessLimits,
    ) -> Result<Self> {
        if args.is_empty() {
            return Err(BenchError::Config("Empty command line".to_string()));
        }
        let argv = args
            .iter()
            .map(|arg| to_cstring(arg, "Argument"))
            .collect::<Result<Vec<_>>>()?;
        let envp = env
            .iter()
            .map(|(key, value)| to_cstring(&format!("{}={}", key, value), "Environment"))
            .collect::<Result<Vec<_>>>()?;
        let search_path = env
            .get("PATH")
            .map(String::as_str)
            .unwrap_or(DEFAULT_PATH)
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect();
        Ok(Self {
            argv,
            envp,
            search_path,
            working_dir,
            stdin,
            output,
            limits,
        })
    }

    pub fn program(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.argv[0].as_bytes()))
    }

    /// Locate the executable the way execvp does, but with the PATH of the
    /// tool environment and relative to the file system the caller sees
    pub fn resolve_executable(&self) -> std::result::Result<CString, String> {
        let program = self.program();
        let candidates: Vec<PathBuf> = if self.argv[0].as_bytes().contains(&b'/') {
            vec![program.to_path_buf()]
        } else {
            self.search_path.iter().map(|dir| dir.join(program)).collect()
        };
        for candidate in candidates {
            if candidate.is_file() && access(&candidate, AccessFlags::X_OK).is_ok() {
                return CString::new(candidate.as_os_str().as_bytes())
                    .map_err(|_| format!("Invalid executable path {}", candidate.display()));
            }
        }
        Err(format!("Command {} not found or not executable", program.display()))
    }

    /// Working directory, process limits and standard streams of the caller
    pub fn prepare(&self) -> std::result::Result<(), String> {
        if let Some(dir) = &self.working_dir {
            std::env::set_current_dir(dir)
                .map_err(|e| format!("Cannot change into working directory {}: {}", dir.display(), e))?;
        }
        self.limits.apply().map_err(|e| e.to_string())?;
        let output = self.output.as_raw_fd();
        for (fd, target) in [(self.stdin.as_raw_fd(), 0), (output, 1), (output, 2)] {
            dup2(fd, target).map_err(|e| format!("Cannot redirect descriptor {}: {}", target, e))?;
        }
        Ok(())
    }

    /// Replace the calling process with the tool. Only returns on failure.
    pub fn exec(&self, executable: &CString) -> String {
        match execve(executable, &self.argv, &self.envp) {
            Err(e) => format!("Cannot execute {}: {}", self.program().display(), e),
            Ok(never) => match never {},
        }
    }
}

/// Report a setup failure to the parent and return the exit code to use
pub(crate) fn report_failure(handshake: &mut Handshake, detail: String) -> i32 {
    let _ = handshake.send(&HandshakeMessage::SetupFailed { detail });
    SETUP_FAILED_CODE
}

/// Wait for a child, retrying on EINTR
pub(crate) fn wait_child(pid: Pid) -> Result<(ExitStatus, libc::rusage)> {
    let mut status = 0;
    // SAFETY: rusage is a plain C struct that wait4 fills in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: valid pointers to locals.
        let result = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if result == pid.as_raw() {
            return Ok((ExitStatus::from_raw(status), usage));
        }
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::EINTR) {
            return Err(BenchError::Process(format!("Waiting for process {} failed: {}", pid, error)));
        }
    }
}

/// CPU time of a finished child from its rusage, in seconds
pub fn rusage_cpu_time(usage: &libc::rusage) -> f64 {
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    seconds(usage.ru_utime) + seconds(usage.ru_stime)
}

/// A tool started without container, blocked before exec until `start`
#[derive(Debug)]
pub struct PlainChild {
    pid: Pid,
    handshake: Handshake,
    reaped: bool,
}

/// How a child ended
#[derive(Debug)]
pub struct ChildExit {
    pub status: ExitStatus,
    pub cpu_time: f64,
    /// Set if the child could not exec the tool
    pub setup_error: Option<String>,
}

/// Fork the tool in its own process group. The child joins the cgroup scope
/// through `membership` before it reports readiness.
pub fn spawn_plain(tool: ToolCommand, membership: &[CString]) -> Result<PlainChild> {
    let (mut parent_end, child_end) = Handshake::pair()?;
    // SAFETY: the child only runs the code in `plain_child` and leaves with _exit.
    match unsafe { fork() }.map_err(|e| BenchError::Process(format!("Cannot fork: {}", e)))? {
        ForkResult::Child => {
            drop(parent_end);
            let code = plain_child(&tool, child_end, membership);
            // SAFETY: terminate without running destructors of the parent's state.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(child_end);
            drop(tool);
            let mut spawned = PlainChild {
                pid: child,
                handshake: parent_end,
                reaped: false,
            };
            match spawned.handshake.recv() {
                Ok(Some(HandshakeMessage::Ready { .. })) => Ok(spawned),
                Ok(Some(HandshakeMessage::SetupFailed { detail })) => {
                    spawned.abort();
                    Err(BenchError::Setup(detail))
                }
                Ok(other) => {
                    spawned.abort();
                    Err(BenchError::Handshake(format!(
                        "Unexpected answer from tool process: {:?}",
                        other
                    )))
                }
                Err(e) => {
                    spawned.abort();
                    Err(e)
                }
            }
        }
    }
}

fn plain_child(tool: &ToolCommand, mut handshake: Handshake, membership: &[CString]) -> i32 {
    if let Err(e) = reset_signal_mask() {
        return report_failure(&mut handshake, e.to_string());
    }
    if let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        return report_failure(&mut handshake, format!("Cannot create process group: {}", e));
    }
    if let Err(e) = namespace::die_with_parent() {
        return report_failure(&mut handshake, e.to_string());
    }
    if let Err(e) = enter_self(membership) {
        return report_failure(&mut handshake, format!("Cannot enter cgroup: {}", e));
    }
    if let Err(detail) = tool.prepare() {
        return report_failure(&mut handshake, detail);
    }
    let executable = match tool.resolve_executable() {
        Ok(executable) => executable,
        Err(detail) => return report_failure(&mut handshake, detail),
    };
    let pid = getpid().as_raw();
    let ready = HandshakeMessage::Ready {
        tool_pid: pid,
        init_pid: pid,
    };
    if handshake.send(&ready).is_err() || handshake.expect(&HandshakeMessage::Start).is_err() {
        return 1;
    }
    let detail = tool.exec(&executable);
    report_failure(&mut handshake, detail)
}

impl PlainChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Let the tool exec
    pub fn start(&mut self) -> Result<()> {
        self.handshake.send(&HandshakeMessage::Start)
    }

    /// Block until the tool terminates
    pub fn wait(mut self) -> Result<ChildExit> {
        let (status, usage) = wait_child(self.pid)?;
        self.reaped = true;
        // the pipe is closed on exec, so anything left is an exec failure
        let setup_error = match self.handshake.recv() {
            Ok(Some(HandshakeMessage::SetupFailed { detail })) => Some(detail),
            _ => None,
        };
        Ok(ChildExit {
            status,
            cpu_time: rusage_cpu_time(&usage),
            setup_error,
        })
    }

    /// Kill and reap a child that will not be started
    pub fn abort(&mut self) {
        if self.reaped {
            return;
        }
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = wait_child(self.pid);
        self.reaped = true;
    }
}

impl Drop for PlainChild {
    fn drop(&mut self) {
        self.abort();
    }
}
