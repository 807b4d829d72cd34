/// Per-process limits of the tool, applied with setrlimit right before exec
use crate::config::ExecutorConfig;
use crate::types::{BenchError, Result};
use nix::sys::resource::{getrlimit, setrlimit, Resource};

/// Process limits derived from the limits of a run.
///
/// The cgroup watchdog is the primary CPU time enforcement; RLIMIT_CPU only
/// catches runs whose watchdog died. File limits have no
/// rlimit counterpart; the watchdog scans the writable layer instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessLimits {
    pub cpu_seconds: Option<u64>,
    pub core_size: u64,
    pub niceness: i32,
    strict_mode: bool,
}

impl ProcessLimits {
    pub fn new(hard_cpu: Option<std::time::Duration>, config: &ExecutorConfig) -> Self {
        Self {
            cpu_seconds: hard_cpu.map(|hard| (hard + config.rlimit_cpu_overhead).as_secs().max(1)),
            core_size: 0,
            niceness: config.niceness,
            strict_mode: config.strict_mode,
        }
    }

    /// Apply to the calling process. Runs between fork and exec, so nothing
    /// here logs; failures only matter in strict mode.
    pub fn apply(&self) -> Result<()> {
        if let Some(seconds) = self.cpu_seconds {
            self.set(Resource::RLIMIT_CPU, seconds, "CPU time")?;
        }
        self.set(Resource::RLIMIT_CORE, self.core_size, "core dump")?;
        if self.niceness != 0 {
            self.renice()?;
        }
        Ok(())
    }

    fn set(&self, resource: Resource, value: u64, name: &str) -> Result<()> {
        // never raise a limit above what the caller already has
        let value = match getrlimit(resource) {
            Ok((_, hard)) if hard != libc::RLIM_INFINITY => value.min(hard),
            _ => value,
        };
        match setrlimit(resource, value, value) {
            Ok(()) => Ok(()),
            Err(e) if self.strict_mode => Err(BenchError::ResourceLimit(format!(
                "Failed to set {} limit: {}",
                name, e
            ))),
            Err(_) => Ok(()),
        }
    }

    fn renice(&self) -> Result<()> {
        // nice() may legitimately return -1, only errno tells failures apart
        // SAFETY: plain syscalls on the calling process.
        let failed = unsafe {
            *libc::__errno_location() = 0;
            libc::nice(self.niceness) == -1 && *libc::__errno_location() != 0
        };
        if failed && self.strict_mode {
            return Err(BenchError::ResourceLimit(format!(
                "Failed to change niceness by {}: {}",
                self.niceness,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cpu_fallback_is_generous() {
        let config = ExecutorConfig::default();
        let limits = ProcessLimits::new(Some(Duration::from_secs(10)), &config);
        assert_eq!(limits.cpu_seconds, Some(40));
        assert_eq!(limits.core_size, 0);
        assert_eq!(limits.niceness, 5);

        let limits = ProcessLimits::new(None, &config);
        assert_eq!(limits.cpu_seconds, None);
    }

    #[test]
    fn test_apply_in_child() {
        let config = ExecutorConfig::default();
        let limits = ProcessLimits::new(Some(Duration::from_secs(1)), &config);
        // SAFETY: the child only performs syscalls and exits.
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                let file_size = getrlimit(Resource::RLIMIT_FSIZE).ok();
                let ok = limits.apply().is_ok()
                    && getrlimit(Resource::RLIMIT_CORE).map(|(soft, _)| soft == 0).unwrap_or(false)
                    && getrlimit(Resource::RLIMIT_FSIZE).ok() == file_size;
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
            }
        }
    }
}
