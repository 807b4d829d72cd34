/// Background enforcement of time, memory and file limits for one scope
use crate::cgroup::{CgroupBackend, CgroupVersion, Scope};
use crate::config::ExecutorConfig;
use crate::files_limit::FileHierarchyLimit;
use crate::killer;
use crate::oom::OomListener;
use crate::types::{BenchError, Limits, Result, TerminationReason, WarningLog};
use nix::sys::signal::Signal;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Highest-priority termination reason offered so far
#[derive(Debug, Default)]
pub struct ReasonCell {
    reason: Mutex<Option<TerminationReason>>,
}

impl ReasonCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` unless a higher-ranked one is already set.
    /// Returns whether `reason` is now the current one.
    pub fn offer(&self, reason: TerminationReason) -> bool {
        let mut current = self
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *current {
            Some(existing) if existing.priority() >= reason.priority() => existing == reason,
            _ => {
                *current = Some(reason);
                true
            }
        }
    }

    pub fn get(&self) -> Option<TerminationReason> {
        *self
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Limits as the watchdog enforces them, after defaults are filled in
#[derive(Clone, Debug, PartialEq)]
pub struct WatchdogLimits {
    pub cpu_soft: Option<Duration>,
    pub cpu_hard: Option<Duration>,
    /// Wall time limit and the reason reported when it expires
    pub wall: Option<(Duration, TerminationReason)>,
    pub files: Option<FileHierarchyLimit>,
}

impl WatchdogLimits {
    /// Derive the enforced limits from the requested ones.
    ///
    /// A soft limit without a distinct hard limit gets a hard limit one grace
    /// margin later. Without an explicit wall limit, any CPU limit implies one
    /// slightly above the hard limit that reports as a CPU time violation.
    pub fn derive(limits: &Limits, config: &ExecutorConfig) -> Result<Self> {
        let (cpu_soft, cpu_hard) = match (limits.cpu_time_soft, limits.cpu_time_hard) {
            (Some(soft), Some(hard)) if soft > hard => {
                return Err(BenchError::Config(format!(
                    "Soft CPU time limit {:?} exceeds hard limit {:?}",
                    soft, hard
                )));
            }
            (Some(soft), Some(hard)) if soft == hard => {
                (Some(soft), Some(soft + config.cpu_grace_margin))
            }
            (Some(soft), None) => (Some(soft), Some(soft + config.cpu_grace_margin)),
            (soft, hard) => (soft, hard),
        };

        let wall = match (limits.wall_time, cpu_hard) {
            (Some(wall), _) => Some((wall, TerminationReason::WallTime)),
            (None, Some(hard)) => Some((
                hard + config.wall_time_overhead,
                TerminationReason::CpuTime,
            )),
            (None, None) => None,
        };

        Ok(Self {
            cpu_soft,
            cpu_hard,
            wall,
            files: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_soft.is_none()
            && self.cpu_hard.is_none()
            && self.wall.is_none()
            && self.files.is_none()
    }
}

type ViolationHandler = Arc<dyn Fn(TerminationReason) + Send + Sync>;

struct Shared {
    backend: Arc<dyn CgroupBackend>,
    scope: Arc<Scope>,
    limits: WatchdogLimits,
    poll_interval: Duration,
    secondary_interval: Duration,
    file_check_interval: Duration,
    warnings: WarningLog,
    on_violation: ViolationHandler,
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        *self
            .stopped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep for `timeout` unless stopped; returns whether we were stopped
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self
            .stopped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = self
            .wakeup
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }

    fn violate(&self, reason: TerminationReason) {
        log::info!("Run in {} exceeded its limit: {}", self.scope.name(), reason);
        (self.on_violation)(reason);
        if let Err(e) = killer::kill_tree(self.backend.as_ref(), &self.scope, &self.warnings) {
            self.warnings
                .push(format!("Killing {} failed: {}", self.scope.name(), e));
        }
    }
}

/// Sampling loop of one run
pub struct Watchdog {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    oom: Option<OomListener>,
}

impl Watchdog {
    /// Start watching `scope`. `on_violation` is called with the reason before
    /// the process tree is killed.
    pub fn watch<F>(
        backend: Arc<dyn CgroupBackend>,
        scope: Arc<Scope>,
        limits: WatchdogLimits,
        config: &ExecutorConfig,
        warnings: WarningLog,
        on_violation: F,
    ) -> Result<Self>
    where
        F: Fn(TerminationReason) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            backend,
            scope,
            limits,
            poll_interval: config.poll_interval,
            secondary_interval: config.secondary_interval,
            file_check_interval: config.file_check_interval,
            warnings,
            on_violation: Arc::new(on_violation),
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });

        let oom = if shared.scope.version() == CgroupVersion::V1 {
            let listener_shared = Arc::clone(&shared);
            match OomListener::start(&shared.scope, shared.warnings.clone(), move || {
                listener_shared.violate(TerminationReason::Memory)
            }) {
                Ok(listener) => listener,
                Err(e) => {
                    shared.warnings.push(format!(
                        "Cannot listen for OOM events, memory limit violations are detected after the run only: {}",
                        e
                    ));
                    None
                }
            }
        } else {
            None
        };

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", shared.scope.name()))
            .spawn(move || run_loop(&thread_shared))?;

        Ok(Self {
            shared,
            handle: Some(handle),
            oom,
        })
    }

    /// Cancel sampling and wait for the thread. Safe to call more than once.
    pub fn stop(&mut self) {
        {
            let mut stopped = self
                .shared
                .stopped
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *stopped = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Watchdog of {} panicked", self.shared.scope.name());
            }
        }
        if let Some(oom) = self.oom.take() {
            oom.cancel();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: &Shared) {
    let start = Instant::now();
    let backend = shared.backend.as_ref();
    let scope = shared.scope.as_ref();
    let limits = &shared.limits;

    let oom_baseline = backend.oom_kill_count(scope).unwrap_or(0);
    let mut soft_sent = false;
    let mut last_secondary = start;
    let mut last_file_check = start;

    while !shared.is_stopped() {
        let now = Instant::now();
        let mut tripped = Vec::new();

        if scope.version() == CgroupVersion::V2 {
            match backend.oom_kill_count(scope) {
                Ok(count) if count > oom_baseline => tripped.push(TerminationReason::Memory),
                Ok(_) => {}
                Err(e) => log::debug!("Reading OOM counter failed: {}", e),
            }
        }

        let cpu_time = match backend.read_cpu_time(scope) {
            Ok(time) => time.map(Duration::from_secs_f64),
            Err(e) => {
                log::debug!("Reading CPU time of {} failed: {}", scope.name(), e);
                None
            }
        };

        if let (Some(used), Some(hard)) = (cpu_time, limits.cpu_hard) {
            if used >= hard {
                tripped.push(TerminationReason::CpuTime);
            }
        }

        if let Some((wall, reason)) = limits.wall {
            if now.duration_since(start) >= wall {
                tripped.push(reason);
            }
        }

        if let Some(files) = &limits.files {
            if now.duration_since(last_file_check) >= shared.file_check_interval {
                last_file_check = now;
                if let Some(reason) = files.check() {
                    tripped.push(reason);
                }
            }
        }

        if let Some(reason) = TerminationReason::resolve(tripped) {
            shared.violate(reason);
            return;
        }

        if let (Some(used), Some(soft), false) = (cpu_time, limits.cpu_soft, soft_sent) {
            if used >= soft {
                soft_sent = true;
                log::info!("Soft CPU time limit reached, sending SIGTERM to {}", scope.name());
                (shared.on_violation)(TerminationReason::CpuTimeSoft);
                if let Err(e) = killer::signal_all(backend, scope, Signal::SIGTERM) {
                    log::debug!("Sending SIGTERM failed: {}", e);
                }
            }
        }

        if now.duration_since(last_secondary) >= shared.secondary_interval {
            last_secondary = now;
            if let Ok(usage) = backend.read_usage(scope) {
                log::debug!(
                    "{}: memory {:?}, read {:?} bytes, written {:?} bytes",
                    scope.name(),
                    usage.memory_current,
                    usage.io_read_bytes,
                    usage.io_write_bytes
                );
            }
        }

        if shared.wait(shared.poll_interval) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn test_reason_cell_keeps_highest() {
        let cell = ReasonCell::new();
        assert!(cell.offer(TerminationReason::WallTime));
        assert!(cell.offer(TerminationReason::Memory));
        assert!(!cell.offer(TerminationReason::Killed));
        assert!(cell.offer(TerminationReason::Memory));
        assert_eq!(cell.get(), Some(TerminationReason::Memory));
    }

    #[test]
    fn test_soft_only_gets_grace() {
        let config = ExecutorConfig::default();
        let limits = Limits {
            cpu_time_soft: Some(secs(10)),
            ..Default::default()
        };
        let derived = WatchdogLimits::derive(&limits, &config).unwrap();
        assert_eq!(derived.cpu_soft, Some(secs(10)));
        assert_eq!(derived.cpu_hard, Some(secs(10) + config.cpu_grace_margin));
    }

    #[test]
    fn test_equal_soft_and_hard() {
        let config = ExecutorConfig::default();
        let limits = Limits {
            cpu_time_soft: Some(secs(5)),
            cpu_time_hard: Some(secs(5)),
            ..Default::default()
        };
        let derived = WatchdogLimits::derive(&limits, &config).unwrap();
        assert!(derived.cpu_hard.unwrap() > derived.cpu_soft.unwrap());
    }

    #[test]
    fn test_soft_above_hard_rejected() {
        let limits = Limits {
            cpu_time_soft: Some(secs(6)),
            cpu_time_hard: Some(secs(5)),
            ..Default::default()
        };
        let result = WatchdogLimits::derive(&limits, &ExecutorConfig::default());
        assert!(matches!(result, Err(BenchError::Config(_))));
    }

    #[test]
    fn test_implicit_wall_limit() {
        let config = ExecutorConfig::default();
        let limits = Limits {
            cpu_time_hard: Some(secs(1)),
            ..Default::default()
        };
        let derived = WatchdogLimits::derive(&limits, &config).unwrap();
        assert_eq!(
            derived.wall,
            Some((secs(1) + config.wall_time_overhead, TerminationReason::CpuTime))
        );

        let limits = Limits {
            cpu_time_hard: Some(secs(1)),
            wall_time: Some(secs(60)),
            ..Default::default()
        };
        let derived = WatchdogLimits::derive(&limits, &config).unwrap();
        assert_eq!(derived.wall, Some((secs(60), TerminationReason::WallTime)));
    }

    #[test]
    fn test_no_limits() {
        let derived = WatchdogLimits::derive(&Limits::default(), &ExecutorConfig::default()).unwrap();
        assert!(derived.is_empty());
    }
}
