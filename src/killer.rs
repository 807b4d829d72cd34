/// Process-tree termination over a cgroup scope
///
/// Kills every process that was ever a descendant of the tool, even one that
/// forks faster than single `kill` calls reach it.
use crate::cgroup::{CgroupBackend, Scope};
use crate::types::{Result, WarningLog};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::thread;
use std::time::{Duration, Instant};

/// Bound for the fallback loop and for waiting on the kernel
const MAX_ROUNDS: u32 = 10;
const EMPTY_WAIT: Duration = Duration::from_secs(5);

/// Which protocol ended up stopping the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillStrategy {
    /// Nothing was running
    AlreadyEmpty,
    /// `cgroup.kill`
    Atomic,
    /// freeze, signal, thaw
    Freezer,
    /// Repeated signalling without a freezer
    SignalLoop,
}

/// Stop every process in the scope. Calling this on an empty or already
/// removed scope is a no-op.
pub fn kill_tree(
    backend: &dyn CgroupBackend,
    scope: &Scope,
    warnings: &WarningLog,
) -> Result<KillStrategy> {
    if backend.tasks(scope)?.is_empty() {
        return Ok(KillStrategy::AlreadyEmpty);
    }

    match backend.kill_atomically(scope) {
        Ok(true) => {
            wait_until_empty(backend, scope, warnings);
            return Ok(KillStrategy::Atomic);
        }
        Ok(false) => {}
        Err(e) => log::debug!("cgroup.kill failed for {}: {}", scope.name(), e),
    }

    match backend.set_frozen(scope, true) {
        Ok(true) => {
            kill_frozen(backend, scope)?;
            wait_until_empty(backend, scope, warnings);
            return Ok(KillStrategy::Freezer);
        }
        Ok(false) => {}
        Err(e) => {
            log::debug!("Freezing {} failed: {}", scope.name(), e);
            // never leave a half-frozen scope behind
            let _ = backend.set_frozen(scope, false);
        }
    }

    warnings.push(format!(
        "No freezer available for cgroup {}, killing processes one by one. \
         A process that forks quickly may escape.",
        scope.name()
    ));
    kill_loop(backend, scope, warnings)?;
    Ok(KillStrategy::SignalLoop)
}

/// Send a signal to every process in the scope without waiting
pub fn signal_all(backend: &dyn CgroupBackend, scope: &Scope, signal: Signal) -> Result<usize> {
    let pids = backend.tasks(scope)?;
    for pid in &pids {
        send(*pid, signal);
    }
    Ok(pids.len())
}

fn kill_frozen(backend: &dyn CgroupBackend, scope: &Scope) -> Result<()> {
    for round in 0..MAX_ROUNDS {
        let pids = backend.tasks(scope)?;
        for pid in &pids {
            send(*pid, Signal::SIGKILL);
        }
        // pending SIGKILL is delivered as soon as the tasks run again
        backend.set_frozen(scope, false)?;
        if pids.is_empty() || backend.tasks(scope)?.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Round {} left processes in {}, freezing again",
            round + 1,
            scope.name()
        );
        thread::sleep(Duration::from_millis(10));
        backend.set_frozen(scope, true)?;
    }
    backend.set_frozen(scope, false)?;
    Ok(())
}

fn kill_loop(backend: &dyn CgroupBackend, scope: &Scope, warnings: &WarningLog) -> Result<()> {
    for round in 0..MAX_ROUNDS {
        let pids = backend.tasks(scope)?;
        if pids.is_empty() {
            return Ok(());
        }
        for pid in &pids {
            send(*pid, Signal::SIGKILL);
        }
        thread::sleep(Duration::from_millis(500) * round);
    }
    let left = backend.tasks(scope)?;
    if !left.is_empty() {
        warnings.push(format!(
            "{} processes of cgroup {} survived {} kill rounds: {:?}",
            left.len(),
            scope.name(),
            MAX_ROUNDS,
            left
        ));
    }
    Ok(())
}

fn wait_until_empty(backend: &dyn CgroupBackend, scope: &Scope, warnings: &WarningLog) {
    let start = Instant::now();
    while start.elapsed() < EMPTY_WAIT {
        match backend.tasks(scope) {
            Ok(pids) if pids.is_empty() => return,
            Ok(_) => thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                log::debug!("Could not list tasks of {}: {}", scope.name(), e);
                return;
            }
        }
    }
    warnings.push(format!(
        "Processes of cgroup {} still exist {:?} after being killed",
        scope.name(),
        EMPTY_WAIT
    ));
}

fn send(pid: Pid, signal: Signal) {
    match signal::kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::debug!("Failed to send {} to {}: {}", signal, pid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupVersion, Controller, LimitOutcome, ResourceLimit, Usage};
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Backend double that counts how the killer drives it
    #[derive(Debug, Default)]
    struct FakeBackend {
        tasks: Mutex<Vec<Pid>>,
        atomic: bool,
        freezer: bool,
        frozen_calls: Mutex<Vec<bool>>,
        controllers: BTreeSet<Controller>,
    }

    impl CgroupBackend for FakeBackend {
        fn version(&self) -> CgroupVersion {
            CgroupVersion::V2
        }
        fn controllers(&self) -> &BTreeSet<Controller> {
            &self.controllers
        }
        fn degradations(&self) -> &[String] {
            &[]
        }
        fn create_scope(&self) -> Result<Scope> {
            unimplemented!()
        }
        fn enter(&self, _: &Scope, _: Pid) -> Result<()> {
            Ok(())
        }
        fn membership_files(&self, _: &Scope) -> Vec<PathBuf> {
            Vec::new()
        }
        fn set_limit(&self, _: &Scope, _: &ResourceLimit) -> Result<LimitOutcome> {
            Ok(LimitOutcome::Applied)
        }
        fn read_cpu_time(&self, _: &Scope) -> Result<Option<f64>> {
            Ok(None)
        }
        fn read_usage(&self, _: &Scope) -> Result<Usage> {
            Ok(Usage::default())
        }
        fn oom_kill_count(&self, _: &Scope) -> Result<u64> {
            Ok(0)
        }
        fn allowed_cpus(&self) -> Result<BTreeSet<usize>> {
            Ok(BTreeSet::new())
        }
        fn allowed_memory_nodes(&self) -> Result<BTreeSet<usize>> {
            Ok(BTreeSet::new())
        }
        fn tasks(&self, _: &Scope) -> Result<Vec<Pid>> {
            Ok(self.tasks.lock().unwrap().clone())
        }
        fn kill_atomically(&self, _: &Scope) -> Result<bool> {
            if self.atomic {
                self.tasks.lock().unwrap().clear();
            }
            Ok(self.atomic)
        }
        fn set_frozen(&self, _: &Scope, frozen: bool) -> Result<bool> {
            if self.freezer {
                self.frozen_calls.lock().unwrap().push(frozen);
                if !frozen {
                    self.tasks.lock().unwrap().clear();
                }
            }
            Ok(self.freezer)
        }
        fn destroy_scope(&self, _: &Scope) -> Result<()> {
            Ok(())
        }
    }

    fn scope() -> Scope {
        Scope::new("benchmark_fake".into(), CgroupVersion::V2, BTreeMap::new())
    }

    // pids far above pid_max so that kill() reports ESRCH
    fn ghost_pids() -> Vec<Pid> {
        vec![Pid::from_raw(999_999_990), Pid::from_raw(999_999_991)]
    }

    #[test]
    fn test_empty_scope_is_noop() {
        let backend = FakeBackend::default();
        let strategy = kill_tree(&backend, &scope(), &WarningLog::new()).unwrap();
        assert_eq!(strategy, KillStrategy::AlreadyEmpty);
    }

    #[test]
    fn test_atomic_kill_preferred() {
        let backend = FakeBackend {
            atomic: true,
            freezer: true,
            ..Default::default()
        };
        *backend.tasks.lock().unwrap() = ghost_pids();
        let strategy = kill_tree(&backend, &scope(), &WarningLog::new()).unwrap();
        assert_eq!(strategy, KillStrategy::Atomic);
        assert!(backend.frozen_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_freezer_protocol_thaws() {
        let backend = FakeBackend {
            freezer: true,
            ..Default::default()
        };
        *backend.tasks.lock().unwrap() = ghost_pids();
        let warnings = WarningLog::new();
        let strategy = kill_tree(&backend, &scope(), &warnings).unwrap();
        assert_eq!(strategy, KillStrategy::Freezer);
        assert_eq!(*backend.frozen_calls.lock().unwrap(), vec![true, false]);
        assert!(warnings.snapshot().is_empty());
    }

    #[test]
    fn test_fallback_is_reported() {
        let backend = FakeBackend::default();
        let warnings = WarningLog::new();
        // nothing to kill once the loop starts: the loop sees an empty scope
        *backend.tasks.lock().unwrap() = ghost_pids();
        let backend_ref = &backend;
        let handle = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                backend_ref.tasks.lock().unwrap().clear();
            });
            kill_tree(backend_ref, &scope(), &warnings)
        });
        assert_eq!(handle.unwrap(), KillStrategy::SignalLoop);
        assert!(warnings.snapshot()[0].contains("No freezer"));
    }
}
