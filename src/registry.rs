/// Process-wide registry of in-flight runs
///
/// Termination signals of the calling program are handled on a dedicated
/// thread that asks every registered run to stop. Each run then goes through
/// its normal cleanup, so the program exits only after all scopes are gone.
use crate::types::{BenchError, Result};
use nix::sys::signal::{SigSet, Signal};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

type StopAction = Box<dyn Fn() + Send + Sync>;

/// Cancellation handle of one run
pub struct RunHandle {
    id: u64,
    name: String,
    stop_requested: AtomicBool,
    action: Mutex<Option<StopAction>>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}

impl RunHandle {
    fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            stop_requested: AtomicBool::new(false),
            action: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Install what stopping means once there is something to stop. Runs
    /// the action right away if a stop was requested before.
    pub fn set_stop_action<F: Fn() + Send + Sync + 'static>(&self, action: F) {
        let mut slot = self.action.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_stop_requested() {
            action();
        }
        *slot = Some(Box::new(action));
    }

    /// Remove the action, e.g. once the scope is destroyed
    pub fn clear_stop_action(&self) {
        self.action.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    /// Request the run to stop. Later requests are ignored.
    pub fn stop(&self) -> bool {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            log::debug!("Run {} is already stopping", self.name);
            return false;
        }
        log::info!("Stopping run {}", self.name);
        let slot = self.action.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(action) = slot.as_ref() {
            action();
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<BTreeMap<u64, Arc<RunHandle>>>,
    idle: Condvar,
    next_id: AtomicU64,
    interrupted: AtomicBool,
    handler_installed: AtomicBool,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry the signal handler of this program consults
    pub fn global() -> Arc<RunRegistry> {
        static GLOBAL: OnceLock<Arc<RunRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(RunRegistry::new())))
    }

    /// Add a run. It stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, name: impl Into<String>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(RunHandle::new(id, name.into()));
        if self.was_interrupted() {
            // the program is shutting down, new runs stop immediately
            handle.stop_requested.store(true, Ordering::SeqCst);
        }
        self.runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Arc::clone(&handle));
        Registration {
            registry: Arc::clone(self),
            handle,
        }
    }

    pub fn active(&self) -> usize {
        self.runs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Ask every registered run to stop; returns how many were newly stopped
    pub fn stop_all(&self) -> usize {
        self.interrupted.store(true, Ordering::SeqCst);
        let handles: Vec<Arc<RunHandle>> = self
            .runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        handles.iter().filter(|handle| handle.stop()).count()
    }

    /// Wait until every run has finished its cleanup
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        while !runs.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            runs = self
                .idle
                .wait_timeout(runs, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
        true
    }

    fn unregister(&self, id: u64) {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.remove(&id);
        if runs.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Route SIGINT and SIGTERM of this program to `stop_all`.
    ///
    /// Must be called before any other thread is started: the signals are
    /// blocked in the calling thread, and threads inherit that mask, so only
    /// the handler thread ever receives them.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        if self.handler_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let signals = termination_signals();
        signals
            .thread_block()
            .map_err(|e| BenchError::Process(format!("Failed to block signals: {}", e)))?;

        let registry = Arc::clone(self);
        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || loop {
                match signals.wait() {
                    Ok(signal) => {
                        if registry.was_interrupted() {
                            log::warn!("Received {}, already stopping all runs", signal);
                            continue;
                        }
                        log::warn!("Received {}, stopping all runs", signal);
                        let stopped = registry.stop_all();
                        log::debug!("{} runs were asked to stop", stopped);
                    }
                    Err(e) => {
                        log::error!("Waiting for signals failed: {}", e);
                        return;
                    }
                }
            })
            .map_err(|e| BenchError::Process(format!("Failed to start signal thread: {}", e)))?;
        Ok(())
    }
}

/// Signals that stop all runs
pub fn termination_signals() -> SigSet {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGHUP);
    signals
}

/// Undo the signal mask of the program in a freshly forked child, which
/// would otherwise never see SIGTERM from a soft CPU limit
pub fn reset_signal_mask() -> Result<()> {
    SigSet::empty()
        .thread_set_mask()
        .map_err(|e| BenchError::Process(format!("Failed to reset signal mask: {}", e)))
}

/// Membership of one run in the registry
#[derive(Debug)]
pub struct Registration {
    registry: Arc<RunRegistry>,
    handle: Arc<RunHandle>,
}

impl Registration {
    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.handle.clear_stop_action();
        self.registry.unregister(self.handle.id);
    }
}
