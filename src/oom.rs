/// Out-of-memory notification for cgroup v1
///
/// The memory controller of cgroup v1 signals OOM through an eventfd that is
/// registered in `cgroup.event_control`. The kernel OOM killer of the scope is
/// disabled so that the tasks pause when hitting the limit and the listener
/// decides how they die. cgroup v2 has no equivalent and is polled through
/// `memory.events` by the watchdog instead.
use crate::cgroup::{write_value, CgroupVersion, Controller, Scope};
use crate::types::{BenchError, Result, WarningLog};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Background thread blocked on the OOM eventfd of one scope
pub struct OomListener {
    cancelled: Arc<AtomicBool>,
    wakeup: File,
    handle: Option<JoinHandle<()>>,
}

impl OomListener {
    /// Register for OOM events of `scope`. Returns `None` when the scope has no
    /// v1 memory controller. `on_oom` runs on the listener thread.
    pub fn start<F>(scope: &Scope, warnings: WarningLog, on_oom: F) -> Result<Option<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        if scope.version() != CgroupVersion::V1 {
            return Ok(None);
        }
        let Some(memory) = scope.path(Controller::Memory) else {
            return Ok(None);
        };
        let memory = memory.to_path_buf();

        // SAFETY: eventfd has no memory-safety preconditions.
        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(BenchError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: efd is a fresh descriptor owned by nobody else.
        let event = unsafe { File::from_raw_fd(efd) };
        let oom_control = File::open(memory.join("memory.oom_control")).map_err(|e| {
            BenchError::Cgroup(format!("Cannot open memory.oom_control: {}", e))
        })?;
        write_value(
            &memory.join("cgroup.event_control"),
            &format!("{} {}", event.as_raw_fd(), oom_control.as_raw_fd()),
        )?;

        if let Err(e) = write_value(&memory.join("memory.oom_control"), "1") {
            warnings.push(format!(
                "Failed to disable the kernel OOM killer, memory limit reports may be imprecise: {}",
                e
            ));
        }

        let wakeup = event.try_clone()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let thread_cancelled = Arc::clone(&cancelled);
        let handle = thread::Builder::new()
            .name("oom-listener".to_string())
            .spawn(move || {
                listen(event, oom_control, memory, thread_cancelled, warnings, on_oom)
            })?;

        Ok(Some(Self {
            cancelled,
            wakeup,
            handle: Some(handle),
        }))
    }

    /// Stop listening and wait for the thread
    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancelled.store(true, Ordering::SeqCst);
        // any value makes the blocked read return
        if let Err(e) = self.wakeup.write_all(&1u64.to_ne_bytes()) {
            log::debug!("Failed to wake up OOM listener: {}", e);
        }
        let _ = handle.join();
    }
}

impl Drop for OomListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listen<F: FnOnce()>(
    mut event: File,
    _oom_control: File,
    memory: PathBuf,
    cancelled: Arc<AtomicBool>,
    warnings: WarningLog,
    on_oom: F,
) {
    let mut buffer = [0u8; 8];
    if let Err(e) = event.read_exact(&mut buffer) {
        log::debug!("OOM listener stopped: {}", e);
        return;
    }
    if cancelled.load(Ordering::SeqCst) {
        return;
    }
    log::debug!("OOM event in {}", memory.display());
    on_oom();

    // paused tasks need memory to process SIGKILL
    for file in ["memory.memsw.limit_in_bytes", "memory.limit_in_bytes"] {
        let path = memory.join(file);
        if path.exists() {
            if let Err(e) = write_value(&path, "-1") {
                warnings.push(format!("Could not lift {} after OOM: {}", file, e));
            }
        }
    }
}
