use crate::{default_executor, run_in, test_executor, tool_output};
use benchbox::cgroup::{CgroupVersion, Controller};
use benchbox::{ExecutorConfig, RunRegistry, RunState, TerminationReason};
use benchbox::executor::RunExecutor;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BUSY_LOOP: &str = "while :; do :; done";

#[test]
#[serial]
fn test_sleeping_tool_hits_cpu_limit_by_wall_time() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["sleep", "100"]);
    run.limits.cpu_time_hard = Some(Duration::from_secs(1));

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::CpuTime));
    assert_eq!(result.state, RunState::LimitViolated);
    assert!(result.usage.wall_time < 3.0, "wall time {}", result.usage.wall_time);
    assert_eq!(result.exit.signal, Some(libc::SIGKILL));
}

#[test]
#[serial]
fn test_busy_loop_hits_cpu_limit() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["sh", "-c", BUSY_LOOP]);
    run.limits.cpu_time_hard = Some(Duration::from_secs(1));

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::CpuTime));
    assert!(result.usage.cpu_time <= 1.0 + 2.0, "cpu time {}", result.usage.cpu_time);
}

#[test]
#[serial]
fn test_soft_limit_sends_term() {
    let Some(executor) = default_executor() else { return };
    if !executor.backend().controllers().contains(&Controller::Cpu) {
        eprintln!("Skipping: no CPU accounting");
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["sh", "-c", BUSY_LOOP]);
    run.limits.cpu_time_soft = Some(Duration::from_secs(1));
    run.limits.cpu_time_hard = Some(Duration::from_secs(5));

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::CpuTimeSoft));
    assert_eq!(result.exit.signal, Some(libc::SIGTERM));
    assert!(result.usage.cpu_time < 5.0);
}

#[test]
#[serial]
fn test_wall_time_limit() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["sleep", "100"]);
    run.limits.wall_time = Some(Duration::from_secs(1));

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::WallTime));
    assert!(result.usage.wall_time >= 1.0 && result.usage.wall_time < 3.0);
}

#[test]
#[serial]
fn test_soft_limit_above_hard_is_rejected() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["true"]);
    run.limits.cpu_time_soft = Some(Duration::from_secs(5));
    run.limits.cpu_time_hard = Some(Duration::from_secs(1));
    assert!(executor.execute(&run).is_err());
}

#[test]
#[serial]
fn test_memory_limit() {
    let Some(executor) = default_executor() else { return };
    if !executor.backend().controllers().contains(&Controller::Memory) {
        eprintln!("Skipping: no memory controller");
        return;
    }
    if executor.backend().version() == CgroupVersion::V1 && benchbox::system::has_swap() {
        eprintln!("Skipping: the tool could swap instead of running out of memory");
        return;
    }
    let dir = TempDir::new().unwrap();
    // dd allocates and fills a buffer of one block
    let mut run = run_in(
        &dir,
        &["dd", "if=/dev/zero", "of=/dev/null", "bs=256M", "count=4"],
    );
    run.limits.memory = Some(64_000_000);
    run.limits.wall_time = Some(Duration::from_secs(30));

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::Memory));
    assert_eq!(result.state, RunState::LimitViolated);
}

#[test]
#[serial]
fn test_fork_bomb_is_contained() {
    let Some(executor) = default_executor() else { return };
    if !executor.backend().controllers().contains(&Controller::Pids) {
        eprintln!("Skipping: no pids controller to bound the fork bomb");
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["sh", "-c", "bomb() { bomb | bomb & }; bomb; sleep 100"]);
    run.limits.max_processes = Some(128);
    run.limits.wall_time = Some(Duration::from_secs(2));

    let start = Instant::now();
    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::WallTime));
    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(executor.registry().active(), 0);
}

#[test]
#[serial]
fn test_external_stop_kills_run() {
    let Some(base) = default_executor() else { return };
    let registry = Arc::new(RunRegistry::new());
    let executor = RunExecutor::with_backend(
        Arc::clone(base.backend()),
        ExecutorConfig::default(),
        Arc::clone(&registry),
    );
    let dir = TempDir::new().unwrap();
    let run = run_in(&dir, &["sleep", "100"]);

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        registry.stop_all()
    });
    let start = Instant::now();
    let result = executor.execute(&run).expect("Run failed");
    stopper.join().unwrap();

    assert_eq!(result.termination_reason, Some(TerminationReason::Killed));
    assert_eq!(result.state, RunState::Interrupted);
    assert!(start.elapsed() < Duration::from_secs(10));

    // runs started after the interrupt do not get to run
    let result = executor
        .execute(&run_in(&dir, &["sleep", "100"]))
        .expect("Run failed");
    assert_eq!(result.termination_reason, Some(TerminationReason::Killed));
    assert_eq!(result.state, RunState::Interrupted);
}

#[test]
#[serial]
fn test_output_is_shrunk() {
    let config = ExecutorConfig {
        max_output_size: Some(1000),
        ..ExecutorConfig::default()
    };
    let Some(executor) = test_executor(config) else { return };
    let dir = TempDir::new().unwrap();
    let run = run_in(&dir, &["seq", "1", "10000"]);

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.exit.code, Some(0));
    let size = std::fs::metadata(&run.output_file).unwrap().len();
    assert!(size < 1500, "output has {} bytes", size);
    assert!(result.warnings.iter().any(|w| w.contains("too large")));
}

#[test]
#[serial]
fn test_files_size_does_not_cap_plain_output() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let mut run = run_in(&dir, &["sh", "-c", "yes x | head -c 10000"]);
    run.limits.files_size = Some(1000);

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.termination_reason, None);
    assert_eq!(result.exit.code, Some(0));
    assert_eq!(result.exit.signal, None);
    assert_eq!(tool_output(&run.output_file).len(), 10000);
    assert!(result
        .warnings
        .iter()
        .any(|warning| warning.contains("only enforced in container mode")));
}
