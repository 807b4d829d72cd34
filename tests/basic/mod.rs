use crate::{default_executor, run_in, tool_output};
use benchbox::killer::{kill_tree, KillStrategy};
use benchbox::types::{StdinSource, WarningLog};
use benchbox::{RunState, TerminationReason};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
#[serial]
fn test_true_completes_without_reason() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();

    let result = executor.execute(&run_in(&dir, &["true"])).expect("Run failed");
    assert_eq!(result.termination_reason, None);
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.exit.code, Some(0));
    assert!(result.usage.wall_time < 5.0);
    assert!(result.setup_error.is_none());
}

#[test]
#[serial]
fn test_exit_code_and_output() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let run = run_in(&dir, &["sh", "-c", "echo hello; echo oops >&2; exit 3"]);

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.exit.code, Some(3));
    assert_eq!(result.termination_reason, None);

    let content = fs::read_to_string(&run.output_file).unwrap();
    assert!(content.starts_with("sh -c echo hello; echo oops >&2; exit 3\n\n\n"));
    assert_eq!(tool_output(&run.output_file), "hello\noops\n");
}

#[test]
#[serial]
fn test_signal_is_reported() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();

    let result = executor
        .execute(&run_in(&dir, &["sh", "-c", "kill -9 $$"]))
        .expect("Run failed");
    assert_eq!(result.exit.signal, Some(libc::SIGKILL));
    assert_eq!(result.exit.code, None);
    assert_eq!(result.termination_reason, None);
}

#[test]
#[serial]
fn test_missing_command_is_setup_failure() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();

    let result = executor
        .execute(&run_in(&dir, &["/nonexistent/benchbox-tool"]))
        .expect("Setup failures are results, not errors");
    assert_eq!(result.state, RunState::SetupFailed);
    assert_eq!(result.termination_reason, Some(TerminationReason::SetupFailed));
    assert!(result.setup_error.unwrap().contains("not found"));
    assert_eq!(executor.registry().active(), 0);
}

#[test]
#[serial]
fn test_unwritable_output_is_setup_failure() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "").unwrap();
    let mut run = run_in(&dir, &["true"]);
    run.output_file = blocker.join("output.log");

    let result = executor
        .execute(&run)
        .expect("Setup failures are results, not errors");
    assert_eq!(result.state, RunState::SetupFailed);
    assert_eq!(result.termination_reason, Some(TerminationReason::SetupFailed));
    assert!(result.setup_error.is_some());
    assert_eq!(executor.registry().active(), 0);
}

#[test]
#[serial]
fn test_stdin_and_environment() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.txt");
    fs::write(&input, "from stdin\n").unwrap();

    let mut run = run_in(&dir, &["sh", "-c", "cat; echo \"$GREETING\"; test -d \"$HOME\" && echo home"]);
    run.stdin = StdinSource::File(input);
    run.environment
        .set
        .insert("GREETING".to_string(), "hi there".to_string());

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.exit.code, Some(0));
    assert_eq!(tool_output(&run.output_file), "from stdin\nhi there\nhome\n");
}

#[test]
#[serial]
fn test_stdin_defaults_to_null() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let run = run_in(&dir, &["cat"]);

    let result = executor.execute(&run).expect("Run failed");
    assert_eq!(result.exit.code, Some(0));
    assert_eq!(tool_output(&run.output_file), "");
}

#[test]
#[serial]
fn test_empty_command_is_rejected() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    let run = run_in(&dir, &[]);
    assert!(executor.execute(&run).is_err());
}

#[test]
#[serial]
fn test_teardown_is_idempotent() {
    let Some(executor) = default_executor() else { return };
    let backend = executor.backend();
    let scope = backend.create_scope().unwrap();
    let warnings = WarningLog::new();

    assert_eq!(
        kill_tree(backend.as_ref(), &scope, &warnings).unwrap(),
        KillStrategy::AlreadyEmpty
    );
    backend.destroy_scope(&scope).unwrap();
    backend.destroy_scope(&scope).unwrap();
    assert_eq!(
        kill_tree(backend.as_ref(), &scope, &warnings).unwrap(),
        KillStrategy::AlreadyEmpty
    );
    for dir in scope.dirs() {
        assert!(!dir.exists());
    }
}

#[test]
#[serial]
fn test_executor_is_reusable() {
    let Some(executor) = default_executor() else { return };
    let dir = TempDir::new().unwrap();
    for code in [0, 1, 2] {
        let script = format!("exit {}", code);
        let result = executor
            .execute(&run_in(&dir, &["sh", "-c", &script]))
            .expect("Run failed");
        assert_eq!(result.exit.code, Some(code));
    }
    assert_eq!(executor.registry().active(), 0);
}
