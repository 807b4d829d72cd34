use crate::{containers_supported, default_executor, run_in, test_executor, tool_output};
use benchbox::types::ContainerConfig;
use benchbox::{DirMode, ExecutorConfig, RunResult, RunState, TerminationReason};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn container_config(output_dir: &Path) -> ContainerConfig {
    ContainerConfig {
        output_dir: output_dir.to_path_buf(),
        ..ContainerConfig::default()
    }
}

/// Scratch directory outside of /tmp, which containers hide by default
fn scratch_dir() -> TempDir {
    TempDir::new_in(env!("CARGO_TARGET_TMPDIR")).unwrap()
}

/// Some environments allow user namespaces but refuse the mounts we need
fn usable(result: &RunResult) -> bool {
    if result.state == RunState::SetupFailed {
        eprintln!("Skipping: container setup failed: {:?}", result.setup_error);
        return false;
    }
    true
}

#[test]
#[serial]
fn test_hidden_tmp_with_retrieval() {
    if !containers_supported() {
        return;
    }
    let Some(executor) = default_executor() else { return };
    let dir = scratch_dir();
    let output_dir = dir.path().join("output.files");
    let host_file = Path::new("/tmp/out.txt");
    let existed = host_file.exists();

    let mut run = run_in(&dir, &["sh", "-c", "echo result > /tmp/out.txt"]);
    let mut config = container_config(&output_dir);
    config.dir_rules.insert(PathBuf::from("/"), DirMode::Overlay);
    config.dir_rules.insert(PathBuf::from("/tmp"), DirMode::Hidden);
    config.result_files = vec!["/tmp/out.txt".to_string()];
    run.container = Some(config);

    let result = executor.execute(&run).expect("Run failed");
    if !usable(&result) {
        return;
    }
    assert_eq!(result.exit.code, Some(0), "output: {}", tool_output(&run.output_file));
    assert_eq!(result.termination_reason, None);
    if !existed {
        assert!(!host_file.exists());
    }

    let retrieved = result
        .result_files
        .iter()
        .find(|file| file.file_name().is_some_and(|name| name == "out.txt"))
        .expect("out.txt was not retrieved");
    let content = fs::read_to_string(output_dir.join(retrieved)).unwrap();
    assert_eq!(content, "result\n");
}

#[test]
#[serial]
fn test_overlay_writes_stay_in_container() {
    if !containers_supported() {
        return;
    }
    let Some(executor) = default_executor() else { return };
    let dir = scratch_dir();
    let output_dir = dir.path().join("output.files");
    let work = dir.path().join("work");
    fs::create_dir(&work).unwrap();
    fs::write(work.join("input.txt"), "original\n").unwrap();

    let mut run = run_in(
        &dir,
        &["sh", "-c", "cat input.txt; echo changed > input.txt; echo new > created.txt"],
    );
    run.working_dir = Some(work.clone());
    run.output_file = dir.path().join("output.log");
    let mut config = container_config(&output_dir);
    config.result_files = vec!["created.txt".to_string()];
    run.container = Some(config);

    let result = executor.execute(&run).expect("Run failed");
    if !usable(&result) {
        return;
    }
    assert_eq!(result.exit.code, Some(0));
    assert_eq!(tool_output(&run.output_file), "original\n");
    assert_eq!(fs::read_to_string(work.join("input.txt")).unwrap(), "original\n");
    assert!(!work.join("created.txt").exists());
    assert_eq!(result.result_files, vec![PathBuf::from("created.txt")]);
    assert_eq!(
        fs::read_to_string(output_dir.join("created.txt")).unwrap(),
        "new\n"
    );
}

#[test]
#[serial]
fn test_read_only_dir_refuses_writes() {
    if !containers_supported() {
        return;
    }
    let Some(executor) = default_executor() else { return };
    let dir = scratch_dir();
    let protected = dir.path().join("protected");
    fs::create_dir(&protected).unwrap();

    let script = format!("echo x > {}/file", protected.display());
    let mut run = run_in(&dir, &["sh", "-c", &script]);
    let mut config = container_config(&dir.path().join("output.files"));
    config.dir_rules.insert(dir.path().to_path_buf(), DirMode::FullAccess);
    config.dir_rules.insert(protected.clone(), DirMode::ReadOnly);
    run.container = Some(config);

    let result = executor.execute(&run).expect("Run failed");
    if !usable(&result) {
        return;
    }
    assert_ne!(result.exit.code, Some(0));
    assert!(!protected.join("file").exists());
}

#[test]
#[serial]
fn test_container_identity() {
    if !containers_supported() {
        return;
    }
    let Some(executor) = default_executor() else { return };
    let dir = scratch_dir();
    let mut run = run_in(
        &dir,
        &["sh", "-c", "cat /etc/hostname; id -u; echo $HOME; echo $$"],
    );
    run.container = Some(container_config(&dir.path().join("output.files")));

    let result = executor.execute(&run).expect("Run failed");
    if !usable(&result) {
        return;
    }
    let output = tool_output(&run.output_file);
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines[0], "benchexec");
    assert_eq!(lines[1], "1000");
    assert_eq!(lines[2], "/home/benchexec");
    // pid 1 is the container init
    let pid: u32 = lines[3].parse().unwrap();
    assert!(pid > 1 && pid < 10, "tool has pid {}", pid);
}

#[test]
#[serial]
fn test_files_count_limit() {
    if !containers_supported() {
        return;
    }
    let config = ExecutorConfig {
        file_check_interval: Duration::from_millis(200),
        ..ExecutorConfig::default()
    };
    let Some(executor) = test_executor(config) else { return };
    let dir = scratch_dir();
    let mut run = run_in(
        &dir,
        &["sh", "-c", "i=0; while :; do i=$((i+1)); echo x > /tmp/f$i; done"],
    );
    run.limits.files_count = Some(100);
    run.limits.wall_time = Some(Duration::from_secs(30));
    run.container = Some(container_config(&dir.path().join("output.files")));

    let result = executor.execute(&run).expect("Run failed");
    if !usable(&result) {
        return;
    }
    assert_eq!(result.termination_reason, Some(TerminationReason::FilesCount));
}

#[test]
#[serial]
fn test_files_size_limit() {
    if !containers_supported() {
        return;
    }
    let config = ExecutorConfig {
        file_check_interval: Duration::from_millis(200),
        ..ExecutorConfig::default()
    };
    let Some(executor) = test_executor(config) else { return };
    let dir = scratch_dir();
    let mut run = run_in(&dir, &["sh", "-c", "head -c 100000 /dev/zero > /tmp/big; sleep 5"]);
    run.limits.files_size = Some(10000);
    run.limits.wall_time = Some(Duration::from_secs(30));
    run.container = Some(container_config(&dir.path().join("output.files")));

    let result = executor.execute(&run).expect("Run failed");
    if !usable(&result) {
        return;
    }
    assert_eq!(result.termination_reason, Some(TerminationReason::FilesSize));
    assert_eq!(result.state, RunState::LimitViolated);
    // the write itself must not be cut short by a per-process file size limit
    assert_ne!(result.exit.signal, Some(libc::SIGXFSZ));
}

#[test]
#[serial]
fn test_invalid_dir_rule_is_rejected() {
    if !containers_supported() {
        return;
    }
    let Some(executor) = default_executor() else { return };
    let dir = scratch_dir();
    let mut run = run_in(&dir, &["true"]);
    let mut config = container_config(&dir.path().join("output.files"));
    config.dir_rules.insert(PathBuf::from("relative/dir"), DirMode::Hidden);
    run.container = Some(config);

    assert!(executor.execute(&run).is_err());
}
