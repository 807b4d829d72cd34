use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

fn benchbox() -> Command {
    Command::cargo_bin("benchbox").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    benchbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check-cgroups"));
}

#[test]
fn test_run_requires_command() {
    benchbox().arg("run").assert().failure();
}

#[test]
fn test_invalid_limit_is_rejected() {
    benchbox()
        .args(["run", "--memlimit", "lots", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid memory value"));
}

#[test]
fn test_dir_modes_require_container() {
    benchbox()
        .args(["run", "--hidden-dir", "/home", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("require --container"));
}

#[test]
#[serial]
fn test_check_cgroups_reports_features() {
    benchbox()
        .arg("check-cgroups")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cgroups:"))
        .stdout(predicate::str::contains("Seccomp:"))
        .stdout(predicate::str::contains("User namespaces:"));
}

#[test]
#[serial]
fn test_run_prints_report() {
    if crate::default_executor().is_none() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("tool.log");
    benchbox()
        .current_dir(dir.path())
        .args(["run", "--output"])
        .arg(&output)
        .args(["--", "sh", "-c", "echo measured; exit 4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("returnvalue=4"))
        .stdout(predicate::str::contains("cputime="))
        .stdout(predicate::str::contains("terminationreason").not());
    assert!(std::fs::read_to_string(&output).unwrap().ends_with("measured\n"));
}

#[test]
#[serial]
fn test_run_json_with_limit() {
    if crate::default_executor().is_none() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let assert = benchbox()
        .current_dir(dir.path())
        .args(["run", "--json", "--walltimelimit", "1s", "--", "sleep", "60"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["termination_reason"], "walltime");
    assert_eq!(result["state"], "LIMIT_VIOLATED");
}
