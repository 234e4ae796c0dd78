//! End-to-end smoke tests driving the compiled `filejobrouterd` binary
//! directly, the way `assert_cmd` is already used elsewhere in the crate's
//! test suite for CLI-level behaviour.

use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(dir: &Path, mutex_name: &str) {
    let config = format!(
        r#"{{
            "WatchDirectory": {watch:?},
            "TimeoutSeconds": 5,
            "MaxRetryCount": 1,
            "LogDirectory": {logs:?},
            "JobsDirectory": {jobs:?},
            "QueueBaseDirectory": {queue:?},
            "MutexName": {mutex:?},
            "Mappings": {{}},
            "IgnoreHiddenAndSystemFiles": true
        }}"#,
        watch = dir.join("watch").to_string_lossy(),
        logs = dir.join("logs").to_string_lossy(),
        jobs = dir.join("jobs").to_string_lossy(),
        queue = dir.join("queue").to_string_lossy(),
        mutex = mutex_name,
    );
    std::fs::create_dir_all(dir.join("watch")).unwrap();
    let mut file = std::fs::File::create(dir.join("config.json")).unwrap();
    file.write_all(config.as_bytes()).unwrap();
}

#[test]
fn missing_config_exits_with_fatal_diagnostic() {
    let dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("filejobrouterd").unwrap();
    cmd.arg("--start-dir").arg(dir.path());
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no config.json found"));
}

#[cfg(unix)]
#[test]
fn second_instance_on_same_host_exits_nonzero_while_first_runs() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "CliStartupTestDevice");

    let binary = assert_cmd::cargo::cargo_bin("filejobrouterd");

    let mut first = Command::new(&binary)
        .arg("--start-dir")
        .arg(dir.path())
        .spawn()
        .unwrap();

    // Give the first engine time to acquire the Instance Guard lock file.
    std::thread::sleep(Duration::from_millis(500));

    let second = Command::new(&binary)
        .arg("--start-dir")
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(!second.status.success());
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(stderr.contains("already running"), "unexpected stderr: {stderr}");

    unsafe {
        libc::kill(first.id() as libc::pid_t, libc::SIGTERM);
    }
    let status = first.wait().unwrap();
    assert!(status.success(), "first instance should shut down cleanly on SIGTERM");
}
