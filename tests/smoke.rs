//! Smoke tests -- verify the binary runs and the CLI surface is wired up.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("qprunner")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Run database server test suites"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("qprunner")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("qprunner"));
}

#[test]
fn test_help_lists_every_mode() {
    let assert = Command::cargo_bin("qprunner").unwrap().arg("--help").assert().success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for mode in ["dtr", "randgen", "sysbench", "sqlbench", "crashme", "cleanup"] {
        assert!(out.contains(mode), "mode {mode} missing from --help");
    }
}

#[test]
fn test_unknown_mode_is_rejected() {
    Command::cargo_bin("qprunner")
        .unwrap()
        .args(["--mode", "nosuchmode"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("nosuchmode"));
}

#[test]
fn test_bad_config_file_exits_2() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("qprunner.toml");
    std::fs::write(&config, "[ports]\nblock_size = 2\n").unwrap();
    Command::cargo_bin("qprunner")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicates::str::contains("block_size"));
}
