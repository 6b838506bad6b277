//! Launcher binary behavior
//!
//! The `acelera` binary only arranges the environment and execs the target,
//! so the tests run it against tiny standard commands.

use std::process::Command;

fn launcher() -> Command {
    Command::new(env!("CARGO_BIN_EXE_acelera"))
}

#[test]
fn test_execs_the_target_command() {
    let status = launcher().args(["--", "true"]).status().unwrap();
    assert!(status.success());
}

#[test]
fn test_target_exit_code_passes_through() {
    let status = launcher().args(["--", "false"]).status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_exports_profiler_environment() {
    let output = launcher()
        .args([
            "-o",
            "/tmp/launcher-test.acelera",
            "--fixed-line",
            "main.rs:10",
            "--fixed-speedup",
            "25",
            "--",
            "env",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ACELERA_ENABLED=1"), "{stdout}");
    assert!(stdout.contains("ACELERA_OUTPUT=/tmp/launcher-test.acelera"), "{stdout}");
    assert!(stdout.contains("ACELERA_FIXED_LINE=main.rs:10"), "{stdout}");
    assert!(stdout.contains("ACELERA_FIXED_SPEEDUP=25"), "{stdout}");
}

#[test]
fn test_requires_a_command() {
    let output = launcher().output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_missing_target_fails() {
    let status = launcher()
        .args(["--", "/nonexistent/acelera/target"])
        .status()
        .unwrap();
    assert!(!status.success());
}
