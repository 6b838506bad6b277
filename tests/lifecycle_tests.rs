//! Startup-to-shutdown record stream
//!
//! One test drives a full profiler lifetime so the record assertions see a
//! single deterministic output file. The scope is pointed at a directory
//! that doesn't exist: with no line ever in scope no round can open, and
//! the stream reduces to startup, counter registrations, and shutdown.

use std::fs;

use acelera::Config;

#[test]
fn test_lifecycle_records() {
    let dir = std::env::temp_dir();
    let output = dir.join(format!("acelera-lifecycle-{}.acelera", std::process::id()));

    let config = Config::new()
        .with_output(&output)
        .with_scope_dir("/nonexistent/acelera/scope")
        .with_progress_line("no_such_file.rs:123");
    acelera::startup(config).expect("profiler startup failed");

    // Application-side progress points register on first hit
    for _ in 0..3 {
        acelera::progress!("units_done");
    }

    // A second startup in the same process is refused
    let second = dir.join(format!("acelera-lifecycle-second-{}.acelera", std::process::id()));
    let result = acelera::startup(Config::new().with_output(&second).with_scope_dir("/nonexistent/acelera/scope"));
    assert!(result.is_err(), "second startup must fail");

    // Shutdown latches: the second call must not duplicate records
    acelera::shutdown();
    acelera::shutdown();

    let contents = fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = contents.lines().collect();

    assert_eq!(
        lines.first().copied(),
        Some(format!("startup\tperiod={}", acelera::constants::SAMPLE_PERIOD_NS).as_str()),
        "stream: {contents}"
    );
    assert_eq!(lines.last().copied(), Some("shutdown"));
    assert_eq!(lines.iter().filter(|l| **l == "shutdown").count(), 1);

    // The resolved progress point is announced exactly once; the unresolved
    // name from the config produced a warning and nothing else
    assert_eq!(
        lines
            .iter()
            .filter(|l| **l == "counter_add\tname=units_done\tkind=progress")
            .count(),
        1
    );
    assert!(!contents.contains("no_such_file.rs"));

    // No line was ever in scope, so no round ever opened
    assert!(!contents.contains("start_round"));
    assert!(!contents.contains("end_round"));

    let _ = fs::remove_file(&output);
    let _ = fs::remove_file(&second);
}
