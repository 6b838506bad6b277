//! Delay-accounting behavior across real threads
//!
//! These tests run against an installed profiler with an empty source scope:
//! no line is ever in scope, so no round opens, the delay size stays zero,
//! and the only movements of the global delay counter are the ones the tests
//! make themselves. That keeps the ledger arithmetic exact while the real
//! sample handler stays armed.

use std::sync::{Mutex, Once};

use acelera::{Config, DelaySnapshot, Profiler};

static START: Once = Once::new();
static LEDGER: Mutex<()> = Mutex::new(());

fn profiler() -> &'static Profiler {
    START.call_once(|| {
        let output = std::env::temp_dir().join(format!(
            "acelera-thread-delay-{}.acelera",
            std::process::id()
        ));
        let config = Config::new()
            .with_output(output)
            .with_scope_dir("/nonexistent/acelera/scope");
        acelera::startup(config).expect("profiler startup failed");
    });
    Profiler::try_global().expect("profiler installed by startup")
}

#[test]
fn test_child_thread_inherits_parent_ledger() {
    let profiler = profiler();
    let _ledger = LEDGER.lock().unwrap();

    let snapshot = std::thread::spawn(move || {
        profiler.handle_thread_start(DelaySnapshot {
            delay_count: 42,
            excess_delay: 1000,
        });
        let snapshot = profiler.delay_snapshot();
        profiler.handle_thread_exit();
        snapshot
    })
    .join()
    .unwrap();

    assert_eq!(snapshot.delay_count, 42);
    assert_eq!(snapshot.excess_delay, 1000);
}

#[test]
fn test_skip_delays_credits_delays_issued_while_blocked() {
    let profiler = profiler();
    let _ledger = LEDGER.lock().unwrap();

    let after = std::thread::spawn(move || {
        // Seed well above anything previously published so the arithmetic
        // below is self-contained
        profiler.handle_thread_start(DelaySnapshot {
            delay_count: 100_000,
            excess_delay: 0,
        });
        profiler.catch_up(); // publish: global delay count is now 100_000
        profiler.snapshot_delays();

        // Ten delays land while this thread is "blocked"
        std::thread::spawn(move || {
            profiler.handle_thread_start(DelaySnapshot {
                delay_count: 100_010,
                excess_delay: 0,
            });
            profiler.catch_up();
            profiler.handle_thread_exit();
        })
        .join()
        .unwrap();

        profiler.skip_delays();
        let after = profiler.delay_snapshot().delay_count;
        profiler.handle_thread_exit();
        after
    })
    .join()
    .unwrap();

    assert_eq!(after, 100_010);
}

#[test]
fn test_spawn_runs_closure_and_settles() {
    let _ = profiler();
    let handle = acelera::spawn(|| 21 * 2);
    assert_eq!(handle.join().unwrap(), 42);
}

#[test]
fn test_spawn_settles_on_panic() {
    let _ = profiler();
    let handle = acelera::spawn(|| panic!("workload failure"));
    assert!(handle.join().is_err());

    // The engine is still usable after the panicked thread exited
    let handle = acelera::spawn(|| "still alive");
    assert_eq!(handle.join().unwrap(), "still alive");
}

#[test]
fn test_blocking_returns_value() {
    let _ = profiler();
    let value = acelera::blocking(|| {
        std::thread::sleep(std::time::Duration::from_millis(10));
        7
    });
    assert_eq!(value, 7);
}

#[test]
fn test_free_functions_are_safe_to_call() {
    let _ = profiler();
    std::thread::spawn(|| {
        acelera::snapshot_delays();
        acelera::skip_delays();
        acelera::catch_up();
    })
    .join()
    .unwrap();
}
