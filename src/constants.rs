//! Sampling and experiment constants
//!
//! Periods are expressed in nanoseconds of task CPU time, not wall time.

/// Nanoseconds of task CPU time between samples (1 ms)
pub const SAMPLE_PERIOD_NS: u64 = 1_000_000;

/// Samples accumulated per thread wakeup
pub const SAMPLE_WAKEUP_COUNT: u64 = 10;

/// Samples required to close an experiment round
pub const MIN_ROUND_SAMPLES: usize = 100;

/// Granularity of randomly drawn speedups: delay sizes are multiples of
/// `SAMPLE_PERIOD_NS / SPEEDUP_DIVISIONS`
pub const SPEEDUP_DIVISIONS: u64 = 20;

/// Realtime signal used to wake threads for sample draining
///
/// A function rather than a constant: glibc reserves the first few realtime
/// signals for its own threading implementation, so `SIGRTMIN` is only known
/// at runtime.
pub fn sample_signal() -> libc::c_int {
    libc::SIGRTMIN() + 7
}
