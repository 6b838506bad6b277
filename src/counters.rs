//! Progress counters
//!
//! A counter is a named throughput signal reported in the experiment output.
//! Sampling counters ride on a source line: their value is that line's
//! cumulative sample count. Progress counters are incremented explicitly by
//! the application, typically through the [`progress!`](crate::progress)
//! macro at a point where one unit of work completes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::line_map::Line;
use crate::profiler::Profiler;

/// How a counter derives its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Incremented implicitly by samples landing on the counter's line
    Sampling,
    /// Incremented explicitly by the application
    Progress,
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKind::Sampling => write!(f, "sampling"),
            CounterKind::Progress => write!(f, "progress"),
        }
    }
}

/// A named progress signal, snapshotted at round boundaries
pub struct Counter {
    name: String,
    kind: CounterKind,
    line: Option<Arc<Line>>,
    cell: AtomicU64,
}

impl Counter {
    /// A counter that tracks samples landing on `line`
    pub fn sampling(name: impl Into<String>, line: Arc<Line>) -> Counter {
        Counter {
            name: name.into(),
            kind: CounterKind::Sampling,
            line: Some(line),
            cell: AtomicU64::new(0),
        }
    }

    /// An application-driven work counter
    pub fn progress(name: impl Into<String>) -> Counter {
        Counter {
            name: name.into(),
            kind: CounterKind::Progress,
            line: None,
            cell: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    /// Line this counter is attached to, for sampling counters
    pub fn line(&self) -> Option<&Arc<Line>> {
        self.line.as_ref()
    }

    /// Record one unit of progress
    pub fn increment(&self) {
        self.cell.fetch_add(1, Ordering::Relaxed);
    }

    /// Current reading
    pub fn value(&self) -> u64 {
        match self.kind {
            CounterKind::Sampling => self.line.as_ref().map_or(0, |line| line.samples()),
            CounterKind::Progress => self.cell.load(Ordering::Relaxed),
        }
    }
}

/// Resolve a per-call-site progress counter, registering it with the global
/// profiler on first use
///
/// Support function for the [`progress!`](crate::progress) macro; not meant
/// to be called directly.
pub fn progress_point(slot: &OnceLock<Arc<Counter>>, name: &str) -> Arc<Counter> {
    slot.get_or_init(|| {
        let counter = Arc::new(Counter::progress(name));
        if let Some(profiler) = Profiler::try_global() {
            profiler.register_counter(counter.clone());
        }
        counter
    })
    .clone()
}

/// Mark a progress point: one unit of application work completed
///
/// With no argument the counter is named after the call site
/// (`file:line`); with an argument the given name is used. The counter is
/// registered with the profiler the first time the point is hit.
#[macro_export]
macro_rules! progress {
    () => {
        $crate::progress!(concat!(file!(), ":", line!()))
    };
    ($name:expr) => {{
        static POINT: ::std::sync::OnceLock<::std::sync::Arc<$crate::counters::Counter>> =
            ::std::sync::OnceLock::new();
        $crate::counters::progress_point(&POINT, $name).increment();
    }};
}
