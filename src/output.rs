//! Experiment record sink
//!
//! Append-only, line-oriented, one tab-separated record per event:
//!
//! ```text
//! startup	period=1000000
//! counter_add	name=main.rs:42	kind=sampling	line=src/main.rs:42
//! start_round	line=src/main.rs:42
//! end_round	delta_delays=18	delay_size=250000
//! counter_snapshot	name=main.rs:42	value=731
//! shutdown
//! ```
//!
//! Record order within one thread is preserved; interleaving across threads
//! is whatever the writer lock serializes. Write failures are swallowed
//! after creation: the sink is advisory output, never a reason to disturb
//! the profiled program.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

use crate::counters::Counter;
use crate::line_map::Line;

/// Append-only experiment record writer
pub struct Output {
    writer: Mutex<BufWriter<File>>,
}

impl Output {
    /// Create (truncating) the output file
    pub fn create(path: &Path) -> Result<Output> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file: {}", path.display()))?;
        Ok(Output {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Record profiler startup and the sampling period
    pub fn startup(&self, period_ns: u64) {
        self.record(|w| writeln!(w, "startup\tperiod={period_ns}"));
    }

    /// Record a newly registered counter
    pub fn add_counter(&self, counter: &Counter) {
        self.record(|w| {
            write!(w, "counter_add\tname={}\tkind={}", counter.name(), counter.kind())?;
            if let Some(line) = counter.line() {
                write!(w, "\tline={line}")?;
            }
            writeln!(w)
        });
    }

    /// Record the opening of a round on `line`
    pub fn start_round(&self, line: &Line) {
        self.record(|w| writeln!(w, "start_round\tline={line}"));
    }

    /// Record the close of a round: delays issued during it and the per-delay
    /// pause size
    pub fn end_round(&self, delta_delays: u64, delay_size: u64) {
        self.record(|w| {
            writeln!(w, "end_round\tdelta_delays={delta_delays}\tdelay_size={delay_size}")
        });
    }

    /// Record one counter reading
    pub fn counter_snapshot(&self, name: &str, value: u64) {
        self.record(|w| writeln!(w, "counter_snapshot\tname={name}\tvalue={value}"));
    }

    /// Record shutdown and flush everything buffered
    pub fn shutdown(&self) {
        self.record(|w| writeln!(w, "shutdown"));
        self.flush();
    }

    /// Force buffered records to disk
    pub fn flush(&self) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = writer.flush() {
            debug!(error = %e, "output flush failed");
        }
    }

    fn record(&self, write: impl FnOnce(&mut BufWriter<File>) -> std::io::Result<()>) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = write(&mut writer) {
            debug!(error = %e, "output record dropped");
        }
    }
}
