//! Acelera - in-process causal profiler for Linux programs
//!
//! Instead of reporting where time is spent, acelera reports where speedups
//! would matter. It runs controlled experiments on the live program:
//! virtually accelerating one source line by pausing every other thread a
//! calibrated amount, and recording how application progress responds. The
//! experiment records it writes convert into "if line L were X% faster, the
//! program would be Y% faster" curves downstream.
//!
//! # Usage
//!
//! Call [`init`] at the top of `main` and run the program through the
//! `acelera` launcher, which activates profiling via environment variables:
//!
//! ```ignore
//! fn main() {
//!     acelera::init().expect("profiler startup failed");
//!     // ... workload ...
//!     acelera::shutdown();
//! }
//! ```
//!
//! Mark completed units of work with the [`progress!`] macro, spawn
//! participating threads with [`spawn`], and bracket blocking operations
//! with [`blocking`] so delay accounting stays fair.

pub mod cli;
pub mod config;
pub mod constants;
pub mod counters;
pub mod crash;
pub mod line_map;
pub mod output;
pub mod profiler;
pub mod sampler;
pub mod thread_state;
pub mod timer;

pub use config::Config;
pub use profiler::{
    blocking, catch_up, shutdown, skip_delays, snapshot_delays, spawn, startup, DelaySnapshot,
    Profiler,
};

/// Start the profiler if the launching environment asked for it
///
/// Reads the `ACELERA_*` variables exported by the `acelera` launcher and
/// calls [`startup`] when `ACELERA_ENABLED=1`. A no-op otherwise, so the
/// call can stay in production binaries.
pub fn init() -> anyhow::Result<()> {
    if config::enabled_from_env() {
        startup(Config::from_env())?;
    }
    Ok(())
}
