//! The experiment engine
//!
//! Runs causal-speedup rounds for the lifetime of the process. Each round
//! anchors one selected source line: every sample landing on that line earns
//! its thread one unit of exemption from the global delay count, which is
//! equivalent to pausing every *other* thread, which makes the selected
//! line virtually faster. When a round has seen enough samples it closes, the delay
//! total and pause size are recorded, and the next sample in known code
//! opens the next round.
//!
//! The engine introduces no threads of its own: all work happens on the
//! application's threads, driven by their per-thread CPU-time timers. The
//! only cross-thread synchronization point is the compare-and-swap on the
//! selected line.

use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::warn;

use crate::config::Config;
use crate::constants::{
    sample_signal, MIN_ROUND_SAMPLES, SAMPLE_PERIOD_NS, SAMPLE_WAKEUP_COUNT, SPEEDUP_DIVISIONS,
};
use crate::counters::Counter;
use crate::crash;
use crate::line_map::{Line, LineMap};
use crate::output::Output;
use crate::sampler::{Record, Sampler};
use crate::thread_state::{self, ThreadState};
use crate::timer::Timer;

/// Sentinel index meaning "no round in flight"
const NO_SELECTION: usize = usize::MAX;

static PROFILER: OnceLock<Profiler> = OnceLock::new();

/// Process-wide experiment state, lock-free
struct ExperimentState {
    /// Index of the line under experiment, or [`NO_SELECTION`]
    selected: AtomicUsize,
    /// Samples observed in the current round
    round_samples: AtomicUsize,
    /// Value of `global_delays` when the round opened
    round_start_delays: AtomicU64,
    /// Monotone count of delay units issued across all rounds
    global_delays: AtomicU64,
    /// Nanoseconds per delay unit in the current round
    delay_size: AtomicU64,
    /// Shutdown latch
    shutdown_done: AtomicBool,
}

impl ExperimentState {
    fn new() -> ExperimentState {
        ExperimentState {
            selected: AtomicUsize::new(NO_SELECTION),
            round_samples: AtomicUsize::new(0),
            round_start_delays: AtomicU64::new(0),
            global_delays: AtomicU64::new(0),
            delay_size: AtomicU64::new(0),
            shutdown_done: AtomicBool::new(false),
        }
    }
}

/// Delay ledger carried from a parent thread to its child at spawn
///
/// A newborn thread starts owing exactly what its parent owed, so being new
/// earns it nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelaySnapshot {
    pub delay_count: u64,
    pub excess_delay: u64,
}

/// The causal profiler engine
pub struct Profiler {
    map: LineMap,
    out: Output,
    start: Instant,
    fixed_line: Option<usize>,
    fixed_delay_size: Option<u64>,
    counters: Mutex<Vec<Arc<Counter>>>,
    experiment: ExperimentState,
}

/// Start profiling this process
///
/// Installs the sample and crash handlers, builds the source map, opens the
/// output sink, and begins sampling on the calling thread. May be called
/// once per process.
pub fn startup(config: Config) -> Result<()> {
    install_sample_handler().context("Failed to install sample handler")?;
    crash::install().context("Failed to install crash handlers")?;

    let scope = if config.scope.is_empty() {
        vec![env::current_dir().context("Failed to resolve working directory for scope")?]
    } else {
        config.scope.clone()
    };
    let map = LineMap::build(&scope)?;

    let fixed_line = match &config.fixed_line {
        Some(name) => match map.find_name(name) {
            Some(line) => Some(line.index()),
            None => {
                warn!(line = %name, "Fixed line was not found");
                None
            }
        },
        None => None,
    };
    let fixed_delay_size = config
        .fixed_speedup
        .map(|percent| SAMPLE_PERIOD_NS * u64::from(percent) / 100);

    let out = Output::create(&config.output)?;

    let profiler = Profiler {
        map,
        out,
        start: Instant::now(),
        fixed_line,
        fixed_delay_size,
        counters: Mutex::new(Vec::new()),
        experiment: ExperimentState::new(),
    };
    PROFILER
        .set(profiler)
        .map_err(|_| anyhow::anyhow!("Profiler already started"))?;
    let Some(profiler) = PROFILER.get() else {
        anyhow::bail!("Profiler installation failed");
    };

    for name in &config.progress {
        match profiler.map.find_name(name) {
            Some(line) => profiler.register_counter(Arc::new(Counter::sampling(
                name.clone(),
                line.clone(),
            ))),
            None => warn!(line = %name, "Progress line was not found"),
        }
    }

    profiler.out.startup(SAMPLE_PERIOD_NS);
    profiler.begin_sampling();
    Ok(())
}

/// Stop profiling and flush the output; runs at most once
pub fn shutdown() {
    if let Some(profiler) = Profiler::try_global() {
        profiler.shutdown();
    }
}

/// Spawn a thread that participates in delay accounting
///
/// The child inherits the parent's delay ledger, samples for its lifetime,
/// and settles its delays on the way out, including on panic.
pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let snapshot = Profiler::try_global().map(|p| p.delay_snapshot());
    thread::spawn(move || match (Profiler::try_global(), snapshot) {
        (Some(profiler), Some(snapshot)) => {
            profiler.handle_thread_start(snapshot);
            let _exit = ThreadExitGuard { profiler };
            f()
        }
        _ => f(),
    })
}

struct ThreadExitGuard {
    profiler: &'static Profiler,
}

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        self.profiler.handle_thread_exit();
    }
}

/// Run a blocking operation bracketed by delay bookkeeping
///
/// Delays issued while `f` blocks are credited to this thread instead of
/// being slept off afterwards.
pub fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Profiler::try_global() {
        Some(profiler) => {
            profiler.snapshot_delays();
            let result = f();
            profiler.skip_delays();
            result
        }
        None => f(),
    }
}

/// Capture the delay ledger immediately before blocking
pub fn snapshot_delays() {
    if let Some(profiler) = Profiler::try_global() {
        profiler.snapshot_delays();
    }
}

/// Credit delays missed while blocked, using the matching snapshot
pub fn skip_delays() {
    if let Some(profiler) = Profiler::try_global() {
        profiler.skip_delays();
    }
}

/// Settle outstanding delays now, typically before unblocking other threads
pub fn catch_up() {
    if let Some(profiler) = Profiler::try_global() {
        profiler.catch_up();
    }
}

impl Profiler {
    /// The installed engine, if [`startup`] has run
    pub fn try_global() -> Option<&'static Profiler> {
        PROFILER.get()
    }

    /// Register a progress counter and announce it in the output
    ///
    /// Holding this thread's state across the sink write keeps the sample
    /// handler off this thread while the sink lock is held.
    pub fn register_counter(&self, counter: Arc<Counter>) {
        let _state = thread_state::acquire();
        self.out.add_counter(&counter);
        if let Ok(mut counters) = self.counters.lock() {
            counters.push(counter);
        }
    }

    /// Current thread's delay ledger, for handing to a child thread
    pub fn delay_snapshot(&self) -> DelaySnapshot {
        let state = thread_state::acquire();
        DelaySnapshot {
            delay_count: state.delay_count,
            excess_delay: state.excess_delay,
        }
    }

    /// Seed a newborn thread from its parent's ledger and begin sampling
    pub fn handle_thread_start(&self, snapshot: DelaySnapshot) {
        let mut state = thread_state::acquire();
        state.delay_count = snapshot.delay_count;
        state.excess_delay = snapshot.excess_delay;
        self.begin_sampling_locked(&mut state);
    }

    /// Settle delays and release sampling resources before thread exit
    pub fn handle_thread_exit(&self) {
        self.end_sampling();
    }

    /// Capture `(global_delays, delay_count)` before blocking
    pub fn snapshot_delays(&self) {
        let mut state = thread_state::acquire();
        state.global_delay_snapshot = self.experiment.global_delays.load(Ordering::Relaxed);
        state.local_delay_snapshot = state.delay_count;
    }

    /// Credit the delays that were issued while this thread was blocked
    pub fn skip_delays(&self) {
        let mut state = thread_state::acquire();
        let missed = self.experiment.global_delays.load(Ordering::Relaxed)
            - state.global_delay_snapshot;
        state.delay_count = state.local_delay_snapshot + missed;
    }

    /// Settle outstanding delays in thread context
    pub fn catch_up(&self) {
        let mut state = thread_state::acquire();
        self.add_delays(&mut state);
    }

    /// Begin sampling on the calling thread
    pub fn begin_sampling(&self) {
        let mut state = thread_state::acquire();
        self.begin_sampling_locked(&mut state);
    }

    fn begin_sampling_locked(&self, state: &mut ThreadState) {
        match Sampler::create() {
            Ok(sampler) => state.sampler = Some(sampler),
            Err(e) => {
                // The thread contributes no samples but still honors delays
                warn!(error = %e, "Sampler unavailable for this thread");
            }
        }
        match Timer::create(sample_signal()) {
            Ok(timer) => {
                if let Err(e) = timer.start_interval(SAMPLE_PERIOD_NS * SAMPLE_WAKEUP_COUNT) {
                    warn!(error = %e, "Failed to arm sample timer");
                }
                state.timer = Some(timer);
            }
            Err(e) => warn!(error = %e, "Failed to create sample timer"),
        }
        if let Some(sampler) = &state.sampler {
            if let Err(e) = sampler.start() {
                warn!(error = %e, "Failed to start sampler");
            }
        }
    }

    /// Drain remaining samples, settle delays, and drop sampling resources
    pub fn end_sampling(&self) {
        let mut state = thread_state::acquire();
        self.process_samples(&mut state);
        self.add_delays(&mut state);
        state.sampler = None;
        state.timer = None;
    }

    /// Drain and classify this thread's queued samples, then settle delays
    ///
    /// Runs from the sample handler (signal context, state acquired by the
    /// caller) and from the end-of-sampling path.
    pub(crate) fn process_samples(&self, state: &mut ThreadState) {
        let ThreadState {
            sampler,
            delay_count,
            rng,
            ..
        } = &mut *state;
        if let Some(sampler) = sampler.as_mut() {
            let _ = sampler.stop();
            while let Some(record) = sampler.next_record() {
                if let Record::Sample(sample) = record {
                    self.handle_sample(sample.ip(), sample.callchain(), delay_count, rng);
                }
            }
            let _ = sampler.start();
        }
        self.add_delays(state);
    }

    /// Classify one sample and advance the round protocol
    fn handle_sample(
        &self,
        ip: u64,
        callchain: &[u64],
        delay_count: &mut u64,
        rng: &mut rand::rngs::SmallRng,
    ) {
        let line = self.find_containing_line(ip, callchain);
        if let Some(line) = line {
            line.add_sample();
        }

        let experiment = &self.experiment;
        let mut current = experiment.selected.load(Ordering::Acquire);

        if current == NO_SELECTION {
            // No active round. If selection is pinned the candidate is the
            // pinned line regardless of where this sample landed.
            let candidate = match self.fixed_line {
                Some(fixed) => Some(fixed),
                None => line.map(|l| l.index()),
            };
            let Some(candidate) = candidate else {
                // Sample in out-of-scope code; nothing can be done
                return;
            };
            match experiment.selected.compare_exchange(
                NO_SELECTION,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    current = candidate;
                    experiment.round_samples.store(0, Ordering::Relaxed);
                    experiment
                        .round_start_delays
                        .store(experiment.global_delays.load(Ordering::Relaxed), Ordering::Relaxed);
                    let size = match self.fixed_delay_size {
                        Some(size) => size,
                        None => {
                            rng.gen_range(0..=SPEEDUP_DIVISIONS)
                                * (SAMPLE_PERIOD_NS / SPEEDUP_DIVISIONS)
                        }
                    };
                    experiment.delay_size.store(size, Ordering::Relaxed);
                    self.out.start_round(self.map.line(candidate));
                }
                Err(observed) => {
                    // Another thread opened the round first
                    current = observed;
                }
            }
        }

        // A sample on the selected line earns this thread one delay exemption
        if line.is_some_and(|l| l.index() == current) {
            *delay_count += 1;
        }

        // The thread whose sample completes the round closes it
        if experiment.round_samples.fetch_add(1, Ordering::AcqRel) + 1 == MIN_ROUND_SAMPLES {
            let delta = experiment
                .global_delays
                .load(Ordering::Relaxed)
                .saturating_sub(experiment.round_start_delays.load(Ordering::Relaxed));
            self.out
                .end_round(delta, experiment.delay_size.load(Ordering::Relaxed));
            self.snapshot_counters();
            experiment.selected.store(NO_SELECTION, Ordering::Release);
        }
    }

    /// Resolve a sample to a known line: by its IP, else by walking the
    /// call chain outwards
    fn find_containing_line(&self, ip: u64, callchain: &[u64]) -> Option<&Arc<Line>> {
        if let Some(line) = self.map.find_ip(ip) {
            return Some(line);
        }
        callchain.iter().find_map(|&pc| self.map.find_ip(pc))
    }

    /// Reconcile this thread's delay ledger with the global count
    ///
    /// A thread ahead of the global count publishes its surplus; a thread
    /// behind it pays the difference in sleep, with past overshoot credited
    /// first and fresh overshoot banked for next time.
    pub(crate) fn add_delays(&self, state: &mut ThreadState) {
        let global = self.experiment.global_delays.load(Ordering::Relaxed);
        let delay_size = self.experiment.delay_size.load(Ordering::Relaxed);

        if state.delay_count > global {
            self.experiment
                .global_delays
                .fetch_add(state.delay_count - global, Ordering::Relaxed);
        } else if state.delay_count < global {
            let mut to_wait = (global - state.delay_count) * delay_size;
            if state.excess_delay > to_wait {
                state.excess_delay -= to_wait;
            } else {
                to_wait -= state.excess_delay;
                let actual = wait_ns(to_wait);
                state.excess_delay = actual.saturating_sub(to_wait);
            }
            state.delay_count = global;
        }
    }

    fn snapshot_counters(&self) {
        let Ok(counters) = self.counters.lock() else {
            return;
        };
        for counter in counters.iter() {
            self.out.counter_snapshot(counter.name(), counter.value());
        }
    }

    /// Stop profiling, flush records, and in end-to-end mode report the
    /// effective runtime on stderr
    pub fn shutdown(&self) {
        if self.experiment.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.end_sampling();
        self.out.shutdown();

        if let (Some(_), Some(delay_size)) = (self.fixed_line, self.fixed_delay_size) {
            let runtime = self.start.elapsed().as_nanos() as u64;
            let delays = self.experiment.global_delays.load(Ordering::Relaxed);
            eprint!("{}", end_to_end_report(delay_size, runtime, delays));
        }
    }
}

/// `speedup_fraction<TAB>effective_time_ns` line for end-to-end runs
fn end_to_end_report(delay_size: u64, runtime_ns: u64, delays: u64) -> String {
    let fraction = delay_size as f64 / SAMPLE_PERIOD_NS as f64;
    let effective = runtime_ns.saturating_sub(delays * delay_size);
    format!("{fraction}\t{effective}\n")
}

/// Sleep for `ns` nanoseconds, returning the measured elapsed time
///
/// A single interruptible nanosleep: any signal cuts the pause short, and
/// the caller's excess-delay ledger absorbs the difference.
fn wait_ns(ns: u64) -> u64 {
    if ns == 0 {
        return 0;
    }
    let start = Instant::now();
    let request = libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    };
    unsafe {
        libc::nanosleep(&request, std::ptr::null_mut());
    }
    start.elapsed().as_nanos() as u64
}

fn install_sample_handler() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = samples_ready as *const () as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sample_signal(), &action, std::ptr::null_mut()) != 0 {
            return Err(anyhow::anyhow!(
                "sigaction({}): {}",
                sample_signal(),
                std::io::Error::last_os_error()
            ));
        }
    }
    Ok(())
}

/// Sample-signal handler: drain this thread's sampler
///
/// If the thread already holds its own state the batch is silently dropped;
/// samples are a statistical signal and losing one batch is acceptable.
extern "C" fn samples_ready(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if let Some(profiler) = Profiler::try_global() {
        if let Some(mut state) = thread_state::try_acquire_signal() {
            profiler.process_samples(&mut state);
        }
    }
}
