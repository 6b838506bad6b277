//! Profiler startup configuration
//!
//! Inputs arrive either programmatically through [`Config`] or, for
//! launcher-driven runs, through `ACELERA_*` environment variables exported
//! by the `acelera` binary before it execs the target.

use std::env;
use std::path::PathBuf;

/// Gate variable: the profiler activates from [`crate::init`] only when this
/// is set to `1`
pub const ENV_ENABLED: &str = "ACELERA_ENABLED";
/// Output file path
pub const ENV_OUTPUT: &str = "ACELERA_OUTPUT";
/// Comma-separated `file:line` progress points
pub const ENV_PROGRESS: &str = "ACELERA_PROGRESS";
/// Colon-separated scope directories
pub const ENV_SCOPE: &str = "ACELERA_SCOPE";
/// `file:line` to pin every round to
pub const ENV_FIXED_LINE: &str = "ACELERA_FIXED_LINE";
/// Fixed speedup percentage in `[0, 100]`
pub const ENV_FIXED_SPEEDUP: &str = "ACELERA_FIXED_SPEEDUP";

/// Default output file, in the profiled program's working directory
pub const DEFAULT_OUTPUT: &str = "profile.acelera";

/// Startup inputs for the profiler
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the experiment record file
    pub output: PathBuf,
    /// `file:line` names to wrap in sampling progress counters
    pub progress: Vec<String>,
    /// Directories bounding which debug-info entries are admitted;
    /// empty means the current working directory
    pub scope: Vec<PathBuf>,
    /// Optional `file:line` pinning round selection
    pub fixed_line: Option<String>,
    /// Optional fixed speedup percentage; always in `[0, 100]`
    pub fixed_speedup: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: PathBuf::from(DEFAULT_OUTPUT),
            progress: Vec::new(),
            scope: Vec::new(),
            fixed_line: None,
            fixed_speedup: None,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Config {
        self.output = path.into();
        self
    }

    pub fn with_progress_line(mut self, name: impl Into<String>) -> Config {
        self.progress.push(name.into());
        self
    }

    pub fn with_scope_dir(mut self, dir: impl Into<PathBuf>) -> Config {
        self.scope.push(dir.into());
        self
    }

    pub fn with_fixed_line(mut self, name: impl Into<String>) -> Config {
        self.fixed_line = Some(name.into());
        self
    }

    /// Pin the speedup percentage; values outside `[0, 100]` leave the
    /// speedup unpinned
    pub fn with_fixed_speedup(mut self, percent: i64) -> Config {
        self.fixed_speedup = speedup_in_range(percent);
        self
    }

    /// Read the `ACELERA_*` environment
    pub fn from_env() -> Config {
        let mut config = Config::new();
        if let Ok(output) = env::var(ENV_OUTPUT) {
            if !output.is_empty() {
                config.output = PathBuf::from(output);
            }
        }
        if let Ok(progress) = env::var(ENV_PROGRESS) {
            config.progress = split_list(&progress, ',');
        }
        if let Ok(scope) = env::var(ENV_SCOPE) {
            config.scope = split_list(&scope, ':').into_iter().map(PathBuf::from).collect();
        }
        if let Ok(fixed_line) = env::var(ENV_FIXED_LINE) {
            if !fixed_line.is_empty() {
                config.fixed_line = Some(fixed_line);
            }
        }
        if let Ok(speedup) = env::var(ENV_FIXED_SPEEDUP) {
            config.fixed_speedup = parse_speedup(&speedup);
        }
        config
    }
}

/// True when the launching environment asked for profiling
pub fn enabled_from_env() -> bool {
    env::var(ENV_ENABLED).is_ok_and(|v| v == "1")
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a speedup percentage; anything unparseable or out of `[0, 100]`
/// means "not fixed"
pub(crate) fn parse_speedup(raw: &str) -> Option<u32> {
    raw.trim().parse::<i64>().ok().and_then(speedup_in_range)
}

fn speedup_in_range(percent: i64) -> Option<u32> {
    (0..=100).contains(&percent).then_some(percent as u32)
}
