//! CLI argument parsing for the acelera launcher

use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "acelera")]
#[command(version)]
#[command(
    about = "Causal profiler launcher: run a program under virtual speedup experiments",
    long_about = None
)]
pub struct Cli {
    /// Profile output file, written in the target's working directory
    #[arg(short = 'o', long = "output", default_value = config::DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Progress line to watch, as file:line (repeatable)
    #[arg(long = "progress", value_name = "FILE:LINE")]
    pub progress: Vec<String>,

    /// Source directory admitted to the profiling scope (repeatable;
    /// default: the target's working directory)
    #[arg(long = "scope", value_name = "DIR")]
    pub scope: Vec<PathBuf>,

    /// Pin every experiment round to this line
    #[arg(long = "fixed-line", value_name = "FILE:LINE")]
    pub fixed_line: Option<String>,

    /// Pin the virtual speedup percentage
    #[arg(long = "fixed-speedup", value_name = "PCT", value_parser = clap::value_parser!(u32).range(0..=100))]
    pub fixed_speedup: Option<u32>,

    /// Command to run under the profiler, after `--`
    #[arg(required = true, last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Environment variables to export into the profiled process
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (config::ENV_ENABLED.to_string(), "1".to_string()),
            (
                config::ENV_OUTPUT.to_string(),
                self.output.display().to_string(),
            ),
        ];
        if !self.progress.is_empty() {
            vars.push((config::ENV_PROGRESS.to_string(), self.progress.join(",")));
        }
        if !self.scope.is_empty() {
            let dirs: Vec<String> = self.scope.iter().map(|d| d.display().to_string()).collect();
            vars.push((config::ENV_SCOPE.to_string(), dirs.join(":")));
        }
        if let Some(fixed_line) = &self.fixed_line {
            vars.push((config::ENV_FIXED_LINE.to_string(), fixed_line.clone()));
        }
        if let Some(fixed_speedup) = self.fixed_speedup {
            vars.push((
                config::ENV_FIXED_SPEEDUP.to_string(),
                fixed_speedup.to_string(),
            ));
        }
        vars
    }
}
