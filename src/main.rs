use anyhow::{Context, Result};
use clap::Parser;
use std::os::unix::process::CommandExt;
use std::process::Command;

use acelera::cli::Cli;

fn main() -> Result<()> {
    let args = Cli::parse();

    let (program, rest) = args
        .command
        .split_first()
        .context("No command specified. Usage: acelera [OPTIONS] -- COMMAND [ARGS...]")?;

    let mut command = Command::new(program);
    command.args(rest).envs(args.env_vars());

    // exec only returns on failure
    let err = command.exec();
    Err(err).context(format!("Failed to exec {program}"))
}
