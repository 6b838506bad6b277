//! Fatal-signal reporting
//!
//! Profiled programs crash like any other program, but a profiler that eats
//! the crash is worse than none. On `SIGSEGV` or `SIGABRT` we print the
//! signal, the faulting address, and a symbolized backtrace, then exit with
//! status 2 so wrappers can tell a profiled crash from a normal failure.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Deepest backtrace reported from a fatal signal
const MAX_FRAMES: usize = 256;

/// Install the fatal-signal handlers
pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::SigAction(on_fatal),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGSEGV, &action)
            .context("Failed to install SIGSEGV handler")?;
        signal::sigaction(Signal::SIGABRT, &action)
            .context("Failed to install SIGABRT handler")?;
    }
    Ok(())
}

/// Banner line for a fatal signal
fn fatal_banner(signum: libc::c_int, addr: *mut libc::c_void) -> String {
    if signum == libc::SIGSEGV {
        format!("Segmentation fault at {addr:p}")
    } else if signum == libc::SIGABRT {
        "Aborted!".to_string()
    } else {
        format!("Signal {signum} at {addr:p}")
    }
}

extern "C" fn on_fatal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let addr = if info.is_null() {
        std::ptr::null_mut()
    } else {
        unsafe { (*info).si_addr() }
    };
    eprintln!("{}", fatal_banner(signum, addr));

    let mut index = 0usize;
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if index >= MAX_FRAMES {
                return false;
            }
            eprintln!("  {index}: {}", describe_frame(frame));
            index += 1;
            true
        });
    }

    unsafe {
        libc::_exit(2);
    }
}

/// Symbolize one frame: symbol name plus source position when known,
/// raw instruction pointer otherwise
fn describe_frame(frame: &backtrace::Frame) -> String {
    let mut description = String::new();
    unsafe {
        backtrace::resolve_frame_unsynchronized(frame, |symbol| {
            if !description.is_empty() {
                return;
            }
            if let Some(name) = symbol.name() {
                let _ = write!(description, "{name}");
            }
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                let _ = write!(description, " at {}:{line}", file.display());
            }
        });
    }
    if description.is_empty() {
        description = format!("{:p}", frame.ip());
    }
    description
}
