//! Per-thread CPU-time interval timer
//!
//! Each sampled thread owns a POSIX timer on its own CPU-time clock,
//! delivering the sample signal to that thread (and no other) every
//! wakeup interval of consumed CPU time. The timer is only the drain
//! trigger; sample production is the sampler's business.

use std::io;
use std::mem;
use std::ptr;

/// Errors from timer setup and arming
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer_create failed: {0}")]
    Create(#[source] io::Error),
    #[error("timer_settime failed: {0}")]
    Arm(#[source] io::Error),
}

/// A periodic CPU-time signal source owned by one thread
///
/// Deleted (and thereby silenced) on drop.
pub struct Timer {
    id: libc::timer_t,
}

// timer_t is an opaque kernel handle; deletion from another thread is legal.
unsafe impl Send for Timer {}

impl Timer {
    /// Create a timer on the calling thread's CPU clock, delivering `signal`
    /// to the calling thread
    pub fn create(signal: libc::c_int) -> Result<Timer, TimerError> {
        let tid = nix::unistd::gettid().as_raw();
        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = signal;
        sev.sigev_notify_thread_id = tid;

        let mut id: libc::timer_t = ptr::null_mut();
        let rc = unsafe { libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut sev, &mut id) };
        if rc != 0 {
            return Err(TimerError::Create(io::Error::last_os_error()));
        }
        Ok(Timer { id })
    }

    /// Arm the timer to fire every `interval_ns` nanoseconds of CPU time
    pub fn start_interval(&self, interval_ns: u64) -> Result<(), TimerError> {
        let interval = timespec_from_ns(interval_ns);
        let spec = libc::itimerspec {
            it_interval: interval,
            it_value: interval,
        };
        let rc = unsafe { libc::timer_settime(self.id, 0, &spec, ptr::null_mut()) };
        if rc != 0 {
            return Err(TimerError::Arm(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}

fn timespec_from_ns(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    }
}
