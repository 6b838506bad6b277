//! Per-thread profiler state with signal-safe access
//!
//! Every thread owns one [`ThreadState`]: its delay ledger, its sampler and
//! timer, and its random generator. The state lives in thread-local storage
//! behind a single-entry guard tagged by acquisition context. Acquiring in
//! thread context while already held is a contract violation; acquiring in
//! signal context while held simply fails, which is what makes it legal for
//! the sample handler to touch the same structures the thread mutates on its
//! normal path: holding the guard in normal code implicitly disables sample
//! handling for that thread.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::sampler::Sampler;
use crate::timer::Timer;

/// Mutable per-thread profiler state
pub struct ThreadState {
    /// Global delays this thread has already absorbed. Monotone, except for
    /// the one-time seed from the parent's snapshot at thread start.
    pub delay_count: u64,
    /// Nanoseconds of sleep overshoot, credited against future waits
    pub excess_delay: u64,
    /// Global delay count captured before blocking
    pub global_delay_snapshot: u64,
    /// Own delay count captured before blocking
    pub local_delay_snapshot: u64,
    /// This thread's sample source, absent when creation failed
    pub sampler: Option<Sampler>,
    /// This thread's wakeup timer, absent when creation failed
    pub timer: Option<Timer>,
    /// Generator for round delay draws, seeded in thread context so signal
    /// context never initializes it
    pub rng: SmallRng,
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            delay_count: 0,
            excess_delay: 0,
            global_delay_snapshot: 0,
            local_delay_snapshot: 0,
            sampler: None,
            timer: None,
            rng: SmallRng::from_entropy(),
        }
    }
}

struct StateSlot {
    held: AtomicBool,
    state: UnsafeCell<Option<ThreadState>>,
}

impl StateSlot {
    const fn new() -> StateSlot {
        StateSlot {
            held: AtomicBool::new(false),
            state: UnsafeCell::new(None),
        }
    }
}

thread_local! {
    static SLOT: StateSlot = const { StateSlot::new() };
}

/// Exclusive access to the calling thread's state
///
/// Releasing the guard re-enables sample handling on this thread.
pub struct StateGuard {
    slot: *const StateSlot,
}

impl Deref for StateGuard {
    type Target = ThreadState;

    fn deref(&self) -> &ThreadState {
        // The guard proves exclusive access, and the slot was initialized
        // before any guard could be handed out.
        match unsafe { (*(*self.slot).state.get()).as_ref() } {
            Some(state) => state,
            None => unreachable!("guard exists only for initialized state"),
        }
    }
}

impl DerefMut for StateGuard {
    fn deref_mut(&mut self) -> &mut ThreadState {
        match unsafe { (*(*self.slot).state.get()).as_mut() } {
            Some(state) => state,
            None => unreachable!("guard exists only for initialized state"),
        }
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        unsafe {
            (*self.slot).held.store(false, Ordering::Release);
        }
    }
}

/// Acquire the calling thread's state in thread context
///
/// Initializes the state on first use. Panics if the state is already held
/// on this thread: normal-context paths must never nest acquisitions.
pub fn acquire() -> StateGuard {
    SLOT.with(|slot| {
        if slot.held.swap(true, Ordering::Acquire) {
            panic!("thread state is already held on this thread");
        }
        let state = unsafe { &mut *slot.state.get() };
        if state.is_none() {
            *state = Some(ThreadState::new());
        }
        StateGuard {
            slot: slot as *const StateSlot,
        }
    })
}

/// Try to acquire the calling thread's state from a signal handler
///
/// Returns `None` when the thread itself holds the state, when the state was
/// never initialized on this thread, or when thread-local storage is already
/// torn down; the handler drops the batch and returns.
pub fn try_acquire_signal() -> Option<StateGuard> {
    SLOT.try_with(|slot| {
        if slot.held.swap(true, Ordering::Acquire) {
            return None;
        }
        let state = unsafe { &*slot.state.get() };
        if state.is_none() {
            slot.held.store(false, Ordering::Release);
            return None;
        }
        Some(StateGuard {
            slot: slot as *const StateSlot,
        })
    })
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_initializes_fresh_state() {
        std::thread::spawn(|| {
            let state = acquire();
            assert_eq!(state.delay_count, 0);
            assert_eq!(state.excess_delay, 0);
            assert!(state.sampler.is_none());
            assert!(state.timer.is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_signal_acquire_fails_while_held() {
        std::thread::spawn(|| {
            let _guard = acquire();
            assert!(try_acquire_signal().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_signal_acquire_fails_before_init() {
        std::thread::spawn(|| {
            assert!(try_acquire_signal().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_release_reenables_access() {
        std::thread::spawn(|| {
            {
                let mut state = acquire();
                state.delay_count = 7;
            }
            let state = try_acquire_signal().expect("released state must be reachable");
            assert_eq!(state.delay_count, 7);
            drop(state);
            let state = acquire();
            assert_eq!(state.delay_count, 7);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_nested_thread_acquire_panics() {
        let result = std::thread::spawn(|| {
            let _guard = acquire();
            let _second = acquire();
        })
        .join();
        assert!(result.is_err(), "nested acquisition must panic");
    }

    #[test]
    fn test_state_is_per_thread() {
        {
            let mut state = acquire();
            state.delay_count = 42;
        }
        std::thread::spawn(|| {
            let state = acquire();
            assert_eq!(state.delay_count, 0);
        })
        .join()
        .unwrap();
        let state = acquire();
        assert_eq!(state.delay_count, 42);
    }
}
