//! Application clock and termination state.
//!
//! One [`Lifecycle`] lives inside each [`Runtime`](crate::Runtime) and is
//! handed to other threads as an `Arc`. Every field sits behind the same
//! mutex, which is held only for field access and never across I/O.
//!
//! Signal handlers cannot take the lock, so graceful-stop signals set a
//! separate process-wide atomic (see [`crate::signals`]); `is_terminating`
//! reports either source and `update` folds the signal flag into the state.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::signals;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct State {
    system_time: f64,
    app_time: f64,
    delta_time: f64,
    terminating: bool,
}

pub struct Lifecycle {
    clock: Box<dyn Clock>,
    state: Mutex<State>,
}

impl Lifecycle {
    /// Zero the state and capture the baseline time.
    pub fn new(clock: Box<dyn Clock>) -> Self {
        let state = State {
            system_time: clock.now(),
            ..State::default()
        };
        Self {
            clock,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is plain data; a panic elsewhere cannot leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the clock by one tick and return the new delta time.
    pub fn update(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock();
        state.delta_time = now - state.system_time;
        state.system_time = now;
        state.app_time += state.delta_time;
        if signals::termination_requested() {
            state.terminating = true;
        }
        state.delta_time
    }

    /// Seconds accumulated over all ticks since init.
    pub fn app_time(&self) -> f64 {
        self.lock().app_time
    }

    /// Seconds between the last two ticks.
    pub fn delta_time(&self) -> f64 {
        self.lock().delta_time
    }

    /// Wall-clock time recorded by the last tick (or init).
    pub fn system_time(&self) -> f64 {
        self.lock().system_time
    }

    /// Request a cooperative stop. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.lock();
        if !state.terminating {
            tracing::debug!("termination requested");
            state.terminating = true;
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.lock().terminating || signals::termination_requested()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.lock();
        f.debug_struct("Lifecycle")
            .field("system_time", &state.system_time)
            .field("app_time", &state.app_time)
            .field("delta_time", &state.delta_time)
            .field("terminating", &state.terminating)
            .finish()
    }
}
