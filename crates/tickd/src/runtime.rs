//! The runtime context: one lifecycle, one reactor, owned by the host loop.
//!
//! ```no_run
//! use tickd::{Runtime, RuntimeConfig};
//!
//! let mut runtime = Runtime::init(RuntimeConfig::default(), ())?;
//! while !runtime.is_terminating() {
//!     runtime.tick()?;
//! }
//! runtime.release();
//! # Ok::<(), tickd::CoreError>(())
//! ```

use std::rc::Rc;
use std::sync::Arc;

use nix::sys::signal::Signal;

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::lifecycle::Lifecycle;
use crate::reactor::{LoopErrorHandler, PollStatus, Reactor};
use crate::signals::{self, UserSignalHandler};
use crate::source::EventSource;
use crate::timer::{Timer, TimerProperties};

#[derive(Debug)]
pub struct Runtime<E = ()> {
    config: RuntimeConfig,
    lifecycle: Arc<Lifecycle>,
    reactor: Reactor,
    ext: E,
}

impl<E> Runtime<E> {
    /// Capture the baseline time, install signal handlers and create the
    /// reactor. `ext` is embedder data carried alongside the runtime.
    pub fn init(config: RuntimeConfig, ext: E) -> Result<Self> {
        Self::with_clock(config, Box::new(SystemClock), ext)
    }

    pub fn with_clock(config: RuntimeConfig, clock: Box<dyn Clock>, ext: E) -> Result<Self> {
        let lifecycle = Arc::new(Lifecycle::new(clock));

        if config.install_signal_handlers {
            signals::install().map_err(|e| CoreError::InitFailed(Box::new(e)))?;
        }
        let reactor = Reactor::new().map_err(|e| CoreError::InitFailed(Box::new(e)))?;

        tracing::debug!(
            poll_timeout_ms = config.poll_timeout.as_millis(),
            signals = config.install_signal_handlers,
            "runtime initialized"
        );
        Ok(Self {
            config,
            lifecycle,
            reactor,
            ext,
        })
    }

    /// One loop iteration: advance the clock, then wait up to the poll
    /// timeout and dispatch ready sources.
    pub fn tick(&mut self) -> Result<PollStatus> {
        self.lifecycle.update();
        self.reactor.poll(self.config.poll_timeout)
    }

    /// Shared handle for other threads.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn app_time(&self) -> f64 {
        self.lifecycle.app_time()
    }

    pub fn delta_time(&self) -> f64 {
        self.lifecycle.delta_time()
    }

    pub fn terminate(&self) {
        self.lifecycle.terminate();
    }

    pub fn is_terminating(&self) -> bool {
        self.lifecycle.is_terminating()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    pub fn register(&mut self, source: &Rc<EventSource>) -> Result<()> {
        self.reactor.register(source)
    }

    pub fn unregister(&mut self, source: &EventSource) {
        self.reactor.unregister(source);
    }

    pub fn timer(&mut self, properties: TimerProperties) -> Result<Timer> {
        Timer::init(&mut self.reactor, properties)
    }

    pub fn release_timer(&mut self, timer: Timer) {
        timer.release(&mut self.reactor);
    }

    pub fn set_signal_handler(
        &self,
        signal: Signal,
        handler: Option<UserSignalHandler>,
    ) -> Result<()> {
        signals::set_signal_handler(signal, handler)
    }

    pub fn set_loop_error_handler(&mut self, handler: Option<LoopErrorHandler>) {
        self.reactor.set_loop_error_handler(handler);
    }

    pub fn ext(&self) -> &E {
        &self.ext
    }

    pub fn ext_mut(&mut self) -> &mut E {
        &mut self.ext
    }

    /// Close the reactor and hand back the embedder data.
    pub fn release(self) -> E {
        tracing::debug!(
            app_time = self.lifecycle.app_time(),
            sources = self.reactor.len(),
            "runtime released"
        );
        self.ext
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::timer::TimerAction;

    const EPS: f64 = 1e-9;

    fn quiet() -> RuntimeConfig {
        RuntimeConfig::default().without_signal_handlers()
    }

    #[test]
    fn idle_tick_is_waiting() {
        let mut runtime = Runtime::init(quiet().with_poll_timeout(Duration::ZERO), ()).unwrap();
        assert!(matches!(runtime.tick().unwrap(), PollStatus::Waiting));
        assert!(!runtime.is_terminating());
        runtime.release();
    }

    #[test]
    fn ticks_follow_the_clock() {
        let clock = ManualClock::at(500.0);
        let config = quiet().with_poll_timeout(Duration::ZERO);
        let mut runtime = Runtime::with_clock(config, Box::new(clock.clone()), ()).unwrap();

        clock.set(500.05);
        runtime.tick().unwrap();
        assert!((runtime.delta_time() - 0.05).abs() < EPS);
        assert!((runtime.app_time() - 0.05).abs() < EPS);

        clock.set(500.12);
        runtime.tick().unwrap();
        assert!((runtime.delta_time() - 0.07).abs() < EPS);
        assert!((runtime.app_time() - 0.12).abs() < EPS);
    }

    #[test]
    fn timers_fire_during_ticks() {
        let config = quiet().with_poll_timeout(Duration::from_millis(20));
        let mut runtime = Runtime::init(config, ()).unwrap();
        let fired = Rc::new(Cell::new(0u32));

        let counter = Rc::clone(&fired);
        let timer = runtime
            .timer(TimerProperties::repeating(Duration::from_millis(5), move || {
                counter.set(counter.get() + 1);
                TimerAction::Continue
            }))
            .unwrap();

        for _ in 0..200 {
            if fired.get() >= 2 {
                break;
            }
            runtime.tick().unwrap();
        }
        assert!(fired.get() >= 2);

        runtime.release_timer(timer);
        assert!(runtime.reactor().is_empty());
    }

    #[test]
    fn terminate_is_observed_by_other_handles() {
        let runtime = Runtime::init(quiet(), ()).unwrap();
        let lifecycle = Arc::clone(runtime.lifecycle());

        runtime.terminate();
        runtime.terminate();
        assert!(lifecycle.is_terminating());
        assert!(runtime.is_terminating());
    }

    #[test]
    fn ext_is_carried_and_returned() {
        let mut runtime = Runtime::init(quiet(), vec![1, 2]).unwrap();
        runtime.ext_mut().push(3);
        assert_eq!(runtime.ext().len(), 3);
        assert_eq!(runtime.release(), vec![1, 2, 3]);
    }
}
