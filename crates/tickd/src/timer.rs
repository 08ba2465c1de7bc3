//! Timers backed by a non-blocking `CLOCK_MONOTONIC` timerfd.
//!
//! Every arm is one-shot at the kernel level (`it_interval` is zero).
//! Repeating timers are re-armed after their callback returns, so a slow
//! callback never finds a second expiration queued behind it.
//!
//! ```text
//! Stopped --start--> Running --expire, repeat--> Running
//!                       |------expire, one-shot / stop--> Stopped
//!                       `------callback returns Release--> Expired
//! ```
//!
//! A callback that wants its own timer gone returns
//! [`TimerAction::Release`]; the release happens after the callback
//! returns. Dropping the [`Timer`] handle from inside its own callback is
//! also tolerated: the reactor holds the source alive until dispatch ends.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, error};

use crate::error::{CoreError, Result};
use crate::reactor::Reactor;
use crate::source::{Disposition, EventSource, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
    /// The expiry callback asked for the timer to be released.
    Expired,
}

/// Returned by an expiry callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Renew a repeating timer; a one-shot timer retires either way.
    Continue,
    /// Release the timer once the callback has returned.
    Release,
}

pub type ExpireHandler = Box<dyn FnMut() -> TimerAction>;
pub type ReleaseHandler = Box<dyn FnOnce()>;

pub struct TimerProperties {
    pub interval: Duration,
    pub repeat: bool,
    pub on_expire: Option<ExpireHandler>,
    /// Runs once when the timer is released, however that happens.
    pub on_released: Option<ReleaseHandler>,
}

impl TimerProperties {
    pub fn once(interval: Duration, on_expire: impl FnMut() -> TimerAction + 'static) -> Self {
        Self {
            interval,
            repeat: false,
            on_expire: Some(Box::new(on_expire)),
            on_released: None,
        }
    }

    pub fn repeating(
        interval: Duration,
        on_expire: impl FnMut() -> TimerAction + 'static,
    ) -> Self {
        Self {
            repeat: true,
            ..Self::once(interval, on_expire)
        }
    }

    pub fn on_released(mut self, on_released: impl FnOnce() + 'static) -> Self {
        self.on_released = Some(Box::new(on_released));
        self
    }
}

impl fmt::Debug for TimerProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerProperties")
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("on_expire", &self.on_expire.is_some())
            .field("on_released", &self.on_released.is_some())
            .finish()
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// Timer state shared between the [`Timer`] handle and its event source.
pub struct TimerCore {
    fd: RawFd,
    /// `None` once released.
    timerfd: RefCell<Option<OwnedFd>>,
    interval: Duration,
    repeat: bool,
    state: Cell<TimerState>,
    on_expire: RefCell<ExpireHandler>,
    on_released: Cell<Option<ReleaseHandler>>,
}

impl TimerCore {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn state(&self) -> TimerState {
        self.state.get()
    }

    pub fn is_released(&self) -> bool {
        self.timerfd.borrow().is_none()
    }

    fn set_time(&self, value: Duration) -> Result<()> {
        let timerfd = self.timerfd.borrow();
        let Some(fd) = timerfd.as_ref() else {
            return Err(CoreError::ArgumentInvalid("timer has been released"));
        };
        let spec = libc::itimerspec {
            it_interval: timespec(Duration::ZERO),
            it_value: timespec(value),
        };
        // SAFETY: `spec` is a valid itimerspec; the old value is not requested.
        let rc = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        Errno::result(rc).map(drop).map_err(|e| {
            error!(fd = self.fd, error = %e, "failed to set timer");
            CoreError::TimerFailed(e)
        })
    }

    fn start(&self) -> Result<()> {
        // A zero it_value disarms the timerfd; arm for the shortest delay instead.
        let value = if self.interval.is_zero() {
            Duration::from_nanos(1)
        } else {
            self.interval
        };
        self.set_time(value)?;
        self.state.set(TimerState::Running);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }
        self.set_time(Duration::ZERO)?;
        self.state.set(TimerState::Stopped);
        Ok(())
    }

    /// Read the expiration counter, clearing readiness.
    fn drain(&self) -> u64 {
        let timerfd = self.timerfd.borrow();
        let Some(fd) = timerfd.as_ref() else {
            return 0;
        };
        let mut buf = [0u8; 8];
        // SAFETY: `buf` is 8 writable bytes, the size a timerfd read requires.
        let rc = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match Errno::result(rc) {
            Ok(_) => u64::from_ne_bytes(buf),
            Err(Errno::EAGAIN) => 0,
            Err(e) => {
                debug!(fd = self.fd, error = %e, "timer read failed");
                0
            }
        }
    }

    fn expire(&self) -> Result<Disposition> {
        let fired = self.drain();
        if fired == 0 || self.state.get() != TimerState::Running {
            return Ok(Disposition::Keep);
        }

        let action = {
            let mut on_expire = self
                .on_expire
                .try_borrow_mut()
                .map_err(|_| CoreError::ArgumentInvalid("timer callback is already running"))?;
            (*on_expire)()
        };

        // The handle was dropped inside the callback.
        if self.is_released() {
            return Ok(Disposition::Remove);
        }

        match action {
            TimerAction::Release => {
                self.state.set(TimerState::Expired);
                Ok(Disposition::Remove)
            }
            TimerAction::Continue if !self.repeat => {
                self.state.set(TimerState::Stopped);
                Ok(Disposition::Remove)
            }
            // The callback stopped its own timer.
            TimerAction::Continue if self.state.get() != TimerState::Running => {
                Ok(Disposition::Keep)
            }
            TimerAction::Continue => self.start().map(|()| Disposition::Keep),
        }
    }

    /// Close the timerfd and run `on_released`. Idempotent.
    pub(crate) fn retire(&self) {
        let Some(fd) = self.timerfd.borrow_mut().take() else {
            return;
        };
        drop(fd);
        if self.state.get() == TimerState::Running {
            self.state.set(TimerState::Stopped);
        }
        debug!(fd = self.fd, state = ?self.state.get(), "timer released");
        if let Some(on_released) = self.on_released.take() {
            on_released();
        }
    }
}

impl fmt::Debug for TimerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCore")
            .field("fd", &self.fd)
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("state", &self.state.get())
            .field("released", &self.is_released())
            .finish()
    }
}

fn on_timer_ready(payload: &mut Payload) -> Result<Disposition> {
    let Payload::Timer(core) = payload else {
        return Err(CoreError::ArgumentInvalid("timer callback on a non-timer source"));
    };
    let core = Rc::clone(core);
    core.expire()
}

fn on_timer_error(payload: &mut Payload) -> Result<Disposition> {
    if let Payload::Timer(core) = payload {
        error!(fd = core.fd, "timer fd reported an error condition");
    }
    Ok(Disposition::Remove)
}

/// Handle to a registered timer. Dropping it releases the timer.
pub struct Timer {
    source: Rc<EventSource>,
    core: Rc<TimerCore>,
}

impl Timer {
    /// Create a timer, register it with `reactor` and start it.
    ///
    /// Fails with `ArgumentInvalid` when `on_expire` is missing, before any
    /// resource is allocated. On later failures the partial timer is released.
    pub fn init(reactor: &mut Reactor, properties: TimerProperties) -> Result<Self> {
        let TimerProperties {
            interval,
            repeat,
            on_expire,
            on_released,
        } = properties;
        let on_expire =
            on_expire.ok_or(CoreError::ArgumentInvalid("timer needs an on_expire callback"))?;

        // SAFETY: timerfd_create has no memory-safety preconditions.
        let raw = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        let raw = Errno::result(raw).map_err(|e| {
            error!(error = %e, "failed to create timer");
            CoreError::TimerFailed(e)
        })?;
        // SAFETY: `raw` was just returned by timerfd_create and has no other owner.
        let timerfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let core = Rc::new(TimerCore {
            fd: raw,
            timerfd: RefCell::new(Some(timerfd)),
            interval,
            repeat,
            state: Cell::new(TimerState::Stopped),
            on_expire: RefCell::new(on_expire),
            on_released: Cell::new(on_released),
        });
        let source = EventSource::new(
            raw,
            on_timer_ready,
            on_timer_error,
            Payload::Timer(Rc::clone(&core)),
        );
        let timer = Self { source, core };

        reactor.register(&timer.source)?;
        if let Err(e) = timer.core.start() {
            reactor.unregister(&timer.source);
            return Err(e);
        }
        debug!(fd = raw, ?interval, repeat, "timer started");
        Ok(timer)
    }

    /// (Re)arm for the configured interval.
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    /// Disarm. Safe on a stopped or released timer.
    pub fn stop(&self) -> Result<()> {
        self.core.stop()
    }

    /// Unregister, close the timer fd and run `on_released`.
    ///
    /// A timer that already retired itself is only dropped.
    pub fn release(self, reactor: &mut Reactor) {
        reactor.unregister(&self.source);
        self.core.retire();
    }

    pub fn state(&self) -> TimerState {
        self.core.state()
    }

    pub fn is_released(&self) -> bool {
        self.core.is_released()
    }

    pub fn interval(&self) -> Duration {
        self.core.interval()
    }

    pub fn repeat(&self) -> bool {
        self.core.repeat()
    }

    pub fn fd(&self) -> RawFd {
        self.core.fd
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Closing the fd also removes it from the epoll set; the reactor
        // prunes its dead entry lazily.
        self.core.retire();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Timer").field(&self.core).finish()
    }
}
