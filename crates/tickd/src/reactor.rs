//! Single-threaded readiness loop over one epoll instance.
//!
//! Sources are registered level-triggered for `EPOLLIN` with their fd as
//! the routing token. Each [`Reactor::poll`] waits at most once and
//! dispatches at most [`MAX_EVENTS`] events inline, in the order the kernel
//! reported them. When more sources are ready than fit in one batch the
//! rest wait for the next poll; a busy source can starve others in that
//! case, which keeps per-tick latency bounded.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, error, warn};

use crate::error::{CoreError, Result};
use crate::source::{Disposition, EventSource, Readiness};

/// Events handled per poll.
pub const MAX_EVENTS: usize = 16;

/// Called when the wait is interrupted by a signal. Returning `true`
/// turns the interruption into [`PollStatus::Waiting`].
pub type LoopErrorHandler = Box<dyn FnMut() -> bool>;

#[derive(Debug)]
pub enum PollStatus {
    /// At least one source was dispatched.
    Ready(Dispatch),
    /// Nothing to do: timeout, stale events only, or a recovered interrupt.
    Waiting,
}

/// Summary of one dispatched batch.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub dispatched: usize,
    pub failures: Vec<SourceFailure>,
}

#[derive(Debug)]
pub struct SourceFailure {
    pub fd: RawFd,
    pub error: CoreError,
}

pub struct Reactor {
    epoll: OwnedFd,
    sources: HashMap<RawFd, Weak<EventSource>>,
    on_loop_error: Option<LoopErrorHandler>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        // SAFETY: epoll_create1 has no memory-safety preconditions.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        let raw = Errno::result(raw).map_err(|e| {
            error!(error = %e, "failed to create epoll instance");
            CoreError::ReactorFailed(e)
        })?;
        // SAFETY: `raw` was just returned by epoll_create1 and has no other owner.
        let epoll = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            epoll,
            sources: HashMap::new(),
            on_loop_error: None,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> nix::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: `event` is valid for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        Errno::result(rc).map(drop)
    }

    /// Add `source` to the poll set.
    pub fn register(&mut self, source: &Rc<EventSource>) -> Result<()> {
        let fd = source.fd();
        if fd < 0 {
            return Err(CoreError::RegistrationFailed {
                fd,
                source: Errno::EBADF,
            });
        }

        match self.sources.get(&fd).map(Weak::strong_count) {
            Some(0) => self.forget(fd),
            Some(_) => {
                return Err(CoreError::RegistrationFailed {
                    fd,
                    source: Errno::EEXIST,
                });
            }
            None => {}
        }

        self.sources
            .try_reserve(1)
            .map_err(|_| CoreError::OutOfMemory)?;
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
            .map_err(|source| {
                error!(fd, error = %source, "failed to register source");
                CoreError::RegistrationFailed { fd, source }
            })?;
        self.sources.insert(fd, Rc::downgrade(source));
        debug!(fd, timer = source.is_timer(), "source registered");
        Ok(())
    }

    /// Remove `source` from the poll set. Unknown sources are ignored.
    pub fn unregister(&mut self, source: &EventSource) {
        let fd = source.fd();
        let owned = self
            .sources
            .get(&fd)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), source));
        if !owned {
            debug!(fd, "unregister: source is not registered");
            return;
        }
        self.sources.remove(&fd);
        // The fd may already be closed, which removed it from the set.
        if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            debug!(fd, error = %e, "epoll_ctl del failed (ignored)");
        }
        debug!(fd, "source unregistered");
    }

    /// Drop the entry for a source whose owner is gone.
    fn forget(&mut self, fd: RawFd) {
        self.sources.remove(&fd);
        if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            debug!(fd, error = %e, "stale source already left the poll set");
        }
    }

    pub fn is_registered(&self, source: &EventSource) -> bool {
        self.sources
            .get(&source.fd())
            .is_some_and(|weak| weak.strong_count() > 0 && std::ptr::eq(weak.as_ptr(), source))
    }

    /// Number of live registered sources.
    pub fn len(&self) -> usize {
        self.sources
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the handler consulted when a wait is interrupted.
    pub fn set_loop_error_handler(&mut self, handler: Option<LoopErrorHandler>) {
        self.on_loop_error = handler;
    }

    /// Wait up to `timeout` and dispatch one batch of ready sources.
    pub fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout_ms = wait_millis(timeout);

        // SAFETY: `events` has room for MAX_EVENTS entries.
        let rc = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        let count = match Errno::result(rc) {
            Ok(n) => usize::try_from(n).unwrap_or(0),
            Err(Errno::EINTR) => return self.recover_interrupted(),
            Err(e) => {
                error!(error = %e, "epoll wait failed");
                return Err(CoreError::PollFailed(e));
            }
        };

        let mut report = Dispatch::default();
        for event in events.iter().take(count) {
            let flags = event.events;
            let token = event.u64;
            self.dispatch_one(token as RawFd, flags, &mut report);
        }

        if report.dispatched == 0 {
            Ok(PollStatus::Waiting)
        } else {
            Ok(PollStatus::Ready(report))
        }
    }

    fn recover_interrupted(&mut self) -> Result<PollStatus> {
        let recovered = match self.on_loop_error.as_mut() {
            Some(handler) => handler(),
            None => false,
        };
        if recovered {
            debug!("interrupted wait recovered by loop error handler");
            Ok(PollStatus::Waiting)
        } else {
            warn!("epoll wait interrupted by a signal");
            Err(CoreError::PollFailed(Errno::EINTR))
        }
    }

    fn dispatch_one(&mut self, fd: RawFd, flags: u32, report: &mut Dispatch) {
        // Hold a strong reference for the whole dispatch so a callback that
        // drops the owner's handle cannot free the source under us.
        let Some(source) = self.sources.get(&fd).and_then(Weak::upgrade) else {
            debug!(fd, "dropping event for a released source");
            self.forget(fd);
            return;
        };

        let failed = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
        let outcome = if failed {
            warn!(fd, flags, "error condition on source");
            report.failures.push(SourceFailure {
                fd,
                error: CoreError::EpollError { fd },
            });
            source.dispatch(Readiness::Failed)
        } else {
            source.dispatch(Readiness::Readable)
        };
        report.dispatched += 1;

        match outcome {
            Ok(Disposition::Keep) => {}
            Ok(Disposition::Remove) => self.retire(&source),
            Err(error) => {
                warn!(fd, %error, "source callback failed, removing source");
                if !failed {
                    report.failures.push(SourceFailure { fd, error });
                }
                self.retire(&source);
            }
        }
    }

    fn retire(&mut self, source: &EventSource) {
        self.unregister(source);
        source.retire();
    }
}

/// Whole milliseconds for `epoll_wait`, rounded up so a sub-millisecond
/// timeout still blocks instead of spinning.
fn wait_millis(timeout: Duration) -> libc::c_int {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("sources", &self.len())
            .field("loop_error_handler", &self.on_loop_error.is_some())
            .finish()
    }
}
