//! Minimal single-threaded runtime for Linux daemons.
//!
//! A host loop calls [`Runtime::tick`] once per iteration. Each tick
//! advances the application clock, waits on epoll for at most the
//! configured poll timeout (10 ms by default) and dispatches ready
//! [`EventSource`]s inline. [`Timer`]s are timerfd-backed sources on the
//! same reactor. Stop signals (SIGINT, SIGTERM, SIGHUP, SIGQUIT) only set a
//! flag; the host notices it through [`Runtime::is_terminating`] after the
//! tick returns.

pub mod clock;
mod config;
mod error;
pub mod lifecycle;
pub mod reactor;
mod runtime;
pub mod signals;
pub mod source;
pub mod timer;
mod version;

pub use clock::{Clock, SystemClock};
pub use config::{DEFAULT_POLL_TIMEOUT, RuntimeConfig};
pub use error::{CoreError, ErrorKind, Result};
pub use lifecycle::Lifecycle;
pub use reactor::{Dispatch, LoopErrorHandler, MAX_EVENTS, PollStatus, Reactor, SourceFailure};
pub use runtime::Runtime;
pub use source::{Disposition, EventSource, Payload, SourceCallback};
pub use timer::{Timer, TimerAction, TimerProperties, TimerState};
pub use version::{Version, version};

pub use nix::sys::signal::Signal;
