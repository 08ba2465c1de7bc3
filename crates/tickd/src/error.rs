//! Error types for the runtime core.

use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::signal::Signal;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Broad classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before any state was touched.
    ArgumentInvalid,
    OutOfMemory,
    /// The kernel refused a signal, epoll or timerfd operation.
    PlatformFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    ArgumentInvalid(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("failed to register handler for {signal}: {source}")]
    SignalRegistrationFailed { signal: Signal, source: Errno },

    #[error("failed to create epoll instance: {0}")]
    ReactorFailed(Errno),

    #[error("failed to register fd {fd}: {source}")]
    RegistrationFailed { fd: RawFd, source: Errno },

    #[error("epoll wait failed: {0}")]
    PollFailed(Errno),

    #[error("error or hangup reported on fd {fd}")]
    EpollError { fd: RawFd },

    #[error("timer failed: {0}")]
    TimerFailed(Errno),

    #[error("runtime init failed: {0}")]
    InitFailed(Box<CoreError>),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ArgumentInvalid(_) => ErrorKind::ArgumentInvalid,
            CoreError::OutOfMemory => ErrorKind::OutOfMemory,
            CoreError::InitFailed(inner) => inner.kind(),
            CoreError::SignalRegistrationFailed { .. }
            | CoreError::ReactorFailed(_)
            | CoreError::RegistrationFailed { .. }
            | CoreError::PollFailed(_)
            | CoreError::EpollError { .. }
            | CoreError::TimerFailed(_) => ErrorKind::PlatformFailure,
        }
    }

    /// Underlying OS error, if the failure came from a syscall.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            CoreError::SignalRegistrationFailed { source, .. }
            | CoreError::RegistrationFailed { source, .. } => Some(*source),
            CoreError::ReactorFailed(e) | CoreError::PollFailed(e) | CoreError::TimerFailed(e) => {
                Some(*e)
            }
            CoreError::InitFailed(inner) => inner.errno(),
            CoreError::ArgumentInvalid(_)
            | CoreError::OutOfMemory
            | CoreError::EpollError { .. } => None,
        }
    }
}
