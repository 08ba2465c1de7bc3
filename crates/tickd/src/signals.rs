//! Signal bridge: OS signals mapped onto the runtime's termination protocol.
//!
//! Every disposition is set with `sigaction`. Stop and user handlers stay
//! installed (`SA_RESTART`); fault handlers are one-shot (`SA_RESETHAND`)
//! so a fault inside the handler kills the process outright.
//!
//! - SIGINT/SIGTERM/SIGHUP/SIGQUIT: set the termination flag, end the log line
//! - SIGILL/SIGABRT/SIGFPE/SIGSEGV: dump a backtrace to stderr and abort
//! - SIGCHLD: ignored, so helper processes never linger as zombies
//! - SIGUSR1/SIGUSR2: forwarded to handlers bound with [`set_signal_handler`]
//!
//! Handlers only touch atomics and `write(2)`. The fatal path also captures
//! a backtrace, which allocates; that is best effort on a process that is
//! about to abort anyway.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{CoreError, Result};

/// Callback bound to SIGUSR1 or SIGUSR2. Runs inside the signal handler.
pub type UserSignalHandler = fn(Signal);

const STOP_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

const FAULT_SIGNALS: [Signal; 4] = [
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

/// Set by stop signals; never cleared.
static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);

static INSTALLED: Mutex<bool> = Mutex::new(false);

/// `UserSignalHandler` pointers for SIGUSR1 and SIGUSR2; zero when unbound.
static USER_HANDLERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

/// Check if a stop signal has been received.
pub fn termination_requested() -> bool {
    TERMINATE_REQUESTED.load(Ordering::SeqCst)
}

/// Terminate the current log line on stderr. Async-signal-safe.
pub fn end_log_line() {
    write_stderr(b"\n");
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: write(2) is async-signal-safe and `bytes` outlives the call.
    let _ = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
}

fn set_handler(sig: Signal, handler: SigHandler, flags: SaFlags) -> Result<SigAction> {
    let action = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: every handler installed by this module is restricted to atomics
    // and write(2), except the fault handler, which never returns.
    unsafe { signal::sigaction(sig, &action) }.map_err(|source| {
        tracing::error!(signal = %sig, error = %source, "sigaction failed");
        CoreError::SignalRegistrationFailed {
            signal: sig,
            source,
        }
    })
}

/// Install the process-wide handlers. Later calls are no-ops.
///
/// If any registration fails, the dispositions changed so far are restored
/// before the error is returned.
pub fn install() -> Result<()> {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if *installed {
        return Ok(());
    }

    let plan = STOP_SIGNALS
        .iter()
        .map(|&sig| (sig, SigHandler::Handler(handle_stop_signal), SaFlags::SA_RESTART))
        .chain(FAULT_SIGNALS.iter().map(|&sig| {
            (
                sig,
                SigHandler::Handler(handle_fault_signal),
                SaFlags::SA_RESETHAND,
            )
        }))
        .chain(std::iter::once((
            Signal::SIGCHLD,
            SigHandler::SigIgn,
            SaFlags::empty(),
        )));

    apply(plan)?;

    *installed = true;
    tracing::debug!("signal handlers installed");
    Ok(())
}

/// Set every disposition in `plan`, or none of them.
fn apply(plan: impl IntoIterator<Item = (Signal, SigHandler, SaFlags)>) -> Result<()> {
    let mut previous = Vec::new();
    for (sig, handler, flags) in plan {
        match set_handler(sig, handler, flags) {
            Ok(old) => previous.push((sig, old)),
            Err(e) => {
                restore(&previous);
                return Err(e);
            }
        }
    }
    Ok(())
}

fn restore(previous: &[(Signal, SigAction)]) {
    for (sig, old) in previous.iter().rev() {
        // SAFETY: reinstalls a disposition previously returned by the kernel.
        if let Err(e) = unsafe { signal::sigaction(*sig, old) } {
            tracing::warn!(signal = %sig, error = %e, "failed to restore signal disposition");
        }
    }
}

fn user_slot(sig: Signal) -> Option<&'static AtomicUsize> {
    match sig {
        Signal::SIGUSR1 => USER_HANDLERS.first(),
        Signal::SIGUSR2 => USER_HANDLERS.get(1),
        _ => None,
    }
}

/// Bind `handler` to SIGUSR1 or SIGUSR2, replacing any previous binding.
///
/// The handler runs in signal context and must stay async-signal-safe.
pub fn set_signal_handler(sig: Signal, handler: Option<UserSignalHandler>) -> Result<()> {
    let slot = user_slot(sig).ok_or(CoreError::ArgumentInvalid(
        "only SIGUSR1 and SIGUSR2 can be rebound",
    ))?;
    let handler = handler.ok_or(CoreError::ArgumentInvalid("signal handler is missing"))?;

    let previous = slot.swap(handler as usize, Ordering::SeqCst);
    if let Err(e) = set_handler(sig, SigHandler::Handler(handle_user_signal), SaFlags::SA_RESTART)
    {
        slot.store(previous, Ordering::SeqCst);
        return Err(e);
    }
    tracing::debug!(signal = %sig, "user signal handler bound");
    Ok(())
}

extern "C" fn handle_stop_signal(_sig: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
    end_log_line();
}

extern "C" fn handle_user_signal(sig: libc::c_int) {
    let Ok(signal) = Signal::try_from(sig) else {
        return;
    };
    let Some(slot) = user_slot(signal) else {
        return;
    };
    let raw = slot.load(Ordering::SeqCst);
    if raw == 0 {
        return;
    }
    // SAFETY: non-zero slot values are only ever stored from a `UserSignalHandler`.
    let handler = unsafe { std::mem::transmute::<usize, UserSignalHandler>(raw) };
    handler(signal);
}

extern "C" fn handle_fault_signal(sig: libc::c_int) {
    let name = Signal::try_from(sig).map(Signal::as_str).unwrap_or("unknown signal");
    write_stderr(b"\nfatal signal ");
    write_stderr(name.as_bytes());
    write_stderr(b", aborting\n");

    let trace = Backtrace::force_capture();
    if trace.status() == BacktraceStatus::Captured {
        write_stderr(format!("{trace}\n").as_bytes());
    } else {
        write_stderr(b"no backtrace\n");
    }

    // SAFETY: SIG_DFL is a valid disposition; abort() must not re-enter here.
    unsafe {
        libc::signal(libc::SIGABRT, libc::SIG_DFL);
    }
    std::process::abort();
}
