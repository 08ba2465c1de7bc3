//! Process-wide signal behavior. Kept out of the unit tests because a stop
//! signal flips a flag that every runtime in the process observes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::raise;
use tickd::{CoreError, PollStatus, Runtime, RuntimeConfig, Signal};

static USR1_SEEN: AtomicUsize = AtomicUsize::new(0);

fn on_usr1(sig: Signal) {
    assert_eq!(sig, Signal::SIGUSR1);
    USR1_SEEN.fetch_add(1, Ordering::SeqCst);
}

fn on_usr2(_: Signal) {}

#[test]
fn user_signal_reaches_bound_handler() {
    let runtime = Runtime::init(RuntimeConfig::default(), ()).unwrap();
    runtime
        .set_signal_handler(Signal::SIGUSR1, Some(on_usr1))
        .unwrap();

    raise(Signal::SIGUSR1).unwrap();
    raise(Signal::SIGUSR1).unwrap();
    assert_eq!(USR1_SEEN.load(Ordering::SeqCst), 2);

    let err = runtime
        .set_signal_handler(Signal::SIGPIPE, Some(on_usr1))
        .unwrap_err();
    assert!(matches!(err, CoreError::ArgumentInvalid(_)));
}

#[test]
fn child_exit_signal_is_ignored() {
    let _runtime = Runtime::init(RuntimeConfig::default(), ()).unwrap();

    // SAFETY: a zeroed sigaction is a valid out-parameter.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: a null new action only queries the disposition.
    let rc = unsafe { libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut current) };
    assert_eq!(rc, 0);
    assert_eq!(current.sa_sigaction, libc::SIG_IGN);
}

#[test]
fn stop_signal_requests_termination() {
    let mut runtime = Runtime::init(
        RuntimeConfig::default().with_poll_timeout(Duration::ZERO),
        (),
    )
    .unwrap();

    raise(Signal::SIGTERM).unwrap();
    assert!(runtime.is_terminating());

    runtime.tick().unwrap();
    assert!(runtime.is_terminating());
    assert!(tickd::signals::termination_requested());
}

#[test]
fn interrupted_wait_consults_loop_error_handler() {
    let mut runtime = Runtime::init(
        RuntimeConfig::default().with_poll_timeout(Duration::from_secs(5)),
        (),
    )
    .unwrap();
    runtime
        .set_signal_handler(Signal::SIGUSR2, Some(on_usr2))
        .unwrap();

    // SAFETY: pthread_self has no preconditions.
    let target = unsafe { libc::pthread_self() };
    let interrupt = move || {
        thread::sleep(Duration::from_millis(100));
        // SAFETY: `target` is the test thread, alive until it joins us.
        unsafe { libc::pthread_kill(target, libc::SIGUSR2) };
    };

    runtime.set_loop_error_handler(Some(Box::new(|| true)));
    let start = Instant::now();
    let sender = thread::spawn(interrupt);
    let status = runtime.tick().unwrap();
    sender.join().unwrap();
    assert!(matches!(status, PollStatus::Waiting));
    assert!(start.elapsed() < Duration::from_secs(4));

    runtime.set_loop_error_handler(None);
    let sender = thread::spawn(interrupt);
    let err = runtime.tick().unwrap_err();
    sender.join().unwrap();
    assert_eq!(err.errno(), Some(Errno::EINTR));
}
