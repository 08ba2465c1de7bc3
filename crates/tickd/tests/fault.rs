//! Fault signals abort the process after printing diagnostics. The test
//! re-runs itself in a child process so the abort does not take down the
//! harness.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use nix::sys::signal::raise;
use tickd::{Runtime, RuntimeConfig, Signal};

const CHILD_ENV: &str = "TICKD_FAULT_CHILD";

#[test]
fn fault_child() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let _runtime = Runtime::init(RuntimeConfig::default(), ()).unwrap();
    raise(Signal::SIGSEGV).unwrap();
    panic!("fault handler returned");
}

#[test]
fn fault_signal_aborts_with_diagnostics() {
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["--exact", "fault_child", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("fatal signal SIGSEGV"), "stderr was: {stderr}");
}
