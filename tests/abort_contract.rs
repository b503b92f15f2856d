//! A callback that returns nonzero has broken its contract: the kernel is
//! told the process can never checkpoint, and the process aborts. Verified
//! in a child process (re-exec of this test binary) since the abort takes
//! the whole process down.

use std::process::Command;

use freezepoint::test_utils::StubChannel;
use freezepoint::{dispatch, init, register_callback, CallbackContext};

const CHILD_ENV: &str = "FREEZEPOINT_ABORT_CONTRACT_CHILD";

/// Runs the doomed scenario when re-executed as the child; a no-op pass
/// otherwise.
#[test]
fn broken_callback_scenario() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }

    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);

    let _client = init().unwrap();
    register_callback(|| 1, CallbackContext::Signal).unwrap();
    dispatch::deliver(50);

    unreachable!("a broken callback contract must abort the process");
}

#[test]
fn broken_callback_aborts_the_process() {
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["--exact", "broken_callback_scenario", "--nocapture"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    assert!(
        !output.status.success(),
        "child survived a broken callback contract: {:?}",
        output
    );

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(
            output.status.signal(),
            Some(libc::SIGABRT),
            "expected SIGABRT, got {:?}",
            output.status
        );
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("freezepoint fatal"),
        "missing fatal diagnostic in: {}",
        stderr
    );
    assert!(stderr.contains("returned 1"));
}
