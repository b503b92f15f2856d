//! Callback chains run in strict reverse registration order, exactly once
//! per event, with outcomes reaching every waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use freezepoint::test_utils::{StubChannel, StubOp};
use freezepoint::{
    checkpoint, clear_callback, dispatch, init, register_callback, replace_callback,
    CallbackContext, CheckpointControl, CheckpointOutcome, CrState,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

type Log = Arc<Mutex<Vec<&'static str>>>;

fn logging_callback(log: &Log, tag: &'static str) -> impl FnMut() -> i32 + Send + 'static {
    let log = Arc::clone(log);
    move || {
        log.lock().push(tag);
        0
    }
}

#[test]
fn reverse_order_exactly_once() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);
    stub.script_checkpoint_result(0);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    std::thread::spawn(move || {
        let _client = init().unwrap();
        register_callback(logging_callback(&log2, "a"), CallbackContext::Signal).unwrap();
        register_callback(logging_callback(&log2, "b"), CallbackContext::Signal).unwrap();
        register_callback(logging_callback(&log2, "c"), CallbackContext::Signal).unwrap();

        dispatch::deliver(30);

        // Callbacks registered after a completed event join the next one.
        register_callback(logging_callback(&log2, "d"), CallbackContext::Signal).unwrap();
        dispatch::deliver(31);
    })
    .join()
    .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["c", "b", "a", "d", "c", "b", "a"]
    );
    assert_eq!(stub.count(|op| matches!(op, StubOp::Checkpoint { .. })), 2);
    assert_eq!(stub.count(|op| matches!(op, StubOp::Done { .. })), 2);
}

#[test]
fn reentrant_checkpoint_splits_pre_and_post_work() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    std::thread::spawn(move || {
        let _client = init().unwrap();

        let inner_log = Arc::clone(&log2);
        register_callback(logging_callback(&log2, "inner"), CallbackContext::Signal)
            .unwrap();
        register_callback(
            move || {
                inner_log.lock().push("outer-pre");
                let outcome = checkpoint(CheckpointControl::Proceed).unwrap();
                assert_eq!(outcome, CheckpointOutcome::Continue);
                inner_log.lock().push("outer-post");
                0
            },
            CallbackContext::Signal,
        )
        .unwrap();

        dispatch::deliver(32);
    })
    .join()
    .unwrap();

    // The re-entrant call ran the rest of the chain (and the capture) before
    // the outer callback's post-resume work.
    assert_eq!(*log.lock(), vec!["outer-pre", "inner", "outer-post"]);
}

#[test]
fn replaced_and_cleared_slots_take_effect_next_event() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);
    stub.script_checkpoint_result(0);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    std::thread::spawn(move || {
        let _client = init().unwrap();
        let a = register_callback(logging_callback(&log2, "a"), CallbackContext::Signal)
            .unwrap();
        let b = register_callback(logging_callback(&log2, "b"), CallbackContext::Signal)
            .unwrap();

        dispatch::deliver(33);

        replace_callback(a, logging_callback(&log2, "a2"), CallbackContext::Signal)
            .unwrap();
        clear_callback(b).unwrap();

        dispatch::deliver(34);
    })
    .join()
    .unwrap();

    assert_eq!(*log.lock(), vec!["b", "a", "a2"]);
}

#[test]
fn a_running_callback_can_replace_itself() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);
    stub.script_checkpoint_result(0);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);

    std::thread::spawn(move || {
        let _client = init().unwrap();

        let outer_log = Arc::clone(&log2);
        register_callback(
            move || {
                outer_log.lock().push("original");
                let swapped_log = Arc::clone(&outer_log);
                freezepoint::replace_self(move || {
                    swapped_log.lock().push("replacement");
                    0
                })
                .unwrap();
                0
            },
            CallbackContext::Signal,
        )
        .unwrap();

        dispatch::deliver(36);
        dispatch::deliver(37);
    })
    .join()
    .unwrap();

    assert_eq!(*log.lock(), vec!["original", "replacement"]);
    assert_eq!(stub.count(|op| matches!(op, StubOp::Checkpoint { .. })), 2);
}

#[test]
fn abort_from_a_callback_cancels_without_unwinding() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.fail_aborts_with(freezepoint::channel::codes::CR_EOMITTED);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);
    let saw_omitted = Arc::new(AtomicBool::new(false));
    let saw_omitted2 = Arc::clone(&saw_omitted);

    std::thread::spawn(move || {
        let _client = init().unwrap();

        register_callback(logging_callback(&log2, "skipped"), CallbackContext::Signal)
            .unwrap();
        let inner_log = Arc::clone(&log2);
        register_callback(
            move || {
                inner_log.lock().push("aborter");
                let err = checkpoint(CheckpointControl::Abort(
                    freezepoint::AbortReason::Omit,
                ))
                .unwrap_err();
                if err == freezepoint::CheckpointError::Omitted {
                    saw_omitted2.store(true, Ordering::Release);
                }
                // The aborting callback itself finishes normally.
                inner_log.lock().push("aborter-done");
                0
            },
            CallbackContext::Signal,
        )
        .unwrap();

        dispatch::deliver(35);
        assert_eq!(freezepoint::status().unwrap(), CrState::Idle);
    })
    .join()
    .unwrap();

    // The earlier-registered callback never ran: aborting stops stacking.
    assert_eq!(*log.lock(), vec!["aborter", "aborter-done"]);
    assert!(saw_omitted.load(Ordering::Acquire));
    assert_eq!(
        stub.count(|op| matches!(op, StubOp::Abort(freezepoint::AbortReason::Omit))),
        1
    );
    // No capture and no completion barrier on the cancelled episode.
    assert_eq!(stub.count(|op| matches!(op, StubOp::Checkpoint { .. })), 0);
    assert_eq!(stub.count(|op| matches!(op, StubOp::Done { .. })), 0);
}
