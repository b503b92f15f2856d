//! Process-wide quiescence: checkpoint dispatch (the black side) must wait
//! for every open critical section (the red side), and no new section may
//! open while dispatch holds the lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use freezepoint::test_utils::{StubChannel, StubOp};
use freezepoint::{
    dispatch, enter_cs, init, leave_cs, register_callback, CallbackContext,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[test]
fn dispatch_waits_for_every_open_section() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);

    const HOLDERS: usize = 4;
    let holding = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let captured_while_held = Arc::new(AtomicBool::new(false));

    crossbeam::scope(|s| {
        // Red side: HOLDERS threads sit inside critical sections.
        for _ in 0..HOLDERS {
            let holding = Arc::clone(&holding);
            let release = Arc::clone(&release);
            s.spawn(move |_| {
                let client = init().unwrap();
                enter_cs(client).unwrap();
                holding.fetch_add(1, Ordering::AcqRel);
                while !release.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                leave_cs(client).unwrap();
            });
        }

        while holding.load(Ordering::Acquire) < HOLDERS {
            std::thread::yield_now();
        }

        // Black side: a request lands on a thread with no section open; its
        // dispatch must block until every holder leaves.
        let stub2 = Arc::clone(&stub);
        let captured2 = Arc::clone(&captured_while_held);
        let release2 = Arc::clone(&release);
        let victim = s.spawn(move |_| {
            let _client = init().unwrap();
            register_callback(
                move || {
                    if !release2.load(Ordering::Acquire) {
                        captured2.store(true, Ordering::Release);
                    }
                    0
                },
                CallbackContext::Signal,
            )
            .unwrap();
            dispatch::deliver(60);
        });

        // Give the victim ample time to reach the lock; the capture must not
        // have happened while sections were open.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            stub.count(|op| matches!(op, StubOp::Checkpoint { .. })),
            0,
            "capture ran while critical sections were open"
        );

        release.store(true, Ordering::Release);
        victim.join().unwrap();
        assert_eq!(stub2.count(|op| matches!(op, StubOp::Checkpoint { .. })), 1);
    })
    .unwrap();

    assert!(!captured_while_held.load(Ordering::Acquire));
}

#[test]
fn no_section_opens_while_dispatch_holds_the_lock() {
    let _serial = SERIAL.lock();
    let stub = StubChannel::install();
    stub.script_checkpoint_result(0);

    let in_callback = Arc::new(AtomicBool::new(false));
    let callback_may_finish = Arc::new(AtomicBool::new(false));
    let entered_during_dispatch = Arc::new(AtomicBool::new(false));

    crossbeam::scope(|s| {
        let in_callback2 = Arc::clone(&in_callback);
        let may_finish = Arc::clone(&callback_may_finish);
        let entered2 = Arc::clone(&entered_during_dispatch);

        s.spawn(move |_| {
            let _client = init().unwrap();
            register_callback(
                move || {
                    in_callback2.store(true, Ordering::Release);
                    // Hold the dispatch window open while the other thread
                    // tries to enter a section.
                    while !may_finish.load(Ordering::Acquire) {
                        std::thread::yield_now();
                    }
                    // Nobody may have been admitted meanwhile.
                    assert!(!entered2.load(Ordering::Acquire));
                    0
                },
                CallbackContext::Signal,
            )
            .unwrap();
            dispatch::deliver(61);
        });

        while !in_callback.load(Ordering::Acquire) {
            std::thread::yield_now();
        }

        let entered3 = Arc::clone(&entered_during_dispatch);
        let contender = s.spawn(move |_| {
            let client = init().unwrap();
            enter_cs(client).unwrap();
            entered3.store(true, Ordering::Release);
            leave_cs(client).unwrap();
        });

        std::thread::sleep(Duration::from_millis(100));
        callback_may_finish.store(true, Ordering::Release);
        contender.join().unwrap();
    })
    .unwrap();

    assert!(entered_during_dispatch.load(Ordering::Acquire));
}
