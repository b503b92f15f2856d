//! Global notification hooks, fired once per completed checkpoint episode.
//!
//! The table is a fixed array of word-sized lock-free cells: the execution
//! engine loads and fires from signal context, so reads must be a single
//! atomic load. Writers are rare and serialize on an ordinary mutex that
//! signal context never touches.

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::context;
use crate::cs;
use crate::error::{CrError, CrResult};
use crate::types::HookEvent;

/// A global hook. Runs in whatever context completed the episode — possibly
/// a signal handler — so it must restrict itself accordingly.
pub type HookFn = fn(HookEvent);

static HOOKS: [AtomicCell<Option<HookFn>>; HookEvent::COUNT] = [
    AtomicCell::new(None),
    AtomicCell::new(None),
    AtomicCell::new(None),
    AtomicCell::new(None),
    AtomicCell::new(None),
    AtomicCell::new(None),
];

static WRITERS: Mutex<()> = Mutex::new(());

/// Install `func` for `event`, returning the previously installed hook.
/// Passing `None` removes the hook.
pub fn register_hook(event: HookEvent, func: Option<HookFn>) -> CrResult<Option<HookFn>> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;

    cs::do_enter(&ctx);
    let old = {
        let _writers = WRITERS.lock();
        HOOKS[event as usize].swap(func)
    };
    cs::do_leave(&ctx);

    Ok(old)
}

/// Fire the hook for `event`, if any. Safe from signal context: one lock-free
/// load plus the call.
pub(crate) fn run_hook(event: HookEvent) {
    if let Some(func) = HOOKS[event as usize].load() {
        func(event);
    }
}
