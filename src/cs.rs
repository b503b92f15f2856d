//! Critical sections: regions checkpoint dispatch must not interrupt.
//!
//! Built on the process-wide red/black lock plus each context's biased depth
//! counter. The protocol's one subtlety is starvation: a thread that
//! re-enters critical sections back to back could keep the red side held
//! forever, so an outermost entry that observes a live checkpoint anywhere
//! first lets its own pending checkpoint run, then retries.

use crate::backoff::Backoff;
use crate::context::{self, Context, CS_LOCK, LIVE_COUNT};
use crate::engine;
use crate::error::{CrError, CrResult};
use crate::types::{ClientId, CrState};
use std::sync::atomic::Ordering;

/// One step of checkpoint dispatch: drop this context's pending-decrement
/// and, if the depth just hit zero, drive the checkpoint under the black
/// lock. Valid from signal context.
pub(crate) fn poll_checkpoint(ctx: &Context) {
    if ctx.cs_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        CS_LOCK.black_lock();
        engine::start_checkpoint(ctx);
        CS_LOCK.black_unlock();
    }
}

/// Signal-context delivery for an ordinary thread: full
/// IDLE -> PENDING -> drive path.
pub(crate) fn on_request(ctx: &Context) {
    ctx.reset_event_info();

    if ctx.cas_state(CrState::Idle, CrState::Pending) {
        LIVE_COUNT.fetch_add(1, Ordering::AcqRel);
        poll_checkpoint(ctx);
    }
}

/// One attempt at entering a critical section. Returns `false` when the
/// caller must retry (a checkpoint was allowed to run first).
fn try_enter(ctx: &Context) -> bool {
    let old = ctx.cs_count.fetch_add(1, Ordering::AcqRel);

    if old > 1 {
        // Nested entry: never defers to the checkpoint, or the outer
        // section's guarantee would be void.
        CS_LOCK.red_lock();
    } else if LIVE_COUNT.load(Ordering::Acquire) != 0 || !CS_LOCK.red_trylock() {
        // A checkpoint is live somewhere, or the black side holds the lock.
        // Nudge the kernel to re-evaluate pending signals (works around
        // lost request deliveries observed in the field), let our own
        // pending checkpoint run, and have the caller retry.
        unsafe {
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            libc::sigprocmask(libc::SIG_UNBLOCK, &empty, std::ptr::null_mut());
        }
        poll_checkpoint(ctx); // undoes our depth increment as a side effect
        return false;
    }
    // else: the red_trylock in the condition acquired the lock.

    true
}

/// Enter, blocking until admitted. Returns the state observed on entry so
/// registration paths can detect ACTIVE (re-entrant no-op) and refuse with
/// busy.
///
/// Signal safe: if a signal drives this context into ACTIVE it also leaves
/// ACTIVE before control returns here.
pub(crate) fn do_enter(ctx: &Context) -> CrState {
    let state = ctx.state();

    if state != CrState::Active {
        let mut backoff = Backoff::new();
        while !try_enter(ctx) {
            backoff.snooze();
        }
    }

    state
}

/// Enter without blocking. Returns `true` on entry (including the ACTIVE
/// re-entrant case).
pub(crate) fn do_tryenter(ctx: &Context) -> bool {
    ctx.state() == CrState::Active || try_enter(ctx)
}

/// Leave the innermost critical section, dispatching a checkpoint that went
/// PENDING while we held it.
pub(crate) fn do_leave(ctx: &Context) {
    if ctx.state() != CrState::Active {
        CS_LOCK.red_unlock();
        poll_checkpoint(ctx);
    }
}

/// Enter a critical section. Re-entrant; pairs with [`leave_cs`].
pub fn enter_cs(_id: ClientId) -> CrResult<()> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    do_enter(&ctx);
    Ok(())
}

/// Try to enter a critical section without blocking. `Ok(true)` on entry.
pub fn try_enter_cs(_id: ClientId) -> CrResult<bool> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    Ok(do_tryenter(&ctx))
}

/// Leave a critical section entered with [`enter_cs`] or [`try_enter_cs`].
pub fn leave_cs(_id: ClientId) -> CrResult<()> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    do_leave(&ctx);
    Ok(())
}

/// The calling thread's checkpoint state.
///
/// Reports PENDING while any checkpoint is live in the process, so waiters
/// polling their own state see a request that has not reached them yet.
pub fn status() -> CrResult<CrState> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;

    let state = ctx.state();
    if state == CrState::Idle && LIVE_COUNT.load(Ordering::Acquire) != 0 {
        return Ok(CrState::Pending);
    }
    Ok(state)
}
