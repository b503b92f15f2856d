//! Callback execution engine: drives a context through
//! PENDING -> ACTIVE -> IDLE around the terminal kernel call.
//!
//! The engine is one countdown loop over the callback vector, entered from
//! signal context (or the checkpoint thread) and re-entered by callbacks
//! that call [`checkpoint`] to order their post-resume work against the
//! capture. The countdown guarantees exactly one terminal kernel call per
//! episode and strict reverse-registration order, no matter how the
//! invocations stack.

use std::sync::atomic::Ordering;

use crate::channel::{self, codes, Token};
use crate::context::{self, Context, HOLD_INIT, LIVE_COUNT};
use crate::error::CheckpointError;
use crate::fatal;
use crate::hooks;
use crate::types::{
    AbortReason, CheckpointControl, CheckpointOutcome, CrState, HoldPolicy, HookEvent,
};

/// Begin running callbacks if a request is actually pending.
///
/// Called with the black lock held, either from signal context or by the
/// checkpoint thread's main loop. The failure policy is deliberately
/// asymmetric: on the signal path a failed PENDING -> ACTIVE transition means
/// the depth counter underflowed (an excess leave), which is unrecoverable;
/// on the checkpoint thread it is an expected false wakeup. Do not unify —
/// the fatal arm is what surfaces real dispatch bugs.
pub(crate) fn start_checkpoint(ctx: &Context) {
    if ctx.cas_state(CrState::Pending, CrState::Active) {
        ctx.run
            .index
            .store(ctx.callback_count() as i32, Ordering::Relaxed);
        let _ = run_chain(ctx, CheckpointControl::Proceed);
    } else if !ctx.is_thread() {
        fatal!("checkpoint state error (excess leave_cs call?)");
    }
    // else: false wakeup of the checkpoint thread, not an error.
}

/// The terminal capture call.
fn do_terminal(token: Token, flags: u32) -> i32 {
    channel::active().checkpoint(token, flags)
}

/// Minimal inline checkpoint for threads with no context or handler: no
/// callbacks, straight to the kernel, fire the no-callbacks hooks.
pub(crate) fn minimal_checkpoint(token: Token) {
    LIVE_COUNT.fetch_add(1, Ordering::AcqRel);
    let rc = do_terminal(token, 0);
    LIVE_COUNT.fetch_sub(1, Ordering::AcqRel);

    if rc >= 0 {
        hooks::run_hook(if rc > 0 {
            HookEvent::RestartNoCallbacks
        } else {
            HookEvent::ContinueNoCallbacks
        });
        let hold = crate::context::HOLD_UNINIT.load(Ordering::Acquire);
        if let Err(e) = channel::active().done(token, hold) {
            fatal!("checkpoint completion call failed (errno {})", e);
        }
    }
}

/// Re-entrant engine step, callable only while this thread's context (or the
/// checkpoint thread's, when running its callbacks) is ACTIVE.
///
/// From inside a callback, `checkpoint(Proceed)` runs the rest of the chain
/// and the kernel capture, then returns the shared outcome; every stacked
/// invocation sees the same resolution. `checkpoint(Abort(_))` cancels the
/// episode instead.
pub fn checkpoint(control: CheckpointControl) -> Result<CheckpointOutcome, CheckpointError> {
    let ctx = context::current().ok_or(CheckpointError::NotInCallback)?;
    if ctx.state() != CrState::Active {
        return Err(CheckpointError::NotInCallback);
    }
    run_chain(&ctx, control)
}

pub(crate) fn run_chain(
    ctx: &Context,
    control: CheckpointControl,
) -> Result<CheckpointOutcome, CheckpointError> {
    let my_id = ctx.run.index.load(Ordering::Relaxed);
    let token = ctx.run_token();
    let outermost = my_id == ctx.callback_count() as i32;

    // Walk the chain until every callback has run, then make the terminal
    // kernel call. The loop shape (rather than plain recursion bookkeeping)
    // ensures the terminal call happens even if the innermost callback is
    // empty or returns without re-entering checkpoint().
    loop {
        if let CheckpointControl::Abort(reason) = control {
            // The invoking callback failed; stop stacking and tell the
            // kernel.
            if let Err(e) = channel::active().abort(token, reason) {
                ctx.run.rc.store(-e, Ordering::Relaxed);
            }
            ctx.run.index.store(-1, Ordering::Relaxed);
            break;
        }

        let index = ctx.run.index.fetch_sub(1, Ordering::Relaxed) - 1;
        if index >= 0 {
            // Clone the cell out and drop the vector lock before invoking:
            // the callback may replace itself.
            let cell = {
                let callbacks = ctx.callbacks.lock();
                callbacks
                    .get(index as usize)
                    .map(|entry| std::sync::Arc::clone(&entry.cell))
            };
            if let Some(cell) = cell {
                let mut slot = cell.lock();
                if let Some(func) = slot.as_mut() {
                    ctx.run.id.store(index, Ordering::Relaxed);
                    let rc = func();
                    if rc != 0 {
                        // Broken callback contract: tell the kernel this
                        // process can never checkpoint, stop stacking, and
                        // remember to abort once the episode has unwound to
                        // a consistent IDLE state.
                        match channel::active()
                            .abort(token, AbortReason::PermanentFailure)
                        {
                            Err(e) => ctx.run.rc.store(-e, Ordering::Relaxed),
                            Ok(()) => ctx
                                .run
                                .rc
                                .store(-codes::CR_EPERMFAIL, Ordering::Relaxed),
                        }
                        ctx.run.broken_rc.store(rc, Ordering::Relaxed);
                        ctx.run.broken_id.store(index, Ordering::Relaxed);
                        ctx.run.index.store(-1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        } else {
            ctx.run
                .rc
                .store(do_terminal(token, 0), Ordering::Relaxed);
        }

        if ctx.run.index.load(Ordering::Relaxed) < 0 {
            break;
        }
    }

    // Once the outermost invocation acknowledges completion the kernel may
    // checkpoint us again; a second episode would overwrite run.rc. Snapshot
    // the outcome first.
    let retval = ctx.run.rc.load(Ordering::Relaxed);

    // Restore the saved id for the caller (replace-self addresses it).
    ctx.run.id.store(my_id, Ordering::Relaxed);

    if outermost {
        ctx.enter_idle();
        LIVE_COUNT.fetch_sub(1, Ordering::AcqRel);

        // A broken contract aborts only after the state machine and live
        // count are consistent again, so the diagnostics describe a settled
        // process.
        let broken = ctx.run.broken_rc.swap(0, Ordering::Relaxed);
        if broken != 0 {
            fatal!(
                "callback {} returned {} during checkpoint",
                ctx.run.broken_id.load(Ordering::Relaxed),
                broken
            );
        }

        if retval >= 0 {
            hooks::run_hook(match (retval > 0, ctx.is_thread()) {
                (true, true) => HookEvent::RestartThreadContext,
                (true, false) => HookEvent::RestartSignalContext,
                (false, true) => HookEvent::ContinueThreadContext,
                (false, false) => HookEvent::ContinueSignalContext,
            });

            let mut hold = ctx.hold.load(Ordering::Acquire);
            if hold == HoldPolicy::Default.code() {
                hold = HOLD_INIT.load(Ordering::Acquire);
            }
            if let Err(e) = channel::active().done(token, hold) {
                fatal!("checkpoint completion call failed (errno {})", e);
            }
        }
    }

    match retval {
        0 => Ok(CheckpointOutcome::Continue),
        rc if rc > 0 => Ok(CheckpointOutcome::Restarted),
        rc => Err(match -rc {
            codes::CR_ETEMPFAIL => CheckpointError::TemporaryFailure,
            codes::CR_EPERMFAIL => CheckpointError::PermanentFailure,
            codes::CR_EOMITTED => CheckpointError::Omitted,
            errno => CheckpointError::Kernel(errno),
        }),
    }
}
