//! Library initialization and the small per-thread surface that hangs off
//! it: hold-policy control, per-event info accessors, context keep-alive.
//!
//! There is no link-time constructor; everything initializes on the first
//! [`init`] call — the kernel connection, the signal handler, and the fork
//! hygiene hooks — and each thread that wants callbacks or critical sections
//! calls [`init`] once itself to create its context.

use std::sync::atomic::Ordering;

use once_cell::sync::OnceCell;

use crate::channel;
use crate::context::{
    self, ContextHandle, CS_LOCK, HOLD_INIT, HOLD_UNINIT, LIVE_COUNT,
};
use crate::dispatch;
use crate::error::{CrError, CrResult};
use crate::fatal;
use crate::types::{
    CheckpointInfo, ClientId, CrState, HoldPolicy, HoldScope, RestartInfo,
};

static PROCESS_INIT: OnceCell<()> = OnceCell::new();

/// Initialize checkpoint support for the calling thread.
///
/// The first call in the process connects to the kernel channel (failing
/// with [`CrError::Channel`] when the kernel side is absent), installs the
/// request-signal handler, and registers the fork-reset hook. Every call
/// creates the calling thread's context if needed, registers it as a
/// dispatch target, and returns a fresh client id for its critical sections.
pub fn init() -> CrResult<ClientId> {
    let token = channel::shared_token().map_err(CrError::Channel)?;

    PROCESS_INIT.get_or_init(|| {
        unsafe {
            if libc::pthread_atfork(None, None, Some(child_reset)) != 0 {
                fatal!("failed to register fork hooks");
            }
        }
        dispatch::install_handler();
        log::debug!("checkpoint support initialized (token {})", token);
    });

    let ctx = context::current_or_init();
    if ctx.mode() == context::DispatchMode::None {
        ctx.set_mode(context::DispatchMode::Signal);

        // Declare this thread a phase-2 dispatch target. Losing a race
        // against an in-flight checkpoint surfaces as EAGAIN after the
        // capture; retry.
        loop {
            match channel::active().register_phase2(token) {
                Ok(()) => break,
                Err(e) if e == libc::EAGAIN => continue,
                Err(e) => fatal!("phase-2 registration failed (errno {})", e),
            }
        }
    }

    Ok(ClientId(ctx.next_client_id.fetch_add(1, Ordering::Relaxed)))
}

/// Atfork child hook: holders and live contexts in other threads do not
/// exist in the child, so reset the process-wide coordination state and the
/// forking thread's own context slot.
extern "C" fn child_reset() {
    CS_LOCK.reset();
    LIVE_COUNT.store(0, Ordering::Release);
    context::clear_current();
    crate::thread::reset_after_fork();
}

/// Read and optionally update a hold-policy cell.
///
/// `update = None` reads without writing. [`HoldPolicy::Default`] is only
/// storable at thread scope, where it defers to the init-scope default at
/// done-time.
pub fn hold_ctrl(scope: HoldScope, update: Option<HoldPolicy>) -> CrResult<HoldPolicy> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;

    let cell = match scope {
        HoldScope::Thread => &ctx.hold,
        HoldScope::InitDefault => &HOLD_INIT,
        HoldScope::UninitDefault => &HOLD_UNINIT,
    };

    let mut old = cell.load(Ordering::Acquire);
    let Some(policy) = update else {
        return Ok(HoldPolicy::from_code(old));
    };

    if policy == HoldPolicy::Default && scope != HoldScope::Thread {
        return Err(CrError::InvalidArgument(
            "default hold policy is thread-scope only",
        ));
    }

    // CAS loop so the returned old value is meaningful in the presence of
    // threads and signals.
    let new = policy.code();
    while let Err(actual) =
        cell.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
    {
        old = actual;
    }

    Ok(HoldPolicy::from_code(old))
}

/// Keep the calling thread's context alive past thread exit.
///
/// Useful when registered callbacks capture state that must survive until a
/// late checkpoint; drop the handle to release it.
pub fn retain_context() -> CrResult<ContextHandle> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    Ok(ContextHandle::new(ctx))
}

/// Metadata of the checkpoint in flight. Only callable from a running
/// callback; fetched from the kernel once per event and cached.
pub fn checkpoint_info() -> CrResult<CheckpointInfo> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    if ctx.state() != CrState::Active {
        return Err(CrError::NotInCallback);
    }

    let mut cache = ctx.checkpoint_info.lock();
    if cache.is_none() {
        let raw = match channel::active().checkpoint_info(ctx.run_token()) {
            Ok(raw) => raw,
            // Documented-infallible while a checkpoint is in flight.
            Err(e) => fatal!("checkpoint info fetch failed (errno {})", e),
        };
        *cache = Some(CheckpointInfo {
            requester: raw.requester,
            target: raw.target,
            scope: channel::scope_from_code(raw.scope),
            signal: raw.signal,
            dest: raw.dest,
        });
    }

    Ok(cache.clone().expect("just filled"))
}

/// Metadata of the restart in flight. Only callable from a running callback.
pub fn restart_info() -> CrResult<RestartInfo> {
    let ctx = context::current().ok_or(CrError::NotInitialized)?;
    if ctx.state() != CrState::Active {
        return Err(CrError::NotInCallback);
    }

    let mut cache = ctx.restart_info.lock();
    if cache.is_none() {
        let src = match channel::active().restart_source(ctx.run_token()) {
            Ok(src) => src,
            Err(e) => fatal!("restart source fetch failed (errno {})", e),
        };
        *cache = Some(RestartInfo {
            // The terminal call returns the restart requester's pid.
            requester: ctx.run.rc.load(Ordering::Relaxed) as libc::pid_t,
            src,
        });
    }

    Ok(cache.clone().expect("just filled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{with_initialized_context, StubChannel};

    #[test]
    fn hold_ctrl_requires_a_context() {
        std::thread::spawn(|| {
            assert_eq!(
                hold_ctrl(HoldScope::Thread, None).unwrap_err(),
                CrError::NotInitialized
            );
        })
        .join()
        .unwrap();
    }

    #[test]
    fn hold_ctrl_reads_and_writes_thread_scope() {
        std::thread::spawn(|| {
            with_initialized_context(|| {
                assert_eq!(
                    hold_ctrl(HoldScope::Thread, None).unwrap(),
                    HoldPolicy::Default
                );
                let old = hold_ctrl(HoldScope::Thread, Some(HoldPolicy::Continue)).unwrap();
                assert_eq!(old, HoldPolicy::Default);
                assert_eq!(
                    hold_ctrl(HoldScope::Thread, None).unwrap(),
                    HoldPolicy::Continue
                );
            })
        })
        .join()
        .unwrap();
    }

    #[test]
    fn default_policy_is_rejected_outside_thread_scope() {
        std::thread::spawn(|| {
            with_initialized_context(|| {
                let err = hold_ctrl(HoldScope::InitDefault, Some(HoldPolicy::Default))
                    .unwrap_err();
                assert!(matches!(err, CrError::InvalidArgument(_)));
            })
        })
        .join()
        .unwrap();
    }

    #[test]
    fn info_accessors_require_an_active_callback() {
        std::thread::spawn(|| {
            with_initialized_context(|| {
                assert_eq!(checkpoint_info().unwrap_err(), CrError::NotInCallback);
                assert_eq!(restart_info().unwrap_err(), CrError::NotInCallback);
            })
        })
        .join()
        .unwrap();
    }

    #[test]
    fn checkpoint_info_is_fetched_once_and_cached() {
        let _serial = crate::context::TEST_SERIAL.lock();
        let stub = StubChannel::install();

        std::thread::spawn(move || {
            with_initialized_context(|| {
                let ctx = crate::context::current().unwrap();
                assert!(ctx.cas_state(CrState::Idle, CrState::Pending));
                assert!(ctx.cas_state(CrState::Pending, CrState::Active));

                let first = checkpoint_info().unwrap();
                let second = checkpoint_info().unwrap();
                assert_eq!(first, second);
                assert_eq!(
                    stub.count(|op| matches!(
                        op,
                        crate::test_utils::StubOp::CheckpointInfo(_)
                    )),
                    1
                );

                ctx.enter_idle();
            })
        })
        .join()
        .unwrap();
    }
}
