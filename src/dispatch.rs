//! Signal dispatcher: the async-signal-safe entry point for checkpoint
//! requests.
//!
//! The extern "C" handler is a thin filter: preserve errno, discard
//! deliveries that did not originate from the kernel channel, pull the
//! request token out of the siginfo, and hand off to [`deliver`]. Everything
//! it touches is an atomic, a TLS read, or an ioctl — no allocation, no
//! locks, no blocking syscalls.

use std::sync::atomic::Ordering;

use once_cell::sync::OnceCell;

use crate::channel::{self, Token};
use crate::context::{self, DispatchMode};
use crate::cs;
use crate::engine;
use crate::fatal;
use crate::thread;
use crate::types::AbortReason;

/// The checkpoint request signal: the top realtime signal, which well-behaved
/// applications leave alone.
pub(crate) fn request_signal() -> libc::c_int {
    libc::SIGRTMAX()
}

type SignalEntry =
    extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

fn entry_addr(entry: SignalEntry) -> libc::sighandler_t {
    entry as libc::sighandler_t
}

static HANDLER_INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the checkpoint signal handler, once per process.
///
/// Refuses to displace a foreign handler: if some other subsystem owns the
/// signal, checkpoint requests would be silently lost, which is exactly the
/// kind of failure that must be loud.
pub(crate) fn install_handler() {
    HANDLER_INSTALLED.get_or_init(|| {
        let signum = request_signal();
        unsafe {
            let mut old: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signum, std::ptr::null(), &mut old) != 0 {
                fatal!("sigaction probe failed for signal {}", signum);
            }
            let foreign = old.sa_sigaction != libc::SIG_DFL
                && old.sa_sigaction != libc::SIG_IGN
                && old.sa_sigaction != entry_addr(handler_entry)
                && old.sa_sigaction != entry_addr(omit_entry);
            if foreign {
                fatal!("signal {} already owned by a foreign handler", signum);
            }

            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = entry_addr(handler_entry);
            sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigfillset(&mut sa.sa_mask);
            if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
                fatal!("failed to install handler for signal {}", signum);
            }
        }
        log::debug!("checkpoint request handler installed on signal {}", signum);
    });
}

/// Replace the dispatcher with the omit handler: every request is answered
/// with abort(omit). Restart children install this before the kernel
/// repopulates them, closing the race between their creation and a new
/// incoming request.
pub(crate) fn install_omit_handler() {
    let signum = request_signal();
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = entry_addr(omit_entry);
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
            fatal!("failed to install omit handler for signal {}", signum);
        }
    }
}

/// Genuine deliveries come from the kernel channel, which stamps the
/// kernel-origin code; anything else on this signal number is noise.
unsafe fn genuine(info: *mut libc::siginfo_t) -> bool {
    !info.is_null() && (*info).si_code == libc::SI_KERNEL
}

extern "C" fn handler_entry(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    unsafe {
        let saved_errno = *libc::__errno_location();

        if genuine(info) {
            // The channel smuggles the request token through the pid field.
            let token = (*info).si_pid() as Token;
            deliver(token);
        }

        *libc::__errno_location() = saved_errno;
    }
}

extern "C" fn omit_entry(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    unsafe {
        let saved_errno = *libc::__errno_location();

        if genuine(info) {
            let token = (*info).si_pid() as Token;
            let _ = channel::active().abort(token, AbortReason::Omit);
        }

        *libc::__errno_location() = saved_errno;
    }
}

/// Route a request to the calling thread's context, below the spurious-
/// delivery filter.
///
/// This is the dispatch path the signal handler takes for genuine
/// deliveries. It is public for embedders (and tests) that receive
/// checkpoint requests over their own transport: call it on the thread the
/// request targets, with the channel token it carried.
pub fn deliver(token: Token) {
    let raw = context::current_raw();
    if raw.is_null() {
        // No context on this thread: minimal inline checkpoint.
        engine::minimal_checkpoint(token);
        return;
    }

    // Safe: non-null means the owning slot on this same thread still holds
    // the context.
    let ctx = unsafe { &*raw };
    match ctx.mode() {
        DispatchMode::None => engine::minimal_checkpoint(token),
        DispatchMode::Signal => {
            ctx.run.token.store(token, Ordering::Relaxed);
            cs::on_request(ctx);
        }
        DispatchMode::ThreadWake => {
            ctx.run.token.store(token, Ordering::Relaxed);
            thread::on_request(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LIVE_COUNT;
    use crate::test_utils::{StubChannel, StubOp};

    #[test]
    fn request_signal_is_a_realtime_signal() {
        let signum = request_signal();
        assert!(signum >= libc::SIGRTMIN());
    }

    #[test]
    fn delivery_without_context_takes_the_minimal_path() {
        let _serial = crate::context::TEST_SERIAL.lock();
        let stub = StubChannel::install();
        stub.script_checkpoint_result(0);

        std::thread::spawn(|| {
            // This thread never initialized; no context exists.
            deliver(11);
        })
        .join()
        .unwrap();

        assert_eq!(stub.count(|op| matches!(op, StubOp::Checkpoint { .. })), 1);
        assert_eq!(stub.count(|op| matches!(op, StubOp::Done { .. })), 1);
        assert_eq!(LIVE_COUNT.load(Ordering::Acquire), 0);
    }

    #[test]
    fn delivery_in_signal_mode_runs_the_full_path() {
        let _serial = crate::context::TEST_SERIAL.lock();
        let stub = StubChannel::install();
        stub.script_checkpoint_result(0);

        std::thread::spawn(|| {
            let ctx = context::current_or_init();
            ctx.set_mode(DispatchMode::Signal);
            deliver(12);
            assert_eq!(ctx.run_token(), 12);
        })
        .join()
        .unwrap();

        assert_eq!(stub.count(|op| matches!(op, StubOp::Checkpoint { .. })), 1);
        assert_eq!(LIVE_COUNT.load(Ordering::Acquire), 0);
    }
}
