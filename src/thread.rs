//! Checkpoint thread manager: the single dedicated thread that runs
//! thread-context callbacks.
//!
//! Lazily spawned on the first thread-context registration. The startup
//! handshake guarantees nobody registers against the thread's context before
//! the thread has connected to the kernel channel and published it. The main
//! loop is suspend-driven: block in the kernel until woken, quiesce the
//! process (black lock), take the dispatch mutex, and drive the engine —
//! where a wakeup with nothing pending is an expected no-op.

use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::callback::{self, CallbackFn};
use crate::channel;
use crate::context::{self, Context, CS_LOCK, DispatchMode, LIVE_COUNT};
use crate::engine;
use crate::error::CrResult;
use crate::fatal;
use crate::types::{CallbackContext, CallbackId, CrState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Running,
}

struct MgrState {
    phase: Phase,
    ctx: Option<Arc<Context>>,
}

struct Manager {
    state: Mutex<MgrState>,
    ready: Condvar,
}

impl Manager {
    fn new() -> Manager {
        Manager {
            state: Mutex::new(MgrState {
                phase: Phase::Stopped,
                ctx: None,
            }),
            ready: Condvar::new(),
        }
    }
}

/// Swappable so the atfork child hook can discard bookkeeping wholesale
/// instead of re-initializing primitives another thread may have held
/// across the fork.
static MGR: Lazy<ArcSwap<Manager>> = Lazy::new(|| ArcSwap::from_pointee(Manager::new()));

/// Thread-wake delivery: flag PENDING and let the main loop drive. Runs in
/// signal context on the checkpoint thread.
pub(crate) fn on_request(ctx: &Context) {
    ctx.reset_event_info();

    if ctx.cas_state(CrState::Idle, CrState::Pending) {
        LIVE_COUNT.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }
}

/// Register a callback on the checkpoint thread's context, starting the
/// thread first if needed. Caller holds a critical section.
pub(crate) fn register_thread_callback(func: CallbackFn) -> CrResult<CallbackId> {
    let mgr = MGR.load_full();
    let mut state = mgr.state.lock();
    ensure_running(&mgr, &mut state);
    let ctx = state.ctx.clone().expect("running manager has a context");
    // Registration stays under the dispatch mutex: the main loop takes it
    // before driving callbacks, so the vector cannot change mid-run.
    callback::do_register(&ctx, func, CallbackContext::Thread)
}

/// Replace a callback on the checkpoint thread's context. Caller holds a
/// critical section.
pub(crate) fn replace_thread_callback(
    id: CallbackId,
    func: Option<CallbackFn>,
    context_tag: CallbackContext,
) -> CrResult<()> {
    let mgr = MGR.load_full();
    let state = mgr.state.lock();
    match &state.ctx {
        Some(ctx) => callback::do_replace(ctx, id, func, context_tag),
        None => Err(crate::error::CrError::InvalidArgument(
            "no thread-context callbacks registered",
        )),
    }
}

/// Called with the manager lock held. More than one thread can queue up here
/// between the spawner dropping the lock to wait and the new thread
/// finishing its handshake; everyone waits for Running.
fn ensure_running(mgr: &Arc<Manager>, state: &mut parking_lot::MutexGuard<'_, MgrState>) {
    if state.phase == Phase::Running {
        return;
    }

    if state.phase == Phase::Stopped {
        spawn_checkpoint_thread();
        state.phase = Phase::Starting;
    }

    while state.phase != Phase::Running {
        mgr.ready.wait(state);
    }
}

/// Spawn with stack-halving retry: thread creation failing on memory is
/// recoverable by asking for less, down to the platform minimum.
fn spawn_checkpoint_thread() {
    let spawn = |builder: std::thread::Builder| builder.spawn(thread_main);

    let mut result = spawn(std::thread::Builder::new().name("freezepoint-cb".into()));

    if is_oom(&result) {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as usize;
        let min = libc::PTHREAD_STACK_MIN.max(page);
        let mut size: usize = 4 * 1024 * 1024;

        while is_oom(&result) && size >= min {
            log::debug!("checkpoint thread spawn hit OOM; retrying with {} byte stack", size);
            result = spawn(
                std::thread::Builder::new()
                    .name("freezepoint-cb".into())
                    .stack_size(size),
            );
            size = (size / 2) & !(page - 1);
        }
    }

    if let Err(e) = result {
        fatal!("failed to spawn checkpoint thread: {}", e);
    }
}

fn is_oom(result: &std::io::Result<std::thread::JoinHandle<()>>) -> bool {
    matches!(result, Err(e) if e.raw_os_error() == Some(libc::ENOMEM)
        || e.raw_os_error() == Some(libc::EAGAIN))
}

fn thread_main() {
    let token = match channel::active().connect() {
        Ok(token) => token,
        Err(e) => fatal!("checkpoint thread could not connect (errno {})", e),
    };

    // Only the kernel channel's suspend call should wake this thread; block
    // everything else to cut down false wakeups.
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    }

    // Declare ourselves the phase-1 handler. Losing a race against an
    // in-flight checkpoint surfaces as EAGAIN after the capture; retry.
    loop {
        match channel::active().register_phase1(token) {
            Ok(()) => break,
            Err(e) if e == libc::EAGAIN => continue,
            Err(e) => fatal!("phase-1 registration failed (errno {})", e),
        }
    }

    // Until `mode` flips below, the kernel and dispatcher still treat us as
    // an ordinary thread and would answer from signal context — acceptable,
    // since no callbacks can be registered before the handshake completes.
    let ctx = context::current_or_init();
    ctx.set_is_thread();
    ctx.run.token.store(token, std::sync::atomic::Ordering::Relaxed);
    ctx.set_mode(DispatchMode::ThreadWake);

    log::debug!("checkpoint thread running (token {})", token);

    // Publish: registrations may proceed once we release the lock.
    let mgr = MGR.load_full();
    {
        let mut state = mgr.state.lock();
        state.ctx = Some(Arc::clone(&ctx));
        state.phase = Phase::Running;
        mgr.ready.notify_all();
    }

    loop {
        match channel::active().suspend(token) {
            Ok(()) => {}
            Err(e) if e == libc::EINTR => {} // false wakeup; still check
            Err(e) => fatal!("checkpoint thread wait failed (errno {})", e),
        }

        // Quiesce first, then serialize against registrations.
        CS_LOCK.black_lock();
        {
            let _dispatch = mgr.state.lock();
            engine::start_checkpoint(&ctx);
        }
        CS_LOCK.black_unlock();
    }
}

/// Atfork child hook: the OS thread did not survive the fork, so discard its
/// bookkeeping and let the child lazily respawn on demand.
pub(crate) fn reset_after_fork() {
    MGR.store(Arc::new(Manager::new()));
}
