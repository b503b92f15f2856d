//! Per-thread checkpoint context and the process-wide coordination state.
//!
//! Every thread that participates in checkpointing owns one [`Context`]: a
//! small atomic state machine plus the callback vector and the bookkeeping
//! one run of the execution engine needs. The context is created lazily on
//! the first checkpoint-aware call and reached from signal context through a
//! pre-filled raw slot, so dispatch never allocates.
//!
//! Ownership: the thread-local slot holds one `Arc` reference; teardown
//! happens when the last reference drops, so [`ContextHandle`]s taken by
//! embedders defer it past thread exit.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::CallbackEntry;
use crate::channel::Token;
use crate::rb_lock::RedBlackLock;
use crate::types::{CheckpointInfo, CrState, HoldPolicy, RestartInfo};

/// Serializes unit tests that exercise the process-wide singletons below.
#[cfg(test)]
pub(crate) static TEST_SERIAL: Mutex<()> = Mutex::new(());

/// Number of contexts currently PENDING or ACTIVE, process-wide. Nonzero
/// tells critical-section holders a checkpoint is incoming even while they
/// still hold the red lock.
pub(crate) static LIVE_COUNT: AtomicU32 = AtomicU32::new(0);

/// The process-wide red/black lock critical sections and dispatch contend on.
pub(crate) static CS_LOCK: RedBlackLock = RedBlackLock::new();

/// Process-wide hold-policy default for initialized threads.
pub(crate) static HOLD_INIT: AtomicI32 = AtomicI32::new(3); // HoldPolicy::Both
/// Process-wide hold-policy default for the handler-less inline path.
pub(crate) static HOLD_UNINIT: AtomicI32 = AtomicI32::new(3); // HoldPolicy::Both

/// How the signal dispatcher routes a request delivered to this thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum DispatchMode {
    /// No handler installed yet; the dispatcher runs the minimal inline path.
    None = 0,
    /// Ordinary thread: full IDLE -> PENDING -> drive path in signal context.
    Signal = 1,
    /// The dedicated checkpoint thread: flag PENDING and let the main loop
    /// drive.
    ThreadWake = 2,
}

impl DispatchMode {
    fn from_u8(raw: u8) -> DispatchMode {
        match raw {
            1 => DispatchMode::Signal,
            2 => DispatchMode::ThreadWake,
            _ => DispatchMode::None,
        }
    }
}

/// Bookkeeping for one run of the execution engine. Single-writer: only the
/// thread currently wearing this context's identity touches it, so relaxed
/// atomics are enough; they exist to make the struct shareable, not to
/// synchronize.
pub(crate) struct RunState {
    pub(crate) token: AtomicI32,
    /// Counts strictly down from callback-count to -1.
    pub(crate) index: AtomicI32,
    /// Id of the callback currently running (down and up again).
    pub(crate) id: AtomicI32,
    /// Saved result of the terminal kernel call.
    pub(crate) rc: AtomicI32,
    /// Nonzero once a callback broke its contract this episode; holds the
    /// offending return value until the outermost cleanup aborts.
    pub(crate) broken_rc: AtomicI32,
    /// Slot of the contract-breaking callback, for the fatal diagnostic.
    pub(crate) broken_id: AtomicI32,
}

/// One thread's checkpoint state.
pub struct Context {
    state: AtomicU32,
    /// Critical-section depth, biased by one: reset to 1 on entering IDLE,
    /// +1 per enter, -1 per leave, -1 per delivered request. Zero means "no
    /// section held and a request is waiting" — one decrement-and-test away,
    /// valid from signal context.
    pub(crate) cs_count: AtomicI32,
    pub(crate) callbacks: Mutex<Vec<CallbackEntry>>,
    pub(crate) next_client_id: AtomicU32,
    mode: AtomicU8,
    is_thread: AtomicBool,
    pub(crate) hold: AtomicI32,
    pub(crate) run: RunState,
    pub(crate) checkpoint_info: Mutex<Option<CheckpointInfo>>,
    pub(crate) restart_info: Mutex<Option<RestartInfo>>,
}

impl Context {
    fn new() -> Context {
        let ctx = Context {
            state: AtomicU32::new(CrState::Idle as u32),
            cs_count: AtomicI32::new(1),
            callbacks: Mutex::new(Vec::new()),
            next_client_id: AtomicU32::new(0),
            mode: AtomicU8::new(DispatchMode::None as u8),
            is_thread: AtomicBool::new(false),
            hold: AtomicI32::new(HoldPolicy::Default.code()),
            run: RunState {
                token: AtomicI32::new(-1),
                index: AtomicI32::new(-1),
                id: AtomicI32::new(-1),
                rc: AtomicI32::new(0),
                broken_rc: AtomicI32::new(0),
                broken_id: AtomicI32::new(-1),
            },
            checkpoint_info: Mutex::new(None),
            restart_info: Mutex::new(None),
        };
        ctx.enter_idle();
        ctx
    }

    /// Detached context for unit tests; real contexts come from the
    /// thread-local slot.
    #[cfg(test)]
    pub(crate) fn new_for_testing() -> Context {
        Context::new()
    }

    pub(crate) fn state(&self) -> CrState {
        CrState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn cas_state(&self, from: CrState, to: CrState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transition to IDLE regardless of starting state and restore the
    /// depth-counter bias.
    pub(crate) fn enter_idle(&self) {
        self.state.store(CrState::Idle as u32, Ordering::Release);
        self.cs_count.store(1, Ordering::Release);
    }

    pub(crate) fn mode(&self) -> DispatchMode {
        DispatchMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: DispatchMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    pub(crate) fn is_thread(&self) -> bool {
        self.is_thread.load(Ordering::Acquire)
    }

    pub(crate) fn set_is_thread(&self) {
        self.is_thread.store(true, Ordering::Release);
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub(crate) fn run_token(&self) -> Token {
        self.run.token.load(Ordering::Relaxed)
    }

    /// Invalidate the per-event info caches at delivery time.
    ///
    /// Uncontended by construction (the caches are only read by callbacks of
    /// the same episode); `try_lock` keeps the dispatch path non-blocking all
    /// the same.
    pub(crate) fn reset_event_info(&self) {
        if let Some(mut cache) = self.checkpoint_info.try_lock() {
            *cache = None;
        }
        if let Some(mut cache) = self.restart_info.try_lock() {
            *cache = None;
        }
    }
}

/// Owning slot contents. Clears the raw mirror before the `Arc` drops, so
/// the dispatcher can never observe a dangling pointer during thread
/// teardown regardless of TLS destructor order.
struct OwnedSlot(Arc<Context>);

impl Drop for OwnedSlot {
    fn drop(&mut self) {
        let _ = CURRENT_RAW.try_with(|raw| raw.set(ptr::null()));
    }
}

thread_local! {
    /// Owning slot: one `Arc` reference per participating thread.
    static CURRENT: RefCell<Option<OwnedSlot>> = const { RefCell::new(None) };

    /// Raw mirror of `CURRENT` for the signal dispatcher: a plain TLS read,
    /// no lazy init, no borrow bookkeeping.
    static CURRENT_RAW: Cell<*const Context> = const { Cell::new(ptr::null()) };
}

/// The calling thread's context, if it has one.
pub(crate) fn current() -> Option<Arc<Context>> {
    CURRENT.with(|slot| slot.borrow().as_ref().map(|owned| Arc::clone(&owned.0)))
}

/// The calling thread's context, created on first use.
pub(crate) fn current_or_init() -> Arc<Context> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(owned) => Arc::clone(&owned.0),
            None => {
                let ctx = Arc::new(Context::new());
                CURRENT_RAW.with(|raw| raw.set(Arc::as_ptr(&ctx)));
                *slot = Some(OwnedSlot(Arc::clone(&ctx)));
                ctx
            }
        }
    })
}

/// Signal-context lookup. Null when this thread never initialized, or during
/// thread teardown — both served by the minimal inline path.
///
/// The pointer stays valid while non-null: the owning `Arc` lives in the
/// same thread's `CURRENT` slot, and `OwnedSlot::drop` clears the raw mirror
/// before releasing it.
pub(crate) fn current_raw() -> *const Context {
    CURRENT_RAW
        .try_with(|raw| raw.get())
        .unwrap_or(ptr::null())
}

/// Drop the calling thread's context slot. The atfork child hook uses this;
/// contexts of other threads do not exist in the child.
pub(crate) fn clear_current() {
    let _ = CURRENT_RAW.try_with(|raw| raw.set(ptr::null()));
    let _ = CURRENT.try_with(|slot| slot.borrow_mut().take());
}

/// Keep-alive handle for a thread's context.
///
/// Holding one defers context teardown past thread exit, for embedders that
/// registered callbacks capturing state the context must outlive. Dropping
/// the handle releases the reference.
pub struct ContextHandle {
    _ctx: Arc<Context>,
}

impl ContextHandle {
    pub(crate) fn new(ctx: Arc<Context>) -> ContextHandle {
        ContextHandle { _ctx: ctx }
    }
}
