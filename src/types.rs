//! Public vocabulary shared across the checkpoint/restart core.

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Hard ceiling on the number of callbacks one context may hold.
///
/// Registration past this point fails with
/// [`CrError::ResourceExhausted`](crate::error::CrError::ResourceExhausted).
pub const MAX_CALLBACKS: usize = 4096;

/// Lifecycle state of one thread's checkpoint context.
///
/// The state only ever cycles `Idle -> Pending -> Active -> Idle`.
/// `Pending -> Active` is the sole transition driven from signal context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CrState {
    /// No checkpoint request outstanding for this context.
    Idle = 0,
    /// A request has been delivered but callbacks have not started.
    Pending = 1,
    /// Callbacks are running (or the terminal kernel call is in flight).
    Active = 2,
}

impl CrState {
    pub(crate) fn from_u32(raw: u32) -> CrState {
        match raw {
            0 => CrState::Idle,
            1 => CrState::Pending,
            2 => CrState::Active,
            other => crate::fatal!("corrupt context state {}", other),
        }
    }
}

/// How a completed checkpoint resolved for the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// The process kept running after the capture.
    Continue,
    /// Execution resumed from a saved image, typically in a new process.
    Restarted,
}

/// Reason supplied when a callback cancels the checkpoint in flight.
///
/// Cancellation is propagated through the kernel channel, not by unwinding;
/// callbacks that already started still finish normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Transient condition; the requester may retry.
    TemporaryFailure,
    /// Permanent condition; retrying cannot help.
    PermanentFailure,
    /// Leave this process out of the checkpoint without failing it.
    Omit,
}

/// Argument to [`checkpoint`](crate::checkpoint): proceed with the chain, or
/// cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointControl {
    /// Keep unwinding the callback chain toward the terminal kernel call.
    Proceed,
    /// Cancel: tell the kernel to abort and stop stacking callbacks.
    Abort(AbortReason),
}

/// Execution context of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackContext {
    /// Runs inside the interrupted thread's signal handler. Must restrict
    /// itself to async-signal-safe operations.
    Signal,
    /// Runs on the dedicated checkpoint thread, free of signal-handler
    /// restrictions.
    Thread,
}

/// Identifier of a registered callback: its slot plus the context it was
/// registered for. Replacement requires the context tags to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId {
    pub(crate) index: u32,
    pub(crate) context: CallbackContext,
}

impl CallbackId {
    /// The slot index within the owning context's callback vector.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The context this callback was registered for.
    pub fn context(&self) -> CallbackContext {
        self.context
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.context {
            CallbackContext::Signal => "sig",
            CallbackContext::Thread => "thr",
        };
        write!(f, "{}/{}", tag, self.index)
    }
}

/// Per-thread client identifier handed out by [`init`](crate::init).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub(crate) u32);

/// Whether the kernel holds clients at the post-checkpoint barrier until all
/// of them acknowledge completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPolicy {
    /// Release immediately in both outcomes.
    None,
    /// Hold at the barrier when continuing.
    Continue,
    /// Hold at the barrier when restarting.
    Restart,
    /// Hold at the barrier in both outcomes.
    Both,
    /// Thread scope only: defer to the init-scope default at done-time.
    Default,
}

impl HoldPolicy {
    pub(crate) fn code(self) -> i32 {
        match self {
            HoldPolicy::None => 0,
            HoldPolicy::Continue => 1,
            HoldPolicy::Restart => 2,
            HoldPolicy::Both => 3,
            HoldPolicy::Default => -1,
        }
    }

    pub(crate) fn from_code(code: i32) -> HoldPolicy {
        match code {
            0 => HoldPolicy::None,
            1 => HoldPolicy::Continue,
            2 => HoldPolicy::Restart,
            3 => HoldPolicy::Both,
            -1 => HoldPolicy::Default,
            other => crate::fatal!("corrupt hold policy {}", other),
        }
    }
}

/// Which hold-policy cell [`hold_ctrl`](crate::hold_ctrl) operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldScope {
    /// The calling thread's own context.
    Thread,
    /// Process-wide default for threads that called [`init`](crate::init).
    InitDefault,
    /// Process-wide default for threads that never initialized (served by the
    /// minimal inline dispatch path).
    UninitDefault,
}

/// Global notification points fired once per completed checkpoint episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HookEvent {
    /// Continue outcome on a thread with no context or handler.
    ContinueNoCallbacks = 0,
    /// Restart outcome on a thread with no context or handler.
    RestartNoCallbacks = 1,
    /// Continue outcome after a signal-context callback chain.
    ContinueSignalContext = 2,
    /// Restart outcome after a signal-context callback chain.
    RestartSignalContext = 3,
    /// Continue outcome after a thread-context callback chain.
    ContinueThreadContext = 4,
    /// Restart outcome after a thread-context callback chain.
    RestartThreadContext = 5,
}

impl HookEvent {
    pub const COUNT: usize = 6;
}

/// Scope of an externally requested checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    /// One process.
    Process,
    /// A process tree.
    Tree,
    /// An entire session.
    Session,
}

/// Arguments for an external checkpoint request.
///
/// `Default` fills the fields a requester must override with invalid
/// sentinels, mirroring the versioned argument-initializer of the wire
/// interface.
#[derive(Debug, Clone)]
pub struct CheckpointRequestArgs {
    /// Pid of the request target; 0 means "self".
    pub target: libc::pid_t,
    /// Scope of the capture.
    pub scope: RequestScope,
    /// Destination file descriptor for the image.
    pub fd: RawFd,
    /// Signal to deliver to the target after the capture, 0 for none.
    pub signal: i32,
    /// Seconds before the kernel abandons the request, 0 for unbounded.
    pub timeout_secs: u32,
    /// Request behavior flags, passed through to the kernel.
    pub flags: u32,
}

impl Default for CheckpointRequestArgs {
    fn default() -> Self {
        CheckpointRequestArgs {
            target: 0,
            scope: RequestScope::Process,
            fd: -1,
            signal: 0,
            timeout_secs: 0,
            flags: 0,
        }
    }
}

/// Arguments for an external restart request.
#[derive(Debug, Clone)]
pub struct RestartRequestArgs {
    /// Source file descriptor holding the saved image.
    pub fd: RawFd,
    /// Signal to deliver to the restarted task, 0 for none.
    pub signal: i32,
    /// Request behavior flags, passed through to the kernel.
    pub flags: u32,
}

impl Default for RestartRequestArgs {
    fn default() -> Self {
        RestartRequestArgs {
            fd: -1,
            signal: 0,
            flags: 0,
        }
    }
}

/// Per-checkpoint metadata, fetched from the kernel once per event and cached
/// in the active context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Pid of the process that requested the checkpoint.
    pub requester: libc::pid_t,
    /// Pid of the request target.
    pub target: libc::pid_t,
    /// Scope the request was issued with.
    pub scope: RequestScope,
    /// Signal the requester asked to have delivered afterwards.
    pub signal: i32,
    /// Destination the image is being written to.
    pub dest: PathBuf,
}

/// Per-restart metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartInfo {
    /// Pid of the process that requested the restart.
    pub requester: libc::pid_t,
    /// Source the image is being read from.
    pub src: PathBuf,
}
