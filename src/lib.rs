//! User-space coordination core for whole-process checkpoint/restart.
//!
//! A checkpoint request arrives asynchronously, as a process-directed
//! signal, at a process whose threads may hold locks or sit mid-way through
//! non-reentrant code. This crate quiesces every thread to a checkpoint-safe
//! point without deadlock, runs registered callbacks exactly once per event
//! in strict reverse registration order around the kernel capture, and
//! resolves every waiter to a continue or restart outcome — using only
//! async-signal-safe primitives at the dispatch point.
//!
//! The kernel side (memory capture and the request channel) is an external
//! collaborator behind [`channel::KernelOps`].
//!
//! ```no_run
//! use freezepoint::{
//!     checkpoint, init, register_callback, CallbackContext, CheckpointControl,
//! };
//!
//! let client = init().expect("kernel support present");
//!
//! freezepoint::enter_cs(client).unwrap();
//! let _id = register_callback(
//!     || {
//!         // Pre-freeze work, then order post-resume work against the
//!         // capture:
//!         let outcome = checkpoint(CheckpointControl::Proceed);
//!         // Post-resume work happens here, on both continue and restart.
//!         drop(outcome);
//!         0
//!     },
//!     CallbackContext::Signal,
//! )
//! .unwrap();
//! freezepoint::leave_cs(client).unwrap();
//! ```

mod backoff;
mod cs;
mod engine;
mod init;
mod rb_lock;
mod thread;

pub mod callback;
pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod request;
pub mod test_utils;
pub mod types;

pub(crate) use error::fatal;

pub use callback::{
    clear_callback, register_callback, replace_callback, replace_self, CallbackFn,
};
pub use channel::swap_channel;
pub use context::ContextHandle;
pub use cs::{enter_cs, leave_cs, status, try_enter_cs};
pub use engine::checkpoint;
pub use error::{CheckpointError, CrError, CrResult};
pub use hooks::{register_hook, HookFn};
pub use init::{
    checkpoint_info, hold_ctrl, init, restart_info, retain_context,
};
pub use request::{
    log_checkpoint, log_restart, poll_checkpoint, reap_checkpoint, reap_restart,
    request_checkpoint, request_file, request_restart, wait_checkpoint, wait_restart,
    CheckpointHandle, RequestPoll, RestartHandle,
};
pub use types::{
    AbortReason, CallbackContext, CallbackId, CheckpointControl, CheckpointInfo,
    CheckpointOutcome, CheckpointRequestArgs, ClientId, CrState, HoldPolicy, HoldScope,
    HookEvent, RequestScope, RestartInfo, RestartRequestArgs, MAX_CALLBACKS,
};
