//! Test support: a scripted in-process stand-in for the kernel channel.
//!
//! The kernel module is rarely present where this crate's tests run, so the
//! suite swaps in a [`StubChannel`]: terminal-call results are scripted, the
//! suspend call parks on a condvar until the test wakes it, and every
//! operation lands in a journal the test can assert on. Installed through
//! the same [`swap_channel`](crate::channel::swap_channel) seam embedders
//! use.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::{
    swap_channel, KernelOps, RawCheckpointInfo, RestartProcs, Token,
};
use crate::types::{AbortReason, CheckpointRequestArgs, RestartRequestArgs};

/// One journaled channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubOp {
    Connect(Token),
    Disconnect(Token),
    Phase1(Token),
    Phase2(Token),
    Suspend(Token),
    Checkpoint { token: Token, flags: u32 },
    Abort(AbortReason),
    Done { token: Token, hold: i32 },
    CheckpointInfo(Token),
    RestartSource(Token),
    SubmitCheckpoint(Token),
    CheckpointLog(Token),
    ReapCheckpoint(Token),
    SubmitRestart(Token),
    RestartProcs(Token),
    RestartChild(Token),
    RestartLog(Token),
    ReapRestart(Token),
}

#[derive(Default)]
struct Script {
    /// Results for successive terminal calls; empty means 0 (continue).
    checkpoint_results: VecDeque<i32>,
    /// Errno every abort call fails with (the kernel reports a successful
    /// abort by failing the call with the abort's own code).
    abort_errno: Option<i32>,
    /// Errnos for successive reap calls; empty means success.
    reap_errnos: VecDeque<i32>,
    /// Remaining restart population plan.
    restart_procs: VecDeque<RestartProcs>,
    /// Ran inside done(), before it returns — lets a test overlap a second
    /// request with the first episode's completion window.
    on_done: Option<Box<dyn FnMut() + Send>>,
}

/// Scripted kernel channel for tests.
pub struct StubChannel {
    journal: Mutex<Vec<StubOp>>,
    script: Mutex<Script>,
    next_token: AtomicI32,
    suspend_permits: Mutex<u32>,
    suspend_wake: Condvar,
}

impl StubChannel {
    pub fn new() -> Arc<StubChannel> {
        Arc::new(StubChannel {
            journal: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            next_token: AtomicI32::new(100),
            suspend_permits: Mutex::new(0),
            suspend_wake: Condvar::new(),
        })
    }

    /// Create a stub and make it the process-wide channel.
    pub fn install() -> Arc<StubChannel> {
        let stub = StubChannel::new();
        swap_channel(stub.clone());
        stub
    }

    fn record(&self, op: StubOp) {
        self.journal.lock().push(op);
    }

    /// Script the result of the next terminal capture call.
    pub fn script_checkpoint_result(&self, rc: i32) {
        self.script.lock().checkpoint_results.push_back(rc);
    }

    /// Make abort calls fail with `errno` — the kernel's way of saying the
    /// abort took effect.
    pub fn fail_aborts_with(&self, errno: i32) {
        self.script.lock().abort_errno = Some(errno);
    }

    /// Script the errno of the next reap call.
    pub fn script_reap_errno(&self, errno: i32) {
        self.script.lock().reap_errnos.push_back(errno);
    }

    /// Script the restart population plan.
    pub fn script_restart_procs(&self, threads: u32) {
        self.script
            .lock()
            .restart_procs
            .push_back(RestartProcs { threads });
    }

    /// Run `hook` inside the next done() calls, before they return.
    pub fn on_done(&self, hook: impl FnMut() + Send + 'static) {
        self.script.lock().on_done = Some(Box::new(hook));
    }

    /// Release one blocked (or future) suspend call.
    pub fn wake_suspended(&self) {
        let mut permits = self.suspend_permits.lock();
        *permits += 1;
        self.suspend_wake.notify_one();
    }

    /// Snapshot of the op journal.
    pub fn ops(&self) -> Vec<StubOp> {
        self.journal.lock().clone()
    }

    /// Count journal entries matching `pred`.
    pub fn count(&self, pred: impl Fn(&StubOp) -> bool) -> usize {
        self.journal.lock().iter().filter(|op| pred(op)).count()
    }
}

impl KernelOps for StubChannel {
    fn connect(&self) -> Result<Token, i32> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.record(StubOp::Connect(token));
        Ok(token)
    }

    fn disconnect(&self, token: Token) {
        self.record(StubOp::Disconnect(token));
    }

    fn register_phase1(&self, token: Token) -> Result<(), i32> {
        self.record(StubOp::Phase1(token));
        Ok(())
    }

    fn register_phase2(&self, token: Token) -> Result<(), i32> {
        self.record(StubOp::Phase2(token));
        Ok(())
    }

    fn suspend(&self, token: Token) -> Result<(), i32> {
        self.record(StubOp::Suspend(token));
        let mut permits = self.suspend_permits.lock();
        while *permits == 0 {
            self.suspend_wake.wait(&mut permits);
        }
        *permits -= 1;
        Ok(())
    }

    fn checkpoint(&self, token: Token, flags: u32) -> i32 {
        self.record(StubOp::Checkpoint { token, flags });
        self.script
            .lock()
            .checkpoint_results
            .pop_front()
            .unwrap_or(0)
    }

    fn abort(&self, token: Token, reason: AbortReason) -> Result<(), i32> {
        let _ = token;
        self.record(StubOp::Abort(reason));
        match self.script.lock().abort_errno {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn done(&self, token: Token, hold: i32) -> Result<(), i32> {
        self.record(StubOp::Done { token, hold });
        let hook = self.script.lock().on_done.take();
        if let Some(mut hook) = hook {
            hook();
            self.script.lock().on_done = Some(hook);
        }
        Ok(())
    }

    fn checkpoint_info(&self, token: Token) -> Result<RawCheckpointInfo, i32> {
        self.record(StubOp::CheckpointInfo(token));
        Ok(RawCheckpointInfo {
            requester: 1000,
            target: unsafe { libc::getpid() },
            scope: 0,
            signal: 0,
            dest: PathBuf::from("/tmp/context.stub"),
        })
    }

    fn restart_source(&self, token: Token) -> Result<PathBuf, i32> {
        self.record(StubOp::RestartSource(token));
        Ok(PathBuf::from("/tmp/context.stub"))
    }

    fn submit_checkpoint(
        &self,
        token: Token,
        _args: &CheckpointRequestArgs,
    ) -> Result<(), i32> {
        self.record(StubOp::SubmitCheckpoint(token));
        Ok(())
    }

    fn checkpoint_log(&self, token: Token) -> Result<String, i32> {
        self.record(StubOp::CheckpointLog(token));
        Ok(String::new())
    }

    fn reap_checkpoint(&self, token: Token) -> Result<(), i32> {
        self.record(StubOp::ReapCheckpoint(token));
        match self.script.lock().reap_errnos.pop_front() {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn submit_restart(&self, token: Token, _args: &RestartRequestArgs) -> Result<(), i32> {
        self.record(StubOp::SubmitRestart(token));
        Ok(())
    }

    fn restart_procs(&self, token: Token) -> Result<Option<RestartProcs>, i32> {
        self.record(StubOp::RestartProcs(token));
        Ok(self.script.lock().restart_procs.pop_front())
    }

    fn restart_child(&self, token: Token) -> i32 {
        self.record(StubOp::RestartChild(token));
        libc::ENOSYS
    }

    fn restart_log(&self, token: Token) -> Result<String, i32> {
        self.record(StubOp::RestartLog(token));
        Ok(String::new())
    }

    fn reap_restart(&self, token: Token) -> Result<i32, i32> {
        self.record(StubOp::ReapRestart(token));
        Ok(0)
    }
}

/// Run `body` with a context installed for the calling thread, as
/// [`init`](crate::init) would leave it minus the kernel connection.
pub fn with_initialized_context<R>(body: impl FnOnce() -> R) -> R {
    let ctx = crate::context::current_or_init();
    ctx.set_mode(crate::context::DispatchMode::Signal);
    body()
}
