//! The kernel channel: an opaque request/response collaborator.
//!
//! The kernel module that actually captures and restores memory is out of
//! scope; this module is the seam to it. [`KernelOps`] carries the fixed
//! request vocabulary, [`IoctlChannel`] speaks it over the control node, and
//! the process-wide active channel is swappable so tests (and embedders
//! without the module loaded) can substitute their own — the same
//! replace-the-global seam the test suite relies on throughout.
//!
//! Everything reachable from signal context here is an atomic load, an `Arc`
//! clone, and an `ioctl`: no locks, no allocation.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::{Lazy, OnceCell};

use crate::types::{
    AbortReason, CheckpointRequestArgs, RequestScope, RestartRequestArgs,
};

/// Opaque handle for one open connection to the kernel channel. Currently the
/// raw fd of the control node.
pub type Token = libc::c_int;

/// Interface version the library was written against, checked at connect
/// time as `(major << 16) | minor`.
pub(crate) const INTERFACE_MAJOR: u32 = 0;
pub(crate) const INTERFACE_MINOR: u32 = 8;

/// Control node the kernel module exposes.
const CTRL_NODE: &str = "/proc/checkpoint/ctrl";

/// Request vocabulary. The numeric values form the ioctl command space of the
/// control node; they are internally consistent and isolated here, since the
/// module's authoritative numbering is outside this crate.
mod op {
    use libc::c_ulong;

    const fn op(n: c_ulong) -> c_ulong {
        (b'C' as c_ulong) << 8 | n
    }

    pub const VERSION: c_ulong = op(0x01);
    pub const HAND_PHASE1: c_ulong = op(0x10);
    pub const HAND_PHASE2: c_ulong = op(0x11);
    pub const HAND_SUSPEND: c_ulong = op(0x12);
    pub const HAND_CHKPT: c_ulong = op(0x13);
    pub const HAND_ABORT: c_ulong = op(0x14);
    pub const HAND_DONE: c_ulong = op(0x15);
    pub const HAND_CHKPT_INFO: c_ulong = op(0x16);
    pub const HAND_SRC: c_ulong = op(0x17);
    pub const CHKPT_REQ: c_ulong = op(0x20);
    pub const CHKPT_LOG: c_ulong = op(0x21);
    pub const CHKPT_REAP: c_ulong = op(0x22);
    pub const RSTRT_REQ: c_ulong = op(0x30);
    pub const RSTRT_PROCS: c_ulong = op(0x31);
    pub const RSTRT_CHILD: c_ulong = op(0x32);
    pub const RSTRT_LOG: c_ulong = op(0x33);
    pub const RSTRT_REAP: c_ulong = op(0x34);
}

/// Checkpoint-specific status codes, carried in the errno position above the
/// ordinary errno range.
pub mod codes {
    /// The handle was invalidated by resuming from a restart.
    pub const CR_ERESTARTED: i32 = 0x4000 + 1;
    /// A callback cancelled with a transient condition.
    pub const CR_ETEMPFAIL: i32 = 0x4000 + 2;
    /// A callback cancelled with a permanent condition.
    pub const CR_EPERMFAIL: i32 = 0x4000 + 3;
    /// The target asked to be omitted from the capture.
    pub const CR_EOMITTED: i32 = 0x4000 + 4;
}

/// Abort reasons on the wire.
pub(crate) fn abort_code(reason: AbortReason) -> u32 {
    match reason {
        AbortReason::TemporaryFailure => 0x1,
        AbortReason::PermanentFailure => 0x2,
        AbortReason::Omit => 0x4,
    }
}

fn scope_code(scope: RequestScope) -> i32 {
    match scope {
        RequestScope::Process => 0,
        RequestScope::Tree => 1,
        RequestScope::Session => 2,
    }
}

pub(crate) fn scope_from_code(code: i32) -> RequestScope {
    match code {
        1 => RequestScope::Tree,
        2 => RequestScope::Session,
        _ => RequestScope::Process,
    }
}

/// Raw per-checkpoint metadata as the channel reports it.
#[derive(Debug, Clone)]
pub struct RawCheckpointInfo {
    pub requester: libc::pid_t,
    pub target: libc::pid_t,
    pub scope: i32,
    pub signal: i32,
    pub dest: PathBuf,
}

/// One entry of the restart population plan: how many threads the next forked
/// shell process must present before the kernel overlays it.
#[derive(Debug, Clone, Copy)]
pub struct RestartProcs {
    pub threads: u32,
}

/// The fixed request vocabulary of the kernel channel.
///
/// Fallible operations return the kernel's errno. `checkpoint` keeps the raw
/// tri-state return because all three values are meaningful: negative is
/// `-errno`, zero is "continuing", positive is "resumed from restart".
pub trait KernelOps: Send + Sync {
    /// Open a fresh connection and perform the version handshake.
    fn connect(&self) -> Result<Token, i32>;

    /// Close a connection obtained from [`connect`](KernelOps::connect).
    fn disconnect(&self, token: Token);

    /// Declare the caller a phase-1 (checkpoint-thread) handler.
    fn register_phase1(&self, token: Token) -> Result<(), i32>;

    /// Declare the caller a phase-2 (signal-context) handler.
    fn register_phase2(&self, token: Token) -> Result<(), i32>;

    /// Block until the kernel wakes the caller for a request. `Err(EINTR)` is
    /// an expected false wakeup.
    fn suspend(&self, token: Token) -> Result<(), i32>;

    /// The terminal capture call. Returns `-errno`, 0 (continuing) or a
    /// positive value (resumed from restart).
    fn checkpoint(&self, token: Token, flags: u32) -> i32;

    /// Cancel the request in flight with the given reason.
    fn abort(&self, token: Token, reason: AbortReason) -> Result<(), i32>;

    /// Acknowledge completion, passing the resolved hold-policy code.
    fn done(&self, token: Token, hold: i32) -> Result<(), i32>;

    /// Fetch metadata about the checkpoint in flight.
    fn checkpoint_info(&self, token: Token) -> Result<RawCheckpointInfo, i32>;

    /// Fetch the source path of the restart in flight.
    fn restart_source(&self, token: Token) -> Result<PathBuf, i32>;

    /// Submit an external checkpoint request on this connection.
    fn submit_checkpoint(&self, token: Token, args: &CheckpointRequestArgs) -> Result<(), i32>;

    /// Collect the request's message log.
    fn checkpoint_log(&self, token: Token) -> Result<String, i32>;

    /// Reap a completed checkpoint request.
    fn reap_checkpoint(&self, token: Token) -> Result<(), i32>;

    /// Submit an external restart request on this connection.
    fn submit_restart(&self, token: Token, args: &RestartRequestArgs) -> Result<(), i32>;

    /// Ask how to populate the next restarted process; `None` when the plan
    /// is exhausted.
    fn restart_procs(&self, token: Token) -> Result<Option<RestartProcs>, i32>;

    /// Overlay the calling process with the restarted image. Does not return
    /// on success; returns the kernel's errno on failure.
    fn restart_child(&self, token: Token) -> i32;

    /// Collect the restart request's message log.
    fn restart_log(&self, token: Token) -> Result<String, i32>;

    /// Reap a completed restart request.
    fn reap_restart(&self, token: Token) -> Result<i32, i32>;
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// The production channel: ioctls against the control node.
pub struct IoctlChannel;

impl IoctlChannel {
    fn ioctl(&self, token: Token, op: libc::c_ulong, arg: libc::c_ulong) -> Result<i32, i32> {
        let rc = unsafe { libc::ioctl(token, op, arg) };
        if rc < 0 {
            Err(errno())
        } else {
            Ok(rc)
        }
    }

    fn ioctl_unit(&self, token: Token, op: libc::c_ulong, arg: libc::c_ulong) -> Result<(), i32> {
        self.ioctl(token, op, arg).map(|_| ())
    }
}

/// On-the-wire layouts for the pointer-argument requests.
#[repr(C)]
struct WireChkptArgs {
    target: libc::pid_t,
    scope: i32,
    fd: libc::c_int,
    secs: u32,
    signal: i32,
    flags: u32,
}

#[repr(C)]
struct WireRstrtArgs {
    fd: libc::c_int,
    signal: i32,
    flags: u32,
}

#[repr(C)]
struct WireChkptInfo {
    requester: libc::pid_t,
    target: libc::pid_t,
    scope: i32,
    signal: i32,
    dest: [u8; libc::PATH_MAX as usize],
}

#[repr(C)]
struct WireLogArgs {
    len: u32,
    buf: *mut u8,
}

#[repr(C)]
struct WireProcsTbl {
    threads: u32,
}

fn path_from_cbuf(buf: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    PathBuf::from(OsStr::from_bytes(&buf[..end]))
}

impl KernelOps for IoctlChannel {
    fn connect(&self) -> Result<Token, i32> {
        let node = std::ffi::CString::new(CTRL_NODE).expect("static path");
        let fd = unsafe { libc::open(node.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            let e = errno();
            log::debug!("kernel channel unavailable at {}: errno {}", CTRL_NODE, e);
            return Err(e);
        }

        let version = (INTERFACE_MAJOR << 16) | INTERFACE_MINOR;
        if let Err(e) = self.ioctl_unit(fd, op::VERSION, version as libc::c_ulong) {
            log::warn!("kernel interface version check failed: errno {}", e);
            unsafe { libc::close(fd) };
            return Err(e);
        }

        log::trace!("connected to kernel channel (token {})", fd);
        Ok(fd)
    }

    fn disconnect(&self, token: Token) {
        unsafe { libc::close(token) };
    }

    fn register_phase1(&self, token: Token) -> Result<(), i32> {
        self.ioctl_unit(token, op::HAND_PHASE1, token as libc::c_ulong)
    }

    fn register_phase2(&self, token: Token) -> Result<(), i32> {
        self.ioctl_unit(token, op::HAND_PHASE2, token as libc::c_ulong)
    }

    fn suspend(&self, token: Token) -> Result<(), i32> {
        self.ioctl_unit(token, op::HAND_SUSPEND, 0)
    }

    fn checkpoint(&self, token: Token, flags: u32) -> i32 {
        let rc = unsafe { libc::ioctl(token, op::HAND_CHKPT, flags as libc::c_ulong) };
        if rc < 0 {
            -errno()
        } else {
            rc
        }
    }

    fn abort(&self, token: Token, reason: AbortReason) -> Result<(), i32> {
        self.ioctl_unit(token, op::HAND_ABORT, abort_code(reason) as libc::c_ulong)
    }

    fn done(&self, token: Token, hold: i32) -> Result<(), i32> {
        self.ioctl_unit(token, op::HAND_DONE, hold as libc::c_ulong)
    }

    fn checkpoint_info(&self, token: Token) -> Result<RawCheckpointInfo, i32> {
        let mut wire = WireChkptInfo {
            requester: 0,
            target: 0,
            scope: 0,
            signal: 0,
            dest: [0; libc::PATH_MAX as usize],
        };
        self.ioctl_unit(token, op::HAND_CHKPT_INFO, &mut wire as *mut _ as libc::c_ulong)?;
        Ok(RawCheckpointInfo {
            requester: wire.requester,
            target: wire.target,
            scope: wire.scope,
            signal: wire.signal,
            dest: path_from_cbuf(&wire.dest),
        })
    }

    fn restart_source(&self, token: Token) -> Result<PathBuf, i32> {
        let mut buf = [0u8; libc::PATH_MAX as usize];
        self.ioctl_unit(token, op::HAND_SRC, buf.as_mut_ptr() as libc::c_ulong)?;
        Ok(path_from_cbuf(&buf))
    }

    fn submit_checkpoint(&self, token: Token, args: &CheckpointRequestArgs) -> Result<(), i32> {
        let wire = WireChkptArgs {
            target: args.target,
            scope: scope_code(args.scope),
            fd: args.fd,
            secs: args.timeout_secs,
            signal: args.signal,
            flags: args.flags,
        };
        self.ioctl_unit(token, op::CHKPT_REQ, &wire as *const _ as libc::c_ulong)
    }

    fn checkpoint_log(&self, token: Token) -> Result<String, i32> {
        self.fetch_log(token, op::CHKPT_LOG)
    }

    fn reap_checkpoint(&self, token: Token) -> Result<(), i32> {
        self.ioctl_unit(token, op::CHKPT_REAP, 0)
    }

    fn submit_restart(&self, token: Token, args: &RestartRequestArgs) -> Result<(), i32> {
        let wire = WireRstrtArgs {
            fd: args.fd,
            signal: args.signal,
            flags: args.flags,
        };
        self.ioctl_unit(token, op::RSTRT_REQ, &wire as *const _ as libc::c_ulong)
    }

    fn restart_procs(&self, token: Token) -> Result<Option<RestartProcs>, i32> {
        let mut wire = WireProcsTbl { threads: 0 };
        let rc = self.ioctl(token, op::RSTRT_PROCS, &mut wire as *mut _ as libc::c_ulong)?;
        if rc > 0 {
            Ok(Some(RestartProcs {
                threads: wire.threads.max(1),
            }))
        } else {
            Ok(None)
        }
    }

    fn restart_child(&self, token: Token) -> i32 {
        unsafe { libc::ioctl(token, op::RSTRT_CHILD, 0) };
        // Reached only on failure: success overlays the process image.
        errno()
    }

    fn restart_log(&self, token: Token) -> Result<String, i32> {
        self.fetch_log(token, op::RSTRT_LOG)
    }

    fn reap_restart(&self, token: Token) -> Result<i32, i32> {
        self.ioctl(token, op::RSTRT_REAP, 0)
    }
}

impl IoctlChannel {
    /// Two-phase log fetch: first call sizes the buffer, second fills it.
    fn fetch_log(&self, token: Token, op: libc::c_ulong) -> Result<String, i32> {
        let mut probe = WireLogArgs {
            len: 0,
            buf: std::ptr::null_mut(),
        };
        let len = self.ioctl(token, op, &mut probe as *mut _ as libc::c_ulong)?;
        if len == 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u8; len as usize];
        let mut fill = WireLogArgs {
            len: len as u32,
            buf: buf.as_mut_ptr(),
        };
        let got = self.ioctl(token, op, &mut fill as *mut _ as libc::c_ulong)?;
        buf.truncate(got as usize);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

struct ActiveChannel(Arc<dyn KernelOps>);

static ACTIVE: Lazy<ArcSwap<ActiveChannel>> =
    Lazy::new(|| ArcSwap::from_pointee(ActiveChannel(Arc::new(IoctlChannel))));

/// The channel the process is currently wired to.
pub(crate) fn active() -> Arc<dyn KernelOps> {
    Arc::clone(&ACTIVE.load().0)
}

/// Replace the process-wide channel, returning the previous one.
///
/// Intended for tests and embedders; swap before the first
/// [`init`](crate::init) so the shared connection is made on the new channel.
pub fn swap_channel(ops: Arc<dyn KernelOps>) -> Arc<dyn KernelOps> {
    let prev = ACTIVE.swap(Arc::new(ActiveChannel(ops)));
    Arc::clone(&prev.0)
}

/// The one shared connection used for dispatch registration (the kernel
/// routes request signals at whole-process granularity, so one handle
/// serves every thread). Connected on first use.
static SHARED_TOKEN: OnceCell<Token> = OnceCell::new();

pub(crate) fn shared_token() -> Result<Token, i32> {
    SHARED_TOKEN.get_or_try_init(|| active().connect()).copied()
}
