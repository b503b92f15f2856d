//! Request/poll surface for external requesters: submit checkpoint and
//! restart requests, wait on them, collect their logs, reap their results.
//!
//! These run in ordinary thread context (the CLI tools that drive them are
//! out of scope), so blocking and allocation are fine here; the only
//! signal-context tie-in is the file-based convenience request, which must
//! not return before its request is either locally pending or already
//! reaped — otherwise a critical section entered right after the call could
//! race the delivery it was meant to order against.

use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use crossbeam_utils::Backoff;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::channel::{self, codes, Token};
use crate::context::LIVE_COUNT;
use crate::dispatch;
use crate::types::{CheckpointRequestArgs, RequestScope, RestartRequestArgs};

/// Outcome of a bounded wait on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPoll {
    /// The request has not completed yet.
    Pending,
    /// The request completed and was reaped.
    Completed,
}

/// Handle on one outstanding checkpoint request.
#[derive(Debug)]
pub struct CheckpointHandle {
    token: Token,
}

/// Handle on one outstanding restart request.
#[derive(Debug)]
pub struct RestartHandle {
    token: Token,
}

fn os_err(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// Wait for readiness on a request token. `None` blocks indefinitely.
fn wait_token(token: Token, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = libc::pollfd {
        fd: token,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };

    loop {
        let rc = unsafe { libc::poll(&mut fds, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

/// Submit a checkpoint request.
pub fn request_checkpoint(args: &CheckpointRequestArgs) -> io::Result<CheckpointHandle> {
    let ops = channel::active();
    let token = ops.connect().map_err(os_err)?;

    log::debug!(
        "requesting checkpoint of pid {} (scope {:?})",
        args.target,
        args.scope
    );
    if let Err(e) = ops.submit_checkpoint(token, args) {
        ops.disconnect(token);
        return Err(os_err(e));
    }

    Ok(CheckpointHandle { token })
}

/// Wait until the checkpoint request completes or `timeout` elapses.
pub fn wait_checkpoint(
    handle: &CheckpointHandle,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    wait_token(handle.token, timeout)
}

/// Collect the request's message log.
pub fn log_checkpoint(handle: &CheckpointHandle) -> io::Result<String> {
    channel::active().checkpoint_log(handle.token).map_err(os_err)
}

/// Reap a completed checkpoint request, releasing the handle's connection.
///
/// An `ENOTTY` failure means the descriptor was restored to something that
/// is not a request handle (possible across a restart); the connection is
/// left alone in that case.
pub fn reap_checkpoint(handle: CheckpointHandle) -> io::Result<()> {
    let ops = channel::active();
    let result = ops.reap_checkpoint(handle.token);
    match result {
        Err(e) if e == libc::ENOTTY => Err(os_err(e)),
        Err(e) => {
            ops.disconnect(handle.token);
            Err(os_err(e))
        }
        Ok(()) => {
            ops.disconnect(handle.token);
            Ok(())
        }
    }
}

/// Wait, then reap if the request completed.
pub fn poll_checkpoint(
    handle: &CheckpointHandle,
    timeout: Option<Duration>,
) -> io::Result<RequestPoll> {
    if !wait_token(handle.token, timeout)? {
        return Ok(RequestPoll::Pending);
    }

    let ops = channel::active();
    match ops.reap_checkpoint(handle.token) {
        Ok(()) => {
            ops.disconnect(handle.token);
            Ok(RequestPoll::Completed)
        }
        Err(e) if e == libc::ENOTTY => Err(os_err(e)),
        Err(e) => {
            ops.disconnect(handle.token);
            Err(os_err(e))
        }
    }
}

static FILE_REQUEST: Lazy<Mutex<Option<CheckpointHandle>>> = Lazy::new(|| Mutex::new(None));

/// Request a checkpoint of this process into `path`.
///
/// Serialized: a previous un-reaped file request is reaped first. Does not
/// return until the new request is either pending locally (the live count is
/// visible) or already reaped — critical sections entered by the caller
/// right after this call are therefore correctly ordered against the
/// delivery.
pub fn request_file(path: &Path) -> io::Result<()> {
    let mut prev = FILE_REQUEST.lock();

    if let Some(handle) = prev.take() {
        match poll_checkpoint(&handle, None) {
            Ok(_) => {}
            // Invalidated across a restart: not an error.
            Err(e) if e.raw_os_error() == Some(codes::CR_ERESTARTED) => {}
            Err(e) => log::warn!("reap of previous file request failed: {}", e),
        }
    }

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;

    let mut args = CheckpointRequestArgs::default();
    args.scope = RequestScope::Process;
    args.fd = file.as_raw_fd();
    let handle = request_checkpoint(&args)?;

    // Spin until the request is pending here or completed. Ordinary thread
    // context: crossbeam's escalating backoff is appropriate.
    let ops = channel::active();
    let backoff = Backoff::new();
    let mut reaped = false;
    loop {
        if LIVE_COUNT.load(std::sync::atomic::Ordering::Acquire) != 0 {
            break;
        }
        match ops.reap_checkpoint(handle.token) {
            Err(e) if e == libc::EAGAIN => {
                backoff.snooze();
                continue;
            }
            Err(e) => {
                log::trace!("file request reap finished with errno {}", e);
                reaped = true;
                break;
            }
            Ok(()) => {
                reaped = true;
                break;
            }
        }
    }

    if reaped {
        ops.disconnect(handle.token);
    } else {
        *prev = Some(handle);
    }

    Ok(())
}

/// Submit a restart request and fork the shell processes the kernel
/// repopulates.
///
/// Each forked child installs the omit handler (a request racing its
/// creation must not capture a half-built process), presents the demanded
/// number of threads, and issues the overlay call, which never returns on
/// success.
pub fn request_restart(args: &RestartRequestArgs) -> io::Result<RestartHandle> {
    let ops = channel::active();
    let token = ops.connect().map_err(os_err)?;

    log::debug!("requesting restart from fd {}", args.fd);
    if let Err(e) = ops.submit_restart(token, args) {
        ops.disconnect(token);
        return Err(os_err(e));
    }

    loop {
        match ops.restart_procs(token) {
            Ok(Some(procs)) => {
                let pid = unsafe { libc::fork() };
                if pid < 0 {
                    let err = io::Error::last_os_error();
                    ops.disconnect(token);
                    return Err(err);
                }
                if pid == 0 {
                    restart_child_main(token, procs.threads);
                    // restart_child_main never returns.
                }
            }
            Ok(None) => break,
            Err(e) => {
                ops.disconnect(token);
                return Err(os_err(e));
            }
        }
    }

    Ok(RestartHandle { token })
}

/// Body of one forked restart shell. Never returns: the overlay call
/// replaces the process image, and every failure path exits.
fn restart_child_main(token: Token, threads: u32) -> ! {
    dispatch::install_omit_handler();

    // The kernel rebuilds each task from one present thread; extra threads
    // only exist to issue the overlay call, so minimal stacks suffice.
    for _ in 1..threads {
        let spawned = std::thread::Builder::new()
            .stack_size(64 * 1024)
            .spawn(move || {
                let errno = channel::active().restart_child(token);
                // Reached only on failure.
                unsafe { libc::_exit(errno) };
            });
        if spawned.is_err() {
            unsafe { libc::_exit(libc::EAGAIN) };
        }
    }

    let errno = channel::active().restart_child(token);
    unsafe { libc::_exit(errno) };
}

/// Wait until the restart request completes or `timeout` elapses.
pub fn wait_restart(handle: &RestartHandle, timeout: Option<Duration>) -> io::Result<bool> {
    wait_token(handle.token, timeout)
}

/// Collect the restart request's message log.
pub fn log_restart(handle: &RestartHandle) -> io::Result<String> {
    channel::active().restart_log(handle.token).map_err(os_err)
}

/// Reap a completed restart request, returning the restarted task's pid.
pub fn reap_restart(handle: RestartHandle) -> io::Result<i32> {
    let ops = channel::active();
    match ops.reap_restart(handle.token) {
        Err(e) if e == libc::ENOTTY => Err(os_err(e)),
        Err(e) => {
            ops.disconnect(handle.token);
            Err(os_err(e))
        }
        Ok(pid) => {
            ops.disconnect(handle.token);
            Ok(pid)
        }
    }
}

impl CheckpointHandle {
    /// The raw request descriptor, for integrating with external event loops.
    pub fn as_raw_fd(&self) -> RawFd {
        self.token
    }
}

impl RestartHandle {
    /// The raw request descriptor, for integrating with external event loops.
    pub fn as_raw_fd(&self) -> RawFd {
        self.token
    }
}
