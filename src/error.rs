//! Error types for the checkpoint/restart core.
//!
//! Three tiers, mirroring how callers must react:
//! usage errors ([`CrError`]) return normally; cancellation outcomes
//! ([`CheckpointError`]) are expected negative results of a checkpoint
//! attempt; internal-consistency violations go through [`fatal!`] and
//! terminate the process, since continuing would operate on state that
//! future checkpoints depend on.

use std::fmt;

use crate::types::CallbackContext;

/// Non-fatal usage errors returned by the public API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrError {
    /// The calling thread has no checkpoint context; call
    /// [`init`](crate::init) first.
    #[error("checkpoint support not initialized on this thread")]
    NotInitialized,

    /// The operation is only valid from inside a running callback.
    #[error("not called from a running checkpoint callback")]
    NotInCallback,

    /// The operation is not permitted while the caller's own context is
    /// actively checkpointing.
    #[error("operation not permitted while a checkpoint is active")]
    Busy,

    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A replacement named a callback registered for a different context.
    #[error("callback context mismatch: id is {id:?}, flags say {requested:?}")]
    ContextMismatch {
        /// Context encoded in the id being replaced.
        id: CallbackContext,
        /// Context the replacement asked for.
        requested: CallbackContext,
    },

    /// The callback table reached its fixed capacity.
    #[error("callback table is full")]
    ResourceExhausted,

    /// The kernel channel refused the operation (errno preserved).
    #[error("kernel channel error (errno {0})")]
    Channel(i32),
}

/// Result alias for the public API.
pub type CrResult<T> = Result<T, CrError>;

/// Negative outcomes of a checkpoint attempt, as seen by
/// [`checkpoint`](crate::checkpoint) and its waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// Called outside a running callback chain.
    #[error("not called from a running checkpoint callback")]
    NotInCallback,

    /// A callback cancelled with a transient condition.
    #[error("checkpoint cancelled: temporary failure")]
    TemporaryFailure,

    /// A callback cancelled with a permanent condition.
    #[error("checkpoint cancelled: permanent failure")]
    PermanentFailure,

    /// This process asked to be omitted from the capture.
    #[error("checkpoint omitted this process")]
    Omitted,

    /// The kernel reported an error (errno preserved).
    #[error("checkpoint failed in the kernel (errno {0})")]
    Kernel(i32),
}

/// Abort after writing a diagnostic with async-signal-safe primitives only.
///
/// Reserved for internal-consistency violations: a broken state-machine
/// invariant outside the tolerated false-wakeup path, a documented-infallible
/// kernel call failing, thread creation failing. May fire inside the signal
/// dispatcher, so it formats into a stack buffer and writes directly.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal_abort(format_args!($($arg)*))
    };
}
pub(crate) use fatal;

struct StackBuf {
    data: [u8; 256],
    len: usize,
}

impl fmt::Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.data.len() - self.len;
        let take = room.min(s.len());
        self.data[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[doc(hidden)]
pub fn fatal_abort(args: fmt::Arguments<'_>) -> ! {
    use fmt::Write;

    let mut buf = StackBuf {
        data: [0; 256],
        len: 0,
    };
    let _ = buf.write_str("freezepoint fatal: ");
    let _ = buf.write_fmt(args);
    let _ = buf.write_str("\n");
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            buf.data.as_ptr().cast(),
            buf.len,
        );
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        let cases: [(CrError, &str); 4] = [
            (
                CrError::NotInitialized,
                "checkpoint support not initialized on this thread",
            ),
            (
                CrError::Busy,
                "operation not permitted while a checkpoint is active",
            ),
            (
                CrError::InvalidArgument("bad scope"),
                "invalid argument: bad scope",
            ),
            (CrError::Channel(38), "kernel channel error (errno 38)"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn checkpoint_error_preserves_errno() {
        assert_eq!(
            CheckpointError::Kernel(5).to_string(),
            "checkpoint failed in the kernel (errno 5)"
        );
    }

    #[test]
    fn stack_buf_truncates_instead_of_overflowing() {
        use fmt::Write;

        let mut buf = StackBuf {
            data: [0; 256],
            len: 0,
        };
        let long = "x".repeat(1000);
        buf.write_str(&long).unwrap();
        assert_eq!(buf.len, 256);
    }
}
