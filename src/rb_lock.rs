//! Red/black lock guarding critical sections against checkpoint dispatch.
//!
//! Like a reader/writer lock where both sides admit multiple holders, except
//! that only one black holder ever exists here by construction (the single
//! checkpoint driver).
//!
//! State == 0: nobody holds the lock.
//! State == +n: held by n red holders (open critical sections).
//! State == -n: held by n black holders (checkpoint dispatch).
//!
//! Acquisition spins with [`Backoff`], never parks, so both sides stay valid
//! in signal context.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::backoff::Backoff;

pub(crate) struct RedBlackLock {
    state: AtomicI32,
}

impl RedBlackLock {
    pub(crate) const fn new() -> RedBlackLock {
        RedBlackLock {
            state: AtomicI32::new(0),
        }
    }

    /// Acquire as red: increment iff the counter is non-negative.
    pub(crate) fn red_lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            let old = self.state.load(Ordering::Relaxed);
            if old < 0 {
                backoff.snooze();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(old, old + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Acquire as red without blocking. Returns `true` on success.
    pub(crate) fn red_trylock(&self) -> bool {
        loop {
            let old = self.state.load(Ordering::Relaxed);
            if old < 0 {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(old, old + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a red hold. Only a current red holder may call this.
    pub(crate) fn red_unlock(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    /// Acquire as black: decrement iff the counter is non-positive.
    pub(crate) fn black_lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            let old = self.state.load(Ordering::Relaxed);
            if old > 0 {
                backoff.snooze();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(old, old - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Acquire as black without blocking. Returns `true` on success.
    #[cfg(test)]
    pub(crate) fn black_trylock(&self) -> bool {
        loop {
            let old = self.state.load(Ordering::Relaxed);
            if old > 0 {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(old, old - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a black hold. Only the current black holder may call this.
    pub(crate) fn black_unlock(&self) {
        self.state.fetch_add(1, Ordering::Release);
    }

    /// Forget all holders. The atfork child hook uses this: holders in other
    /// threads do not exist in the child.
    pub(crate) fn reset(&self) {
        self.state.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn raw_state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }
}
