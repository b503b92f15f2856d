//! Yield-then-sleep backoff for spin loops that may run in signal context.
//!
//! `crossbeam_utils::Backoff` escalates to parking, which is off-limits
//! inside a signal handler; this one escalates from `sched_yield` to a short
//! `nanosleep`, both async-signal-safe.

/// Yields before the first real sleep.
const MAX_YIELDS: u32 = 50;

/// Sleep length once yielding stops helping. Must exceed 2 ms or the kernel
/// may busy-wait instead of sleeping for realtime threads.
const SLEEP_NS: libc::c_long = 2_000_001;

/// Escalating waiter for contended atomic loops.
///
/// Yield the scheduler slot for the first [`MAX_YIELDS`] rounds (a
/// higher-priority spinner would otherwise never let the holder run), then
/// sleep long enough that the kernel genuinely deschedules us, and start
/// over.
pub(crate) struct Backoff {
    rounds: u32,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff { rounds: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.rounds < MAX_YIELDS {
            self.rounds += 1;
            unsafe {
                libc::sched_yield();
            }
        } else {
            self.rounds = 0;
            let ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: SLEEP_NS,
            };
            unsafe {
                libc::nanosleep(&ts, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn yields_stay_cheap() {
        let mut backoff = Backoff::new();
        let start = Instant::now();
        for _ in 0..MAX_YIELDS {
            backoff.snooze();
        }
        // Pure yields; nowhere near the sleep threshold.
        assert!(start.elapsed().as_millis() < 500);
    }

    #[test]
    fn escalates_to_a_real_sleep() {
        let mut backoff = Backoff::new();
        for _ in 0..MAX_YIELDS {
            backoff.snooze();
        }
        let start = Instant::now();
        backoff.snooze();
        assert!(start.elapsed().as_nanos() >= SLEEP_NS as u128);
        // Counter reset: the next round is a yield again.
        assert_eq!(backoff.rounds, 0);
    }
}
