//! Per-transaction barriers
//!
//! One barrier exists per transaction index. Strands arrive with [`Barrier::wait`] and
//! stay parked until the controller (master poll loop or slave command loop) calls
//! [`Barrier::release`]. The release is one-shot: a released barrier never blocks again
//! during the same run.
//!
//! The barrier lives in shared memory, so it is built from atomics only. Waiters back off
//! with `crossbeam::utils::Backoff` and then sleep in short ticks, checking an abort
//! predicate on every tick so a global error always unparks them.

use super::shm::Zeroable;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Sleep between checks once spinning is exhausted
const WAIT_TICK: Duration = Duration::from_micros(200);

/// Outcome of a barrier wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    Released,
    Aborted,
}

#[repr(C)]
#[derive(Debug)]
pub struct Barrier {
    arrived: AtomicU64,
    limit: AtomicU64,
    released: AtomicU32,
    _pad: u32,
}

unsafe impl Zeroable for Barrier {}

impl Barrier {
    /// Arm the barrier for `limit` participants
    pub fn init(&self, limit: u64) {
        self.arrived.store(0, Ordering::Relaxed);
        self.released.store(0, Ordering::Relaxed);
        self.limit.store(limit, Ordering::Release);
    }

    /// Register arrival and park until released or `abort` returns true
    pub fn wait<F: Fn() -> bool>(&self, abort: F) -> BarrierWait {
        self.arrived.fetch_add(1, Ordering::AcqRel);
        let backoff = Backoff::new();
        loop {
            if self.is_released() {
                return BarrierWait::Released;
            }
            if abort() {
                return BarrierWait::Aborted;
            }
            if backoff.is_completed() {
                std::thread::sleep(WAIT_TICK);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Every participant has arrived
    pub fn is_reached(&self) -> bool {
        self.arrived.load(Ordering::Acquire) >= self.limit.load(Ordering::Acquire)
    }

    /// Participants still missing
    pub fn not_reached(&self) -> u64 {
        self.limit
            .load(Ordering::Acquire)
            .saturating_sub(self.arrived.load(Ordering::Acquire))
    }

    pub fn arrived(&self) -> u64 {
        self.arrived.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Let every current and future waiter through
    ///
    /// Returns false when the barrier had already been released.
    pub fn release(&self) -> bool {
        self.released.swap(1, Ordering::AcqRel) == 0
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire) != 0
    }
}
