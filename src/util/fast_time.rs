//! Monotonic clock, sleeps and spins
//!
//! Deadlines (callouts, transaction begin) are stored as plain nanosecond counts of
//! `CLOCK_MONOTONIC` so that they can live in the shared run state and be compared
//! across strands, including process-backed strands.

use std::time::Duration;

/// Timestamp read directly from `CLOCK_MONOTONIC`
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FastInstant {
    nanos: u64,
}

impl FastInstant {
    #[inline(always)]
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // CLOCK_MONOTONIC is always available on the supported targets
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }

        let nanos = (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64);

        Self { nanos }
    }

    /// Rebuild an instant from a stored nanosecond count
    #[inline]
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    #[inline]
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    #[inline(always)]
    pub fn duration_since(&self, earlier: FastInstant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }

    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }

    #[inline]
    pub fn add(&self, d: Duration) -> Self {
        Self {
            nanos: self.nanos.saturating_add(d.as_nanos() as u64),
        }
    }
}

/// Current `CLOCK_MONOTONIC` reading in nanoseconds
#[inline]
pub fn monotonic_ns() -> u64 {
    FastInstant::now().as_nanos()
}

/// Idle wait
pub fn sleep_for(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}

/// Busy wait, burning the CPU until `d` has passed
pub fn spin_for(d: Duration) {
    let start = FastInstant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}
