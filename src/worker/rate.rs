//! Rate pacing
//!
//! Both pacers run the transaction body `per_sec` times over roughly one wall-clock
//! second and return early on the first outcome other than success.
//!
//! - [`sliced`] splits the second into `intervals` slices. Each slice runs up to
//!   `per_sec / intervals` bodies, stopping early if the slice deadline passes, then
//!   sleeps out the rest of the slice.
//! - [`busy_wait`] gives every call its own `1e9 / per_sec` ns slot and spins until the
//!   slot opens. Used where sleep granularity would distort tight pacing.
//!
//! Waits poll `interrupted`, and a tripped interrupt ends the call with
//! [`ExecOutcome::DurationExpired`].

use super::scheduler::ExecOutcome;
use crate::util::fast_time::monotonic_ns;
use std::time::Duration;

pub const DEFAULT_INTERVALS: u32 = 2;

const NANOS_PER_SEC: u64 = 1_000_000_000;
const SLEEP_TICK: Duration = Duration::from_millis(10);

/// Sleep until `deadline_ns`, waking every tick to check `interrupted`
fn sleep_until<I: Fn() -> bool>(deadline_ns: u64, interrupted: &I) -> bool {
    loop {
        let now = monotonic_ns();
        if now >= deadline_ns {
            return true;
        }
        if interrupted() {
            return false;
        }
        std::thread::sleep(Duration::from_nanos(deadline_ns - now).min(SLEEP_TICK));
    }
}

pub fn sliced<B, I>(per_sec: u32, intervals: u32, interrupted: I, mut body: B) -> ExecOutcome
where
    B: FnMut() -> ExecOutcome,
    I: Fn() -> bool,
{
    let intervals = intervals.max(1);
    let per_loop = (per_sec / intervals).max(1);
    let slice_ns = NANOS_PER_SEC / u64::from(intervals);

    for _ in 0..intervals {
        let start = monotonic_ns();
        let deadline = start + slice_ns;
        for _ in 0..per_loop {
            match body() {
                ExecOutcome::Success => {}
                other => return other,
            }
            if monotonic_ns() >= deadline {
                break;
            }
        }
        if !sleep_until(deadline, &interrupted) {
            return ExecOutcome::DurationExpired;
        }
    }
    ExecOutcome::Success
}

pub fn busy_wait<B, I>(per_sec: u32, interrupted: I, mut body: B) -> ExecOutcome
where
    B: FnMut() -> ExecOutcome,
    I: Fn() -> bool,
{
    let per_sec = per_sec.max(1);
    let slot_ns = NANOS_PER_SEC / u64::from(per_sec);
    let start = monotonic_ns();

    for i in 0..u64::from(per_sec) {
        let target = start + i * slot_ns;
        while monotonic_ns() < target {
            if interrupted() {
                return ExecOutcome::DurationExpired;
            }
            std::hint::spin_loop();
        }
        match body() {
            ExecOutcome::Success => {}
            other => return other,
        }
    }

    // Finish out the second so back-to-back calls keep the rate
    while monotonic_ns() < start + NANOS_PER_SEC {
        if interrupted() {
            return ExecOutcome::DurationExpired;
        }
        std::hint::spin_loop();
    }
    ExecOutcome::Success
}
