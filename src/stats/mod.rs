//! Statistics collection
//!
//! Lock-free counters written by strands and summed by the controller.
//!
//! Every strand owns one [`StrandCounters`] block inside the shared run state. Only
//! that strand writes it; the controller reads all blocks to build the run total that
//! goes into the goodbye message and the report.

pub mod report;

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line aligned atomic counter to prevent false sharing
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
///
/// An all-zero bit pattern is a valid counter holding 0, so counters can be placed in
/// freshly mapped shared memory without running a constructor.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    /// Increment the counter by the specified amount
    ///
    /// Uses `Ordering::Relaxed`; no ordering is needed between different counters.
    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-strand flowop counters
#[repr(C)]
#[derive(Debug, Default)]
pub struct StrandCounters {
    pub ops: AlignedCounter,
    pub bytes: AlignedCounter,
    pub errors: AlignedCounter,
}

impl StrandCounters {
    /// Record one completed flowop repetition
    #[inline]
    pub fn record_op(&self, bytes: u64) {
        self.ops.add(1);
        if bytes > 0 {
            self.bytes.add(bytes);
        }
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.add(1);
    }

    pub fn reset(&self) {
        self.ops.set(0);
        self.bytes.set(0);
        self.errors.set(0);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ops: self.ops.get(),
            bytes: self.bytes.get(),
            errors: self.errors.get(),
        }
    }
}

/// Plain copy of a counter block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub ops: u64,
    pub bytes: u64,
    pub errors: u64,
}

impl AddAssign for CounterSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.ops += rhs.ops;
        self.bytes += rhs.bytes;
        self.errors += rhs.errors;
    }
}
