//! Shared run state
//!
//! One [`RunState`] exists per run, on the master and on every slave. It is the only
//! state that crosses strand boundaries:
//!
//! - a barrier per transaction index
//! - a callout (group deadline) per group
//! - the global error counter and the finished-strand counter
//! - one [`StrandSlot`] per strand: lifecycle state, signalled flag, counters
//! - the run log of error/warning lines ([`log::SharedLog`])
//!
//! # Architecture
//!
//! Everything strands touch lives in shared anonymous mappings ([`shm::SharedRegion`])
//! so that thread-backed and process-backed strands see the same memory, the run log
//! included.
//!
//! The state is an explicitly owned object handed to every strand as `Arc<RunState>`;
//! there are no ambient globals.

pub mod barrier;
pub mod log;
pub mod shm;

pub use barrier::{Barrier, BarrierWait};
pub use self::log::{LogEntry, LogLevel};

use crate::stats::{CounterSnapshot, StrandCounters};
use crate::util::fast_time::monotonic_ns;
use crate::workload::{Group, NUM_BARRIER};
use anyhow::Result;
use self::log::SharedLog;
use shm::{SharedRegion, Zeroable};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Which side of the run this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Lifecycle of a strand as seen by the failure coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StrandState {
    Init = 0,
    AtBarrier = 1,
    Executing = 2,
    Exit = 3,
}

impl StrandState {
    fn from_raw(v: u32) -> Self {
        match v {
            1 => StrandState::AtBarrier,
            2 => StrandState::Executing,
            3 => StrandState::Exit,
            _ => StrandState::Init,
        }
    }
}

/// Per-strand shared slot
#[repr(C, align(64))]
#[derive(Debug)]
pub struct StrandSlot {
    state: AtomicU32,
    signalled: AtomicU32,
    killed: AtomicU32,
    group: AtomicU32,
    pid: AtomicI32,
    start_ns: AtomicU64,
    end_ns: AtomicU64,
    pub counters: StrandCounters,
}

unsafe impl Zeroable for StrandSlot {}

impl StrandSlot {
    pub fn state(&self) -> StrandState {
        StrandState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: StrandState) {
        self.state.store(s as u32, Ordering::Release);
    }

    pub fn group(&self) -> usize {
        self.group.load(Ordering::Relaxed) as usize
    }

    /// Cooperative interrupt: the strand should wind down its current transaction
    pub fn signal(&self) {
        self.signalled.store(1, Ordering::Release);
    }

    pub fn clear_signal(&self) {
        self.signalled.store(0, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire) != 0
    }

    /// Abort: the strand should stop running transactions altogether
    pub fn kill(&self) {
        self.killed.store(1, Ordering::Release);
        self.signal();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire) != 0
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn mark_start(&self) {
        self.start_ns.store(monotonic_ns(), Ordering::Release);
    }

    pub fn mark_end(&self) {
        self.end_ns.store(monotonic_ns(), Ordering::Release);
    }

    /// Nanoseconds between start and end (or now, if still running)
    pub fn elapsed_ns(&self) -> u64 {
        let start = self.start_ns.load(Ordering::Acquire);
        if start == 0 {
            return 0;
        }
        let end = match self.end_ns.load(Ordering::Acquire) {
            0 => monotonic_ns(),
            e => e,
        };
        end.saturating_sub(start)
    }
}

/// Process-wide counters and barriers
#[repr(C)]
#[derive(Debug)]
struct RunHeader {
    global_error: AtomicU64,
    finished: AtomicU64,
    txn_begin_ns: AtomicU64,
    barriers: [Barrier; NUM_BARRIER],
}

unsafe impl Zeroable for RunHeader {}

/// Totals over every strand of the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub counters: CounterSnapshot,
    pub elapsed_ns: u64,
}

/// State shared by every strand and the controller of one run
#[derive(Debug)]
pub struct RunState {
    role: Role,
    header: SharedRegion<RunHeader>,
    strands: SharedRegion<StrandSlot>,
    callouts: SharedRegion<AtomicU64>,
    group_sizes: Vec<usize>,
    nbarrier: usize,
    bitswap: AtomicBool,
    log: SharedLog,
}

impl RunState {
    /// Allocate the run state for `groups` and arm one barrier per transaction index
    ///
    /// Barrier `i` waits for every strand of every group that has a transaction `i`.
    pub fn new(role: Role, groups: &[Group]) -> Result<Self> {
        let nbarrier = groups.iter().map(|g| g.txns.len()).max().unwrap_or(0);
        if nbarrier > NUM_BARRIER {
            anyhow::bail!("Shm exhausted: {} transactions (max {})", nbarrier, NUM_BARRIER);
        }
        let group_sizes: Vec<usize> = groups.iter().map(|g| g.nthreads as usize).collect();
        let nstrands: usize = group_sizes.iter().sum();

        let header = SharedRegion::<RunHeader>::new(1)?;
        let strands = SharedRegion::<StrandSlot>::new(nstrands)?;
        let callouts = SharedRegion::<AtomicU64>::new(groups.len())?;

        let mut idx = 0;
        for (gi, n) in group_sizes.iter().enumerate() {
            for _ in 0..*n {
                strands[idx].group.store(gi as u32, Ordering::Relaxed);
                idx += 1;
            }
        }

        for i in 0..nbarrier {
            let limit: u64 = groups
                .iter()
                .filter(|g| g.txns.len() > i)
                .map(|g| u64::from(g.nthreads))
                .sum();
            header[0].barriers[i].init(limit);
        }

        Ok(Self {
            role,
            header,
            strands,
            callouts,
            group_sizes,
            nbarrier,
            bitswap: AtomicBool::new(false),
            log: SharedLog::new()?,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_bitswap(&self, on: bool) {
        self.bitswap.store(on, Ordering::Relaxed);
    }

    pub fn bitswap(&self) -> bool {
        self.bitswap.load(Ordering::Relaxed)
    }

    // -- barriers ----------------------------------------------------------

    pub fn num_barriers(&self) -> usize {
        self.nbarrier
    }

    pub fn barrier(&self, txn: usize) -> Option<&Barrier> {
        if txn < self.nbarrier {
            Some(&self.header[0].barriers[txn])
        } else {
            None
        }
    }

    // -- global counters ---------------------------------------------------

    pub fn global_error(&self) -> u64 {
        self.header[0].global_error.load(Ordering::Acquire)
    }

    /// Count one run-level error; any nonzero value aborts the run
    pub fn flag_error(&self) {
        self.header[0].global_error.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finished(&self) -> u64 {
        self.header[0].finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.header[0].finished.fetch_add(1, Ordering::AcqRel);
    }

    pub fn all_finished(&self) -> bool {
        self.finished() >= self.strands.len() as u64
    }

    pub fn set_txn_begin(&self, ns: u64) {
        self.header[0].txn_begin_ns.store(ns, Ordering::Release);
    }

    /// Time the controller released the current transaction
    pub fn txn_begin(&self) -> u64 {
        self.header[0].txn_begin_ns.load(Ordering::Acquire)
    }

    // -- strands -----------------------------------------------------------

    pub fn num_strands(&self) -> usize {
        self.strands.len()
    }

    pub fn num_groups(&self) -> usize {
        self.group_sizes.len()
    }

    pub fn strand(&self, idx: usize) -> &StrandSlot {
        &self.strands[idx]
    }

    pub fn strands(&self) -> impl Iterator<Item = (usize, &StrandSlot)> {
        self.strands.iter().enumerate()
    }

    /// Index of the first strand of group `g`
    pub fn group_base(&self, g: usize) -> usize {
        self.group_sizes[..g].iter().sum()
    }

    /// Strand indices belonging to group `g`
    pub fn group_strands(&self, g: usize) -> std::ops::Range<usize> {
        let base = self.group_base(g);
        base..base + self.group_sizes[g]
    }

    // -- callouts ----------------------------------------------------------

    /// Register the deadline of group `g`
    ///
    /// Only the first registration of an interval wins; returns false if one is pending.
    pub fn register_callout(&self, g: usize, deadline_ns: u64) -> bool {
        self.callouts[g]
            .compare_exchange(0, deadline_ns.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn callout(&self, g: usize) -> Option<u64> {
        match self.callouts[g].load(Ordering::Acquire) {
            0 => None,
            d => Some(d),
        }
    }

    /// Groups whose deadline is at or before `now_ns`
    pub fn due_callouts(&self, now_ns: u64) -> Vec<usize> {
        self.callouts
            .iter()
            .enumerate()
            .filter_map(|(g, c)| {
                let d = c.load(Ordering::Acquire);
                (d > 0 && d <= now_ns).then_some(g)
            })
            .collect()
    }

    pub fn clear_callout(&self, g: usize) {
        self.callouts[g].store(0, Ordering::Release);
    }

    // -- log ---------------------------------------------------------------

    /// Record a line for the end-of-run report and echo it to the tracing log
    pub fn log_msg(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => error!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
        }
        self.log.push(level, &message);
    }

    /// Every line logged by the controller or any strand, in order
    pub fn log_entries(&self) -> Vec<LogEntry> {
        let mut entries = self.log.entries();
        let dropped = self.log.dropped();
        if dropped > 0 {
            entries.push(LogEntry {
                level: LogLevel::Warning,
                message: format!("{} more log lines dropped", dropped),
            });
        }
        entries
    }

    /// Error and warning lines joined for a goodbye message
    pub fn log_text(&self) -> String {
        self.log_entries()
            .iter()
            .filter(|e| e.level != LogLevel::Info)
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_log_errors(&self) -> bool {
        self.log_entries().iter().any(|e| e.level == LogLevel::Error)
    }

    // -- stats -------------------------------------------------------------

    /// Sum of every strand's counters and the longest strand lifetime
    pub fn totals(&self) -> RunTotals {
        let mut totals = RunTotals::default();
        for slot in self.strands.iter() {
            totals.counters += slot.counters.snapshot();
            totals.elapsed_ns = totals.elapsed_ns.max(slot.elapsed_ns());
        }
        totals
    }
}

/// Cancellation handle of one strand
///
/// Blocking transport calls and loops poll it; it trips when the strand is signalled or
/// killed, or when the run has seen an error.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<RunState>,
    strand: usize,
}

impl CancelToken {
    pub fn new(state: Arc<RunState>, strand: usize) -> Self {
        Self { state, strand }
    }

    pub fn is_cancelled(&self) -> bool {
        let slot = self.state.strand(self.strand);
        slot.is_signalled() || slot.is_killed() || self.state.global_error() > 0
    }
}

impl crate::transport::Interrupt for CancelToken {
    fn is_interrupted(&self) -> bool {
        self.is_cancelled()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workload::{Flowop, FlowopOptions, FlowopType, StrandKind, Txn};

    pub(crate) fn group(id: u32, nthreads: u32, ntxn: usize) -> Group {
        Group {
            id,
            name: format!("g{}", id),
            kind: StrandKind::Thread,
            nthreads,
            max_async: 0,
            txns: (0..ntxn)
                .map(|i| {
                    Txn::new(
                        i as u32,
                        vec![Flowop::new(FlowopType::Nop, FlowopOptions::default())],
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_barrier_limits_follow_group_txn_counts() {
        let state = RunState::new(Role::Master, &[group(0, 2, 3), group(1, 4, 1)]).unwrap();
        assert_eq!(state.num_barriers(), 3);
        assert_eq!(state.barrier(0).unwrap().limit(), 6);
        assert_eq!(state.barrier(1).unwrap().limit(), 2);
        assert_eq!(state.barrier(2).unwrap().limit(), 2);
        assert!(state.barrier(3).is_none());
    }

    #[test]
    fn test_strand_layout_by_group() {
        let state = RunState::new(Role::Slave, &[group(0, 2, 1), group(1, 3, 1)]).unwrap();
        assert_eq!(state.num_strands(), 5);
        assert_eq!(state.group_strands(1), 2..5);
        assert_eq!(state.strand(4).group(), 1);
        assert_eq!(state.strand(0).state(), StrandState::Init);
    }

    #[test]
    fn test_callout_registers_once() {
        let state = RunState::new(Role::Master, &[group(0, 1, 1)]).unwrap();
        assert!(state.register_callout(0, 100));
        assert!(!state.register_callout(0, 50));
        assert_eq!(state.due_callouts(99), Vec::<usize>::new());
        assert_eq!(state.due_callouts(100), vec![0]);
        state.clear_callout(0);
        assert_eq!(state.callout(0), None);
    }

    #[test]
    fn test_totals_and_errors() {
        let state = RunState::new(Role::Master, &[group(0, 2, 1)]).unwrap();
        state.strand(0).counters.record_op(100);
        state.strand(1).counters.record_op(50);
        state.strand(1).counters.record_error();
        let t = state.totals();
        assert_eq!(t.counters.ops, 2);
        assert_eq!(t.counters.bytes, 150);
        assert_eq!(t.counters.errors, 1);

        assert_eq!(state.global_error(), 0);
        state.flag_error();
        assert_eq!(state.global_error(), 1);
    }

    #[test]
    fn test_log_text_skips_info() {
        let state = RunState::new(Role::Slave, &[group(0, 1, 1)]).unwrap();
        state.log_msg(LogLevel::Info, "hello");
        state.log_msg(LogLevel::Error, "broken pipe");
        state.log_msg(LogLevel::Warning, "slow");
        assert_eq!(state.log_text(), "broken pipe\nslow");
        assert!(state.has_log_errors());
    }

    #[test]
    fn test_cancel_token_trips_on_signal_and_global_error() {
        let state = Arc::new(RunState::new(Role::Slave, &[group(0, 2, 1)]).unwrap());
        let t0 = CancelToken::new(Arc::clone(&state), 0);
        let t1 = CancelToken::new(Arc::clone(&state), 1);
        assert!(!t0.is_cancelled());
        state.strand(0).signal();
        assert!(t0.is_cancelled());
        assert!(!t1.is_cancelled());
        state.flag_error();
        assert!(t1.is_cancelled());
    }

    #[test]
    fn test_rejects_too_many_transactions() {
        assert!(RunState::new(Role::Master, &[group(0, 1, NUM_BARRIER + 1)]).is_err());
    }
}
