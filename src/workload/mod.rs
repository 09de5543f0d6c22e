//! Workload model
//!
//! In-memory representation of the benchmark plan:
//!
//! ```text
//! Workorder ──> Group* ──> Txn* ──> Flowop*
//! ```
//!
//! A [`Group`] is a cohort of identically configured strands. Every strand of a group runs
//! the group's transactions in order; every transaction runs its flowops in order.
//!
//! The model is pure data. The master ships one slice of it per (group, remote host) to
//! the slaves; [`Group::masked_for_host`] and [`Group::prepare_for_slave`] implement the
//! rewrites on either side of that transfer.

pub mod flowop;

pub use flowop::{
    Flowop, FlowopFlags, FlowopOptions, FlowopType, Protocol, DEFAULT_BUFFER_SIZE,
    NUM_PROTOCOLS, SLAVE_READ_SIZE,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Most transactions a workorder may contain per group
pub const NUM_BARRIER: usize = 100;

/// Most flowops a single transaction may contain
pub const MAX_FLOWOPS: usize = 1024;

/// Most strands a single group may run
pub const MAX_STRANDS: usize = 16384;

/// How strands of a group are backed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum StrandKind {
    #[default]
    Thread = 1,
    Process = 2,
}

impl StrandKind {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(StrandKind::Thread),
            2 => Some(StrandKind::Process),
            _ => None,
        }
    }
}

/// Selected execution mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Run the body exactly this many times
    Iterations(u64),
    /// Run the body until the group deadline fires
    Duration(Duration),
    /// Run the body `per_sec` times per second until the group deadline fires
    Rate { duration: Duration, per_sec: u32 },
}

/// Ordered list of flowops run as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Txn {
    pub id: u32,
    pub name: String,
    pub iterations: u64,
    /// Wall-clock duration in nanoseconds, 0 when iteration-driven
    pub duration_ns: u64,
    /// Target invocations per second, 0 when not rate-paced
    pub rate_count: u32,
    pub flowops: Vec<Flowop>,
}

impl Txn {
    pub fn new(id: u32, flowops: Vec<Flowop>) -> Self {
        Self {
            id,
            name: format!("txn{}", id),
            iterations: 1,
            duration_ns: 0,
            rate_count: 0,
            flowops,
        }
    }

    /// Duration wins over iterations; rate only applies on top of a duration
    pub fn mode(&self) -> TxnMode {
        if self.duration_ns > 0 {
            let duration = Duration::from_nanos(self.duration_ns);
            if self.rate_count > 0 {
                TxnMode::Rate {
                    duration,
                    per_sec: self.rate_count,
                }
            } else {
                TxnMode::Duration(duration)
            }
        } else {
            TxnMode::Iterations(self.iterations)
        }
    }

    /// Coalesce repeats when the slave is told to use a larger transfer size
    fn optimize_for_slave(&mut self) {
        let mut divisor = 0u64;
        for f in &mut self.flowops {
            let o = &mut f.options;
            if o.rsize > o.size && o.size > 0 {
                if o.count > 1 {
                    o.count = (u64::from(o.size) * o.count / u64::from(o.rsize)).max(1);
                } else {
                    divisor = divisor.max(u64::from(o.rsize / o.size));
                }
                o.size = o.rsize;
            }
        }
        if divisor > 1 && self.duration_ns == 0 {
            self.iterations = (self.iterations / divisor).max(1);
        }
    }
}

/// A cohort of identical strands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u32,
    pub name: String,
    pub kind: StrandKind,
    pub nthreads: u32,
    pub max_async: u32,
    pub txns: Vec<Txn>,
}

impl Group {
    /// Protocols used by any flowop of the group
    pub fn protocols(&self) -> BTreeSet<Protocol> {
        self.flowops()
            .filter(|f| f.kind.uses_connection())
            .map(|f| f.options.protocol)
            .collect()
    }

    pub fn flowops(&self) -> impl Iterator<Item = &Flowop> {
        self.txns.iter().flat_map(|t| t.flowops.iter())
    }

    /// Peak number of simultaneously open connections of a single strand
    pub fn max_open_connections(&self) -> u64 {
        let mut count = 0u64;
        for t in &self.txns {
            let mut local = 1i64;
            for f in &t.flowops {
                match f.kind {
                    FlowopType::Connect | FlowopType::Accept => local += t.iterations as i64,
                    FlowopType::Disconnect => local -= t.iterations as i64,
                    _ => {}
                }
            }
            count = count.max(local.max(0) as u64);
        }
        count
    }

    /// Largest transfer size of any flowop, never below the default buffer size
    pub fn max_dto_size(&self) -> u32 {
        self.flowops()
            .map(Flowop::transfer_size)
            .fold(DEFAULT_BUFFER_SIZE, u32::max)
    }

    /// Distinct remote hosts named by connect/accept flowops, in first-seen order
    pub fn remote_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for f in self.flowops() {
            if matches!(f.kind, FlowopType::Connect | FlowopType::Accept)
                && !f.options.remotehost.is_empty()
                && !hosts.contains(&f.options.remotehost)
            {
                hosts.push(f.options.remotehost.clone());
            }
        }
        hosts
    }

    pub fn has_accepts(&self) -> bool {
        self.flowops().any(|f| f.kind == FlowopType::Accept)
    }

    /// Copy of the group as sent to `host`
    ///
    /// Every flowop addressed to some other host becomes a no-op so that each slave
    /// only executes its own share of a group that spans several hosts.
    pub fn masked_for_host(&self, host: &str) -> Group {
        let mut g = self.clone();
        for t in &mut g.txns {
            for f in &mut t.flowops {
                if !f.options.remotehost.is_empty() && f.options.remotehost != host {
                    f.mask();
                }
            }
        }
        g
    }

    /// Rewrite a received group into the slave's complementary role
    ///
    /// `peer` is the master's address as observed on the control connection.
    pub fn prepare_for_slave(&mut self, peer: &str) {
        for t in &mut self.txns {
            for f in &mut t.flowops {
                f.make_opposite();
                let o = &mut f.options;
                if o.localhost.is_empty() {
                    o.remotehost = peer.to_string();
                } else {
                    std::mem::swap(&mut o.remotehost, &mut o.localhost);
                }
            }
            t.optimize_for_slave();
        }
    }
}

/// Root of the benchmark plan
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Workorder {
    pub name: String,
    pub groups: Vec<Group>,
}

impl Workorder {
    pub fn num_strands(&self) -> usize {
        self.groups.iter().map(|g| g.nthreads as usize).sum()
    }

    pub fn num_strands_by_kind(&self, kind: StrandKind) -> usize {
        self.groups
            .iter()
            .filter(|g| g.kind == kind)
            .map(|g| g.nthreads as usize)
            .sum()
    }

    /// Longest transaction list of any group
    pub fn max_txn(&self) -> usize {
        self.groups.iter().map(|g| g.txns.len()).max().unwrap_or(0)
    }

    /// Total connection slots needed by every strand of every group
    pub fn num_connections(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| g.max_open_connections() * u64::from(g.nthreads))
            .sum()
    }

    /// Protocols used anywhere in the plan
    pub fn protocols(&self) -> BTreeSet<Protocol> {
        self.groups.iter().flat_map(|g| g.protocols()).collect()
    }

    /// Number of strands that take part in transaction `index`
    ///
    /// Groups with fewer transactions do not participate in the later barriers.
    pub fn strands_per_txn(&self) -> Vec<u64> {
        let mut per_txn = vec![0u64; self.max_txn()];
        for g in &self.groups {
            for slot in per_txn.iter_mut().take(g.txns.len()) {
                *slot += u64::from(g.nthreads);
            }
        }
        per_txn
    }

    /// Distinct remote hosts across all groups, in first-seen order
    pub fn remote_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for g in &self.groups {
            for h in g.remote_hosts() {
                if !hosts.contains(&h) {
                    hosts.push(h);
                }
            }
        }
        hosts
    }

    /// Structural checks done once before a run starts
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.groups.is_empty() {
            anyhow::bail!("Workorder '{}' has no groups", self.name);
        }
        if self.max_txn() > NUM_BARRIER {
            anyhow::bail!(
                "Workorder '{}' has {} transactions (max {})",
                self.name,
                self.max_txn(),
                NUM_BARRIER
            );
        }
        for g in &self.groups {
            if g.nthreads == 0 {
                anyhow::bail!("Group '{}' has no strands", g.name);
            }
            if g.nthreads as usize > MAX_STRANDS {
                anyhow::bail!(
                    "Group '{}' has {} strands (max {})",
                    g.name,
                    g.nthreads,
                    MAX_STRANDS
                );
            }
            for t in &g.txns {
                if t.flowops.len() > MAX_FLOWOPS {
                    anyhow::bail!(
                        "Transaction '{}' of group '{}' has {} flowops (max {})",
                        t.name,
                        g.name,
                        t.flowops.len(),
                        MAX_FLOWOPS
                    );
                }
                if t.duration_ns == 0 && t.iterations == 0 {
                    anyhow::bail!(
                        "Transaction '{}' of group '{}' has neither iterations nor duration",
                        t.name,
                        g.name
                    );
                }
                if t.rate_count > 0 && t.duration_ns == 0 {
                    anyhow::bail!(
                        "Transaction '{}' of group '{}' sets a rate without a duration",
                        t.name,
                        g.name
                    );
                }
                for f in &t.flowops {
                    let o = &f.options;
                    if o.flag.random_size() && o.rand_sz_min > o.rand_sz_max {
                        anyhow::bail!("Flowop '{}' has rand_sz_min > rand_sz_max", f.name);
                    }
                    if (f.kind.is_transmit() || f.kind.is_receive())
                        && o.size == 0
                        && !o.flag.random_size()
                    {
                        anyhow::bail!("Flowop '{}' has zero size", f.name);
                    }
                }
            }
        }
        Ok(())
    }
}
