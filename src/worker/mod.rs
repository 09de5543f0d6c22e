//! Strands
//!
//! A [`Strand`] is one execution unit of a group. It owns everything it touches while
//! running, except for its slot in the shared [`RunState`]:
//!
//! - a clone of the group's workload slice
//! - a connection pool keyed by logical connection id
//! - the listeners pre-bound for its accept flowops
//! - the peer's listening ports for its connect flowops ([`SlaveInfo`])
//! - an IO buffer sized for the largest flowop of the group
//! - a fast RNG for random transfer sizes
//!
//! # Architecture
//!
//! ```text
//! controller ── spawn_strand ──> WorkerHandle (thread | process)
//!                                   │
//!                                   └── Strand::run
//!                                         └── group_execute   (scheduler.rs)
//!                                               ├── barrier wait per txn
//!                                               └── txn_execute ── rate.rs
//!                                                     └── flowop_execute ── transport
//! ```
//!
//! The failure coordinator (`failure.rs`) drives strands from the outside through their
//! handles and their shared slots.

pub mod failure;
pub mod handle;
pub mod pool;
pub mod prefork;
pub mod rate;
pub mod scheduler;

pub use handle::{spawn_strand, ProcessWorker, ThreadWorker, WorkerHandle};
pub use prefork::PreparedStrands;
pub use pool::ConnectionPool;
pub use scheduler::{ExecOutcome, FlowopError};

use crate::distributed::protocol::SlaveInfo;
use crate::run_state::{CancelToken, RunState, StrandSlot, StrandState};
use crate::transport::{Listener, TransportProvider};
use crate::workload::{FlowopType, Group, Protocol, NUM_PROTOCOLS};
use crate::Result;
use anyhow::Context;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use tracing::debug;

/// Listener per protocol slot
pub type Listeners = [Option<Arc<dyn Listener>>; NUM_PROTOCOLS];

/// Listeners bound ahead of a run for a group's accept flowops
pub struct AcceptPlan {
    /// One entry per strand of the group
    pub listeners: Vec<Listeners>,
    /// What the peer needs to connect, one entry per strand
    pub info: Vec<SlaveInfo>,
}

/// Pre-bind listening ports for every accept flowop of `group`
///
/// A flowop with a fixed port gets one listener shared by every strand; otherwise each
/// strand gets its own ephemeral port. Returns `None` when the group accepts nothing.
pub fn preprocess_accepts(
    group: &Group,
    provider: &dyn TransportProvider,
) -> Result<Option<AcceptPlan>> {
    if !group.has_accepts() {
        return Ok(None);
    }
    let n = group.nthreads as usize;
    let mut plan = AcceptPlan {
        listeners: (0..n).map(|_| Listeners::default()).collect(),
        info: vec![SlaveInfo::default(); n],
    };

    for f in group.flowops().filter(|f| f.kind == FlowopType::Accept) {
        let slot = f.options.protocol.index();
        if plan.info.first().map_or(0, |si| si.ports[slot]) > 0 {
            continue;
        }
        if f.options.port != 0 {
            let listener = provider
                .listen(&f.options)
                .with_context(|| format!("Error creating port {}", f.options.port))?;
            for (l, si) in plan.listeners.iter_mut().zip(plan.info.iter_mut()) {
                si.ports[slot] = u32::from(listener.port());
                l[slot] = Some(Arc::clone(&listener));
            }
        } else {
            for (l, si) in plan.listeners.iter_mut().zip(plan.info.iter_mut()) {
                let listener = provider
                    .listen(&f.options)
                    .context("Error creating ephemeral port")?;
                si.ports[slot] = u32::from(listener.port());
                l[slot] = Some(listener);
            }
        }
        debug!(
            "Group '{}': {} listeners ready for {}",
            group.name, n, f.options.protocol
        );
    }
    Ok(Some(plan))
}

/// One execution unit of a group
pub struct Strand {
    /// Index of this strand's slot in the run state
    id: usize,

    /// Index of the group within the run
    group_index: usize,

    /// Workload slice; shared with the other strands of the group, never mutated
    group: Arc<Group>,

    state: Arc<RunState>,

    provider: Arc<dyn TransportProvider>,

    pool: ConnectionPool,

    listeners: Listeners,

    /// Peer listening ports, one entry per peer host
    peers: Vec<SlaveInfo>,

    buffer: Vec<u8>,

    rng: Xoshiro256PlusPlus,

    cancel: CancelToken,

    /// Sub-second slices for sliced rate pacing
    rate_intervals: u32,
}

impl Strand {
    pub fn new(
        id: usize,
        group_index: usize,
        group: Arc<Group>,
        state: Arc<RunState>,
        provider: Arc<dyn TransportProvider>,
    ) -> Self {
        let buffer = vec![0u8; group.max_dto_size() as usize];
        let cancel = CancelToken::new(Arc::clone(&state), id);
        Self {
            id,
            group_index,
            group,
            state,
            provider,
            pool: ConnectionPool::new(),
            listeners: Listeners::default(),
            peers: Vec::new(),
            buffer,
            rng: Xoshiro256PlusPlus::from_entropy(),
            cancel,
            rate_intervals: rate::DEFAULT_INTERVALS,
        }
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_peers(mut self, peers: Vec<SlaveInfo>) -> Self {
        self.peers = peers;
        self
    }

    pub(crate) fn take_peers(&mut self) -> Vec<SlaveInfo> {
        std::mem::take(&mut self.peers)
    }

    pub fn with_rate_intervals(mut self, intervals: u32) -> Self {
        self.rate_intervals = intervals.max(1);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub fn slot(&self) -> &StrandSlot {
        self.state.strand(self.id)
    }

    /// The first strand of a group registers the group's deadlines
    pub fn is_leader(&self) -> bool {
        self.id == self.state.group_base(self.group_index)
    }

    /// Port the peer listens on for `protocol`
    ///
    /// Matches `host` exactly; with a single peer its entry is used regardless, since
    /// the address a flowop names may differ from the one the peer was reached at.
    pub fn peer_port(&self, host: &str, protocol: Protocol) -> Option<u16> {
        if let Some(si) = self.peers.iter().find(|si| si.host == host) {
            return si.port(protocol);
        }
        match self.peers.as_slice() {
            [only] => only.port(protocol),
            _ => None,
        }
    }

    /// Run the whole transaction list and release everything the strand holds
    pub fn run(mut self) -> ExecOutcome {
        let state = Arc::clone(&self.state);
        let slot = state.strand(self.id);
        debug!("Strand {} starting ({} txns)", self.id, self.group.txns.len());

        let outcome = self.group_execute();
        if outcome == ExecOutcome::Failure {
            state.flag_error();
        }

        slot.mark_end();
        slot.clear_signal();
        self.pool.close_all();
        self.listeners = Listeners::default();
        slot.set_state(StrandState::Exit);
        state.mark_finished();
        debug!("Strand {} finished: {:?}", self.id, outcome);
        outcome
    }

    /// Retire a strand that never ran, so the controller does not wait for it
    pub fn abandon(self) {
        let slot = self.slot();
        slot.set_state(StrandState::Exit);
        self.state.mark_finished();
        debug!("Strand {} abandoned before launch", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::Role;
    use crate::transport::mock::MockProvider;
    use crate::workload::tests::flowop;
    use crate::workload::{StrandKind, Txn};

    fn accept_group(port: u32) -> Group {
        let mut f = flowop(FlowopType::Accept, "m");
        f.options.port = port;
        Group {
            id: 0,
            name: "g".to_string(),
            kind: StrandKind::Thread,
            nthreads: 3,
            max_async: 0,
            txns: vec![Txn::new(0, vec![f])],
        }
    }

    #[test]
    fn test_ephemeral_accepts_get_one_port_per_strand() {
        let plan = preprocess_accepts(&accept_group(0), &MockProvider::new())
            .unwrap()
            .unwrap();
        assert_eq!(plan.info.len(), 3);
        let ports: Vec<_> = plan.info.iter().map(|si| si.port(Protocol::Tcp)).collect();
        assert!(ports.iter().all(Option::is_some));
        assert_ne!(ports[0], ports[1]);
        assert!(plan.listeners.iter().all(|l| l[Protocol::Tcp.index()].is_some()));
    }

    #[test]
    fn test_fixed_port_accept_is_shared() {
        let plan = preprocess_accepts(&accept_group(5001), &MockProvider::new())
            .unwrap()
            .unwrap();
        assert!(plan
            .info
            .iter()
            .all(|si| si.port(Protocol::Tcp) == Some(5001)));
    }

    #[test]
    fn test_no_accepts_no_plan() {
        let g = Group {
            txns: vec![Txn::new(0, vec![flowop(FlowopType::Connect, "h")])],
            ..accept_group(0)
        };
        assert!(preprocess_accepts(&g, &MockProvider::new()).unwrap().is_none());
    }

    #[test]
    fn test_peer_port_lookup() {
        let g = Arc::new(accept_group(0));
        let state = Arc::new(RunState::new(Role::Master, &[(*g).clone()]).unwrap());
        let mut a = SlaveInfo {
            host: "a".to_string(),
            ..Default::default()
        };
        a.ports[Protocol::Tcp.index()] = 7000;
        let mut b = SlaveInfo {
            host: "b".to_string(),
            ..Default::default()
        };
        b.ports[Protocol::Tcp.index()] = 8000;

        let s = Strand::new(1, 0, Arc::clone(&g), Arc::clone(&state), Arc::new(MockProvider::new()))
            .with_peers(vec![a.clone(), b]);
        assert_eq!(s.peer_port("b", Protocol::Tcp), Some(8000));
        assert_eq!(s.peer_port("c", Protocol::Tcp), None);
        assert!(!s.is_leader());

        let single = Strand::new(0, 0, g, state, Arc::new(MockProvider::new())).with_peers(vec![a]);
        assert_eq!(single.peer_port("10.0.0.9", Protocol::Tcp), Some(7000));
        assert!(single.is_leader());
    }
}
