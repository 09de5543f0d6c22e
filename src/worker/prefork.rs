//! Local strands prepared ahead of a run
//!
//! The master binds its accept ports and forks its process strands before the async
//! runtime exists. A child forked from a multi-threaded process inherits every lock some
//! other thread held at that instant, and the child has no thread left to release it.
//! Forking early keeps the controller single-threaded at fork time.
//!
//! ```text
//! prepare ── run state, accept ports, fork (children wait on their launch pipe)
//!   ── handshake ── launch(peers) ── threads spawned, pipes written
//! ```
//!
//! Thread strands are built here but only started by [`PreparedStrands::launch`].

use super::handle::{ProcessWorker, ThreadWorker, WorkerHandle};
use super::{preprocess_accepts, Strand};
use crate::distributed::protocol::SlaveInfo;
use crate::run_state::{Role, RunState};
use crate::transport::TransportProvider;
use crate::workload::{Group, StrandKind};
use crate::Result;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::{debug, warn};

enum Prepared {
    Thread(Strand),
    Process(ProcessWorker),
}

/// Every local strand of a run, built but not yet running
pub struct PreparedStrands {
    state: Arc<RunState>,
    /// Accept ports per group, the same for every slave of the group
    master_info: Vec<Vec<SlaveInfo>>,
    /// Strands in slot order, tagged with their group
    strands: Vec<(usize, Prepared)>,
}

impl PreparedStrands {
    /// Allocate the run state, pre-bind accept ports and fork process strands
    pub fn prepare(
        groups: &[Group],
        provider: &Arc<dyn TransportProvider>,
        rate_intervals: u32,
    ) -> Result<Self> {
        let state = Arc::new(RunState::new(Role::Master, groups)?);
        let mut prepared = Self {
            state,
            master_info: Vec::with_capacity(groups.len()),
            strands: Vec::new(),
        };
        for (gi, g) in groups.iter().enumerate() {
            if let Err(e) = prepared.add_group(gi, g, provider, rate_intervals) {
                prepared.discard();
                return Err(e);
            }
        }
        debug!(
            "Prepared {} strands, {} forked",
            prepared.strands.len(),
            prepared.num_processes()
        );
        Ok(prepared)
    }

    fn add_group(
        &mut self,
        gi: usize,
        g: &Group,
        provider: &Arc<dyn TransportProvider>,
        rate_intervals: u32,
    ) -> Result<()> {
        let (listeners, info) = match preprocess_accepts(g, provider.as_ref())? {
            Some(plan) => (plan.listeners, plan.info),
            None => (Vec::new(), Vec::new()),
        };
        self.master_info.push(info);

        let shared = Arc::new(g.clone());
        let mut listeners = listeners.into_iter();
        for id in self.state.group_strands(gi) {
            let strand = Strand::new(
                id,
                gi,
                Arc::clone(&shared),
                Arc::clone(&self.state),
                Arc::clone(provider),
            )
            .with_listeners(listeners.next().unwrap_or_default())
            .with_rate_intervals(rate_intervals);
            let p = match g.kind {
                StrandKind::Thread => Prepared::Thread(strand),
                StrandKind::Process => {
                    Prepared::Process(ProcessWorker::prefork(strand, &self.launch_fds())?)
                }
            };
            self.strands.push((gi, p));
        }
        Ok(())
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Accept ports of group `g` to send to its slaves
    pub fn master_info(&self, g: usize) -> &[SlaveInfo] {
        self.master_info.get(g).map_or(&[], Vec::as_slice)
    }

    pub fn num_processes(&self) -> usize {
        self.strands
            .iter()
            .filter(|(_, p)| matches!(p, Prepared::Process(_)))
            .count()
    }

    /// Launch pipes still open; every later child closes them
    fn launch_fds(&self) -> Vec<RawFd> {
        self.strands
            .iter()
            .filter_map(|(_, p)| match p {
                Prepared::Process(w) => w.launch_fd(),
                Prepared::Thread(_) => None,
            })
            .collect()
    }

    /// Start every strand; `peers[g][k]` are the peers of strand `k` of group `g`
    ///
    /// Started strands are pushed to `workers` even on failure. Strands after the
    /// failing one are retired without running, process children among them pushed as
    /// well so that they get reaped.
    pub fn launch(
        self,
        peers: Vec<Vec<Vec<SlaveInfo>>>,
        workers: &mut Vec<Box<dyn WorkerHandle>>,
    ) -> Result<()> {
        let mut peers: Vec<_> = peers.into_iter().map(Vec::into_iter).collect();
        let mut failed = None;
        for (gi, p) in self.strands {
            let mine = peers.get_mut(gi).and_then(|it| it.next()).unwrap_or_default();
            if failed.is_some() {
                retire(p, workers);
                continue;
            }
            let res = match p {
                Prepared::Thread(s) => {
                    ThreadWorker::spawn(s.with_peers(mine)).map(|w| workers.push(Box::new(w)))
                }
                Prepared::Process(mut w) => {
                    let r = w.launch(&mine);
                    workers.push(Box::new(w));
                    r
                }
            };
            if let Err(e) = res {
                failed = Some(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }

    /// Give up before launching
    ///
    /// Thread strands are retired on the spot; forked children see their launch pipe
    /// close and exit. Returns the children for reaping.
    pub fn abandon(self) -> Vec<Box<dyn WorkerHandle>> {
        let mut workers = Vec::new();
        for (_, p) in self.strands {
            retire(p, &mut workers);
        }
        workers
    }

    /// Abandon and wait for the children right away
    fn discard(&mut self) {
        let strands = std::mem::take(&mut self.strands);
        let mut workers = Vec::new();
        for (_, p) in strands {
            retire(p, &mut workers);
        }
        for w in &mut workers {
            if let Err(e) = w.join() {
                warn!("{:#}", e);
            }
        }
    }
}

fn retire(p: Prepared, workers: &mut Vec<Box<dyn WorkerHandle>>) {
    match p {
        Prepared::Thread(s) => s.abandon(),
        Prepared::Process(mut w) => {
            w.cancel_launch();
            workers.push(Box::new(w));
        }
    }
}
