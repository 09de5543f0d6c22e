//! Slave service
//!
//! Listens on the control port and serves every accepted control connection as an
//! independent session: its own run state, its own strands, one group. A session runs
//! the slave half of the handshake, follows the master's commands and always ends with
//! a goodbye. Sessions run as tokio tasks, so one slave serves runs one after another,
//! or several groups of the same run side by side.

use super::command::{slave_poll, InboundReader, SlavePollOptions};
use super::goodbye::{goodbye_for, send_goodbye};
use super::handshake::{
    slave_phase2_accept, slave_phase2_reject, slave_phase3, slave_receive_plan, SlavePlan,
};
use crate::config::RunOptions;
use crate::run_state::{Role, RunState};
use crate::transport::{NetProvider, TransportProvider};
use crate::worker::failure::{killall, process_callouts, reap};
use crate::worker::{preprocess_accepts, spawn_strand, Strand, WorkerHandle};
use crate::workload::StrandKind;
use crate::Result;
use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Grace period for strands after the run was torn down
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Slave side of uperf
pub struct NodeService {
    listener: TcpListener,
    options: RunOptions,
    provider: Arc<dyn TransportProvider>,
}

impl NodeService {
    /// Bind the control port
    pub async fn bind<A: ToSocketAddrs>(addr: A, options: RunOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("Failed to bind slave control port")?;
        Ok(Self {
            listener,
            options,
            provider: Arc::new(NetProvider),
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn TransportProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Serve sessions until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("Slave listening on port {}", self.local_port()?);
        loop {
            let handle = self.accept_session().await?;
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Session failed: {:#}", e),
                    Err(e) => error!("Session task failed: {}", e),
                }
            });
        }
    }

    /// Serve exactly `sessions` control connections and wait for all of them
    ///
    /// Returns the first session error.
    pub async fn serve(self, sessions: usize) -> Result<()> {
        let mut handles = Vec::with_capacity(sessions);
        for _ in 0..sessions {
            handles.push(self.accept_session().await?);
        }
        let mut first_err = None;
        for h in handles {
            let res = h
                .await
                .map_err(|e| anyhow!("Session task failed: {}", e))
                .and_then(|r| r);
            if let Err(e) = res {
                error!("Session failed: {:#}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn accept_session(&self) -> Result<JoinHandle<Result<()>>> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept control connection")?;
        // ignore failure, only latency suffers
        let _ = stream.set_nodelay(true);
        let peer = addr.ip().to_string();
        info!("Master connected from {}", peer);
        let options = self.options.clone();
        let provider = Arc::clone(&self.provider);
        Ok(tokio::spawn(async move {
            run_session(stream, peer, options, provider).await
        }))
    }
}

/// One control connection, from handshake to goodbye
async fn run_session(
    mut stream: TcpStream,
    peer: String,
    options: RunOptions,
    provider: Arc<dyn TransportProvider>,
) -> Result<()> {
    let SlavePlan {
        group,
        endian,
        master_info,
    } = slave_receive_plan(&mut stream, &peer, provider.as_ref()).await?;

    let groups = [group];
    let state = Arc::new(RunState::new(Role::Slave, &groups)?);
    state.set_bitswap(endian.is_swapped());
    let group = Arc::new(groups[0].clone());

    let plan = match preprocess_accepts(&group, provider.as_ref()) {
        Ok(plan) => plan,
        Err(e) => {
            let msg = format!("Error creating ports: {:#}", e);
            slave_phase2_reject(&mut stream, endian, &msg).await?;
            return Err(e);
        }
    };
    let (listeners, infos) = match plan {
        Some(p) => (p.listeners, p.info),
        None => (Vec::new(), Vec::new()),
    };

    let mut workers: Vec<Box<dyn WorkerHandle>> = Vec::with_capacity(state.num_strands());
    let mut listeners = listeners.into_iter();
    for (k, id) in state.group_strands(0).enumerate() {
        // only the master forks; slave strands are always threads
        let strand = Strand::new(
            id,
            0,
            Arc::clone(&group),
            Arc::clone(&state),
            Arc::clone(&provider),
        )
        .with_listeners(listeners.next().unwrap_or_default())
        .with_peers(master_info.get(k).cloned().into_iter().collect())
        .with_rate_intervals(options.rate_intervals);
        match spawn_strand(StrandKind::Thread, strand) {
            Ok(w) => workers.push(w),
            Err(e) => {
                killall(&state, &workers);
                reap(&state, &mut workers, KILL_GRACE).await;
                slave_phase2_reject(&mut stream, endian, "Error creating strands").await?;
                return Err(e);
            }
        }
    }
    debug!("Spawned {} strands for group '{}'", workers.len(), group.name);

    let handshake = async {
        slave_phase2_accept(&mut stream, endian, &infos).await?;
        slave_phase3(&mut stream).await
    };
    if let Err(e) = handshake.await {
        killall(&state, &workers);
        reap(&state, &mut workers, KILL_GRACE).await;
        return Err(e.context("Error completing handshake"));
    }

    let (read, mut write) = stream.into_split();
    let mut inbound = InboundReader::spawn(read, endian);
    let opts = options.slave_poll_options();

    match slave_poll(&state, &workers, &mut inbound, &opts).await {
        Ok(()) => {
            let grace = Duration::from_secs(u64::from(options.barrier_wait_secs));
            finish_last_txn(&state, &workers, &opts, grace).await;
        }
        Err(e) => {
            warn!("Run with {} ended: {:#}", peer, e);
            killall(&state, &workers);
        }
    }
    if !reap(&state, &mut workers, KILL_GRACE).await {
        debug!("Some strands of group '{}' failed", group.name);
    }

    let goodbye = goodbye_for(&state);
    send_goodbye(&mut write, endian, &goodbye).await?;
    info!("Session with {} done", peer);
    Ok(())
}

/// Let strands still in the last transaction finish it, firing its deadline if due
async fn finish_last_txn(
    state: &RunState,
    workers: &[Box<dyn WorkerHandle>],
    opts: &SlavePollOptions,
    grace: Duration,
) {
    let deadline = tokio::time::Instant::now() + grace;
    while !state.all_finished() && tokio::time::Instant::now() < deadline {
        if let Err(e) = process_callouts(state, workers, opts.signal).await {
            debug!("{:#}", e);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
