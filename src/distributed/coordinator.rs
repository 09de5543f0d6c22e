//! Master run driver
//!
//! The master opens one control connection per (group, remote host), handshakes with
//! every slave, runs its own share of each group and paces both sides through the
//! transaction barriers:
//!
//! ```text
//! prepare (accept ports, fork) ── connect ── phase 1 (all) ── phase 2 (all)
//!   ── launch strands ── phase 3 (all) ── poll loop ── SEND_STATS | ABORT
//!   ── goodbyes ── report
//! ```
//!
//! [`DistributedCoordinator::prepare`] forks the process strands and must run before the
//! async runtime starts when the workorder has any.
//!
//! The poll loop releases barrier `i` locally only after NEXT_TXN `i` went out to every
//! slave. Anything a slave sends before the end of the run means it gave up.

use super::command::{broadcast, InboundReader, Polled};
use super::goodbye::{collect_goodbyes, host_report, missing};
use super::handshake::{master_phase1, master_phase2, master_phase3};
use super::protocol::{CommandKind, GoodbyeStats, Inbound, SlaveInfo};
use super::wire::Endian;
use crate::config::RunOptions;
use crate::run_state::{LogLevel, RunState};
use crate::stats::report::{HostReport, RunReport};
use crate::transport::{NetProvider, TransportProvider};
use crate::util::fast_time::monotonic_ns;
use crate::worker::failure::{killall, process_callouts, reap};
use crate::worker::{PreparedStrands, WorkerHandle};
use crate::workload::{StrandKind, Workorder};
use crate::Result;
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Pause between two passes of the poll loop
const POLL_TICK: Duration = Duration::from_millis(10);

/// Grace period for strands when setup fails
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Control connection while handshaking
struct Pending {
    group: usize,
    host: String,
    stream: TcpStream,
}

/// Control connection once the run is under way
struct SlaveLink {
    host: String,
    writer: OwnedWriteHalf,
    reader: InboundReader,
    /// Goodbye that arrived before the master asked for it
    early: Option<HostReport>,
}

/// Runs a workorder as the master
pub struct DistributedCoordinator {
    workorder: Workorder,
    options: RunOptions,
    provider: Arc<dyn TransportProvider>,
    local: Option<PreparedStrands>,
}

impl DistributedCoordinator {
    pub fn new(workorder: Workorder, options: RunOptions) -> Result<Self> {
        workorder.validate()?;
        if workorder.remote_hosts().is_empty() {
            bail!("Workorder '{}' names no remote host", workorder.name);
        }
        Ok(Self {
            workorder,
            options,
            provider: Arc::new(NetProvider),
            local: None,
        })
    }

    /// Must be set before [`prepare`](Self::prepare)
    pub fn with_provider(mut self, provider: Arc<dyn TransportProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Allocate the run state, bind the master's accept ports and fork process strands
    ///
    /// Call this while the process is still single-threaded.
    pub fn prepare(&mut self) -> Result<()> {
        if self.local.is_none() {
            self.local = Some(PreparedStrands::prepare(
                &self.workorder.groups,
                &self.provider,
                self.options.rate_intervals,
            )?);
        }
        Ok(())
    }

    /// Run the workorder and build the report
    ///
    /// Returns an error only when the run could not be set up; failures during the run
    /// end up in the report.
    pub async fn run(mut self) -> Result<RunReport> {
        if self.local.is_none() {
            if self.workorder.num_strands_by_kind(StrandKind::Process) > 0 {
                bail!("Process strands must be forked before the runtime starts");
            }
            self.prepare()?;
        }
        let local = self.local.take().context("No prepared strands")?;
        let state = Arc::clone(local.state());
        info!(
            "Starting {} strands running profile '{}'",
            self.workorder.num_strands(),
            self.workorder.name
        );

        let (mut pending, peers) = match self.handshake(&local).await {
            Ok(r) => r,
            Err(e) => {
                let mut workers = local.abandon();
                killall(&state, &workers);
                reap(&state, &mut workers, KILL_GRACE).await;
                return Err(e);
            }
        };

        let mut workers: Vec<Box<dyn WorkerHandle>> = Vec::with_capacity(state.num_strands());
        if let Err(e) = local.launch(peers, &mut workers) {
            state.log_msg(LogLevel::Error, format!("{:#}", e));
            killall(&state, &workers);
            reap(&state, &mut workers, KILL_GRACE).await;
            return Err(e);
        }

        for p in &mut pending {
            if let Err(e) = master_phase3(&mut p.stream, &p.host).await {
                killall(&state, &workers);
                reap(&state, &mut workers, KILL_GRACE).await;
                return Err(e);
            }
        }
        info!("Handshake complete, running");

        let mut links: Vec<SlaveLink> = pending
            .into_iter()
            .map(|p| {
                let (read, writer) = p.stream.into_split();
                SlaveLink {
                    host: p.host,
                    writer,
                    reader: InboundReader::spawn(read, Endian::Same),
                    early: None,
                }
            })
            .collect();

        if let Err(e) = self.master_poll(&state, &workers, &mut links).await {
            error!("{:#}", e);
            state.log_msg(LogLevel::Error, format!("{:#}", e));
            state.flag_error();
        }

        let failed = state.global_error() > 0;
        if failed {
            killall(&state, &workers);
            let writers = links.iter_mut().map(|l| &mut l.writer);
            if let Err(e) = broadcast(writers, CommandKind::Abort, 0).await {
                warn!("Error sending abort: {:#}", e);
            }
        } else {
            let writers = links.iter_mut().map(|l| &mut l.writer);
            if let Err(e) = broadcast(writers, CommandKind::SendStats, 0).await {
                state.log_msg(LogLevel::Error, format!("{:#}", e));
                state.flag_error();
            }
        }

        let timeout = self.options.goodbye_timeout(state.global_error() > 0);
        if !reap(&state, &mut workers, timeout).await {
            state.log_msg(LogLevel::Warning, "Some strands did not exit cleanly");
        }

        let mut collected = collect_goodbyes(
            links
                .iter_mut()
                .filter(|l| l.early.is_none())
                .map(|l| (l.host.as_str(), &mut l.reader)),
            timeout,
        )
        .await
        .into_iter();

        let mut report = RunReport::new(
            self.workorder.name.clone(),
            GoodbyeStats::from(state.totals()),
        );
        for link in &mut links {
            let host = match link.early.take() {
                Some(h) => Some(h),
                None => collected.next(),
            };
            if let Some(h) = host {
                report.add_host(h);
            }
        }
        report.errors = state.global_error();
        report.log = state
            .log_entries()
            .into_iter()
            .filter(|e| e.level != LogLevel::Info)
            .map(|e| e.message)
            .collect();
        Ok(report)
    }

    /// Connect and run phases 1 and 2 with every slave
    ///
    /// Returns the connections and, per group and master strand, the ports each slave
    /// listens on.
    async fn handshake(
        &self,
        local: &PreparedStrands,
    ) -> Result<(Vec<Pending>, Vec<Vec<Vec<SlaveInfo>>>)> {
        let local_name = local_host_name();
        let groups = &self.workorder.groups;

        let mut pending = Vec::new();
        for (gi, g) in groups.iter().enumerate() {
            for host in g.remote_hosts() {
                let stream = TcpStream::connect((host.as_str(), self.options.port))
                    .await
                    .with_context(|| {
                        format!("Error connecting to {}:{}", host, self.options.port)
                    })?;
                // ignore failure, only latency suffers
                let _ = stream.set_nodelay(true);
                debug!("Control connection to {} for group '{}'", host, g.name);
                pending.push(Pending {
                    group: gi,
                    host,
                    stream,
                });
            }
        }

        for p in &mut pending {
            let protocols = groups[p.group].protocols();
            master_phase1(&mut p.stream, &p.host, &local_name, protocols).await?;
        }
        info!("Handshake phase 1 with {} connections done", pending.len());

        let mut peers: Vec<Vec<Vec<SlaveInfo>>> = groups
            .iter()
            .map(|g| vec![Vec::new(); g.nthreads as usize])
            .collect();
        for p in &mut pending {
            let infos = master_phase2(
                &mut p.stream,
                &p.host,
                &local_name,
                &groups[p.group],
                local.master_info(p.group),
            )
            .await?;
            for (slot, si) in peers[p.group].iter_mut().zip(infos) {
                slot.push(si);
            }
        }
        info!("Handshake phase 2 with {} connections done", pending.len());
        Ok((pending, peers))
    }

    /// Pace the transactions until every local strand is done or the run fails
    async fn master_poll(
        &self,
        state: &RunState,
        workers: &[Box<dyn WorkerHandle>],
        links: &mut [SlaveLink],
    ) -> Result<()> {
        let policy = self.options.signal_policy();
        let mut curr = 0;
        while curr < state.num_barriers() {
            if state.global_error() > 0 {
                bail!("Run failed during transaction {}", curr);
            }
            check_slaves(links)?;
            process_callouts(state, workers, policy).await?;

            let reached = state.barrier(curr).map_or(false, |b| b.is_reached());
            if reached {
                let writers = links.iter_mut().map(|l| &mut l.writer);
                broadcast(writers, CommandKind::NextTxn, curr as u32).await?;
                state.set_txn_begin(monotonic_ns());
                if let Some(b) = state.barrier(curr) {
                    b.release();
                }
                debug!("Transaction {} released", curr);
                curr += 1;
            } else {
                tokio::time::sleep(POLL_TICK).await;
            }
        }

        while !state.all_finished() {
            if state.global_error() > 0 {
                bail!("Run failed in the last transaction");
            }
            check_slaves(links)?;
            process_callouts(state, workers, policy).await?;
            tokio::time::sleep(POLL_TICK).await;
        }
        Ok(())
    }
}

/// Fail if any slave has spoken up
///
/// A goodbye sent on its own is kept so the report still shows why the slave left.
fn check_slaves(links: &mut [SlaveLink]) -> Result<()> {
    for link in links.iter_mut().filter(|l| l.early.is_none()) {
        match link.reader.try_poll() {
            Polled::Idle => {}
            Polled::Message(Inbound::Goodbye(g)) => {
                link.early = Some(host_report(&link.host, g));
                bail!("Slave {} aborted", link.host);
            }
            Polled::Message(Inbound::Command(c)) => {
                bail!("Slave {} aborted (sent command {})", link.host, c.command);
            }
            Polled::Closed(e) => {
                link.early = Some(missing(&link.host, format!("{:#}", e)));
                return Err(e.context(format!("Slave {} aborted", link.host)));
            }
        }
    }
    Ok(())
}

/// Name this host announces in handshake headers
fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::node_service::NodeService;
    use crate::workload::{Flowop, FlowopOptions, FlowopType, Group, StrandKind, Txn};

    fn loopback_workorder(nthreads: u32) -> Workorder {
        let opts = |size| FlowopOptions {
            remotehost: "127.0.0.1".to_string(),
            size,
            ..Default::default()
        };
        let mut connect = Flowop::new(FlowopType::Connect, opts(0));
        connect.connection_id = 1;
        let mut write = Flowop::new(FlowopType::Write, opts(1024));
        write.connection_id = 1;
        let mut disconnect = Flowop::new(FlowopType::Disconnect, opts(0));
        disconnect.connection_id = 1;
        Workorder {
            name: "loopback".to_string(),
            groups: vec![Group {
                id: 0,
                name: "g".to_string(),
                kind: StrandKind::Thread,
                nthreads,
                max_async: 0,
                txns: vec![
                    Txn::new(0, vec![connect]),
                    Txn {
                        iterations: 20,
                        ..Txn::new(1, vec![write])
                    },
                    Txn::new(2, vec![disconnect]),
                ],
            }],
        }
    }

    fn fast_options(port: u16) -> RunOptions {
        RunOptions {
            port,
            goodbye_timeout_ms: 5000,
            signal_pause_ms: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_needs_a_remote_host() {
        let mut w = loopback_workorder(1);
        for f in w.groups[0].txns.iter_mut().flat_map(|t| t.flowops.iter_mut()) {
            f.options.remotehost.clear();
        }
        let err = DistributedCoordinator::new(w, RunOptions::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no remote host"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loopback_run() {
        let service = NodeService::bind("127.0.0.1:0", RunOptions::default())
            .await
            .unwrap();
        let port = service.local_port().unwrap();
        let slave = tokio::spawn(service.serve(1));

        let coordinator =
            DistributedCoordinator::new(loopback_workorder(2), fast_options(port)).unwrap();
        let report = coordinator.run().await.unwrap();
        slave.await.unwrap().unwrap();

        assert_eq!(report.errors, 0, "log: {:?}", report.log);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.hosts.len(), 1);
        assert_eq!(report.hosts[0].host, "127.0.0.1");
        assert_eq!(report.hosts[0].status, "info");
        assert_eq!(report.hosts[0].message, "Success");
        assert_eq!(report.master.bytes_xfer, 2 * 20 * 1024);
        assert_eq!(report.master.error, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unreachable_slave_fails_setup() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let coordinator =
            DistributedCoordinator::new(loopback_workorder(1), fast_options(port)).unwrap();
        let err = coordinator.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Error connecting to 127.0.0.1"));
    }

    /// Forks before any runtime thread exists, like the binary does
    fn run_prepared(workorder: Workorder) -> RunReport {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let service = runtime
            .block_on(NodeService::bind("127.0.0.1:0", RunOptions::default()))
            .unwrap();
        let port = service.local_port().unwrap();
        let mut coordinator = DistributedCoordinator::new(workorder, fast_options(port)).unwrap();
        coordinator.prepare().unwrap();
        runtime.block_on(async move {
            let slave = tokio::spawn(service.serve(1));
            let report = coordinator.run().await.unwrap();
            slave.await.unwrap().unwrap();
            report
        })
    }

    fn process_workorder() -> Workorder {
        let mut w = loopback_workorder(2);
        w.groups[0].kind = StrandKind::Process;
        w
    }

    #[test]
    fn test_process_group_run() {
        let report = run_prepared(process_workorder());
        assert_eq!(report.errors, 0, "log: {:?}", report.log);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.hosts[0].status, "info");
        // counted by the children through the shared mapping
        assert_eq!(report.master.bytes_xfer, 2 * 20 * 1024);
    }

    #[test]
    fn test_failing_process_strand_fails_the_run() {
        let mut w = process_workorder();
        // addressed elsewhere, so the slave sees a no-op and only the master fails
        let mut boom = Flowop::new(
            FlowopType::Error,
            FlowopOptions {
                remotehost: "elsewhere".to_string(),
                ..Default::default()
            },
        );
        boom.name = "boom".to_string();
        w.groups[0].txns[1].flowops.push(boom);

        let report = run_prepared(w);
        assert!(report.errors > 0);
        assert_eq!(report.exit_code(), 1);
        assert!(
            report.log.iter().any(|l| l.contains("boom flowop failed")),
            "log: {:?}",
            report.log
        );
        assert_eq!(report.hosts.len(), 1);
    }

    #[tokio::test]
    async fn test_process_group_needs_prepare() {
        let coordinator =
            DistributedCoordinator::new(process_workorder(), fast_options(1)).unwrap();
        let err = coordinator.run().await.unwrap_err();
        assert!(err.to_string().contains("forked before the runtime starts"));
    }
}
