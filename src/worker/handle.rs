//! Strand handles
//!
//! A strand runs either on its own OS thread or in a forked child process. Both share
//! the run state through the anonymous shared mappings, so the controller drives them
//! the same way: through the strand's slot, plus a `SIGUSR2` for processes so a child
//! blocked in a syscall wakes up and checks its slot.
//!
//! Forking is split in two steps. [`ProcessWorker::prefork`] forks a child that waits on
//! a launch pipe; [`ProcessWorker::launch`] later writes the strand's peers into that
//! pipe. The fork can then happen while the controller is still single-threaded, and
//! launching only needs a `write`.

use super::{ExecOutcome, Strand};
use crate::distributed::protocol::SlaveInfo;
use crate::distributed::wire::{check_count, WireReader, WireRecord, WireWriter};
use crate::run_state::{RunState, StrandSlot};
use crate::workload::{StrandKind, MAX_STRANDS};
use crate::Result;
use anyhow::{anyhow, bail, Context};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Controller-side view of a running strand
pub trait WorkerHandle: Send + Sync {
    /// Index of the strand's slot in the run state
    fn index(&self) -> usize;

    /// Ask the strand to end its current transaction
    fn signal(&self) -> Result<()>;

    /// Wait for the strand to exit
    fn join(&mut self) -> Result<ExecOutcome>;

    /// Make the strand exit regardless of where it is
    fn force_kill(&mut self) -> Result<()>;
}

pub struct ThreadWorker {
    index: usize,
    state: Arc<RunState>,
    handle: Option<JoinHandle<ExecOutcome>>,
}

impl ThreadWorker {
    pub fn spawn(strand: Strand) -> Result<Self> {
        let index = strand.id();
        let state = Arc::clone(strand.state());
        let handle = std::thread::Builder::new()
            .name(format!("strand-{}", index))
            .spawn(move || strand.run())
            .with_context(|| format!("Error creating thread for strand {}", index))?;
        Ok(Self {
            index,
            state,
            handle: Some(handle),
        })
    }
}

impl WorkerHandle for ThreadWorker {
    fn index(&self) -> usize {
        self.index
    }

    fn signal(&self) -> Result<()> {
        self.state.strand(self.index).signal();
        Ok(())
    }

    fn join(&mut self) -> Result<ExecOutcome> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("Strand {} already joined", self.index))?;
        handle
            .join()
            .map_err(|_| anyhow!("Strand {} panicked", self.index))
    }

    fn force_kill(&mut self) -> Result<()> {
        // Threads cannot be killed; the kill flag unparks barriers and blocking IO
        self.state.strand(self.index).kill();
        Ok(())
    }
}

extern "C" fn wake_handler(_sig: libc::c_int) {}

/// Install a no-op SIGUSR2 handler without SA_RESTART so blocked syscalls return EINTR
fn install_wake_handler() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = wake_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR2, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error()).context("sigaction(SIGUSR2)");
        }
    }
    Ok(())
}

pub struct ProcessWorker {
    index: usize,
    state: Arc<RunState>,
    pid: libc::pid_t,
    /// Write end of the launch pipe until the strand is launched
    launch: Option<File>,
    reaped: bool,
}

impl ProcessWorker {
    /// Fork a child for `strand` that waits until [`launch`](Self::launch)
    ///
    /// `close_in_child` lists descriptors the child must not keep, such as the launch
    /// pipes of siblings forked earlier. The child never returns into the caller: it
    /// leaves with `_exit`, 0 unless the strand failed.
    pub fn prefork(strand: Strand, close_in_child: &[RawFd]) -> Result<Self> {
        let index = strand.id();
        let state = Arc::clone(strand.state());

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Error creating launch pipe for strand {}", index));
        }
        // SAFETY: both descriptors were just created and are owned here
        let (reader, writer) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Error creating process for strand {}", index));
        }
        if pid == 0 {
            drop(writer);
            for fd in close_in_child {
                unsafe { libc::close(*fd) };
            }
            let code = child_main(strand, reader);
            unsafe { libc::_exit(code) }
        }

        drop(reader);
        drop(strand);
        state.strand(index).set_pid(pid);
        debug!("Strand {} forked as pid {}", index, pid);
        Ok(Self {
            index,
            state,
            pid,
            launch: Some(writer),
            reaped: false,
        })
    }

    /// Fork and launch in one go
    ///
    /// Only safe where no other thread of this process may hold a lock.
    pub fn spawn(mut strand: Strand) -> Result<Self> {
        let peers = strand.take_peers();
        let mut worker = Self::prefork(strand, &[])?;
        worker.launch(&peers)?;
        Ok(worker)
    }

    /// Hand the child its peers and let it run
    pub fn launch(&mut self, peers: &[SlaveInfo]) -> Result<()> {
        let mut pipe = self
            .launch
            .take()
            .ok_or_else(|| anyhow!("Strand {} already launched", self.index))?;
        let mut w = WireWriter::with_capacity(4 + peers.len() * SlaveInfo::SIZE);
        w.u32(peers.len() as u32);
        for si in peers {
            si.encode(&mut w);
        }
        let msg = w.into_inner();
        pipe.write_all(&msg).with_context(|| {
            format!("Error launching strand {} (pid {})", self.index, self.pid)
        })
    }

    /// Close the launch pipe unused; the waiting child retires without running
    pub fn cancel_launch(&mut self) {
        self.launch = None;
    }

    /// Launch pipe descriptor while the strand waits for it
    pub fn launch_fd(&self) -> Option<RawFd> {
        self.launch.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
}

/// Body of a forked child
fn child_main(strand: Strand, mut pipe: File) -> libc::c_int {
    if install_wake_handler().is_err() {
        strand.abandon();
        return 1;
    }
    match read_launch(&mut pipe, strand.slot()) {
        Ok(Some(peers)) => match strand.with_peers(peers).run() {
            ExecOutcome::Failure => 1,
            _ => 0,
        },
        // the controller gave up before launching
        Ok(None) => {
            strand.abandon();
            0
        }
        Err(e) => {
            strand
                .state()
                .log_msg(crate::run_state::LogLevel::Error, format!("{:#}", e));
            strand.abandon();
            1
        }
    }
}

/// Wait for the launch message: `None` on EOF or when the strand is killed first
fn read_launch(pipe: &mut File, slot: &StrandSlot) -> Result<Option<Vec<SlaveInfo>>> {
    let mut count = [0u8; 4];
    if !read_full(pipe, &mut count, slot)? {
        return Ok(None);
    }
    let n = check_count("peer", u32::from_ne_bytes(count), MAX_STRANDS)?;
    let mut buf = vec![0u8; n * SlaveInfo::SIZE];
    if !read_full(pipe, &mut buf, slot)? {
        return Ok(None);
    }
    let mut r = WireReader::new(&buf);
    let mut peers = Vec::with_capacity(n);
    for _ in 0..n {
        peers.push(SlaveInfo::decode(&mut r)?);
    }
    Ok(Some(peers))
}

/// Fill `buf`; false on EOF or kill
fn read_full(pipe: &mut File, buf: &mut [u8], slot: &StrandSlot) -> Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        match pipe.read(&mut buf[off..]) {
            Ok(0) => return Ok(false),
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                if slot.is_killed() {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e).context("Error reading launch pipe"),
        }
    }
    Ok(true)
}

impl WorkerHandle for ProcessWorker {
    fn index(&self) -> usize {
        self.index
    }

    fn signal(&self) -> Result<()> {
        self.state.strand(self.index).signal();
        if self.reaped {
            return Ok(());
        }
        if unsafe { libc::kill(self.pid, libc::SIGUSR2) } != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("Error signalling pid {}", self.pid));
            }
        }
        Ok(())
    }

    fn join(&mut self) -> Result<ExecOutcome> {
        if self.reaped {
            bail!("Strand {} already joined", self.index);
        }
        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if rc == self.pid {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err).with_context(|| format!("waitpid({})", self.pid));
            }
        }
        self.reaped = true;
        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
            Ok(ExecOutcome::Success)
        } else {
            warn!("Strand {} (pid {}) exited with status {}", self.index, self.pid, status);
            Ok(ExecOutcome::Failure)
        }
    }

    fn force_kill(&mut self) -> Result<()> {
        self.state.strand(self.index).kill();
        self.launch = None;
        if !self.reaped && unsafe { libc::kill(self.pid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("Error killing pid {}", self.pid));
            }
        }
        Ok(())
    }
}

/// Start `strand` on the execution vehicle its group asks for
pub fn spawn_strand(kind: StrandKind, strand: Strand) -> Result<Box<dyn WorkerHandle>> {
    Ok(match kind {
        StrandKind::Thread => Box::new(ThreadWorker::spawn(strand)?),
        StrandKind::Process => Box::new(ProcessWorker::spawn(strand)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::{Role, StrandState};
    use crate::transport::mock::MockProvider;
    use crate::util::fast_time::monotonic_ns;
    use crate::workload::{Flowop, FlowopOptions, FlowopType, Group, Txn};
    use std::time::{Duration, Instant};

    fn think_group(kind: StrandKind, count: u64, duration_ns: u64) -> Group {
        let think = Flowop::new(
            FlowopType::Think,
            FlowopOptions {
                duration: 1_000_000,
                count,
                ..Default::default()
            },
        );
        Group {
            id: 0,
            name: "g".to_string(),
            kind,
            nthreads: 1,
            max_async: 0,
            txns: vec![Txn {
                duration_ns,
                ..Txn::new(0, vec![think])
            }],
        }
    }

    fn strand(g: Group) -> (Arc<RunState>, Strand) {
        let state = Arc::new(RunState::new(Role::Master, &[g.clone()]).unwrap());
        state.barrier(0).unwrap().release();
        let s = Strand::new(0, 0, Arc::new(g), Arc::clone(&state), Arc::new(MockProvider::new()));
        (state, s)
    }

    #[test]
    fn test_thread_worker_runs_and_joins() {
        let (state, s) = strand(think_group(StrandKind::Thread, 3, 0));
        let mut h = spawn_strand(StrandKind::Thread, s).unwrap();
        assert_eq!(h.index(), 0);
        assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        assert_eq!(state.totals().counters.ops, 3);
        assert!(h.join().is_err());
    }

    #[test]
    fn test_process_worker_shares_counters() {
        let (state, s) = strand(think_group(StrandKind::Process, 3, 0));
        let mut h = spawn_strand(StrandKind::Process, s).unwrap();
        assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        // written by the child through the shared mapping
        assert_eq!(state.totals().counters.ops, 3);
        assert_eq!(state.strand(0).state(), StrandState::Exit);
        assert!(state.strand(0).pid() > 0);
        assert!(state.all_finished());
    }

    #[test]
    fn test_process_worker_signal_ends_duration() {
        let (state, s) = strand(think_group(StrandKind::Process, 1, 60_000_000_000));
        state.set_txn_begin(monotonic_ns());
        let start = Instant::now();
        let mut h = ProcessWorker::spawn(s).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        h.signal().unwrap();
        assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_force_kill_stops_blocked_thread() {
        let g = think_group(StrandKind::Thread, 1, 0);
        let state = Arc::new(RunState::new(Role::Master, &[g.clone()]).unwrap());
        // barrier never released
        let s = Strand::new(0, 0, Arc::new(g), Arc::clone(&state), Arc::new(MockProvider::new()));
        let mut h = ThreadWorker::spawn(s).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        h.force_kill().unwrap();
        assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        assert_eq!(state.totals().counters.ops, 0);
    }

    fn connect_group() -> Group {
        let mut connect = Flowop::new(
            FlowopType::Connect,
            FlowopOptions {
                remotehost: "peer".to_string(),
                ..Default::default()
            },
        );
        connect.connection_id = 1;
        Group {
            txns: vec![Txn::new(0, vec![connect])],
            ..think_group(StrandKind::Process, 1, 0)
        }
    }

    #[test]
    fn test_launch_delivers_peers_to_child() {
        let (state, s) = strand(connect_group());
        let mut h = ProcessWorker::prefork(s, &[]).unwrap();
        assert!(h.launch_fd().is_some());
        let mut peer = SlaveInfo {
            host: "peer".to_string(),
            ..Default::default()
        };
        peer.ports[crate::workload::Protocol::Tcp.index()] = 7000;
        h.launch(&[peer]).unwrap();
        assert!(h.launch_fd().is_none());
        assert!(h.launch(&[]).is_err());
        assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        assert_eq!(state.totals().counters.ops, 1);
    }

    #[test]
    fn test_child_without_peer_port_fails() {
        let (state, s) = strand(connect_group());
        let mut h = ProcessWorker::prefork(s, &[]).unwrap();
        h.launch(&[]).unwrap();
        assert_eq!(h.join().unwrap(), ExecOutcome::Failure);
        assert!(state.global_error() > 0);
        assert!(state.log_text().contains("flowop failed"));
    }

    #[test]
    fn test_cancelled_launch_retires_child() {
        let (state, s) = strand(think_group(StrandKind::Process, 3, 0));
        let mut h = ProcessWorker::prefork(s, &[]).unwrap();
        h.cancel_launch();
        assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        assert_eq!(state.totals().counters.ops, 0);
        assert!(state.all_finished());
    }
}
