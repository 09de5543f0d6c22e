//! Execution scheduler
//!
//! Runs a strand's transaction list:
//!
//! 1. For transaction `i`, park on barrier `i` until the controller releases it. The wait
//!    is abandoned when the run has an error or the strand is killed.
//! 2. Run the transaction in its mode:
//!    - iterations: the body exactly N times, stopping at the first non-success
//!    - duration: the body until the strand is signalled by the group deadline
//!    - rate: the body through a pacer until signalled
//! 3. Clear the signalled flag and continue, unless the transaction failed.
//!
//! The body runs each flowop `count` times and checks the signalled flag before every
//! repetition, so an interrupt is observed within one repetition.
//!
//! Outcomes are plain values, not errors: a duration that ends on schedule and a peer
//! that closes its end are [`ExecOutcome::DurationExpired`], never a failure.

use super::{rate, Strand};
use crate::run_state::{BarrierWait, LogLevel, Role, StrandState};
use crate::transport::TransportError;
use crate::util::fast_time::{monotonic_ns, sleep_for, spin_for};
use crate::workload::{Flowop, FlowopType, Protocol, Txn, TxnMode};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Longest uninterrupted stretch of a think flowop
const THINK_TICK: Duration = Duration::from_millis(10);

/// Result of executing a flowop, a transaction or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Failure,
    DurationExpired,
}

/// Why a single flowop repetition did not complete
#[derive(Debug, Error)]
pub enum FlowopError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Peer closed connection")]
    Closed,
    #[error("Connection already closed")]
    AlreadyClosed,
    #[error("No connection with id {0}")]
    NoConnection(u32),
    #[error("Could not get port for {host} ({protocol})")]
    NoPort { host: String, protocol: Protocol },
    #[error("No {0} listener for accept")]
    NoListener(Protocol),
    #[error("Invalid flowop")]
    Invalid,
}

impl FlowopError {
    /// Conditions that end a duration rather than fail it
    fn is_expiry(&self) -> bool {
        matches!(
            self,
            FlowopError::Closed | FlowopError::Transport(TransportError::Interrupted)
        )
    }
}

impl Strand {
    fn is_signalled(&self) -> bool {
        self.slot().is_signalled()
    }

    /// Run every transaction of the group in order
    pub fn group_execute(&mut self) -> ExecOutcome {
        let group = Arc::clone(&self.group);
        let state = Arc::clone(&self.state);
        let slot = state.strand(self.id);
        let mut outcome = ExecOutcome::Success;

        for (i, txn) in group.txns.iter().enumerate() {
            slot.set_state(StrandState::AtBarrier);
            let Some(barrier) = state.barrier(i) else {
                state.log_msg(LogLevel::Error, format!("No barrier for transaction {}", i));
                outcome = ExecOutcome::Failure;
                break;
            };
            let wait = barrier.wait(|| state.global_error() > 0 || slot.is_killed());
            if wait == BarrierWait::Aborted {
                debug!("Strand {} abandoned barrier {}", self.id, i);
                break;
            }
            if state.global_error() > 0 {
                break;
            }
            // A signal aimed at the previous transaction must not end this one
            slot.clear_signal();
            if i == 0 {
                slot.mark_start();
            }

            slot.set_state(StrandState::Executing);
            outcome = self.txn_execute(txn);
            slot.clear_signal();
            if outcome == ExecOutcome::Failure {
                break;
            }
        }

        slot.set_state(StrandState::Exit);
        outcome
    }

    /// Register the group deadline for a timed transaction
    fn register_deadline(&self, duration: Duration) {
        if !self.is_leader() {
            return;
        }
        let begin = match self.state.txn_begin() {
            0 => monotonic_ns(),
            b => b,
        };
        let deadline = begin.saturating_add(duration.as_nanos() as u64);
        if !self.state.register_callout(self.group_index, deadline) {
            debug!("Group {} already has a pending deadline", self.group_index);
        }
    }

    pub fn txn_execute(&mut self, txn: &Txn) -> ExecOutcome {
        match txn.mode() {
            TxnMode::Iterations(n) => {
                for _ in 0..n {
                    match self.txn_body(txn) {
                        ExecOutcome::Success => {}
                        other => return other,
                    }
                }
                ExecOutcome::Success
            }
            TxnMode::Duration(d) => {
                self.register_deadline(d);
                loop {
                    if self.is_signalled() {
                        return ExecOutcome::DurationExpired;
                    }
                    match self.txn_body(txn) {
                        ExecOutcome::Success => {}
                        other => return other,
                    }
                }
            }
            TxnMode::Rate { duration, per_sec } => {
                self.register_deadline(duration);
                let state = Arc::clone(&self.state);
                let id = self.id;
                let intervals = self.rate_intervals;
                loop {
                    let interrupted = || state.strand(id).is_signalled();
                    let r = match state.role() {
                        Role::Master => {
                            rate::sliced(per_sec, intervals, interrupted, || self.txn_body(txn))
                        }
                        Role::Slave => {
                            rate::busy_wait(per_sec, interrupted, || self.txn_body(txn))
                        }
                    };
                    if r != ExecOutcome::Success {
                        return r;
                    }
                }
            }
        }
    }

    /// One pass over the transaction's flowops
    fn txn_body(&mut self, txn: &Txn) -> ExecOutcome {
        for f in &txn.flowops {
            match self.flowop_execute(f) {
                ExecOutcome::Success => {}
                other => return other,
            }
        }
        ExecOutcome::Success
    }

    /// Run `count` repetitions of one flowop
    pub fn flowop_execute(&mut self, f: &Flowop) -> ExecOutcome {
        for _ in 0..f.options.count {
            if self.is_signalled() {
                return ExecOutcome::DurationExpired;
            }
            match self.execute_once(f) {
                Ok(bytes) => {
                    if f.kind != FlowopType::Nop {
                        self.slot().counters.record_op(bytes);
                    }
                }
                Err(e) if e.is_expiry() => return ExecOutcome::DurationExpired,
                Err(e) if f.options.flag.can_fail() => {
                    self.slot().counters.record_error();
                    debug!("Strand {}: {} failed, tolerated: {}", self.id, f.name, e);
                }
                Err(e) => {
                    self.slot().counters.record_error();
                    self.state.log_msg(
                        LogLevel::Error,
                        format!("Strand {}: {} flowop failed: {}", self.id, f.name, e),
                    );
                    return ExecOutcome::Failure;
                }
            }
        }
        ExecOutcome::Success
    }

    /// Bytes moved by one transfer repetition
    fn io_size(&mut self, f: &Flowop) -> usize {
        let o = &f.options;
        let size = if !o.flag.random_size() {
            o.size
        } else if f.kind.is_receive() {
            o.rand_sz_max
        } else {
            self.rng.gen_range(o.rand_sz_min.min(o.rand_sz_max)..=o.rand_sz_max)
        };
        (size as usize).min(self.buffer.len())
    }

    fn think(&self, f: &Flowop) -> Result<(), FlowopError> {
        let end = monotonic_ns().saturating_add(f.options.duration);
        let busy = f.options.flag.think_busy();
        loop {
            let now = monotonic_ns();
            if now >= end {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(TransportError::Interrupted.into());
            }
            let step = Duration::from_nanos(end - now).min(THINK_TICK);
            if busy {
                spin_for(step);
            } else {
                sleep_for(step);
            }
        }
    }

    fn execute_once(&mut self, f: &Flowop) -> Result<u64, FlowopError> {
        let id = f.connection_id;
        match f.kind {
            FlowopType::Nop => Ok(0),
            FlowopType::Think => {
                self.think(f)?;
                Ok(0)
            }
            FlowopType::Connect => {
                let protocol = f.options.protocol;
                let host = f.options.remotehost.as_str();
                let port = self
                    .peer_port(host, protocol)
                    .or_else(|| u16::try_from(f.options.port).ok().filter(|p| *p != 0))
                    .ok_or_else(|| FlowopError::NoPort {
                        host: host.to_string(),
                        protocol,
                    })?;
                let conn = self.provider.connect(host, port, &f.options, &self.cancel)?;
                self.pool.add(id, conn);
                Ok(0)
            }
            FlowopType::Accept => {
                let protocol = f.options.protocol;
                let listener = self.listeners[protocol.index()]
                    .clone()
                    .ok_or(FlowopError::NoListener(protocol))?;
                let conn = listener.accept(&f.options, &self.cancel)?;
                self.pool.add(id, conn);
                Ok(0)
            }
            FlowopType::Disconnect => {
                let mut conn = self.pool.remove(id).ok_or(FlowopError::AlreadyClosed)?;
                conn.disconnect()?;
                Ok(0)
            }
            FlowopType::Read | FlowopType::Recv => {
                let size = self.io_size(f);
                let conn = self.pool.get(id).ok_or(FlowopError::NoConnection(id))?;
                match conn.read(&mut self.buffer[..size], &self.cancel)? {
                    0 if size > 0 => Err(FlowopError::Closed),
                    n => Ok(n as u64),
                }
            }
            FlowopType::Write
            | FlowopType::Send
            | FlowopType::Sendfile
            | FlowopType::Sendfilev => {
                let size = self.io_size(f);
                let conn = self.pool.get(id).ok_or(FlowopError::NoConnection(id))?;
                match conn.write(&self.buffer[..size], &self.cancel)? {
                    0 if size > 0 => Err(FlowopError::Closed),
                    n => Ok(n as u64),
                }
            }
            FlowopType::Error => Err(FlowopError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::protocol::SlaveInfo;
    use crate::run_state::{RunState, StrandState};
    use crate::transport::mock::{MockOp, MockProvider};
    use crate::transport::TransportProvider;
    use crate::workload::tests::flowop;
    use crate::workload::{FlowopFlags, FlowopOptions, Group, StrandKind};
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Instant;

    fn group(nthreads: u32, txns: Vec<Txn>) -> Group {
        Group {
            id: 0,
            name: "g".to_string(),
            kind: StrandKind::Thread,
            nthreads,
            max_async: 0,
            txns,
        }
    }

    fn with_count(kind: FlowopType, count: u64) -> Flowop {
        let mut f = flowop(kind, "peer");
        f.connection_id = 1;
        f.options.count = count;
        f
    }

    fn think(ms: u64, count: u64) -> Flowop {
        let mut f = with_count(FlowopType::Think, count);
        f.options.duration = ms * 1_000_000;
        f
    }

    /// Strands of a one-group run on the mock transport, each with connection 1 open
    fn setup(g: Group, role: Role) -> (Arc<RunState>, MockProvider, Vec<Strand>) {
        let state = Arc::new(RunState::new(role, &[g.clone()]).unwrap());
        let provider = MockProvider::new();
        let g = Arc::new(g);
        let strands = (0..g.nthreads as usize)
            .map(|i| {
                let mut s = Strand::new(
                    i,
                    0,
                    Arc::clone(&g),
                    Arc::clone(&state),
                    Arc::new(provider.clone()),
                );
                let conn = provider
                    .connect("peer", 1, &FlowopOptions::default(), &AtomicBool::new(false))
                    .unwrap();
                s.pool.add(1, conn);
                s
            })
            .collect();
        provider.clear_operations();
        (state, provider, strands)
    }

    fn release_all(state: &RunState) {
        for i in 0..state.num_barriers() {
            state.barrier(i).unwrap().release();
        }
    }

    /// Signal every strand of a due group, the way the controller's sweep does
    fn sweep(state: &RunState) {
        for g in state.due_callouts(monotonic_ns()) {
            for i in state.group_strands(g) {
                state.strand(i).signal();
            }
            state.clear_callout(g);
        }
    }

    #[test]
    fn test_iterations_times_count() {
        let txn = Txn {
            iterations: 5,
            ..Txn::new(0, vec![with_count(FlowopType::Write, 3)])
        };
        let (state, provider, mut strands) = setup(group(1, vec![txn]), Role::Master);
        release_all(&state);

        let outcome = strands.remove(0).run();

        assert_eq!(outcome, ExecOutcome::Success);
        assert_eq!(provider.data_op_count(), 15);
        assert_eq!(state.totals().counters.ops, 15);
        assert_eq!(state.totals().counters.bytes, 15 * 8192);
        assert_eq!(state.strand(0).state(), StrandState::Exit);
        assert!(state.all_finished());
        assert_eq!(state.global_error(), 0);
    }

    #[test]
    fn test_duration_transaction_expires_on_deadline() {
        let txn = Txn {
            duration_ns: 2_000_000_000,
            ..Txn::new(0, vec![think(10, 1)])
        };
        let (state, _provider, mut strands) = setup(group(2, vec![txn]), Role::Master);
        let start = Instant::now();
        state.set_txn_begin(monotonic_ns());
        release_all(&state);

        let handles: Vec<_> = strands
            .drain(..)
            .map(|s| thread::spawn(move || s.run()))
            .collect();
        while !state.all_finished() {
            sweep(&state);
            thread::sleep(Duration::from_millis(5));
        }

        for h in handles {
            assert_eq!(h.join().unwrap(), ExecOutcome::DurationExpired);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2100), "{:?}", elapsed);
        assert_eq!(state.global_error(), 0);
    }

    #[test]
    fn test_signal_is_seen_within_one_repetition() {
        let txn = Txn::new(0, vec![think(10, 1000)]);
        let (state, _provider, mut strands) = setup(group(1, vec![txn]), Role::Master);
        release_all(&state);

        let start = Instant::now();
        let h = {
            let s = strands.remove(0);
            thread::spawn(move || s.run())
        };
        thread::sleep(Duration::from_millis(50));
        state.strand(0).signal();

        assert_eq!(h.join().unwrap(), ExecOutcome::DurationExpired);
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(state.totals().counters.ops < 1000);
    }

    #[test]
    fn test_presignalled_flowop_runs_nothing() {
        let (_state, provider, mut strands) = setup(group(1, vec![]), Role::Master);
        let s = &mut strands[0];
        s.slot().signal();
        assert_eq!(
            s.flowop_execute(&with_count(FlowopType::Write, 100)),
            ExecOutcome::DurationExpired
        );
        assert_eq!(provider.data_op_count(), 0);
    }

    #[test]
    fn test_can_fail_tolerates_transport_errors() {
        let (state, provider, mut strands) = setup(group(1, vec![]), Role::Master);
        provider.set_should_fail(true);
        let s = &mut strands[0];

        let mut tolerant = with_count(FlowopType::Write, 4);
        tolerant.options.flag.insert(FlowopFlags::CANFAIL);
        assert_eq!(s.flowop_execute(&tolerant), ExecOutcome::Success);
        assert_eq!(state.totals().counters.errors, 4);

        assert_eq!(
            s.flowop_execute(&with_count(FlowopType::Write, 4)),
            ExecOutcome::Failure
        );
        assert!(state.has_log_errors());
    }

    #[test]
    fn test_failure_flags_global_error() {
        let txn = Txn::new(0, vec![with_count(FlowopType::Read, 1)]);
        let (state, provider, mut strands) = setup(group(1, vec![txn]), Role::Slave);
        provider.set_should_fail(true);
        release_all(&state);

        assert_eq!(strands.remove(0).run(), ExecOutcome::Failure);
        assert_eq!(state.global_error(), 1);
    }

    #[test]
    fn test_peer_close_is_not_a_failure() {
        let (state, provider, mut strands) = setup(group(1, vec![]), Role::Slave);
        provider.set_close_after(2);
        assert_eq!(
            strands[0].flowop_execute(&with_count(FlowopType::Read, 5)),
            ExecOutcome::DurationExpired
        );
        assert_eq!(state.totals().counters.ops, 2);
    }

    #[test]
    fn test_connect_write_disconnect() {
        let mut connect = with_count(FlowopType::Connect, 1);
        connect.connection_id = 7;
        let mut write = with_count(FlowopType::Write, 2);
        write.connection_id = 7;
        let mut disconnect = with_count(FlowopType::Disconnect, 1);
        disconnect.connection_id = 7;
        let txn = Txn::new(0, vec![connect, write, disconnect.clone()]);

        let (state, provider, mut strands) = setup(group(1, vec![txn]), Role::Master);
        let mut info = SlaveInfo {
            host: "peer".to_string(),
            ..Default::default()
        };
        info.ports[Protocol::Tcp.index()] = 6000;
        let mut s = strands.remove(0).with_peers(vec![info]);
        release_all(&state);

        let txn = Arc::clone(&s.group);
        assert_eq!(s.txn_execute(&txn.txns[0]), ExecOutcome::Success);
        assert_eq!(
            provider.operations(),
            vec![
                MockOp::Connect {
                    host: "peer".to_string(),
                    port: 6000
                },
                MockOp::Write { len: 8192 },
                MockOp::Write { len: 8192 },
                MockOp::Disconnect,
            ]
        );

        // the id is gone now
        assert_eq!(s.flowop_execute(&disconnect), ExecOutcome::Failure);
        assert!(state.log_text().contains("Connection already closed"));
    }

    #[test]
    fn test_connect_without_port_fails() {
        let (_state, _provider, mut strands) = setup(group(1, vec![]), Role::Master);
        assert_eq!(
            strands[0].flowop_execute(&with_count(FlowopType::Connect, 1)),
            ExecOutcome::Failure
        );
    }

    #[test]
    fn test_accept_uses_prebound_listener() {
        let (_state, provider, mut strands) = setup(group(1, vec![]), Role::Slave);
        let listener = provider.listen(&FlowopOptions::default()).unwrap();
        let port = listener.port();
        let mut listeners = super::super::Listeners::default();
        listeners[Protocol::Tcp.index()] = Some(listener);
        let mut s = strands.remove(0).with_listeners(listeners);

        let mut accept = with_count(FlowopType::Accept, 1);
        accept.connection_id = 3;
        assert_eq!(s.flowop_execute(&accept), ExecOutcome::Success);
        assert_eq!(provider.operations(), vec![MockOp::Accept { port }]);
        assert!(s.pool.get(3).is_some());
    }

    #[test]
    fn test_random_sizes() {
        let (_state, provider, mut strands) = setup(group(1, vec![]), Role::Master);
        let s = &mut strands[0];
        let mut w = with_count(FlowopType::Write, 50);
        w.options.flag.insert(FlowopFlags::SIZE_RAND);
        w.options.rand_sz_min = 100;
        w.options.rand_sz_max = 200;
        assert_eq!(s.flowop_execute(&w), ExecOutcome::Success);

        let mut r = w.clone();
        r.kind = FlowopType::Read;
        r.options.count = 1;
        assert_eq!(s.flowop_execute(&r), ExecOutcome::Success);

        let ops = provider.operations();
        for op in &ops[..50] {
            match op {
                MockOp::Write { len } => assert!((100..=200).contains(len)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(ops[50], MockOp::Read { len: 200 });
    }

    #[test]
    fn test_barrier_holds_next_transaction() {
        let txns = vec![
            Txn::new(0, vec![with_count(FlowopType::Write, 1)]),
            Txn::new(1, vec![with_count(FlowopType::Write, 1)]),
        ];
        let (state, _provider, mut strands) = setup(group(2, txns), Role::Master);
        let handles: Vec<_> = strands
            .drain(..)
            .map(|s| thread::spawn(move || s.run()))
            .collect();

        let b0 = state.barrier(0).unwrap();
        while !b0.is_reached() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(state.totals().counters.ops, 0);
        b0.release();

        let b1 = state.barrier(1).unwrap();
        while !b1.is_reached() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        // everyone finished txn 0 and nobody has started txn 1
        assert_eq!(state.totals().counters.ops, 2);
        b1.release();

        for h in handles {
            assert_eq!(h.join().unwrap(), ExecOutcome::Success);
        }
        assert_eq!(state.totals().counters.ops, 4);
    }

    #[test]
    fn test_global_error_unparks_barrier() {
        let txn = Txn::new(0, vec![with_count(FlowopType::Write, 1)]);
        let (state, provider, mut strands) = setup(group(1, vec![txn]), Role::Master);
        let h = {
            let s = strands.remove(0);
            thread::spawn(move || s.run())
        };
        thread::sleep(Duration::from_millis(20));
        state.flag_error();
        h.join().unwrap();
        assert_eq!(provider.data_op_count(), 0);
        assert!(state.all_finished());
    }

    #[test]
    fn test_rate_mode_paces_and_expires() {
        let txn = Txn {
            duration_ns: 1_500_000_000,
            rate_count: 40,
            ..Txn::new(0, vec![with_count(FlowopType::Write, 1)])
        };
        let (state, provider, mut strands) = setup(group(1, vec![txn]), Role::Slave);
        state.set_txn_begin(monotonic_ns());
        release_all(&state);

        let h = {
            let s = strands.remove(0);
            thread::spawn(move || s.run())
        };
        while !state.all_finished() {
            sweep(&state);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.join().unwrap(), ExecOutcome::DurationExpired);
        // 40/s over 1.5s
        let n = provider.data_op_count();
        assert!((55..=65).contains(&n), "{}", n);
    }
}
