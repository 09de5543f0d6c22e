//! Command channel
//!
//! Once the handshake is done the control connection carries only two kinds of records:
//! commands from the master (NEXT_TXN, ABORT, SEND_STATS) and, at the very end, a
//! goodbye from the slave. Both sides read them through an [`InboundReader`], a task
//! that owns the read half of the connection and forwards whole records over a channel.
//! Polling the channel with a timeout never tears a record in half, which a timeout
//! around a partial read would.

use super::protocol::{read_inbound, send_command, CommandKind, Inbound};
use super::wire::Endian;
use crate::run_state::{LogLevel, RunState};
use crate::util::fast_time::monotonic_ns;
use crate::worker::failure::{process_callouts, signal_all_strands, SignalPolicy};
use crate::worker::WorkerHandle;
use crate::Result;
use anyhow::{anyhow, bail};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Result of polling an [`InboundReader`]
#[derive(Debug)]
pub enum Polled {
    /// Nothing arrived within the wait
    Idle,
    Message(Inbound),
    /// The connection is gone or delivered garbage; nothing more will arrive
    Closed(anyhow::Error),
}

/// Background reader of one control connection
pub struct InboundReader {
    rx: mpsc::Receiver<Result<Inbound>>,
    task: JoinHandle<()>,
}

impl InboundReader {
    pub fn spawn<R>(mut reader: R, endian: Endian) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            loop {
                let rec = read_inbound(&mut reader, endian).await;
                let failed = rec.is_err();
                if tx.send(rec).await.is_err() || failed {
                    break;
                }
            }
        });
        Self { rx, task }
    }

    fn classify(item: Option<Result<Inbound>>) -> Polled {
        match item {
            Some(Ok(m)) => Polled::Message(m),
            Some(Err(e)) => Polled::Closed(e),
            None => Polled::Closed(anyhow!("Control connection closed")),
        }
    }

    /// Wait up to `wait` for the next record
    pub async fn poll(&mut self, wait: Duration) -> Polled {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(item) => Self::classify(item),
            Err(_) => Polled::Idle,
        }
    }

    /// Take a record that has already arrived, without waiting
    pub fn try_poll(&mut self) -> Polled {
        match self.rx.try_recv() {
            Ok(item) => Self::classify(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => Polled::Idle,
            Err(mpsc::error::TryRecvError::Disconnected) => Self::classify(None),
        }
    }
}

impl Drop for InboundReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Send `kind` to every writer, stopping at the first failure
pub async fn broadcast<'a, W, I>(writers: I, kind: CommandKind, value: u32) -> Result<()>
where
    W: AsyncWrite + Unpin + 'a,
    I: IntoIterator<Item = &'a mut W>,
{
    for w in writers {
        send_command(w, kind, value).await?;
    }
    Ok(())
}

/// Slave-side knobs of the command loop
#[derive(Debug, Clone, Copy)]
pub struct SlavePollOptions {
    /// Longest wait for a command before running callouts again
    pub poll_interval: Duration,
    /// Pause between attempts to bring strands to a barrier
    pub barrier_pause: Duration,
    /// Attempts before giving up on strands that never reach a barrier
    pub barrier_tries: u32,
    pub signal: SignalPolicy,
}

impl Default for SlavePollOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            barrier_pause: Duration::from_secs(1),
            barrier_tries: 5,
            signal: SignalPolicy::default(),
        }
    }
}

/// Bring every local strand to barrier `txn` and release it
///
/// Strands still busy in the previous transaction are signalled out of it; the master
/// has already finished its side of that transaction, so whatever they are waiting for
/// will not come.
pub async fn wait_unlock_barrier(
    state: &RunState,
    workers: &[Box<dyn WorkerHandle>],
    txn: usize,
    opts: &SlavePollOptions,
) -> Result<()> {
    let Some(barrier) = state.barrier(txn) else {
        return Ok(());
    };
    let mut tries = opts.barrier_tries;
    while !barrier.is_reached() {
        if state.global_error() > 0 {
            bail!("Run failed while waiting for barrier {}", txn);
        }
        info!("{} threads not at barrier {}", barrier.not_reached(), txn);
        if let Err(e) = signal_all_strands(state, workers, None, opts.signal).await {
            state.log_msg(LogLevel::Error, "Slave: Error sending signal to strands");
            return Err(e);
        }
        tokio::time::sleep(opts.barrier_pause).await;
        if let Err(e) = process_callouts(state, workers, opts.signal).await {
            state.log_msg(LogLevel::Error, "Error processing callouts");
            return Err(e);
        }
        if tries == 0 {
            let msg = format!("Error waiting for strands at barrier {}", txn);
            state.log_msg(LogLevel::Error, msg.clone());
            bail!(msg);
        }
        tries -= 1;
    }
    debug!("Unlocking barrier {}", txn);
    barrier.release();
    Ok(())
}

/// Follow the master's commands until it asks for stats
///
/// Returns an error when the run must be torn down: an ABORT, a lost control
/// connection, an unknown command or a local failure.
pub async fn slave_poll(
    state: &RunState,
    workers: &[Box<dyn WorkerHandle>],
    inbound: &mut InboundReader,
    opts: &SlavePollOptions,
) -> Result<()> {
    let mut reported_done = false;
    loop {
        if state.global_error() > 0 {
            bail!("Run failed");
        }
        match inbound.poll(opts.poll_interval).await {
            Polled::Idle => {}
            Polled::Closed(e) => return Err(e.context("Error in get command")),
            Polled::Message(Inbound::Goodbye(_)) => bail!("Unexpected goodbye from master"),
            Polled::Message(Inbound::Command(cmd)) => match cmd.kind()? {
                CommandKind::NextTxn => {
                    state.set_txn_begin(monotonic_ns());
                    wait_unlock_barrier(state, workers, cmd.value as usize, opts).await?;
                }
                CommandKind::Abort => {
                    info!("Got abort command");
                    bail!("Got abort command");
                }
                CommandKind::SendStats => return Ok(()),
                other => bail!("Unknown command {:?}", other),
            },
        }
        // a failure here has already been flagged on the run state
        if let Err(e) = process_callouts(state, workers, opts.signal).await {
            debug!("{}", e);
        }
        if state.all_finished() && !reported_done {
            info!("Strands finished, but waiting for master cmd");
            reported_done = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::protocol::{GoodbyeKind, GoodbyeMessage, GoodbyeStats};
    use crate::distributed::wire::write_record;
    use crate::run_state::tests::group;
    use crate::run_state::{BarrierWait, Role, StrandState};
    use crate::transport::mock::MockProvider;
    use crate::worker::{spawn_strand, Strand};
    use crate::workload::StrandKind;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::duplex;

    fn quick() -> SlavePollOptions {
        SlavePollOptions {
            poll_interval: Duration::from_millis(20),
            barrier_pause: Duration::from_millis(10),
            barrier_tries: 2,
            signal: SignalPolicy {
                retries: 5,
                pause: Duration::from_millis(5),
            },
        }
    }

    #[tokio::test]
    async fn test_reader_delivers_whole_records() {
        let (mut a, b) = duplex(4096);
        let mut reader = InboundReader::spawn(b, Endian::Same);

        assert!(matches!(reader.try_poll(), Polled::Idle));
        send_command(&mut a, CommandKind::NextTxn, 4).await.unwrap();
        match reader.poll(Duration::from_secs(5)).await {
            Polled::Message(Inbound::Command(c)) => {
                assert_eq!(c.kind(), Ok(CommandKind::NextTxn));
                assert_eq!(c.value, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            reader.poll(Duration::from_millis(20)).await,
            Polled::Idle
        ));

        let bye = GoodbyeMessage::new(GoodbyeKind::Info, GoodbyeStats::default(), "Success");
        write_record(&mut a, &bye).await.unwrap();
        drop(a);
        assert!(matches!(
            reader.poll(Duration::from_secs(5)).await,
            Polled::Message(Inbound::Goodbye(_))
        ));
        assert!(matches!(
            reader.poll(Duration::from_secs(5)).await,
            Polled::Closed(_)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let (mut a1, b1) = duplex(4096);
        let (mut a2, b2) = duplex(4096);
        broadcast([&mut a1, &mut a2], CommandKind::SendStats, 0)
            .await
            .unwrap();
        for b in [b1, b2] {
            let mut r = InboundReader::spawn(b, Endian::Same);
            assert!(matches!(
                r.poll(Duration::from_secs(5)).await,
                Polled::Message(Inbound::Command(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unlock_releases_reached_barrier() {
        let state = Arc::new(RunState::new(Role::Slave, &[group(0, 1, 2)]).unwrap());
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.barrier(1).unwrap().wait(|| false))
        };
        while !state.barrier(1).unwrap().is_reached() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        wait_unlock_barrier(&state, &[], 1, &quick()).await.unwrap();
        assert_eq!(waiter.join().unwrap(), BarrierWait::Released);

        // out of range is ignored
        wait_unlock_barrier(&state, &[], 7, &quick()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_gives_up_on_absent_strands() {
        let state = RunState::new(Role::Slave, &[group(0, 2, 1)]).unwrap();
        for (_, slot) in state.strands() {
            slot.set_state(StrandState::AtBarrier);
        }
        let start = Instant::now();
        let err = wait_unlock_barrier(&state, &[], 0, &quick()).await.unwrap_err();
        assert!(err.to_string().contains("barrier 0"));
        assert!(state.log_text().contains("Error waiting for strands at barrier 0"));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!state.barrier(0).unwrap().is_released());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slave_poll_follows_commands() {
        let g = group(0, 1, 2);
        let state = Arc::new(RunState::new(Role::Slave, &[g.clone()]).unwrap());
        let strand = Strand::new(
            0,
            0,
            Arc::new(g),
            Arc::clone(&state),
            Arc::new(MockProvider::new()),
        );
        let mut workers = vec![spawn_strand(StrandKind::Thread, strand).unwrap()];

        let (mut master, slave) = duplex(4096);
        let mut reader = InboundReader::spawn(slave, Endian::Same);
        send_command(&mut master, CommandKind::NextTxn, 0).await.unwrap();
        send_command(&mut master, CommandKind::NextTxn, 1).await.unwrap();
        send_command(&mut master, CommandKind::SendStats, 0).await.unwrap();

        slave_poll(&state, &workers, &mut reader, &quick()).await.unwrap();
        assert!(state.barrier(0).unwrap().is_released());
        assert!(state.barrier(1).unwrap().is_released());
        assert!(state.txn_begin() > 0);
        assert_eq!(workers[0].join().unwrap(), crate::worker::ExecOutcome::Success);
    }

    #[tokio::test]
    async fn test_slave_poll_abort_and_lost_master() {
        let state = RunState::new(Role::Slave, &[group(0, 1, 1)]).unwrap();
        let (mut master, slave) = duplex(4096);
        let mut reader = InboundReader::spawn(slave, Endian::Same);
        send_command(&mut master, CommandKind::Abort, 0).await.unwrap();
        let err = slave_poll(&state, &[], &mut reader, &quick()).await.unwrap_err();
        assert!(err.to_string().contains("abort"));

        drop(master);
        assert!(slave_poll(&state, &[], &mut reader, &quick()).await.is_err());
    }
}
