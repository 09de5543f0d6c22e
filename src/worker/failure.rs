//! Failure and signal coordination
//!
//! Controller-side operations that drive strands out of their transactions:
//!
//! - [`signal_all_strands`] ends the current transaction of every strand (or of one
//!   group) and waits until each one is back at a barrier or has exited
//! - [`process_callouts`] fires the group deadlines that are due
//! - [`killall`] sets every strand's kill flag so that nothing keeps running
//! - [`reap`] joins the handles, force-killing strands that outlive a grace period
//!
//! These run on the controller's tokio runtime; strands never call them.

use super::{ExecOutcome, WorkerHandle};
use crate::run_state::{LogLevel, RunState, StrandState};
use crate::util::fast_time::monotonic_ns;
use crate::Result;
use anyhow::bail;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long [`signal_all_strands`] keeps nudging strands that have not responded
#[derive(Debug, Clone, Copy)]
pub struct SignalPolicy {
    pub retries: u32,
    pub pause: Duration,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            pause: Duration::from_millis(200),
        }
    }
}

fn is_parked(state: StrandState) -> bool {
    matches!(state, StrandState::AtBarrier | StrandState::Exit)
}

fn signal_one(state: &RunState, workers: &[Box<dyn WorkerHandle>], idx: usize) -> Result<()> {
    match workers.iter().find(|w| w.index() == idx) {
        Some(w) => w.signal(),
        None => {
            state.strand(idx).signal();
            Ok(())
        }
    }
}

/// Signal the strands of `group` (every group when `None`) that are not parked
///
/// Strands that stay signalled are signalled again after each pause, up to
/// `policy.retries` times. Fails if some are still executing after that.
pub async fn signal_all_strands(
    state: &RunState,
    workers: &[Box<dyn WorkerHandle>],
    group: Option<usize>,
    policy: SignalPolicy,
) -> Result<()> {
    let targets: Vec<usize> = match group {
        Some(g) => state.group_strands(g).collect(),
        None => (0..state.num_strands()).collect(),
    };

    for &i in &targets {
        if !is_parked(state.strand(i).state()) {
            signal_one(state, workers, i)?;
        }
    }

    let mut retries = policy.retries;
    loop {
        let pending: Vec<usize> = targets
            .iter()
            .copied()
            .filter(|&i| {
                let slot = state.strand(i);
                slot.is_signalled() && !is_parked(slot.state())
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        if retries == 0 {
            info!("{} threads not responding", pending.len());
            bail!("{} threads not responding", pending.len());
        }
        retries -= 1;
        tokio::time::sleep(policy.pause).await;
        for i in pending {
            signal_one(state, workers, i)?;
        }
    }
}

/// Fire every group deadline that has passed
///
/// Returns the number of groups called out. A group whose strands do not respond flags
/// a run error.
pub async fn process_callouts(
    state: &RunState,
    workers: &[Box<dyn WorkerHandle>],
    policy: SignalPolicy,
) -> Result<usize> {
    let due = state.due_callouts(monotonic_ns());
    for &g in &due {
        if let Err(e) = signal_all_strands(state, workers, Some(g), policy).await {
            state.flag_error();
            state.log_msg(LogLevel::Error, "Error signalling strands");
            return Err(e);
        }
        state.clear_callout(g);
        debug!("Group {} called out", g);
    }
    Ok(due.len())
}

/// Set every strand's kill flag and wake it
pub fn killall(state: &RunState, workers: &[Box<dyn WorkerHandle>]) {
    for (i, slot) in state.strands() {
        slot.kill();
        if let Err(e) = signal_one(state, workers, i) {
            debug!("Waking strand {} failed: {}", i, e);
        }
    }
}

/// Join every handle, force-killing strands still running after `grace`
///
/// Returns `true` when every strand exited without failure.
pub async fn reap(
    state: &RunState,
    workers: &mut [Box<dyn WorkerHandle>],
    grace: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while !state.all_finished() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if !state.all_finished() {
        warn!("Strands still running after {:?}, killing", grace);
        for w in workers.iter_mut() {
            if let Err(e) = w.force_kill() {
                warn!("Error killing strand {}: {}", w.index(), e);
            }
        }
    }

    let mut ok = true;
    for w in workers.iter_mut() {
        match w.join() {
            Ok(ExecOutcome::Failure) => ok = false,
            Ok(_) => {}
            Err(e) => {
                warn!("{}", e);
                ok = false;
            }
        }
    }
    ok
}
