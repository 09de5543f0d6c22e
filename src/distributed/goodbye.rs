//! Goodbye exchange
//!
//! Every slave session ends with exactly one goodbye, whether the run succeeded or was
//! aborted: the session's totals plus either "Success" or the error and warning lines
//! logged during the run. The master collects one per control connection and folds
//! them into the run report.

use super::command::{InboundReader, Polled};
use super::protocol::{GoodbyeKind, GoodbyeMessage, GoodbyeStats, Inbound};
use super::wire::{write_record_as, Endian};
use crate::run_state::{RunState, RunTotals};
use crate::stats::report::HostReport;
use crate::Result;
use anyhow::Context;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl From<RunTotals> for GoodbyeStats {
    fn from(t: RunTotals) -> Self {
        Self {
            elapsed_time: t.elapsed_ns,
            error: t.counters.errors,
            bytes_xfer: t.counters.bytes,
            count: t.counters.ops,
        }
    }
}

/// The goodbye describing this side of the run
pub fn goodbye_for(state: &RunState) -> GoodbyeMessage {
    let stats = GoodbyeStats::from(state.totals());
    let log = state.log_text();
    if log.is_empty() {
        GoodbyeMessage::new(GoodbyeKind::Info, stats, "Success")
    } else {
        info!("Goodbye ** {} **", log);
        GoodbyeMessage::new(GoodbyeKind::Error, stats, log)
    }
}

pub async fn send_goodbye<S>(
    stream: &mut S,
    endian: Endian,
    goodbye: &GoodbyeMessage,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_record_as(stream, goodbye, endian)
        .await
        .context("Error sending goodbye")
}

fn status_name(kind: GoodbyeKind) -> &'static str {
    match kind {
        GoodbyeKind::Error => "error",
        GoodbyeKind::Warning => "warning",
        GoodbyeKind::Info => "info",
        GoodbyeKind::None => "none",
    }
}

pub(crate) fn missing(host: &str, why: String) -> HostReport {
    HostReport {
        host: host.to_string(),
        status: "missing".to_string(),
        message: why,
        stats: GoodbyeStats::default(),
    }
}

/// Report entry for a goodbye received from `host`
pub(crate) fn host_report(host: &str, goodbye: GoodbyeMessage) -> HostReport {
    match goodbye.kind() {
        Ok(kind) => HostReport {
            host: host.to_string(),
            status: status_name(kind).to_string(),
            message: goodbye.message,
            stats: goodbye.stats,
        },
        Err(e) => missing(host, format!("Malformed goodbye: {}", e)),
    }
}

/// Wait for the goodbye of one connection
///
/// Commands are not expected at this point and are skipped. A connection that closes
/// or stays silent until `deadline` yields a "missing" entry rather than an error.
pub async fn await_goodbye(
    host: &str,
    reader: &mut InboundReader,
    deadline: Instant,
) -> HostReport {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            warn!("No goodbye from {}", host);
            return missing(host, "Timed out waiting for goodbye".to_string());
        }
        match reader.poll(left).await {
            Polled::Idle => {}
            Polled::Message(Inbound::Command(c)) => {
                debug!("Ignoring command {} from {} during goodbye", c.command, host);
            }
            Polled::Message(Inbound::Goodbye(g)) => return host_report(host, g),
            Polled::Closed(e) => {
                warn!("Error reading goodbye from {}: {:#}", host, e);
                return missing(host, format!("{:#}", e));
            }
        }
    }
}

/// Collect one goodbye per connection, all bounded by the same `timeout`
pub async fn collect_goodbyes<'a, I>(conns: I, timeout: Duration) -> Vec<HostReport>
where
    I: IntoIterator<Item = (&'a str, &'a mut InboundReader)>,
{
    let deadline = Instant::now() + timeout;
    let mut reports = Vec::new();
    for (host, reader) in conns {
        reports.push(await_goodbye(host, reader, deadline).await);
    }
    reports
}
