//! End-of-run report
//!
//! Built by the master from its own totals plus one goodbye per remote host. Printed as
//! text on stdout, or serialized with `serde_json` when `--json` is given.

use crate::distributed::protocol::GoodbyeStats;
use crate::util::time::{
    format_bitrate, format_bytes, format_duration, format_rate, per_second, percent_diff,
};
use crate::Result;
use serde::Serialize;
use std::time::Duration;

/// What one slave reported in its goodbye
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    /// "info", "warning", "error", "none", or "missing" when no goodbye arrived
    pub status: String,
    pub message: String,
    pub stats: GoodbyeStats,
}

/// Master totals relative to the slaves' totals, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Difference {
    pub bytes: f64,
    pub ops: f64,
    pub errors: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub workorder: String,
    pub timestamp: String,
    pub master: GoodbyeStats,
    pub hosts: Vec<HostReport>,
    pub slaves: GoodbyeStats,
    /// Global error count at teardown
    pub errors: u64,
    /// Error and warning lines collected during the run
    pub log: Vec<String>,
}

impl RunReport {
    pub fn new(workorder: impl Into<String>, master: GoodbyeStats) -> Self {
        Self {
            workorder: workorder.into(),
            timestamp: chrono::Local::now().to_rfc3339(),
            master,
            hosts: Vec::new(),
            slaves: GoodbyeStats::default(),
            errors: 0,
            log: Vec::new(),
        }
    }

    pub fn add_host(&mut self, host: HostReport) {
        self.slaves.merge(&host.stats);
        self.hosts.push(host);
    }

    pub fn difference(&self) -> Difference {
        Difference {
            bytes: percent_diff(self.slaves.bytes_xfer, self.master.bytes_xfer),
            ops: percent_diff(self.slaves.count, self.master.count),
            errors: percent_diff(self.slaves.error, self.master.error),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    /// Process exit status for this run
    pub fn exit_code(&self) -> i32 {
        if self.has_errors() {
            1
        } else {
            0
        }
    }

    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Json<'a> {
            #[serde(flatten)]
            report: &'a RunReport,
            difference: Difference,
        }
        Ok(serde_json::to_string_pretty(&Json {
            report: self,
            difference: self.difference(),
        })?)
    }

    pub fn print(&self) {
        println!("═══════════════════════════════════════════════════════════");
        println!("  Run: {}    ({})", self.workorder, self.timestamp);
        println!("═══════════════════════════════════════════════════════════");
        println!();
        print_stats_line("master", &self.master);
        for h in &self.hosts {
            print_stats_line(&h.host, &h.stats);
        }
        println!();

        if !self.hosts.is_empty() {
            let d = self.difference();
            println!(
                "Difference (%)   bytes {:+.2}   ops {:+.2}   errors {:+.2}",
                d.bytes, d.ops, d.errors
            );
            println!();
            for h in &self.hosts {
                if !h.message.is_empty() && h.status != "info" {
                    println!("{} [{}]:", h.host, h.status);
                    for line in h.message.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }

        for line in &self.log {
            println!("{}", line);
        }

        if self.has_errors() {
            println!();
            println!("WARNING: {} Errors detected during run", self.errors);
        }
    }
}

fn print_stats_line(label: &str, s: &GoodbyeStats) {
    let elapsed = Duration::from_nanos(s.elapsed_time);
    println!(
        "{:<16} {:>10} {:>12} {:>12} ops/s {:>12} ops {:>6} errors  {}",
        label,
        format_duration(elapsed),
        format_bytes(s.bytes_xfer),
        format_rate(per_second(s.count, elapsed)),
        s.count,
        s.error,
        format_bitrate(s.bytes_xfer, elapsed),
    );
}
