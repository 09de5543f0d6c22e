//! CLI argument parsing using clap

use super::RunOptions;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Master - drive a profile against remote slaves
    Master,
    /// Slave - serve runs requested by masters
    Slave,
}

/// uperf - distributed network benchmark
#[derive(Parser, Debug)]
#[command(name = "uperf")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: master or slave
    #[arg(long, value_enum, default_value = "slave")]
    pub mode: ExecutionMode,

    /// Workload profile (TOML), required in master mode
    #[arg(short = 'm', long, value_name = "FILE")]
    pub profile: Option<PathBuf>,

    /// Control port: where slaves listen and masters connect
    #[arg(short = 'P', long, env = "UPERF_PORT")]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,

    /// How long to wait for slave goodbyes after a clean run
    #[arg(long, value_name = "MS")]
    pub goodbye_timeout_ms: Option<u64>,

    /// Upper bound on a single wait for a command or slave message
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mode == ExecutionMode::Master && self.profile.is_none() {
            anyhow::bail!("master mode needs a workload profile (--profile)");
        }
        if self.mode == ExecutionMode::Slave && self.profile.is_some() {
            anyhow::bail!("--profile is only used in master mode");
        }
        if self.port == Some(0) {
            anyhow::bail!("port must be non-zero");
        }
        if self.poll_interval_ms == Some(0) {
            anyhow::bail!("poll_interval_ms must be at least 1");
        }
        Ok(())
    }

    /// Apply the flags that were given on top of `options` (CLI takes precedence)
    pub fn apply(&self, options: &mut RunOptions) {
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(ms) = self.goodbye_timeout_ms {
            options.goodbye_timeout_ms = ms;
        }
        if let Some(ms) = self.poll_interval_ms {
            options.poll_interval_ms = ms;
        }
    }

    /// Filter directive for the tracing subscriber when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "uperf=debug"
        } else {
            "uperf=info"
        }
    }
}
