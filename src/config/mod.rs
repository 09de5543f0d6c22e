//! Configuration module
//!
//! CLI argument parsing, the TOML workload profile and the run tunables.

pub mod cli;
pub mod toml;

use crate::distributed::command::SlavePollOptions;
use crate::worker::failure::SignalPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and networking knobs of a run
///
/// Every field has a default, so a profile can carry an `[options]` table with only the
/// values it wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Port slaves listen on for control connections
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long the master waits for goodbyes after a clean run
    #[serde(default = "default_goodbye_timeout_ms")]
    pub goodbye_timeout_ms: u64,
    /// How long the master waits for goodbyes once an error was flagged
    #[serde(default = "default_error_goodbye_timeout_ms")]
    pub error_goodbye_timeout_ms: u64,
    /// Upper bound on a wait for a command or a slave message
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds a slave keeps trying to bring its strands to a barrier
    #[serde(default = "default_barrier_wait_secs")]
    pub barrier_wait_secs: u32,
    /// Attempts to signal strands that are still executing
    #[serde(default = "default_signal_retries")]
    pub signal_retries: u32,
    /// Pause between those attempts
    #[serde(default = "default_signal_pause_ms")]
    pub signal_pause_ms: u64,
    /// Slices per second for rate-paced transactions on the master
    #[serde(default = "default_rate_intervals")]
    pub rate_intervals: u32,
}

fn default_port() -> u16 {
    20000
}

fn default_goodbye_timeout_ms() -> u64 {
    15000
}

fn default_error_goodbye_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_barrier_wait_secs() -> u32 {
    5
}

fn default_signal_retries() -> u32 {
    5
}

fn default_signal_pause_ms() -> u64 {
    200
}

fn default_rate_intervals() -> u32 {
    2
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            goodbye_timeout_ms: default_goodbye_timeout_ms(),
            error_goodbye_timeout_ms: default_error_goodbye_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            barrier_wait_secs: default_barrier_wait_secs(),
            signal_retries: default_signal_retries(),
            signal_pause_ms: default_signal_pause_ms(),
            rate_intervals: default_rate_intervals(),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be at least 1".to_string());
        }
        if self.rate_intervals == 0 {
            return Err("rate_intervals must be at least 1".to_string());
        }
        Ok(())
    }

    /// Goodbye wait, shortened once the run has failed
    pub fn goodbye_timeout(&self, errored: bool) -> Duration {
        if errored {
            Duration::from_millis(self.error_goodbye_timeout_ms)
        } else {
            Duration::from_millis(self.goodbye_timeout_ms)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy {
            retries: self.signal_retries,
            pause: Duration::from_millis(self.signal_pause_ms),
        }
    }

    /// Command loop settings of a slave session
    ///
    /// Barrier attempts are one second apart, so the wait in seconds is the number of
    /// attempts.
    pub fn slave_poll_options(&self) -> SlavePollOptions {
        SlavePollOptions {
            poll_interval: self.poll_interval(),
            barrier_pause: Duration::from_secs(1),
            barrier_tries: self.barrier_wait_secs,
            signal: self.signal_policy(),
        }
    }
}
