//! uperf - distributed network benchmark
//!
//! A master and its slaves run the two halves of a workorder: groups of strands
//! executing transactions of flowops (connect, write, read, think ...) against each
//! other, kept in step by per-transaction barriers.
//!
//! # Architecture
//!
//! - **Workload model**: workorder, groups, transactions, flowops
//! - **Distributed protocol**: handshake with endian negotiation, commands, goodbyes
//! - **Scheduler**: barrier-synchronized, iteration, duration or rate driven
//! - **Shared run state**: barriers, deadlines, counters in a shared mapping
//! - **Failure coordination**: signalling, deadlines, kill and reap of strands

pub mod config;
pub mod distributed;
pub mod run_state;
pub mod stats;
pub mod transport;
pub mod util;
pub mod worker;
pub mod workload;

// Re-export commonly used types
pub use config::RunOptions;
pub use workload::Workorder;

/// Result type used throughout uperf
pub type Result<T> = anyhow::Result<T>;
