//! Shared utilities

pub mod fast_time;
pub mod time;

pub use fast_time::{monotonic_ns, FastInstant};
