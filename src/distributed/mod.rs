//! Master/slave protocol
//!
//! # Architecture
//!
//! uperf runs a workorder as one master and any number of slaves:
//!
//! - **Master**: connects to every slave named by the workorder, handshakes, runs its
//!   own half of each group and paces everybody through the transaction barriers
//! - **Slave**: serves each control connection as a session that runs the
//!   complementary half of one group
//! - **Strands**: threads (or, on the master, processes) executing flowops
//!
//! # Modules
//!
//! - `wire`: fixed-layout codec and byte-order handling
//! - `protocol`: record definitions and constants
//! - `handshake`: phases 1 to 3 on both sides
//! - `command`: command channel and the slave's command loop
//! - `goodbye`: end-of-run exchange
//! - `coordinator`: master run driver
//! - `node_service`: slave listener and sessions

pub mod command;
pub mod coordinator;
pub mod goodbye;
pub mod handshake;
pub mod node_service;
pub mod protocol;
pub mod wire;

// Re-export key types
pub use coordinator::DistributedCoordinator;
pub use handshake::HandshakeError;
pub use node_service::NodeService;
pub use protocol::{CommandKind, GoodbyeMessage, GoodbyeStats, UPERF_DATA_VERSION};
pub use wire::{Endian, WireError};
