//! Flowop types, options and the master/slave complement
//!
//! A flowop is the smallest unit of work a strand executes. The master and the slave run
//! complementary halves of every flowop: what the master writes, the slave reads; what the
//! master connects to, the slave accepts. [`FlowopType::opposite`] encodes that mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Size used for IO when no explicit size was configured
pub const DEFAULT_BUFFER_SIZE: u32 = 8192;

/// Slave-side read size substituted for sendfile/sendfilev flowops
pub const SLAVE_READ_SIZE: u32 = 64 * 1024;

/// Number of transport slots carried in protocol bitmaps and port tables
pub const NUM_PROTOCOLS: usize = 8;

/// Data-plane transport a flowop runs over
///
/// Discriminants are the on-wire protocol numbers. Slot 0 is never used and slot 7 is
/// the "unsupported" sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Protocol {
    #[default]
    Tcp = 1,
    Udapl = 2,
    Udp = 3,
    Rds = 4,
    Ssl = 5,
    Sctp = 6,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::Tcp,
        Protocol::Udapl,
        Protocol::Udp,
        Protocol::Rds,
        Protocol::Ssl,
        Protocol::Sctp,
    ];

    /// Decode an on-wire protocol number
    pub fn from_wire(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| *p as u32 == value)
    }

    /// Slot of this protocol in bitmaps and port tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udapl => "uDAPL",
            Protocol::Udp => "UDP",
            Protocol::Rds => "RDS",
            Protocol::Ssl => "SSL",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flowop operation type
///
/// Discriminants are the on-wire type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum FlowopType {
    Error = 0,
    Read = 1,
    Write = 2,
    Connect = 3,
    Disconnect = 4,
    Accept = 5,
    Nop = 6,
    Think = 7,
    Send = 8,
    Recv = 9,
    Sendfilev = 10,
    Sendfile = 11,
}

impl FlowopType {
    pub const ALL: [FlowopType; 12] = [
        FlowopType::Error,
        FlowopType::Read,
        FlowopType::Write,
        FlowopType::Connect,
        FlowopType::Disconnect,
        FlowopType::Accept,
        FlowopType::Nop,
        FlowopType::Think,
        FlowopType::Send,
        FlowopType::Recv,
        FlowopType::Sendfilev,
        FlowopType::Sendfile,
    ];

    /// Decode an on-wire type number
    pub fn from_wire(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u32 == value)
    }

    /// The operation the peer performs to complement this one
    ///
    /// Sendfile and sendfilev have no sending counterpart on the slave, both map to read.
    pub fn opposite(self) -> Self {
        match self {
            FlowopType::Read => FlowopType::Write,
            FlowopType::Write => FlowopType::Read,
            FlowopType::Send => FlowopType::Recv,
            FlowopType::Recv => FlowopType::Send,
            FlowopType::Accept => FlowopType::Connect,
            FlowopType::Connect => FlowopType::Accept,
            FlowopType::Sendfile | FlowopType::Sendfilev => FlowopType::Read,
            other => other,
        }
    }

    /// Transmit-side data transfer
    pub fn is_transmit(self) -> bool {
        matches!(self, FlowopType::Write | FlowopType::Send)
    }

    /// Receive-side data transfer
    pub fn is_receive(self) -> bool {
        matches!(self, FlowopType::Read | FlowopType::Recv)
    }

    /// Flowops that open or reference a data connection
    pub fn uses_connection(self) -> bool {
        !matches!(self, FlowopType::Nop | FlowopType::Think | FlowopType::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            FlowopType::Error => "error",
            FlowopType::Read => "read",
            FlowopType::Write => "write",
            FlowopType::Connect => "connect",
            FlowopType::Disconnect => "disconnect",
            FlowopType::Accept => "accept",
            FlowopType::Nop => "nop",
            FlowopType::Think => "think",
            FlowopType::Send => "send",
            FlowopType::Recv => "recv",
            FlowopType::Sendfilev => "sendfilev",
            FlowopType::Sendfile => "sendfile",
        }
    }
}

impl fmt::Display for FlowopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flowop option bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowopFlags(pub u32);

impl FlowopFlags {
    pub const TCP_NODELAY: u32 = 1 << 1;
    pub const CANFAIL: u32 = 1 << 2;
    pub const NONBLOCKING: u32 = 1 << 3;
    pub const THINK_IDLE: u32 = 1 << 4;
    pub const THINK_BUSY: u32 = 1 << 5;
    pub const SIZE_RAND: u32 = 1 << 6;
    pub const SCTP_UNORDERED: u32 = 1 << 7;
    pub const SCTP_NODELAY: u32 = 1 << 8;

    #[inline]
    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }

    #[inline]
    pub fn remove(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn can_fail(self) -> bool {
        self.contains(Self::CANFAIL)
    }

    pub fn random_size(self) -> bool {
        self.contains(Self::SIZE_RAND)
    }

    pub fn think_busy(self) -> bool {
        self.contains(Self::THINK_BUSY)
    }
}

/// Options bag carried by every flowop
///
/// Numeric fields are byte-swapped on receipt from a foreign-endian master; the string
/// fields never are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowopOptions {
    /// Transfer size in bytes
    pub size: u32,
    pub rand_sz_min: u32,
    pub rand_sz_max: u32,
    /// Size the slave should use instead of `size` when larger
    pub rsize: u32,
    pub protocol: Protocol,
    /// Fixed listen port for accept flowops (0 = ephemeral)
    pub port: u32,
    pub flag: FlowopFlags,
    pub nfiles: u32,
    pub encaps_port: u32,
    /// Think time or per-flowop duration in nanoseconds
    pub duration: u64,
    pub wndsz: u64,
    /// Repetitions per transaction iteration
    pub count: u64,
    /// Poll timeout in nanoseconds
    pub poll_timeout: u64,
    pub sctp_out_streams: u16,
    pub sctp_in_streams: u16,
    pub sctp_stream_id: u16,
    pub cc: String,
    pub stack: String,
    pub dir: String,
    pub remotehost: String,
    pub localhost: String,
    pub engine: String,
    pub cipher: String,
    pub method: String,
}

impl Default for FlowopOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_BUFFER_SIZE,
            rand_sz_min: 0,
            rand_sz_max: 0,
            rsize: 0,
            protocol: Protocol::Tcp,
            port: 0,
            flag: FlowopFlags::default(),
            nfiles: 0,
            encaps_port: 0,
            duration: 0,
            wndsz: 0,
            count: 1,
            poll_timeout: 0,
            sctp_out_streams: 0,
            sctp_in_streams: 0,
            sctp_stream_id: 0,
            cc: String::new(),
            stack: String::new(),
            dir: String::new(),
            remotehost: String::new(),
            localhost: String::new(),
            engine: String::new(),
            cipher: String::new(),
            method: String::new(),
        }
    }
}

impl FlowopOptions {
    pub fn think_duration(&self) -> Duration {
        Duration::from_nanos(self.duration)
    }
}

/// A single workload operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flowop {
    pub name: String,
    pub kind: FlowopType,
    /// Logical connection id this flowop works on
    pub connection_id: u32,
    pub options: FlowopOptions,
}

impl Flowop {
    pub fn new(kind: FlowopType, options: FlowopOptions) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            connection_id: 0,
            options,
        }
    }

    /// Turn this flowop into the one the peer executes
    ///
    /// Flips the type, swaps the direction-dependent SCTP stream counts and substitutes
    /// the slave read size for sendfile variants.
    pub fn make_opposite(&mut self) {
        if matches!(self.kind, FlowopType::Sendfile | FlowopType::Sendfilev) {
            self.options.size = SLAVE_READ_SIZE;
        }
        self.kind = self.kind.opposite();
        std::mem::swap(
            &mut self.options.sctp_in_streams,
            &mut self.options.sctp_out_streams,
        );
        self.name = self.kind.name().to_string();
    }

    /// Rewrite into a no-op, keeping ids so the transaction shape is preserved
    pub fn mask(&mut self) {
        self.kind = FlowopType::Nop;
        self.name = FlowopType::Nop.name().to_string();
    }

    /// Bytes moved by one repetition, for buffer sizing
    pub fn transfer_size(&self) -> u32 {
        if self.options.flag.random_size() {
            self.options.rand_sz_max.max(self.options.size)
        } else {
            self.options.size
        }
    }
}
