//! Control-channel protocol
//!
//! This module defines every record exchanged between the master and a slave over the
//! control connection, together with their fixed binary layouts (see [`super::wire`]).
//!
//! # Message Flow
//!
//! ```text
//! Master                                  Slave
//!   |                                       |
//!   |--- PHASE1 (magic, version, protos) -->|
//!   |<-------------- ACK (OK / Not OK) -----|
//!   |                                       |
//!   |--- PHASE2 header ------------------->|   once per group
//!   |--- group, txns, flowops ------------>|
//!   |--- SlaveInfo[] (master listeners) -->|
//!   |<-------------- P2 ACK + SlaveInfo[] -|
//!   |                                       |
//!   |--- PHASE3 ACK ---------------------->|
//!   |<------------------------ PHASE3 ACK -|
//!   |                                       |
//!   |--- COMMAND(NEXT_TXN, i) ------------>|   once per transaction
//!   |--- COMMAND(SEND_STATS | ABORT) ----->|
//!   |<--------------------------- GOODBYE -|
//! ```
//!
//! # Layouts
//!
//! | Record | Size |
//! |---|---|
//! | `PhaseHeader` | 496 |
//! | `HandshakeAck` | 192 |
//! | `Phase2Ack` | 200 |
//! | `SlaveInfo` | 288 |
//! | `GroupWire` / `TxnWire` / `FlowopWire` | 88 / 96 / 1088 |
//! | `CommandMessage` | 72 |
//! | `GoodbyeMessage` | 616 |

use super::wire::{
    check_count, ensure_read, normalize, read_record, write_record, ByteSwap, Endian, WireError,
    WireReader, WireRecord, WireWriter, ENDIAN_VALUE,
};
use crate::workload::{
    Flowop, FlowopFlags, FlowopOptions, FlowopType, Group, Protocol, StrandKind, Txn,
    MAX_FLOWOPS, MAX_STRANDS, NUM_BARRIER, NUM_PROTOCOLS,
};
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};

/// Data-layout version; master and slave must match exactly
pub const UPERF_DATA_VERSION: &str = "0.3";

/// Handshake magic
pub const UPERF_MAGIC: &str = "0xbadcafedeadbeef";

/// Command magic
pub const COMMAND_MAGIC: &str = "uperf_command";

/// Goodbye magic
pub const GOODBYE_MAGIC: &str = "So Long, and Thanks for All the Fish";

/// Default control port of a slave
pub const MASTER_PORT: u16 = 20000;

pub const STATUS_OK: &str = "OK";
pub const STATUS_NOT_OK: &str = "Not OK";

pub const MAGIC_LEN: usize = 64;
pub const VERSION_LEN: usize = 128;
pub const HOST_LEN: usize = 256;
pub const NAME_LEN: usize = 64;
pub const STATUS_LEN: usize = 64;
pub const ACK_MESSAGE_LEN: usize = 128;
pub const GOODBYE_MESSAGE_LEN: usize = 512;
const PATH_LEN: usize = 256;

/// Handshake phase numbers
pub const PHASE_1: u32 = 1;
pub const PHASE_2: u32 = 2;

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Header shared by phase-1 and phase-2 requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseHeader {
    pub magic: String,
    pub endian: u32,
    pub phase: u32,
    /// SlaveInfo entries that follow the group tree (phase 2 only)
    pub no_slave_info: u32,
    /// One flag per protocol slot
    pub protocols: [u32; NUM_PROTOCOLS],
    pub version: String,
    pub host: String,
}

impl PhaseHeader {
    pub fn new(phase: u32, host: &str) -> Self {
        Self {
            magic: UPERF_MAGIC.to_string(),
            endian: ENDIAN_VALUE,
            phase,
            no_slave_info: 0,
            protocols: [0; NUM_PROTOCOLS],
            version: UPERF_DATA_VERSION.to_string(),
            host: host.to_string(),
        }
    }

    pub fn with_protocols<I: IntoIterator<Item = Protocol>>(mut self, protos: I) -> Self {
        for p in protos {
            self.protocols[p.index()] = 1;
        }
        self
    }

    /// Requested protocol slots, in slot order
    pub fn requested_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.protocols
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, _)| i)
    }
}

impl WireRecord for PhaseHeader {
    const SIZE: usize = MAGIC_LEN + 16 + 4 * NUM_PROTOCOLS + VERSION_LEN + HOST_LEN;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.magic, MAGIC_LEN);
        w.u32(self.endian);
        w.u32(self.phase);
        w.u32(self.no_slave_info);
        w.u32(0);
        for p in &self.protocols {
            w.u32(*p);
        }
        w.str(&self.version, VERSION_LEN);
        w.str(&self.host, HOST_LEN);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let magic = r.str(MAGIC_LEN)?;
        let endian = r.u32()?;
        let phase = r.u32()?;
        let no_slave_info = r.u32()?;
        let _padding = r.u32()?;
        let mut protocols = [0u32; NUM_PROTOCOLS];
        for p in &mut protocols {
            *p = r.u32()?;
        }
        Ok(Self {
            magic,
            endian,
            phase,
            no_slave_info,
            protocols,
            version: r.str(VERSION_LEN)?,
            host: r.str(HOST_LEN)?,
        })
    }
}

impl ByteSwap for PhaseHeader {
    fn byteswap(&mut self) {
        self.endian = self.endian.swap_bytes();
        self.phase = self.phase.swap_bytes();
        self.no_slave_info = self.no_slave_info.swap_bytes();
        for p in &mut self.protocols {
            *p = p.swap_bytes();
        }
    }
}

/// Status reply to a phase request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAck {
    pub status: String,
    pub message: String,
}

impl HandshakeAck {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
            message: String::new(),
        }
    }

    pub fn not_ok(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_NOT_OK.to_string(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

impl WireRecord for HandshakeAck {
    const SIZE: usize = STATUS_LEN + ACK_MESSAGE_LEN;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.status, STATUS_LEN);
        w.str(&self.message, ACK_MESSAGE_LEN);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            status: r.str(STATUS_LEN)?,
            message: r.str(ACK_MESSAGE_LEN)?,
        })
    }
}

impl ByteSwap for HandshakeAck {
    fn byteswap(&mut self) {}
}

/// Phase-2 reply: status plus the count of SlaveInfo entries that follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase2Ack {
    pub ack: HandshakeAck,
    pub no_slave_info: u32,
}

impl WireRecord for Phase2Ack {
    const SIZE: usize = HandshakeAck::SIZE + 8;

    fn encode(&self, w: &mut WireWriter) {
        self.ack.encode(w);
        w.u32(self.no_slave_info);
        w.u32(0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let ack = HandshakeAck::decode(r)?;
        let no_slave_info = r.u32()?;
        let _padding = r.u32()?;
        Ok(Self { ack, no_slave_info })
    }
}

impl ByteSwap for Phase2Ack {
    fn byteswap(&mut self) {
        self.no_slave_info = self.no_slave_info.swap_bytes();
    }
}

/// Listening ports pre-bound for one strand's accept flowops
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlaveInfo {
    pub host: String,
    /// Port per protocol slot, 0 when not listening
    pub ports: [u32; NUM_PROTOCOLS],
}

impl SlaveInfo {
    pub fn port(&self, protocol: Protocol) -> Option<u16> {
        match self.ports[protocol.index()] {
            0 => None,
            p => u16::try_from(p).ok(),
        }
    }
}

impl WireRecord for SlaveInfo {
    const SIZE: usize = HOST_LEN + 4 * NUM_PROTOCOLS;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.host, HOST_LEN);
        for p in &self.ports {
            w.u32(*p);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let host = r.str(HOST_LEN)?;
        let mut ports = [0u32; NUM_PROTOCOLS];
        for p in &mut ports {
            *p = r.u32()?;
        }
        Ok(Self { host, ports })
    }
}

impl ByteSwap for SlaveInfo {
    fn byteswap(&mut self) {
        for p in &mut self.ports {
            *p = p.swap_bytes();
        }
    }
}

// ---------------------------------------------------------------------------
// Group tree
// ---------------------------------------------------------------------------

/// Group header as laid out on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupWire {
    pub name: String,
    pub id: u32,
    pub kind: u32,
    pub nthreads: u32,
    pub max_async: u32,
    pub ntxn: u32,
}

impl From<&Group> for GroupWire {
    fn from(g: &Group) -> Self {
        Self {
            name: g.name.clone(),
            id: g.id,
            kind: g.kind as u32,
            nthreads: g.nthreads,
            max_async: g.max_async,
            ntxn: g.txns.len() as u32,
        }
    }
}

impl GroupWire {
    /// Bound the strand and transaction counts; returns the transaction count
    pub fn check_counts(&self) -> Result<usize, WireError> {
        if self.nthreads == 0 {
            return Err(WireError::BadCount {
                field: "strand",
                value: 0,
                max: MAX_STRANDS,
            });
        }
        check_count("strand", self.nthreads, MAX_STRANDS)?;
        check_count("transaction", self.ntxn, NUM_BARRIER)
    }
}

impl WireRecord for GroupWire {
    const SIZE: usize = NAME_LEN + 24;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.name, NAME_LEN);
        w.u32(self.id);
        w.u32(self.kind);
        w.u32(self.nthreads);
        w.u32(self.max_async);
        w.u32(self.ntxn);
        w.u32(0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let g = Self {
            name: r.str(NAME_LEN)?,
            id: r.u32()?,
            kind: r.u32()?,
            nthreads: r.u32()?,
            max_async: r.u32()?,
            ntxn: r.u32()?,
        };
        let _padding = r.u32()?;
        Ok(g)
    }
}

impl ByteSwap for GroupWire {
    fn byteswap(&mut self) {
        self.id = self.id.swap_bytes();
        self.kind = self.kind.swap_bytes();
        self.nthreads = self.nthreads.swap_bytes();
        self.max_async = self.max_async.swap_bytes();
        self.ntxn = self.ntxn.swap_bytes();
    }
}

/// Transaction header as laid out on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnWire {
    pub name: String,
    pub id: u32,
    pub nflowop: u32,
    pub rate_count: u32,
    pub iterations: u64,
    pub duration_ns: u64,
}

impl From<&Txn> for TxnWire {
    fn from(t: &Txn) -> Self {
        Self {
            name: t.name.clone(),
            id: t.id,
            nflowop: t.flowops.len() as u32,
            rate_count: t.rate_count,
            iterations: t.iterations,
            duration_ns: t.duration_ns,
        }
    }
}

impl WireRecord for TxnWire {
    const SIZE: usize = NAME_LEN + 32;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.name, NAME_LEN);
        w.u32(self.id);
        w.u32(self.nflowop);
        w.u32(self.rate_count);
        w.u32(0);
        w.u64(self.iterations);
        w.u64(self.duration_ns);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let name = r.str(NAME_LEN)?;
        let id = r.u32()?;
        let nflowop = r.u32()?;
        let rate_count = r.u32()?;
        let _padding = r.u32()?;
        Ok(Self {
            name,
            id,
            nflowop,
            rate_count,
            iterations: r.u64()?,
            duration_ns: r.u64()?,
        })
    }
}

impl ByteSwap for TxnWire {
    fn byteswap(&mut self) {
        self.id = self.id.swap_bytes();
        self.nflowop = self.nflowop.swap_bytes();
        self.rate_count = self.rate_count.swap_bytes();
        self.iterations = self.iterations.swap_bytes();
        self.duration_ns = self.duration_ns.swap_bytes();
    }
}

/// Flowop record as laid out on the wire
///
/// Type and protocol stay raw numbers until the record has been byte-order normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowopWire {
    pub name: String,
    pub kind: u32,
    pub connection_id: u32,
    pub protocol: u32,
    pub options: FlowopOptions,
}

impl From<&Flowop> for FlowopWire {
    fn from(f: &Flowop) -> Self {
        Self {
            name: f.name.clone(),
            kind: f.kind as u32,
            connection_id: f.connection_id,
            protocol: f.options.protocol as u32,
            options: f.options.clone(),
        }
    }
}

impl TryFrom<FlowopWire> for Flowop {
    type Error = WireError;

    fn try_from(w: FlowopWire) -> Result<Self, WireError> {
        let kind = FlowopType::from_wire(w.kind).ok_or(WireError::BadEnum {
            field: "flowop type",
            value: u64::from(w.kind),
        })?;
        let protocol = Protocol::from_wire(w.protocol).ok_or(WireError::BadEnum {
            field: "protocol",
            value: u64::from(w.protocol),
        })?;
        let mut options = w.options;
        options.protocol = protocol;
        Ok(Flowop {
            name: w.name,
            kind,
            connection_id: w.connection_id,
            options,
        })
    }
}

impl WireRecord for FlowopWire {
    const SIZE: usize =
        NAME_LEN + 8 + 40 + 32 + 8 + 32 + 32 + PATH_LEN + 2 * HOST_LEN + 32 + 64 + 8;

    fn encode(&self, w: &mut WireWriter) {
        let o = &self.options;
        w.str(&self.name, NAME_LEN);
        w.u32(self.kind);
        w.u32(self.connection_id);

        w.u32(o.size);
        w.u32(o.rand_sz_min);
        w.u32(o.rand_sz_max);
        w.u32(o.rsize);
        w.u32(self.protocol);
        w.u32(o.port);
        w.u32(o.flag.0);
        w.u32(o.nfiles);
        w.u32(o.encaps_port);
        w.u32(0);

        w.u64(o.duration);
        w.u64(o.wndsz);
        w.u64(o.count);
        w.u64(o.poll_timeout);

        w.u16(o.sctp_out_streams);
        w.u16(o.sctp_in_streams);
        w.u16(o.sctp_stream_id);
        w.u16(0);

        w.str(&o.cc, 32);
        w.str(&o.stack, 32);
        w.str(&o.dir, PATH_LEN);
        w.str(&o.remotehost, HOST_LEN);
        w.str(&o.localhost, HOST_LEN);
        w.str(&o.engine, 32);
        w.str(&o.cipher, 64);
        w.str(&o.method, 8);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let name = r.str(NAME_LEN)?;
        let kind = r.u32()?;
        let connection_id = r.u32()?;

        let size = r.u32()?;
        let rand_sz_min = r.u32()?;
        let rand_sz_max = r.u32()?;
        let rsize = r.u32()?;
        let protocol = r.u32()?;
        let port = r.u32()?;
        let flag = FlowopFlags(r.u32()?);
        let nfiles = r.u32()?;
        let encaps_port = r.u32()?;
        let _padding = r.u32()?;

        let duration = r.u64()?;
        let wndsz = r.u64()?;
        let count = r.u64()?;
        let poll_timeout = r.u64()?;

        let sctp_out_streams = r.u16()?;
        let sctp_in_streams = r.u16()?;
        let sctp_stream_id = r.u16()?;
        let _padding = r.u16()?;

        let options = FlowopOptions {
            size,
            rand_sz_min,
            rand_sz_max,
            rsize,
            protocol: Protocol::default(),
            port,
            flag,
            nfiles,
            encaps_port,
            duration,
            wndsz,
            count,
            poll_timeout,
            sctp_out_streams,
            sctp_in_streams,
            sctp_stream_id,
            cc: r.str(32)?,
            stack: r.str(32)?,
            dir: r.str(PATH_LEN)?,
            remotehost: r.str(HOST_LEN)?,
            localhost: r.str(HOST_LEN)?,
            engine: r.str(32)?,
            cipher: r.str(64)?,
            method: r.str(8)?,
        };

        Ok(Self {
            name,
            kind,
            connection_id,
            protocol,
            options,
        })
    }
}

impl ByteSwap for FlowopWire {
    fn byteswap(&mut self) {
        self.kind = self.kind.swap_bytes();
        self.connection_id = self.connection_id.swap_bytes();
        self.protocol = self.protocol.swap_bytes();
        let o = &mut self.options;
        o.size = o.size.swap_bytes();
        o.rand_sz_min = o.rand_sz_min.swap_bytes();
        o.rand_sz_max = o.rand_sz_max.swap_bytes();
        o.rsize = o.rsize.swap_bytes();
        o.port = o.port.swap_bytes();
        o.flag = FlowopFlags(o.flag.0.swap_bytes());
        o.nfiles = o.nfiles.swap_bytes();
        o.encaps_port = o.encaps_port.swap_bytes();
        o.duration = o.duration.swap_bytes();
        o.wndsz = o.wndsz.swap_bytes();
        o.count = o.count.swap_bytes();
        o.poll_timeout = o.poll_timeout.swap_bytes();
        o.sctp_out_streams = o.sctp_out_streams.swap_bytes();
        o.sctp_in_streams = o.sctp_in_streams.swap_bytes();
        o.sctp_stream_id = o.sctp_stream_id.swap_bytes();
    }
}

/// Serialize a group depth-first: group header, then per txn its header and flowops
pub fn encode_group(g: &Group) -> Vec<u8> {
    let size = GroupWire::SIZE
        + g.txns
            .iter()
            .map(|t| TxnWire::SIZE + t.flowops.len() * FlowopWire::SIZE)
            .sum::<usize>();
    let mut w = WireWriter::with_capacity(size);
    GroupWire::from(g).encode(&mut w);
    for t in &g.txns {
        TxnWire::from(t).encode(&mut w);
        for f in &t.flowops {
            FlowopWire::from(f).encode(&mut w);
        }
    }
    w.into_inner()
}

/// Decode a depth-first group tree from a complete buffer
pub fn decode_group(buf: &[u8], endian: Endian) -> Result<Group, WireError> {
    let mut r = WireReader::new(buf);
    let header = normalize(GroupWire::decode(&mut r)?, endian);
    let ntxn = header.check_counts()?;
    let mut txns = Vec::with_capacity(ntxn);
    for _ in 0..ntxn {
        let th = normalize(TxnWire::decode(&mut r)?, endian);
        let nflowop = check_count("flowop", th.nflowop, MAX_FLOWOPS)?;
        let mut flowops = Vec::with_capacity(nflowop);
        for _ in 0..nflowop {
            let fw = normalize(FlowopWire::decode(&mut r)?, endian);
            flowops.push(Flowop::try_from(fw)?);
        }
        txns.push(txn_from_wire(th, flowops));
    }
    group_from_wire(header, txns)
}

/// Read a depth-first group tree from the control connection
pub async fn read_group<S>(stream: &mut S, endian: Endian) -> Result<Group>
where
    S: AsyncRead + Unpin,
{
    let header: GroupWire = read_record(stream, endian)
        .await
        .context("Failed to read group header")?;
    let ntxn = header.check_counts()?;
    let mut txns = Vec::with_capacity(ntxn);
    for i in 0..ntxn {
        let th: TxnWire = read_record(stream, endian).await.with_context(|| {
            format!("Failed to read transaction {} of group '{}'", i, header.name)
        })?;
        let nflowop = check_count("flowop", th.nflowop, MAX_FLOWOPS)?;
        let mut flowops = Vec::with_capacity(nflowop);
        for _ in 0..nflowop {
            let fw: FlowopWire = read_record(stream, endian)
                .await
                .with_context(|| format!("Failed to read flowop of transaction '{}'", th.name))?;
            flowops.push(Flowop::try_from(fw)?);
        }
        txns.push(txn_from_wire(th, flowops));
    }
    Ok(group_from_wire(header, txns)?)
}

fn txn_from_wire(th: TxnWire, flowops: Vec<Flowop>) -> Txn {
    Txn {
        id: th.id,
        name: th.name,
        iterations: th.iterations,
        duration_ns: th.duration_ns,
        rate_count: th.rate_count,
        flowops,
    }
}

fn group_from_wire(header: GroupWire, txns: Vec<Txn>) -> Result<Group, WireError> {
    let kind = StrandKind::from_wire(header.kind).ok_or(WireError::BadEnum {
        field: "strand kind",
        value: u64::from(header.kind),
    })?;
    Ok(Group {
        id: header.id,
        name: header.name,
        kind,
        nthreads: header.nthreads,
        max_async: header.max_async,
        txns,
    })
}

// ---------------------------------------------------------------------------
// Commands and goodbye
// ---------------------------------------------------------------------------

/// Command sent by the master while a run is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    /// Release the barrier of the transaction named by `value`
    NextTxn = 0,
    Abort = 1,
    SendStats = 2,
    Error = 3,
}

impl CommandKind {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(CommandKind::NextTxn),
            1 => Some(CommandKind::Abort),
            2 => Some(CommandKind::SendStats),
            3 => Some(CommandKind::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub magic: String,
    pub command: u32,
    pub value: u32,
}

impl CommandMessage {
    pub fn new(kind: CommandKind, value: u32) -> Self {
        Self {
            magic: COMMAND_MAGIC.to_string(),
            command: kind as u32,
            value,
        }
    }

    pub fn kind(&self) -> Result<CommandKind, WireError> {
        if self.magic != COMMAND_MAGIC {
            return Err(WireError::BadMagic(self.magic.clone()));
        }
        CommandKind::from_wire(self.command).ok_or(WireError::BadEnum {
            field: "command",
            value: u64::from(self.command),
        })
    }
}

impl WireRecord for CommandMessage {
    const SIZE: usize = MAGIC_LEN + 8;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.magic, MAGIC_LEN);
        w.u32(self.command);
        w.u32(self.value);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            magic: r.str(MAGIC_LEN)?,
            command: r.u32()?,
            value: r.u32()?,
        })
    }
}

impl ByteSwap for CommandMessage {
    fn byteswap(&mut self) {
        self.command = self.command.swap_bytes();
        self.value = self.value.swap_bytes();
    }
}

/// Classification of a goodbye
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum GoodbyeKind {
    Error = 0xaa,
    Warning = 0xbb,
    Info = 0xcc,
    None = 0xdd,
}

impl GoodbyeKind {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0xaa => Some(GoodbyeKind::Error),
            0xbb => Some(GoodbyeKind::Warning),
            0xcc => Some(GoodbyeKind::Info),
            0xdd => Some(GoodbyeKind::None),
            _ => None,
        }
    }
}

/// Aggregate statistics carried in a goodbye
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct GoodbyeStats {
    /// Nanoseconds
    pub elapsed_time: u64,
    pub error: u64,
    pub bytes_xfer: u64,
    pub count: u64,
}

impl GoodbyeStats {
    /// Fold another host's totals in: longest elapsed time, summed counters
    pub fn merge(&mut self, other: &GoodbyeStats) {
        self.elapsed_time = self.elapsed_time.max(other.elapsed_time);
        self.error += other.error;
        self.bytes_xfer += other.bytes_xfer;
        self.count += other.count;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodbyeMessage {
    pub magic: String,
    pub msg_type: u64,
    pub stats: GoodbyeStats,
    pub message: String,
}

impl GoodbyeMessage {
    pub fn new(kind: GoodbyeKind, stats: GoodbyeStats, message: impl Into<String>) -> Self {
        Self {
            magic: GOODBYE_MAGIC.to_string(),
            msg_type: kind as u64,
            stats,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Result<GoodbyeKind, WireError> {
        if self.magic != GOODBYE_MAGIC {
            return Err(WireError::BadMagic(self.magic.clone()));
        }
        GoodbyeKind::from_wire(self.msg_type).ok_or(WireError::BadEnum {
            field: "goodbye type",
            value: self.msg_type,
        })
    }
}

impl WireRecord for GoodbyeMessage {
    const SIZE: usize = MAGIC_LEN + 40 + GOODBYE_MESSAGE_LEN;

    fn encode(&self, w: &mut WireWriter) {
        w.str(&self.magic, MAGIC_LEN);
        w.u64(self.msg_type);
        w.u64(self.stats.elapsed_time);
        w.u64(self.stats.error);
        w.u64(self.stats.bytes_xfer);
        w.u64(self.stats.count);
        w.str(&self.message, GOODBYE_MESSAGE_LEN);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            magic: r.str(MAGIC_LEN)?,
            msg_type: r.u64()?,
            stats: GoodbyeStats {
                elapsed_time: r.u64()?,
                error: r.u64()?,
                bytes_xfer: r.u64()?,
                count: r.u64()?,
            },
            message: r.str(GOODBYE_MESSAGE_LEN)?,
        })
    }
}

impl ByteSwap for GoodbyeMessage {
    fn byteswap(&mut self) {
        self.msg_type = self.msg_type.swap_bytes();
        let s = &mut self.stats;
        s.elapsed_time = s.elapsed_time.swap_bytes();
        s.error = s.error.swap_bytes();
        s.bytes_xfer = s.bytes_xfer.swap_bytes();
        s.count = s.count.swap_bytes();
    }
}

/// Unsolicited record arriving on a control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(CommandMessage),
    Goodbye(GoodbyeMessage),
}

/// Read whichever record comes next, dispatching on its magic
pub async fn read_inbound<S>(stream: &mut S, endian: Endian) -> Result<Inbound>
where
    S: AsyncRead + Unpin,
{
    let mut magic = vec![0u8; MAGIC_LEN];
    ensure_read(stream, &mut magic).await?;
    let tag = WireReader::new(&magic).str(MAGIC_LEN)?;

    let size = match tag.as_str() {
        COMMAND_MAGIC => CommandMessage::SIZE,
        GOODBYE_MAGIC => GoodbyeMessage::SIZE,
        _ => return Err(WireError::BadMagic(tag).into()),
    };
    let mut buf = magic;
    buf.resize(size, 0);
    ensure_read(stream, &mut buf[MAGIC_LEN..]).await?;

    Ok(if tag == COMMAND_MAGIC {
        Inbound::Command(normalize(CommandMessage::from_bytes(&buf)?, endian))
    } else {
        Inbound::Goodbye(normalize(GoodbyeMessage::from_bytes(&buf)?, endian))
    })
}

pub async fn send_command<S>(stream: &mut S, kind: CommandKind, value: u32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_record(stream, &CommandMessage::new(kind, value))
        .await
        .with_context(|| format!("Failed to send command {:?}({})", kind, value))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workload::tests::two_host_group;

    fn rich_group() -> Group {
        let mut g = two_host_group();
        g.kind = StrandKind::Process;
        g.max_async = 4;
        g.txns[1].duration_ns = 2_000_000_000;
        g.txns[1].rate_count = 250;
        let o = &mut g.txns[1].flowops[0].options;
        o.size = 0x0102_0304;
        o.rand_sz_min = 10;
        o.rand_sz_max = 70000;
        o.flag = FlowopFlags(FlowopFlags::CANFAIL | FlowopFlags::SIZE_RAND);
        o.count = 0x0A0B_0C0D_0E0F_1011;
        o.sctp_in_streams = 0x0102;
        o.sctp_out_streams = 7;
        o.cc = "cubic".to_string();
        o.localhost = "10.1.1.1".to_string();
        g
    }

    /// Encode as a peer with the opposite byte order would
    pub(crate) fn encode_group_foreign(g: &Group) -> Vec<u8> {
        let mut w = WireWriter::default();
        let mut gw = GroupWire::from(g);
        gw.byteswap();
        gw.encode(&mut w);
        for t in &g.txns {
            let mut tw = TxnWire::from(t);
            tw.byteswap();
            tw.encode(&mut w);
            for f in &t.flowops {
                let mut fw = FlowopWire::from(f);
                fw.byteswap();
                fw.encode(&mut w);
            }
        }
        w.into_inner()
    }

    #[test]
    fn test_record_sizes_match_layout() {
        assert_eq!(PhaseHeader::new(PHASE_1, "h").to_bytes().len(), 496);
        assert_eq!(HandshakeAck::ok().to_bytes().len(), 192);
        assert_eq!(SlaveInfo::default().to_bytes().len(), 288);
        assert_eq!(CommandMessage::new(CommandKind::Abort, 0).to_bytes().len(), 72);
        let bye = GoodbyeMessage::new(GoodbyeKind::Info, GoodbyeStats::default(), "Success");
        assert_eq!(bye.to_bytes().len(), 616);
        let f = Flowop::new(FlowopType::Read, FlowopOptions::default());
        assert_eq!(FlowopWire::from(&f).to_bytes().len(), FlowopWire::SIZE);
    }

    #[test]
    fn test_group_tree_round_trip() {
        let g = rich_group();
        let bytes = encode_group(&g);
        let decoded = decode_group(&bytes, Endian::Same).unwrap();
        assert_eq!(decoded, g);
    }

    #[test]
    fn test_group_tree_from_foreign_endian_peer() {
        let g = rich_group();
        let foreign = encode_group_foreign(&g);
        assert_ne!(foreign, encode_group(&g));

        let decoded = decode_group(&foreign, Endian::Swapped).unwrap();
        assert_eq!(decoded, g);
        // strings never swapped
        assert_eq!(decoded.txns[1].flowops[0].options.cc, "cubic");
    }

    #[test]
    fn test_decode_rejects_oversized_counts() {
        let g = two_host_group();
        let mut bytes = encode_group(&g);
        let mut header = GroupWire::from(&g);
        header.ntxn = u32::MAX;
        bytes[..GroupWire::SIZE].copy_from_slice(&header.to_bytes());
        assert_eq!(
            decode_group(&bytes, Endian::Same),
            Err(WireError::BadCount {
                field: "transaction",
                value: u64::from(u32::MAX),
                max: NUM_BARRIER,
            })
        );

        let mut header = GroupWire::from(&g);
        header.nthreads = 0;
        bytes[..GroupWire::SIZE].copy_from_slice(&header.to_bytes());
        assert!(matches!(
            decode_group(&bytes, Endian::Same),
            Err(WireError::BadCount { field: "strand", .. })
        ));

        let mut bytes = encode_group(&g);
        let mut txn = TxnWire::from(&g.txns[0]);
        txn.nflowop = u32::MAX;
        bytes[GroupWire::SIZE..GroupWire::SIZE + TxnWire::SIZE].copy_from_slice(&txn.to_bytes());
        assert!(matches!(
            decode_group(&bytes, Endian::Same),
            Err(WireError::BadCount { field: "flowop", .. })
        ));
    }

    #[tokio::test]
    async fn test_read_group_rejects_huge_transaction_count() {
        let g = two_host_group();
        let mut header = GroupWire::from(&g);
        header.ntxn = u32::MAX;
        let (mut a, mut b) = tokio::io::duplex(1 << 12);
        write_record(&mut a, &header).await.unwrap();
        let err = read_group(&mut b, Endian::Same).await.unwrap_err();
        assert!(err.to_string().contains("transaction count"));
    }

    #[test]
    fn test_phase_header_swap() {
        let h = PhaseHeader::new(PHASE_2, "master").with_protocols([Protocol::Tcp]);
        let mut foreign = h.clone();
        foreign.byteswap();
        let bytes = foreign.to_bytes();

        let raw = PhaseHeader::from_bytes(&bytes).unwrap();
        let endian = Endian::from_tag(raw.endian).unwrap();
        assert_eq!(endian, Endian::Swapped);
        assert_eq!(normalize(raw, endian), h);
    }

    #[test]
    fn test_command_kind_checks_magic() {
        let mut c = CommandMessage::new(CommandKind::NextTxn, 3);
        assert_eq!(c.kind(), Ok(CommandKind::NextTxn));
        c.magic = "bogus".to_string();
        assert!(matches!(c.kind(), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn test_goodbye_merge() {
        let mut total = GoodbyeStats {
            elapsed_time: 5,
            error: 1,
            bytes_xfer: 100,
            count: 10,
        };
        total.merge(&GoodbyeStats {
            elapsed_time: 9,
            error: 0,
            bytes_xfer: 50,
            count: 5,
        });
        assert_eq!(
            total,
            GoodbyeStats {
                elapsed_time: 9,
                error: 1,
                bytes_xfer: 150,
                count: 15
            }
        );
    }

    #[tokio::test]
    async fn test_read_group_over_stream_and_inbound_dispatch() {
        let g = rich_group();
        let (mut a, mut b) = tokio::io::duplex(1 << 16);

        super::super::wire::ensure_write(&mut a, &encode_group(&g)).await.unwrap();
        send_command(&mut a, CommandKind::SendStats, 0).await.unwrap();
        let bye = GoodbyeMessage::new(GoodbyeKind::Info, GoodbyeStats::default(), "Success");
        write_record(&mut a, &bye).await.unwrap();

        assert_eq!(read_group(&mut b, Endian::Same).await.unwrap(), g);
        match read_inbound(&mut b, Endian::Same).await.unwrap() {
            Inbound::Command(c) => assert_eq!(c.kind(), Ok(CommandKind::SendStats)),
            other => panic!("unexpected {:?}", other),
        }
        match read_inbound(&mut b, Endian::Same).await.unwrap() {
            Inbound::Goodbye(m) => {
                assert_eq!(m.kind(), Ok(GoodbyeKind::Info));
                assert_eq!(m.message, "Success");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
