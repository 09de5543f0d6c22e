//! Handshake state machine
//!
//! One handshake runs per control connection, and a control connection carries exactly
//! one group to one slave:
//!
//! 1. **Phase 1.** The master announces magic, data version, its endian tag and the
//!    protocols the group uses. The slave checks them and answers OK or NOT_OK with a
//!    reason. A slave whose byte order differs from the master's sets bitswap for the
//!    rest of the session.
//! 2. **Phase 2.** The master sends a second header, the group tree (flowops addressed
//!    to other hosts masked to no-ops) and the ports of its pre-bound listeners. The
//!    slave turns the group into its complementary role, binds its own listeners and
//!    replies with its ports.
//! 3. **Phase 3.** An empty acknowledgment in each direction, so that neither side
//!    releases a barrier before the other has finished setting up.
//!
//! The master side is split per phase because the master runs phase 1 on every
//! connection before any phase 2.

use super::protocol::{
    encode_group, read_group, HandshakeAck, Phase2Ack, PhaseHeader, SlaveInfo, PHASE_1,
    PHASE_2, UPERF_DATA_VERSION, UPERF_MAGIC,
};
use super::wire::{
    check_count, ensure_write, read_record, write_record, write_record_as, Endian,
};
use crate::transport::TransportProvider;
use crate::workload::{Group, Protocol, MAX_STRANDS};
use crate::Result;
use anyhow::Context;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Reasons a handshake is refused
///
/// The `Display` text is what travels to the peer in the NOT_OK acknowledgment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Wrong magic")]
    BadMagic,
    #[error("Version {ours} is incompatible with master data version {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("Unsupported protocol:{0}")]
    UnsupportedProtocol(String),
    #[error("{0}")]
    Rejected(String),
    #[error("Malformed handshake: {0}")]
    Malformed(String),
}

/// Check a phase header against what this side can run
pub fn validate_header(
    header: &PhaseHeader,
    provider: &dyn TransportProvider,
) -> std::result::Result<(), HandshakeError> {
    if header.magic != UPERF_MAGIC {
        return Err(HandshakeError::BadMagic);
    }
    if header.version != UPERF_DATA_VERSION {
        return Err(HandshakeError::VersionMismatch {
            ours: UPERF_DATA_VERSION.to_string(),
            theirs: header.version.clone(),
        });
    }
    for slot in header.requested_slots() {
        match Protocol::from_wire(slot as u32) {
            Some(p) if provider.supports(p) => {}
            Some(p) => return Err(HandshakeError::UnsupportedProtocol(p.name().to_string())),
            None => return Err(HandshakeError::UnsupportedProtocol("Unknown".to_string())),
        }
    }
    Ok(())
}

fn check_ack(host: &str, ack: &HandshakeAck) -> Result<()> {
    if ack.is_ok() {
        return Ok(());
    }
    Err(HandshakeError::Rejected(ack.message.clone()))
        .with_context(|| format!("Error while handshaking with {}", host))
}

// ---------------------------------------------------------------------------
// Master side
// ---------------------------------------------------------------------------

/// Phase 1 with the slave at `host`
pub async fn master_phase1<S, I>(
    stream: &mut S,
    host: &str,
    local: &str,
    protocols: I,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: IntoIterator<Item = Protocol>,
{
    let header = PhaseHeader::new(PHASE_1, local).with_protocols(protocols);
    write_record(stream, &header)
        .await
        .with_context(|| format!("Error sending phase 1 to {}", host))?;
    let ack: HandshakeAck = read_record(stream, Endian::Same)
        .await
        .with_context(|| format!("Error reading phase 1 reply from {}", host))?;
    check_ack(host, &ack)
}

/// Phase 2 with the slave at `host`
///
/// Sends the group as the slave should see it and the master's listener ports, and
/// returns the slave's listener ports tagged with `host`.
pub async fn master_phase2<S>(
    stream: &mut S,
    host: &str,
    local: &str,
    group: &Group,
    master_info: &[SlaveInfo],
) -> Result<Vec<SlaveInfo>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let masked = group.masked_for_host(host);
    let mut header = PhaseHeader::new(PHASE_2, local).with_protocols(masked.protocols());
    header.no_slave_info = master_info.len() as u32;

    write_record(stream, &header).await?;
    ensure_write(stream, &encode_group(&masked))
        .await
        .with_context(|| format!("Error sending group '{}' to {}", group.name, host))?;
    for si in master_info {
        write_record(stream, si).await?;
    }
    debug!(
        "Sent group '{}' and {} slave infos to {}",
        group.name,
        master_info.len(),
        host
    );

    let reply: Phase2Ack = read_record(stream, Endian::Same)
        .await
        .with_context(|| format!("Error reading phase 2 reply from {}", host))?;
    check_ack(host, &reply.ack)?;

    let ninfo = check_count("slave info", reply.no_slave_info, group.nthreads as usize)
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
        .with_context(|| format!("Bad phase 2 reply from {}", host))?;
    let mut infos = Vec::with_capacity(ninfo);
    for _ in 0..ninfo {
        let mut si: SlaveInfo = read_record(stream, Endian::Same).await?;
        si.host = host.to_string();
        infos.push(si);
    }
    Ok(infos)
}

/// Phase 3 with the slave at `host`
pub async fn master_phase3<S>(stream: &mut S, host: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_record(stream, &HandshakeAck::ok())
        .await
        .with_context(|| format!("Error handshaking P3 with {}", host))?;
    let _ack: HandshakeAck = read_record(stream, Endian::Same)
        .await
        .with_context(|| format!("Error handshaking P3 with {}", host))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Slave side
// ---------------------------------------------------------------------------

/// What a slave learns from phases 1 and 2
#[derive(Debug)]
pub struct SlavePlan {
    /// The group rewritten into the slave's complementary role
    pub group: Group,
    /// Byte order of the master relative to ours
    pub endian: Endian,
    /// The master's listener ports, one per strand, tagged with the master's address
    pub master_info: Vec<SlaveInfo>,
}

/// Run phases 1 and 2 up to the point where the slave must reply with its own ports
///
/// `peer` is the master's address as seen on the control connection. Refusals are
/// answered on the wire before the error is returned.
pub async fn slave_receive_plan<S>(
    stream: &mut S,
    peer: &str,
    provider: &dyn TransportProvider,
) -> Result<SlavePlan>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let raw: PhaseHeader = read_record(stream, Endian::Same)
            .await
            .context("Cannot read handshake header")?;
        let Some(endian) = Endian::from_tag(raw.endian) else {
            let err = HandshakeError::Malformed(format!("endian tag {:#x}", raw.endian));
            write_record(stream, &HandshakeAck::not_ok(err.to_string())).await?;
            return Err(err.into());
        };
        if endian.is_swapped() {
            debug!("Master has a different endian type");
        }
        let header = super::wire::normalize(raw, endian);
        let verdict = validate_header(&header, provider);

        match header.phase {
            PHASE_2 => {
                // nothing after a refused header is read
                if let Err(e) = verdict {
                    slave_phase2_reject(stream, endian, &e.to_string()).await?;
                    return Err(e.into());
                }
                let ninfo = match check_count("slave info", header.no_slave_info, MAX_STRANDS) {
                    Ok(n) => n,
                    Err(e) => {
                        let err = HandshakeError::Malformed(e.to_string());
                        slave_phase2_reject(stream, endian, &err.to_string()).await?;
                        return Err(err.into());
                    }
                };
                let mut group = read_group(stream, endian).await?;
                if ninfo > group.nthreads as usize {
                    let err = HandshakeError::Malformed(format!(
                        "{} slave infos for {} strands",
                        ninfo, group.nthreads
                    ));
                    slave_phase2_reject(stream, endian, &err.to_string()).await?;
                    return Err(err.into());
                }
                let mut master_info = Vec::with_capacity(ninfo);
                for _ in 0..ninfo {
                    let mut si: SlaveInfo = read_record(stream, endian).await?;
                    si.host = peer.to_string();
                    master_info.push(si);
                }
                group.prepare_for_slave(peer);
                info!(
                    "Received group '{}' ({} strands, {} txns) from {}",
                    group.name,
                    group.nthreads,
                    group.txns.len(),
                    peer
                );
                return Ok(SlavePlan {
                    group,
                    endian,
                    master_info,
                });
            }
            PHASE_1 => {
                let ack = match &verdict {
                    Ok(()) => HandshakeAck::ok(),
                    Err(e) => HandshakeAck::not_ok(e.to_string()),
                };
                write_record_as(stream, &ack, endian).await?;
                if let Err(e) = verdict {
                    return Err(e).with_context(|| format!("Refused handshake from {}", peer));
                }
            }
            other => {
                let err = HandshakeError::Malformed(format!("unexpected phase {}", other));
                write_record_as(stream, &HandshakeAck::not_ok(err.to_string()), endian).await?;
                return Err(err.into());
            }
        }
    }
}

/// Finish phase 2 with the slave's own listener ports
pub async fn slave_phase2_accept<S>(
    stream: &mut S,
    endian: Endian,
    infos: &[SlaveInfo],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = Phase2Ack {
        ack: HandshakeAck::ok(),
        no_slave_info: infos.len() as u32,
    };
    write_record_as(stream, &reply, endian).await?;
    for si in infos {
        write_record_as(stream, si, endian).await?;
    }
    Ok(())
}

/// Finish phase 2 with a refusal
pub async fn slave_phase2_reject<S>(stream: &mut S, endian: Endian, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = Phase2Ack {
        ack: HandshakeAck::not_ok(message),
        no_slave_info: 0,
    };
    write_record_as(stream, &reply, endian).await
}

pub async fn slave_phase3<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ack: HandshakeAck = read_record(stream, Endian::Same)
        .await
        .context("Error in handshake end")?;
    write_record(stream, &ack).await.context("Error in handshake end")
}
