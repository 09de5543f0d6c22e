//! Fixed-layout wire codec
//!
//! Every control-channel record has a fixed size and a fixed field order. Integers are
//! written in the sender's native byte order; strings are NUL-padded byte arrays of a
//! fixed width.
//!
//! # Byte order
//!
//! The master never converts anything. A slave learns the master's byte order from the
//! endian tag in the phase-1 header and, when it differs from its own, runs every record
//! through [`ByteSwap`] as it crosses the codec boundary: after decoding what it reads
//! and before encoding what it writes back. The master therefore always sees its own
//! byte order. Decoding and swapping are two separate stages so that swapping stays in
//! one place:
//!
//! ```text
//! raw bytes ──decode (native)──> record ──byteswap() if peer differs──> record
//! record ──byteswap() if peer differs──> record ──encode (native)──> raw bytes
//! ```
//!
//! # Ensure semantics
//!
//! [`ensure_read`] and [`ensure_write`] keep going until the whole record has been
//! transferred. A peer that closes mid-record surfaces as an error, never as a short
//! record.

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Tag written by every sender in its own byte order
pub const ENDIAN_VALUE: u32 = 0xBADC;

/// Codec-level failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unexpected magic '{0}'")]
    BadMagic(String),
    #[error("invalid {field} value {value}")]
    BadEnum { field: &'static str, value: u64 },
    #[error("{field} count {value} out of range (max {max})")]
    BadCount {
        field: &'static str,
        value: u64,
        max: usize,
    },
}

/// Reject a count read off the wire before anything is sized by it
pub fn check_count(field: &'static str, value: u32, max: usize) -> Result<usize, WireError> {
    let n = value as usize;
    if n > max {
        return Err(WireError::BadCount {
            field,
            value: u64::from(value),
            max,
        });
    }
    Ok(n)
}

/// Byte order relation to a peer, fixed once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Same,
    Swapped,
}

impl Endian {
    /// Classify a received endian tag
    pub fn from_tag(tag: u32) -> Option<Self> {
        if tag == ENDIAN_VALUE {
            Some(Endian::Same)
        } else if tag.swap_bytes() == ENDIAN_VALUE {
            Some(Endian::Swapped)
        } else {
            None
        }
    }

    pub fn is_swapped(self) -> bool {
        self == Endian::Swapped
    }
}

/// Reverse the byte order of every multi-byte numeric field in place
///
/// String fields are left alone. Applying the swap twice restores the original.
pub trait ByteSwap {
    fn byteswap(&mut self);
}

/// Swap `record` only when the peer's byte order differs
pub fn normalize<T: ByteSwap>(mut record: T, endian: Endian) -> T {
    if endian.is_swapped() {
        record.byteswap();
    }
    record
}

/// Fixed-size binary record
pub trait WireRecord: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn encode(&self, w: &mut WireWriter);

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(Self::SIZE);
        self.encode(&mut w);
        debug_assert_eq!(w.len(), Self::SIZE);
        w.into_inner()
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(buf);
        Self::decode(&mut r)
    }
}

/// Sequential writer of native-order fields
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write `s` into a NUL-padded field of `width` bytes
    ///
    /// Overlong strings are cut so that at least one terminating NUL remains.
    pub fn str(&mut self, s: &str, width: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width.saturating_sub(1));
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + (width - n), 0);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential reader of native-order fields
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_ne_bytes(a))
    }

    /// Read a NUL-padded string field of `width` bytes
    pub fn str(&mut self, width: usize) -> Result<String, WireError> {
        let b = self.take(width)?;
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        Ok(String::from_utf8_lossy(&b[..end]).into_owned())
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Read exactly `buf.len()` bytes
pub async fn ensure_read<S>(stream: &mut S, buf: &mut [u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .with_context(|| format!("Failed to read {} bytes from control connection", buf.len()))?;
    Ok(())
}

/// Write all of `buf` and flush
pub async fn ensure_write<S>(stream: &mut S, buf: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(buf)
        .await
        .with_context(|| format!("Failed to write {} bytes to control connection", buf.len()))?;
    stream.flush().await.context("Failed to flush control connection")?;
    Ok(())
}

/// Read one fixed-size record and normalize its byte order
pub async fn read_record<T, S>(stream: &mut S, endian: Endian) -> Result<T>
where
    T: WireRecord + ByteSwap,
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; T::SIZE];
    ensure_read(stream, &mut buf).await?;
    let record = T::from_bytes(&buf)?;
    Ok(normalize(record, endian))
}

/// Write one fixed-size record in native byte order
pub async fn write_record<T, S>(stream: &mut S, record: &T) -> Result<()>
where
    T: WireRecord,
    S: AsyncWrite + Unpin,
{
    ensure_write(stream, &record.to_bytes()).await
}

/// Write one record in the byte order of a peer related to us by `endian`
pub async fn write_record_as<T, S>(stream: &mut S, record: &T, endian: Endian) -> Result<()>
where
    T: WireRecord + ByteSwap + Clone,
    S: AsyncWrite + Unpin,
{
    write_record(stream, &normalize(record.clone(), endian)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endian_tag() {
        assert_eq!(Endian::from_tag(ENDIAN_VALUE), Some(Endian::Same));
        assert_eq!(
            Endian::from_tag(ENDIAN_VALUE.swap_bytes()),
            Some(Endian::Swapped)
        );
        assert_eq!(Endian::from_tag(0x1234), None);
    }

    #[test]
    fn test_string_field_padding_and_truncation() {
        let mut w = WireWriter::default();
        w.str("abc", 8);
        w.str("0123456789", 4);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..8], b"abc\0\0\0\0\0");
        assert_eq!(&bytes[8..], b"012\0");

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.str(8).unwrap(), "abc");
        assert_eq!(r.str(4).unwrap(), "012");
    }

    #[test]
    fn test_truncated_read() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert_eq!(
            r.u32(),
            Err(WireError::Truncated { need: 4, have: 3 })
        );
    }

    #[tokio::test]
    async fn test_ensure_read_reports_closed_peer() {
        let (mut a, b) = tokio::io::duplex(64);
        ensure_write(&mut a, &[1, 2, 3]).await.unwrap();
        drop(a);
        let mut b = b;
        let mut buf = [0u8; 8];
        assert!(ensure_read(&mut b, &mut buf).await.is_err());
    }
}
