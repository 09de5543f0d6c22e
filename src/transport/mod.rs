//! Data-plane transport abstraction
//!
//! Strands move benchmark traffic through the [`Transport`] and [`Listener`] traits and
//! never see a socket type directly. A [`TransportProvider`] creates both, keyed by the
//! flowop's [`Protocol`]; the networked provider only carries TCP.
//!
//! # Cancellation
//!
//! Every potentially blocking call takes an [`Interrupt`]. Implementations block in short
//! ticks and poll it between ticks, returning [`TransportError::Interrupted`] once it
//! trips. A zero-byte read means the peer closed the connection.
//!
//! # Thread Safety
//!
//! Connections are `Send` and owned by exactly one strand. Listeners are `Send + Sync`
//! because a fixed-port listener is shared by every strand of a group.

pub mod mock;
pub mod tcp;

use crate::workload::{FlowopOptions, Protocol};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a blocking call waits before re-checking its interrupt
pub const POLL_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Interrupted")]
    Interrupted,
    #[error("{0} transport is not available")]
    Unsupported(Protocol),
    #[error("No address for {0}")]
    Resolve(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Polled by blocking transport calls
pub trait Interrupt {
    fn is_interrupted(&self) -> bool;
}

impl Interrupt for AtomicBool {
    fn is_interrupted(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// One established data connection
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` means the peer closed
    fn read(&mut self, buf: &mut [u8], cancel: &dyn Interrupt) -> Result<usize, TransportError>;

    /// Write all of `buf`, returning the bytes written (short only if the peer closed)
    fn write(&mut self, buf: &[u8], cancel: &dyn Interrupt) -> Result<usize, TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// A bound listening endpoint
pub trait Listener: Send + Sync {
    /// Locally bound port
    fn port(&self) -> u16;

    fn accept(
        &self,
        options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Factory for connections and listeners
pub trait TransportProvider: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Box<dyn Transport>, TransportError>;

    /// Bind a listener on `options.port` (0 picks an ephemeral port)
    fn listen(&self, options: &FlowopOptions) -> Result<Arc<dyn Listener>, TransportError>;

    fn supports(&self, protocol: Protocol) -> bool;
}

/// Real network transports
#[derive(Debug, Default, Clone, Copy)]
pub struct NetProvider;

impl TransportProvider for NetProvider {
    fn connect(
        &self,
        host: &str,
        port: u16,
        options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match options.protocol {
            Protocol::Tcp => Ok(Box::new(tcp::TcpTransport::connect(host, port, options, cancel)?)),
            other => Err(TransportError::Unsupported(other)),
        }
    }

    fn listen(&self, options: &FlowopOptions) -> Result<Arc<dyn Listener>, TransportError> {
        match options.protocol {
            Protocol::Tcp => Ok(Arc::new(tcp::TcpListenerEndpoint::bind(options)?)),
            other => Err(TransportError::Unsupported(other)),
        }
    }

    fn supports(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_provider_only_supports_tcp() {
        let p = NetProvider;
        assert!(p.supports(Protocol::Tcp));
        assert!(!p.supports(Protocol::Sctp));
        let opts = FlowopOptions {
            protocol: Protocol::Udp,
            ..Default::default()
        };
        assert!(matches!(
            p.listen(&opts),
            Err(TransportError::Unsupported(Protocol::Udp))
        ));
    }
}
