//! Mock transport for testing
//!
//! Simulates connections without touching the network so scheduler behaviour can be
//! tested deterministically.
//!
//! # Features
//!
//! - Configurable success/failure behaviour
//! - Configurable bytes per operation (0 = the requested length)
//! - Peer close after a fixed number of operations
//! - Records every operation and every connect/listen for verification
//!
//! All state sits behind one `Arc<Mutex<..>>`, so clones of a [`MockProvider`] and the
//! connections it hands out observe and control the same counters.

use super::{Interrupt, Listener, Transport, TransportError, TransportProvider};
use crate::workload::{FlowopOptions, Protocol};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Record of a transport call for test verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Connect { host: String, port: u16 },
    Accept { port: u16 },
    Read { len: usize },
    Write { len: usize },
    Disconnect,
}

#[derive(Debug, Default)]
struct MockState {
    should_fail: bool,
    bytes_per_op: usize,
    /// Data ops left before reads/writes return 0
    close_after: Option<u64>,
    ops: Vec<MockOp>,
}

/// Shared controller of the mock transport
#[derive(Debug, Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    next_port: Arc<AtomicU16>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            next_port: Arc::new(AtomicU16::new(40000)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent data operation fail
    pub fn set_should_fail(&self, should_fail: bool) {
        self.state().should_fail = should_fail;
    }

    /// Bytes returned per read/write; 0 returns the requested length
    pub fn set_bytes_per_op(&self, bytes: usize) {
        self.state().bytes_per_op = bytes;
    }

    /// Simulate the peer closing after `ops` more data operations
    pub fn set_close_after(&self, ops: u64) {
        self.state().close_after = Some(ops);
    }

    pub fn operations(&self) -> Vec<MockOp> {
        self.state().ops.clone()
    }

    /// Number of reads and writes performed
    pub fn data_op_count(&self) -> usize {
        self.state()
            .ops
            .iter()
            .filter(|op| matches!(op, MockOp::Read { .. } | MockOp::Write { .. }))
            .count()
    }

    pub fn clear_operations(&self) {
        self.state().ops.clear();
    }

    fn connection(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            provider: self.clone(),
        })
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportProvider for MockProvider {
    fn connect(
        &self,
        host: &str,
        port: u16,
        _options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if cancel.is_interrupted() {
            return Err(TransportError::Interrupted);
        }
        let mut st = self.state();
        st.ops.push(MockOp::Connect {
            host: host.to_string(),
            port,
        });
        if st.should_fail {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }
        drop(st);
        Ok(self.connection())
    }

    fn listen(&self, options: &FlowopOptions) -> Result<Arc<dyn Listener>, TransportError> {
        let port = match u16::try_from(options.port) {
            Ok(0) | Err(_) => self.next_port.fetch_add(1, Ordering::Relaxed),
            Ok(p) => p,
        };
        Ok(Arc::new(MockListener {
            provider: self.clone(),
            port,
        }))
    }

    fn supports(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Tcp
    }
}

#[derive(Debug)]
pub struct MockListener {
    provider: MockProvider,
    port: u16,
}

impl Listener for MockListener {
    fn port(&self) -> u16 {
        self.port
    }

    fn accept(
        &self,
        _options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if cancel.is_interrupted() {
            return Err(TransportError::Interrupted);
        }
        self.provider.state().ops.push(MockOp::Accept { port: self.port });
        Ok(self.provider.connection())
    }
}

#[derive(Debug)]
pub struct MockTransport {
    provider: MockProvider,
}

impl MockTransport {
    fn transfer(&self, requested: usize, op: fn(usize) -> MockOp) -> Result<usize, TransportError> {
        let mut st = self.provider.state();
        if st.should_fail {
            st.ops.push(op(0));
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
        }
        if let Some(left) = st.close_after.as_mut() {
            if *left == 0 {
                return Ok(0);
            }
            *left -= 1;
        }
        let n = match st.bytes_per_op {
            0 => requested,
            b => b.min(requested),
        };
        st.ops.push(op(n));
        Ok(n)
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8], _cancel: &dyn Interrupt) -> Result<usize, TransportError> {
        self.transfer(buf.len(), |len| MockOp::Read { len })
    }

    fn write(&mut self, buf: &[u8], _cancel: &dyn Interrupt) -> Result<usize, TransportError> {
        self.transfer(buf.len(), |len| MockOp::Write { len })
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.provider.state().ops.push(MockOp::Disconnect);
        Ok(())
    }
}
