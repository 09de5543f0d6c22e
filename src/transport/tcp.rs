//! TCP transport over blocking std sockets
//!
//! Sockets run with a read/write timeout of [`POLL_TICK`]; a timeout is not an error, it
//! only gives the caller's interrupt a chance to trip. Listeners are non-blocking and
//! polled the same way, so any number of strands can share one.

use super::{Interrupt, Listener, Transport, TransportError, POLL_TICK};
use crate::workload::{FlowopFlags, FlowopOptions};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ATTEMPT: Duration = Duration::from_secs(1);

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

/// Apply per-flowop socket options
fn tune(stream: &TcpStream, options: &FlowopOptions) -> std::io::Result<()> {
    if options.flag.contains(FlowopFlags::TCP_NODELAY) {
        stream.set_nodelay(true)?;
    }
    if options.wndsz > 0 {
        let size = libc::c_int::try_from(options.wndsz).unwrap_or(libc::c_int::MAX);
        for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
            // SAFETY: valid fd owned by `stream`, option value is a c_int
            let rc = unsafe {
                libc::setsockopt(
                    stream.as_raw_fd(),
                    libc::SOL_SOCKET,
                    opt,
                    &size as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    stream.set_read_timeout(Some(POLL_TICK))?;
    stream.set_write_timeout(Some(POLL_TICK))?;
    Ok(())
}

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(
        host: &str,
        port: u16,
        options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Self, TransportError> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(TransportError::Resolve(host.to_string()));
        }
        let timeout = match options.poll_timeout {
            0 => CONNECT_TIMEOUT,
            ns => Duration::from_nanos(ns),
        };
        let deadline = Instant::now() + timeout;

        let mut last_err = None;
        for addr in &addrs {
            // Connect in ticks so a stuck SYN does not outlive an abort
            loop {
                if cancel.is_interrupted() {
                    return Err(TransportError::Interrupted);
                }
                match TcpStream::connect_timeout(addr, CONNECT_ATTEMPT) {
                    Ok(stream) => {
                        tune(&stream, options)?;
                        debug!("Connected to {}", addr);
                        return Ok(Self { stream });
                    }
                    Err(e) if is_timeout(&e) && Instant::now() < deadline => continue,
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }
        Err(last_err
            .map(TransportError::Io)
            .unwrap_or_else(|| TransportError::Resolve(host.to_string())))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], cancel: &dyn Interrupt) -> Result<usize, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if is_timeout(&e) => {
                    if cancel.is_interrupted() {
                        return Err(TransportError::Interrupted);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, buf: &[u8], cancel: &dyn Interrupt) -> Result<usize, TransportError> {
        let mut done = 0;
        while done < buf.len() {
            match self.stream.write(&buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if is_timeout(&e) => {
                    if cancel.is_interrupted() {
                        return Err(TransportError::Interrupted);
                    }
                }
                Err(e) if e.kind() == ErrorKind::BrokenPipe && done == 0 => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
pub struct TcpListenerEndpoint {
    listener: TcpListener,
    port: u16,
}

impl TcpListenerEndpoint {
    /// Bind on all interfaces, IPv6 dual-stack first
    pub fn bind(options: &FlowopOptions) -> Result<Self, TransportError> {
        let port = u16::try_from(options.port).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("Port {} out of range", options.port),
            ))
        })?;
        let listener = TcpListener::bind(("::", port))
            .or_else(|_| TcpListener::bind(("0.0.0.0", port)))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        debug!("Listening on TCP port {}", port);
        Ok(Self { listener, port })
    }
}

impl Listener for TcpListenerEndpoint {
    fn port(&self) -> u16 {
        self.port
    }

    fn accept(
        &self,
        options: &FlowopOptions,
        cancel: &dyn Interrupt,
    ) -> Result<Box<dyn Transport>, TransportError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    tune(&stream, options)?;
                    debug!("Accepted connection from {}", peer);
                    return Ok(Box::new(TcpTransport { stream }));
                }
                Err(e) if is_timeout(&e) => {
                    if cancel.is_interrupted() {
                        return Err(TransportError::Interrupted);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
