//! Transport trait abstraction for datagram backends.
//!
//! RigelNet nodes never block: every call either completes immediately or
//! reports that nothing is pending. The `Transport` trait captures exactly
//! that contract so nodes can run over a real UDP socket, an in-memory link
//! or a lossy wrapper without changing protocol code.

use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address {addr}: {source}")]
    BindFailed {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying socket error
        source: io::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Non-blocking datagram transport.
///
/// Implementations must never block the calling thread. A receive with
/// nothing queued returns `Ok(None)`; a send that the backend cannot accept
/// right now may drop the datagram, exactly as UDP would.
///
/// # Examples
///
/// ```no_run
/// use rigelnet_transport::{Transport, UdpTransport};
/// use std::net::SocketAddr;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let mut transport = UdpTransport::bind(addr)?;
///
/// transport.send_to(b"hello", "127.0.0.1:50000".parse()?)?;
///
/// let mut buf = vec![0u8; 1500];
/// while let Some((size, from)) = transport.recv_from(&mut buf)? {
///     println!("Received {} bytes from {}", size, from);
/// }
/// # Ok(())
/// # }
/// ```
pub trait Transport: Send {
    /// Send one datagram to `addr`.
    ///
    /// Returns the number of bytes handed to the backend (zero if the
    /// datagram was dropped locally).
    ///
    /// # Errors
    /// Returns `TransportError` if the backend failed for a reason other
    /// than temporary back-pressure.
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one pending datagram into `buf`.
    ///
    /// Returns `Ok(None)` when nothing is queued.
    ///
    /// # Errors
    /// Returns `TransportError` if the backend failed.
    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        (**self).send_to(buf, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        (**self).recv_from(buf)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        (**self).local_addr()
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams sent
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Datagrams dropped before reaching the wire
    pub packets_dropped: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a datagram dropped locally
    pub fn record_drop(&mut self) {
        self.packets_dropped += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
