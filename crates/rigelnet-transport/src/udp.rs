//! Non-blocking UDP transport.
//!
//! Sockets are created through `socket2` so buffer sizes can be raised
//! before binding, then handed over to `std::net::UdpSocket` in
//! non-blocking mode.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Requested kernel buffer size for both directions
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// UDP transport backed by a non-blocking socket
pub struct UdpTransport {
    socket: UdpSocket,
    stats: TransportStats,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the given address
    ///
    /// # Arguments
    /// * `addr` - The local address to bind to. Use port 0 for automatic port selection.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created
    /// or bound.
    ///
    /// # Examples
    /// ```no_run
    /// use rigelnet_transport::{Transport, UdpTransport};
    /// use std::net::SocketAddr;
    ///
    /// let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    /// let transport = UdpTransport::bind(addr).unwrap();
    /// println!("Listening on {}", transport.local_addr().unwrap());
    /// ```
    pub fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let addr = addr.into();
        let socket = Self::open(addr).map_err(|source| TransportError::BindFailed { addr, source })?;

        tracing::debug!("UDP transport bound to {}", addr);

        Ok(Self {
            socket,
            stats: TransportStats::new(),
        })
    }

    fn open(addr: SocketAddr) -> io::Result<UdpSocket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;

        // Buffer sizes are advisory; some platforms clamp or refuse them.
        if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            tracing::debug!("Could not set UDP receive buffer size: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            tracing::debug!("Could not set UDP send buffer size: {}", e);
        }

        socket.bind(&addr.into())?;
        Ok(socket.into())
    }

    /// Get the receive buffer size reported by the kernel
    ///
    /// # Errors
    /// Returns an I/O error if the socket option cannot be read.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        socket2::SockRef::from(&self.socket).recv_buffer_size()
    }

    /// Get the send buffer size reported by the kernel
    ///
    /// # Errors
    /// Returns an I/O error if the socket option cannot be read.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        socket2::SockRef::from(&self.socket).send_buffer_size()
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        match self.socket.send_to(buf, addr) {
            Ok(sent) => {
                self.stats.record_send(sent);
                Ok(sent)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!("UDP send buffer full, dropping {} bytes to {}", buf.len(), addr);
                self.stats.record_drop();
                Ok(0)
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((size, from)) => {
                    self.stats.record_recv(size);
                    return Ok(Some((size, from)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port-unreachable surfaces here on some platforms; it
                // refers to an earlier send, not to this receive.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    self.stats.record_recv_error();
                }
                Err(e) => {
                    self.stats.record_recv_error();
                    return Err(e.into());
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}
