//! In-memory datagram links.
//!
//! A `MemoryTransport` pair behaves like two UDP sockets that can only reach
//! each other. Datagrams travel through `crossbeam-channel` queues, so both
//! ends may live on different threads and tests run without touching the
//! network stack.

use crate::transport::{Transport, TransportResult, TransportStats};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::net::SocketAddr;

type Datagram = (SocketAddr, Vec<u8>);

/// One end of an in-memory datagram link
pub struct MemoryTransport {
    local: SocketAddr,
    peer: SocketAddr,
    outbound: Sender<Datagram>,
    inbound: Receiver<Datagram>,
    stats: TransportStats,
}

impl MemoryTransport {
    /// Create two connected endpoints with the given addresses.
    ///
    /// Datagrams sent to any address other than the peer's are dropped
    /// silently.
    #[must_use]
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (to_b, from_a) = crossbeam_channel::unbounded();
        let (to_a, from_b) = crossbeam_channel::unbounded();

        let first = Self {
            local: a,
            peer: b,
            outbound: to_b,
            inbound: from_b,
            stats: TransportStats::new(),
        };
        let second = Self {
            local: b,
            peer: a,
            outbound: to_a,
            inbound: from_a,
            stats: TransportStats::new(),
        };
        (first, second)
    }

    /// Address of the other end
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Number of datagrams waiting to be received
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if addr != self.peer {
            tracing::trace!("Memory link {} has no route to {}", self.local, addr);
            self.stats.record_drop();
            return Ok(0);
        }

        // A vanished peer looks like a lost datagram, not an error.
        if self.outbound.send((self.local, buf.to_vec())).is_err() {
            self.stats.record_drop();
            return Ok(0);
        }

        self.stats.record_send(buf.len());
        Ok(buf.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        match self.inbound.try_recv() {
            Ok((from, data)) => {
                // Oversized datagrams are truncated like a short UDP read.
                let size = data.len().min(buf.len());
                buf[..size].copy_from_slice(&data[..size]);
                self.stats.record_recv(size);
                Ok(Some((size, from)))
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local)
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}
