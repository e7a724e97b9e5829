//! Packet loss simulation.
//!
//! `LossyTransport` wraps another transport and discards a fraction of the
//! datagrams passing through it. Randomness comes from a seeded `StdRng`, so
//! a given seed always produces the same loss pattern for the same traffic.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;

/// Transport wrapper that drops datagrams with a fixed probability
pub struct LossyTransport<T> {
    inner: T,
    send_drop_rate: f64,
    recv_drop_rate: f64,
    rng: StdRng,
    dropped: u64,
}

impl<T: Transport> LossyTransport<T> {
    /// Wrap `inner`, dropping outgoing datagrams with probability `drop_rate`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if `drop_rate` is not within
    /// `0.0..=1.0`.
    pub fn new(inner: T, drop_rate: f64, seed: u64) -> TransportResult<Self> {
        validate_rate(drop_rate)?;
        Ok(Self {
            inner,
            send_drop_rate: drop_rate,
            recv_drop_rate: 0.0,
            rng: StdRng::seed_from_u64(seed),
            dropped: 0,
        })
    }

    /// Also drop incoming datagrams with probability `drop_rate`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if `drop_rate` is not within
    /// `0.0..=1.0`.
    pub fn with_recv_drop_rate(mut self, drop_rate: f64) -> TransportResult<Self> {
        validate_rate(drop_rate)?;
        self.recv_drop_rate = drop_rate;
        Ok(self)
    }

    /// Number of datagrams discarded so far in either direction
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Get a reference to the wrapped transport
    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Unwrap into the inner transport
    #[must_use]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn validate_rate(rate: f64) -> TransportResult<()> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(TransportError::InvalidConfig(format!(
            "drop rate must be within 0.0..=1.0, got {rate}"
        )))
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.rng.gen_bool(self.send_drop_rate) {
            tracing::trace!("Simulated loss of {} bytes to {}", buf.len(), addr);
            self.dropped += 1;
            // Report success: the sender cannot observe loss on the wire.
            return Ok(buf.len());
        }
        self.inner.send_to(buf, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        while let Some((size, from)) = self.inner.recv_from(buf)? {
            if self.recv_drop_rate > 0.0 && self.rng.gen_bool(self.recv_drop_rate) {
                tracing::trace!("Simulated loss of {} bytes from {}", size, from);
                self.dropped += 1;
                continue;
            }
            return Ok(Some((size, from)));
        }
        Ok(None)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.local_addr()
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.inner.stats();
        stats.packets_dropped += self.dropped;
        stats
    }
}
