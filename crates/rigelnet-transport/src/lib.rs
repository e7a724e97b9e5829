//! # RigelNet Transport
//!
//! Datagram transport layer for RigelNet.
//!
//! This crate provides:
//! - The non-blocking [`Transport`] trait nodes are written against
//! - [`UdpTransport`], a `socket2`-configured UDP socket
//! - [`MemoryTransport`], a pair of in-process endpoints for tests
//! - [`LossyTransport`], a seeded packet-loss simulator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lossy;
pub mod memory;
pub mod transport;
pub mod udp;

pub use lossy::LossyTransport;
pub use memory::MemoryTransport;
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;

/// Size of the IPv4 UDP header, used when estimating bytes on the wire
pub const UDP_HEADER_SIZE: usize = 8;

/// Largest datagram a transport is asked to receive
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
