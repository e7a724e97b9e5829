//! # RigelNet Core
//!
//! Reliable, ordered RPC delivery over UDP.
//!
//! This crate provides:
//! - [`Packet`], a big-endian binary buffer for RPC arguments
//! - [`HandlerRegistry`], name-addressed handlers with deterministic IDs
//! - The datagram wire format and the per-peer [`Connector`] state machine
//! - Sequenced send/receive windows with weak and strong acknowledgements
//! - [`UdpClient`] and [`UdpServer`], driven by explicit `update()` calls
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    UdpClient / UdpServer                         │
//! │   (socket ownership, demultiplexing, handler dispatch)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Connector                                │
//! │   (handshake, send/receive windows, acks, latency, timeouts)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Datagram / Packet                             │
//! │   (message kinds, big-endian argument encoding)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod connector;
pub mod error;
pub mod event;
pub mod handler;
pub mod latency;
pub mod node;
pub mod packet;
pub mod retransmit;
pub mod telemetry;
pub mod wire;

pub use buffer::{RecvBuffer, SendBuffer, StoreOutcome, TaggedPacket};
pub use connector::{Connector, ConnectorStatus, RemoteInfo};
pub use error::{HandlerError, PacketError, WireError};
pub use event::{ConnectFailReason, DisconnectReason, Event, EventQueue};
pub use handler::{HandlerFn, HandlerId, HandlerRegistry};
pub use latency::LatencyEstimator;
pub use node::{
    Delivery, NodeConfig, NodeError, NodeExt, NodeInterface, Recipient, UdpClient, UdpServer,
    UnknownHandlerPolicy, UpdateMode,
};
pub use packet::{Decode, Encode, Packet};
pub use retransmit::{default_predicate, default_retransmit_predicate, RetransmitPredicate};
pub use telemetry::Telemetry;
pub use wire::{Datagram, Fragment, MessageKind, RejectReason};

pub use rigelnet_transport::TransportStats;
