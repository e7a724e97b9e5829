//! Node layer: UDP clients and servers.
//!
//! A node owns one datagram transport and one or more [`Connector`]s and is
//! driven entirely by the application calling [`NodeInterface::update`]:
//!
//! ```text
//! loop {
//!     node.update(UpdateMode::Receive);   // drain socket, ack, dispatch, timeouts
//!     while let Some(event) = node.poll_event() { ... }
//!     ... application logic, node.compose(...) ...
//!     node.update(UpdateMode::Send);      // handshakes, seal, (re)transmit
//! }
//! ```
//!
//! Nothing happens in the background: no threads, no blocking calls. Every
//! state change of every connector happens inside `update()`, `compose()`
//! or an explicit `connect`/`disconnect`/`start`/`stop` call.
//!
//! # Example
//!
//! ```no_run
//! use rigelnet_core::node::{NodeConfig, NodeExt, NodeInterface, UdpServer, UpdateMode};
//! use rigelnet_core::{HandlerError, HandlerRegistry, Packet};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry.register("echo", |node, packet: &mut Packet| {
//!     let text: String = packet.extract_or_err()?;
//!     if let Some(sender) = node.sender_index() {
//!         node.compose(sender, "echo", &text);
//!     }
//!     Ok::<(), HandlerError>(())
//! });
//! registry.index();
//!
//! let mut server = UdpServer::new(NodeConfig::with_passphrase("secret"), 8, Arc::new(registry))?;
//! server.start(7777)?;
//! loop {
//!     server.update(UpdateMode::Receive);
//!     while let Some(event) = server.poll_event() {
//!         println!("{event}");
//!     }
//!     server.update(UpdateMode::Send);
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub(crate) mod dispatch;
pub mod error;
pub mod server;

pub use client::UdpClient;
pub use config::{NodeConfig, UnknownHandlerPolicy, MIN_PACKET_SIZE};
pub use error::{NodeError, Result};
pub use server::UdpServer;

use crate::connector::{Connector, Link};
use crate::event::{Event, EventQueue};
use crate::handler::HandlerRegistry;
use crate::packet::Encode;
use crate::retransmit::{default_predicate, RetransmitPredicate};
use crate::telemetry::Telemetry;
use crate::wire::{self, Datagram};
use rigelnet_transport::{Transport, TransportStats, MAX_DATAGRAM_SIZE};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Phase of an update cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Drain the socket, send acks, dispatch handlers, check timeouts
    Receive,
    /// Send handshakes, seal outgoing payloads, transmit due slots
    Send,
}

/// Target of a composed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// One server slot (ignored on clients)
    Slot(usize),
    /// Every connected peer
    All,
}

impl From<usize> for Recipient {
    fn from(slot: usize) -> Self {
        Recipient::Slot(slot)
    }
}

/// Delivery guarantee of a composed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Retransmitted until acknowledged, delivered once and in order
    #[default]
    Reliable,
    /// Sent once in the next Send cycle; may be lost
    Unsafe,
}

/// Object-safe interface shared by clients and servers.
///
/// RPC handlers receive the dispatching node as `&mut dyn NodeInterface`;
/// the typed helpers live on [`NodeExt`].
pub trait NodeInterface: Send {
    /// Run one phase of the update cycle, returning the traffic it caused
    fn update(&mut self, mode: UpdateMode) -> Telemetry;

    /// Pop the oldest pending event
    fn poll_event(&mut self) -> Option<Event>;

    /// Whether this node is a server
    fn is_server(&self) -> bool;

    /// Whether the node currently owns a socket
    fn is_running(&self) -> bool;

    /// Local socket address, if running
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Datagram counters kept by the socket, if running
    fn transport_stats(&self) -> Option<TransportStats>;

    /// Handler registry shared by this node
    fn registry(&self) -> &HandlerRegistry;

    /// Slot of the client whose message is being dispatched.
    ///
    /// Only set on servers, and only while a handler runs.
    fn sender_index(&self) -> Option<usize>;

    /// Queue an already encoded `(HandlerId, args)` message.
    ///
    /// # Panics
    ///
    /// On servers, panics if `recipient` is a slot that is out of range or
    /// not connected. Panics if an unsafe message exceeds the maximum packet
    /// size; reliable messages that large are fragmented instead.
    fn compose_message(&mut self, recipient: Recipient, message: &[u8], delivery: Delivery);

    /// Silence after which connections are dropped
    fn timeout_limit(&self) -> Duration;

    /// Change the timeout of every current and future connection (zero disables)
    fn set_timeout_limit(&mut self, limit: Duration);

    /// Replace the retransmission policy of every current and future connection
    fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate);

    /// This node as a server, if it is one
    fn as_server_mut(&mut self) -> Option<&mut UdpServer> {
        None
    }

    /// This node as a client, if it is one
    fn as_client_mut(&mut self) -> Option<&mut UdpClient> {
        None
    }

    /// Application state attached to the node
    fn user_data(&mut self) -> Option<&mut (dyn Any + Send)>;

    /// Attach application state, returning the previous value
    fn replace_user_data(&mut self, data: Option<Box<dyn Any + Send>>) -> Option<Box<dyn Any + Send>>;
}

/// Typed helpers available on every node, including `dyn NodeInterface`
pub trait NodeExt: NodeInterface {
    /// Reliably send `args` to the handler registered as `handler`.
    ///
    /// Messages of any size are accepted; those larger than the maximum
    /// packet size travel as several fragments.
    ///
    /// # Panics
    ///
    /// Panics if `handler` is not registered or if the recipient slot is
    /// not connected (servers).
    fn compose<A>(&mut self, recipient: impl Into<Recipient>, handler: &str, args: &A)
    where
        A: Encode + ?Sized,
    {
        let message = encode_message(self.registry(), handler, args);
        self.compose_message(recipient.into(), &message, Delivery::Reliable);
    }

    /// Send `args` to `handler` once, without acknowledgement.
    ///
    /// # Panics
    ///
    /// Same conditions as [`compose`](Self::compose), and also if the
    /// encoded message exceeds the maximum packet size.
    fn compose_unsafe<A>(&mut self, recipient: impl Into<Recipient>, handler: &str, args: &A)
    where
        A: Encode + ?Sized,
    {
        let message = encode_message(self.registry(), handler, args);
        self.compose_message(recipient.into(), &message, Delivery::Unsafe);
    }

    /// Attach `data` as the node's application state
    fn set_user_data<T: Any + Send>(&mut self, data: T) {
        self.replace_user_data(Some(Box::new(data)));
    }

    /// Application state, if it is a `T`
    fn user_data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.user_data()?.downcast_mut::<T>()
    }
}

impl<N: NodeInterface + ?Sized> NodeExt for N {}

/// Encode one handler message: the handler's ID followed by its arguments.
///
/// # Panics
///
/// Panics if the registry is not indexed or `handler` is not registered.
#[must_use]
pub fn encode_message<A: Encode + ?Sized>(registry: &HandlerRegistry, handler: &str, args: &A) -> Vec<u8> {
    assert!(
        registry.is_indexed(),
        "handler registry must be indexed before composing messages"
    );
    let Some(id) = registry.id_with_name(handler) else {
        panic!("no handler registered as '{handler}'");
    };

    let mut message = Vec::new();
    id.encode(&mut message);
    args.encode(&mut message);
    message
}

/// State and plumbing common to clients and servers
pub(crate) struct NodeCore {
    pub config: NodeConfig,
    pub registry: Arc<HandlerRegistry>,
    pub transport: Option<Box<dyn Transport>>,
    pub events: EventQueue,
    pub retransmit: RetransmitPredicate,
    pub user_data: Option<Box<dyn Any + Send>>,
    recv_buf: Vec<u8>,
}

impl NodeCore {
    pub fn new(config: NodeConfig, registry: Arc<HandlerRegistry>) -> Result<Self> {
        config.validate()?;
        if !registry.is_indexed() {
            return Err(NodeError::RegistryNotIndexed);
        }

        Ok(Self {
            config,
            registry,
            transport: None,
            events: EventQueue::new(),
            retransmit: default_predicate(),
            user_data: None,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn new_connector(&self, slot: Option<usize>) -> Connector {
        Connector::new(slot, &self.config, Arc::clone(&self.retransmit))
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref()?.local_addr().ok()
    }

    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.transport.as_ref().map(|transport| transport.stats())
    }

    /// I/O context for connectors, `None` if no socket is open
    pub fn link<'a>(&'a mut self, telemetry: &'a mut Telemetry, now: Instant) -> Option<Link<'a>> {
        Some(Link {
            transport: self.transport.as_deref_mut()?,
            telemetry,
            events: &mut self.events,
            now,
        })
    }

    /// Read and parse every datagram queued at the socket.
    pub fn drain(&mut self, telemetry: &mut Telemetry) -> Vec<(SocketAddr, Datagram)> {
        let mut received = Vec::new();
        let Some(transport) = self.transport.as_deref_mut() else {
            return received;
        };

        loop {
            match transport.recv_from(&mut self.recv_buf) {
                Ok(Some((size, from))) => {
                    telemetry.record_download(size);
                    let bytes = &self.recv_buf[..size];
                    match Datagram::parse(bytes) {
                        Ok(datagram) => {
                            tracing::trace!("Received {:?} ({} bytes) from {}", datagram.kind(), size, from);
                            received.push((from, datagram));
                        }
                        Err(e) => tracing::warn!(
                            "Discarding malformed datagram from {} ({}): {}",
                            from,
                            e,
                            wire::hex_preview(bytes)
                        ),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Receive failed: {}", e);
                    break;
                }
            }
        }
        received
    }

    pub fn replace_user_data(&mut self, data: Option<Box<dyn Any + Send>>) -> Option<Box<dyn Any + Send>> {
        std::mem::replace(&mut self.user_data, data)
    }
}
