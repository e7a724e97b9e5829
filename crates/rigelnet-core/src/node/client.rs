//! Single-connection UDP client.

use super::dispatch::{self, ProtocolViolation};
use super::error::{NodeError, Result};
use super::{Delivery, NodeConfig, NodeCore, NodeInterface, Recipient, UpdateMode};
use crate::connector::{Connector, ConnectorStatus};
use crate::event::Event;
use crate::handler::HandlerRegistry;
use crate::retransmit::RetransmitPredicate;
use crate::telemetry::Telemetry;
use rigelnet_transport::{Transport, TransportStats, UdpTransport};
use std::any::Any;
use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Disconnect message sent by `disconnect(true)`
pub const DISCONNECT_MESSAGE: &str = "Client disconnected.";

/// Client connected to at most one server
pub struct UdpClient {
    core: NodeCore,
    connector: Connector,
}

impl UdpClient {
    /// Create a disconnected client.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if `config` is invalid, or
    /// `NodeError::RegistryNotIndexed` if `registry` has not been indexed.
    pub fn new(config: NodeConfig, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let core = NodeCore::new(config, registry)?;
        let connector = core.new_connector(None);
        Ok(Self { core, connector })
    }

    /// Resolve `host:port` and start connecting from `local_port`.
    ///
    /// IPv4 addresses are preferred when the name resolves to several.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if a connection is in progress or
    /// established, `NodeError::AddressResolution` if `host` does not
    /// resolve, or `NodeError::TransportInit` if the socket cannot be bound.
    pub fn connect(&mut self, local_port: u16, host: &str, port: u16) -> Result<()> {
        self.ensure_idle()?;
        let server = resolve(host, port)?;
        self.connect_addr(local_port, server)
    }

    /// Start connecting to `server` from `local_port` (0 for ephemeral).
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub fn connect_addr(&mut self, local_port: u16, server: SocketAddr) -> Result<()> {
        self.ensure_idle()?;
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, local_port)),
        };
        let transport = UdpTransport::bind(local)?;
        self.connect_with_transport(Box::new(transport), server)
    }

    /// Start connecting to `server` over an already bound transport.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if a connection is in progress or
    /// established.
    pub fn connect_with_transport(&mut self, transport: Box<dyn Transport>, server: SocketAddr) -> Result<()> {
        self.ensure_idle()?;
        self.core.transport = Some(transport);
        self.connector.connect(server, Instant::now());
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.connector.status() == ConnectorStatus::Disconnected {
            Ok(())
        } else {
            Err(NodeError::invalid_state(
                "client is already connecting or connected",
            ))
        }
    }

    /// End the connection and release the socket.
    ///
    /// Does nothing if the client holds no socket.
    pub fn disconnect(&mut self, notify_remote: bool) {
        let mut telemetry = Telemetry::new();
        if let Some(mut link) = self.core.link(&mut telemetry, Instant::now()) {
            self.connector.disconnect(notify_remote, DISCONNECT_MESSAGE, &mut link);
        }
        if self.core.transport.take().is_some() {
            tracing::debug!("Client socket released");
        }
    }

    /// Connection state
    #[must_use]
    pub fn status(&self) -> ConnectorStatus {
        self.connector.status()
    }

    /// Connector to the server
    #[must_use]
    pub fn server_connector(&self) -> &Connector {
        &self.connector
    }

    /// Slot the server assigned to this client, once connected
    #[must_use]
    pub fn client_index(&self) -> Option<usize> {
        self.connector.client_index()
    }

    fn receive(&mut self, telemetry: &mut Telemetry, now: Instant) {
        let datagrams = self.core.drain(telemetry);
        let alive = {
            let Some(mut link) = self.core.link(telemetry, now) else {
                return;
            };
            let server = self.connector.address();
            for (from, datagram) in datagrams {
                if server == Some(from) {
                    self.connector.receive(datagram, &mut link);
                } else {
                    tracing::trace!("Ignoring {:?} from unexpected sender {}", datagram.kind(), from);
                }
            }
            let alive = self.connector.status() != ConnectorStatus::Disconnected;
            if alive {
                self.connector.send_acks(&mut link);
            }
            alive
        };

        if alive {
            self.dispatch(telemetry, now);
            if let Some(mut link) = self.core.link(telemetry, now) {
                self.connector.check_for_timeout(&mut link);
            }
        }
        self.release_if_reset();
    }

    /// Close the socket once the connector has dropped its peer.
    ///
    /// Covers rejects, timeouts and remote disconnects; a local
    /// [`disconnect`](Self::disconnect) releases it directly.
    fn release_if_reset(&mut self) {
        if self.connector.status() == ConnectorStatus::Disconnected && self.core.transport.take().is_some() {
            tracing::debug!("Client socket released after the connection ended");
        }
    }

    fn dispatch(&mut self, telemetry: &mut Telemetry, now: Instant) {
        let registry = Arc::clone(&self.core.registry);
        let policy = self.core.config.unknown_handler_policy;

        for mut packet in self.connector.take_ready() {
            if !self.connector.is_connected() {
                break;
            }

            let outcome = dispatch::run_handlers(self, &registry, &mut packet, policy, |client| {
                client.connector.is_connected()
            });

            if let Err(ProtocolViolation(message)) = outcome {
                if let Some(mut link) = self.core.link(telemetry, now) {
                    self.connector.terminate(message, &mut link);
                }
                break;
            }
        }
    }
}

/// Resolve `host:port`, preferring IPv4.
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| NodeError::AddressResolution(Cow::Owned(format!("{host}:{port}: {e}"))))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NodeError::AddressResolution(Cow::Owned(format!("{host}:{port}: no addresses"))))
}

impl NodeInterface for UdpClient {
    fn update(&mut self, mode: UpdateMode) -> Telemetry {
        let mut telemetry = Telemetry::new();
        let now = Instant::now();
        match mode {
            UpdateMode::Receive => self.receive(&mut telemetry, now),
            UpdateMode::Send => {
                if let Some(mut link) = self.core.link(&mut telemetry, now) {
                    self.connector.send(&mut link);
                }
            }
        }
        telemetry
    }

    fn poll_event(&mut self) -> Option<Event> {
        self.core.events.pop()
    }

    fn is_server(&self) -> bool {
        false
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn transport_stats(&self) -> Option<TransportStats> {
        self.core.transport_stats()
    }

    fn registry(&self) -> &HandlerRegistry {
        &self.core.registry
    }

    fn sender_index(&self) -> Option<usize> {
        None
    }

    /// Messages composed while connecting are held until the handshake
    /// completes; the recipient is ignored.
    fn compose_message(&mut self, _recipient: Recipient, message: &[u8], delivery: Delivery) {
        match self.connector.status() {
            ConnectorStatus::Connecting | ConnectorStatus::Connected => match delivery {
                Delivery::Reliable => self.connector.append_reliable(message),
                Delivery::Unsafe => self.connector.append_unsafe(message),
            },
            status => tracing::debug!("Dropping message composed while {:?}", status),
        }
    }

    fn timeout_limit(&self) -> Duration {
        self.core.config.timeout_limit
    }

    fn set_timeout_limit(&mut self, limit: Duration) {
        self.core.config.timeout_limit = limit;
        self.connector.set_timeout_limit(limit);
    }

    fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate) {
        self.connector.set_retransmit_predicate(Arc::clone(&predicate));
        self.core.retransmit = predicate;
    }

    fn as_client_mut(&mut self) -> Option<&mut UdpClient> {
        Some(self)
    }

    fn user_data(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.core.user_data.as_deref_mut()
    }

    fn replace_user_data(&mut self, data: Option<Box<dyn Any + Send>>) -> Option<Box<dyn Any + Send>> {
        self.core.replace_user_data(data)
    }
}

impl std::fmt::Debug for UdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpClient")
            .field("local_addr", &self.core.local_addr())
            .field("connector", &self.connector)
            .finish()
    }
}
