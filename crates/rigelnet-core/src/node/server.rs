//! Multi-client UDP server.

use super::dispatch::{self, ProtocolViolation};
use super::error::{NodeError, Result};
use super::{Delivery, NodeConfig, NodeCore, NodeInterface, Recipient, UpdateMode};
use crate::connector::{Connector, ConnectorStatus, Link};
use crate::event::Event;
use crate::handler::HandlerRegistry;
use crate::packet::Packet;
use crate::retransmit::RetransmitPredicate;
use crate::telemetry::Telemetry;
use crate::wire::{Datagram, RejectReason};
use rigelnet_transport::{Transport, TransportStats, UdpTransport};
use std::any::Any;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Disconnect message sent to every client on `stop(true)`
pub const SHUTDOWN_MESSAGE: &str = "Server shutting down.";

/// A sender whose passphrase was rejected is reported at most once per interval.
///
/// Every Hello with a bad passphrase is still answered with a Reject.
pub const BAD_PASSPHRASE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Server with a fixed number of client slots.
///
/// Each slot is a [`Connector`] that is reused across connections. A Hello
/// from an unknown address is offered to the first free slot; when every slot
/// is taken the sender gets a single Reject.
pub struct UdpServer {
    core: NodeCore,
    connectors: Vec<Connector>,
    sender_index: Option<usize>,
    bad_passphrase_reports: HashMap<SocketAddr, Instant>,
}

impl UdpServer {
    /// Create a stopped server with `capacity` client slots.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if `config` is invalid, or
    /// `NodeError::RegistryNotIndexed` if `registry` has not been indexed.
    pub fn new(config: NodeConfig, capacity: usize, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let core = NodeCore::new(config, registry)?;
        let connectors = (0..capacity).map(|slot| core.new_connector(Some(slot))).collect();
        tracing::debug!("Server created with {} slots", capacity);

        Ok(Self {
            core,
            connectors,
            sender_index: None,
            bad_passphrase_reports: HashMap::new(),
        })
    }

    /// Bind `0.0.0.0:local_port` and start accepting clients.
    ///
    /// Port 0 picks an ephemeral port; see [`local_addr`](NodeInterface::local_addr).
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if already running, or
    /// `NodeError::TransportInit` if the socket cannot be bound.
    pub fn start(&mut self, local_port: u16) -> Result<()> {
        if self.core.is_running() {
            return Err(NodeError::invalid_state("server is already running"));
        }
        let transport = UdpTransport::bind((Ipv4Addr::UNSPECIFIED, local_port))?;
        self.start_with_transport(Box::new(transport))
    }

    /// Start on an already bound transport.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if already running.
    pub fn start_with_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.core.is_running() {
            return Err(NodeError::invalid_state("server is already running"));
        }
        self.core.transport = Some(transport);
        tracing::info!("Server listening on {:?}", self.core.local_addr());
        Ok(())
    }

    /// Disconnect every client and release the socket.
    ///
    /// Does nothing if the server is not running.
    pub fn stop(&mut self, notify_clients: bool) {
        let mut telemetry = Telemetry::new();
        let Some(mut link) = self.core.link(&mut telemetry, Instant::now()) else {
            return;
        };
        for connector in &mut self.connectors {
            connector.disconnect(notify_clients, SHUTDOWN_MESSAGE, &mut link);
        }
        self.core.transport = None;
        tracing::info!("Server stopped");
    }

    /// Change the number of client slots.
    ///
    /// Growing always succeeds. Shrinking only removes trailing slots that
    /// are disconnected.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if a slot that would be removed is
    /// in use.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        let current = self.connectors.len();
        if capacity < current {
            if self.connectors[capacity..]
                .iter()
                .any(|c| c.status() != ConnectorStatus::Disconnected)
            {
                return Err(NodeError::invalid_state(
                    "cannot shrink below a slot that is in use",
                ));
            }
            self.connectors.truncate(capacity);
        } else {
            let core = &self.core;
            self.connectors
                .extend((current..capacity).map(|slot| core.new_connector(Some(slot))));
        }
        tracing::debug!("Server resized from {} to {} slots", current, capacity);
        Ok(())
    }

    /// Number of client slots
    #[must_use]
    pub fn size(&self) -> usize {
        self.connectors.len()
    }

    /// Number of slots with a completed handshake
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.connectors.iter().filter(|c| c.is_connected()).count()
    }

    /// Connector of slot `index`
    #[must_use]
    pub fn client_connector(&self, index: usize) -> Option<&Connector> {
        self.connectors.get(index)
    }

    /// Shared passphrase
    #[must_use]
    pub fn passphrase(&self) -> &str {
        &self.core.config.passphrase
    }

    /// Disconnect the client in slot `index`.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if `index` is not a slot.
    pub fn kick_client(&mut self, index: usize, notify_client: bool, message: &str) -> Result<()> {
        let connector = self
            .connectors
            .get_mut(index)
            .ok_or(NodeError::invalid_state("no such client slot"))?;

        let mut telemetry = Telemetry::new();
        if let Some(mut link) = self.core.link(&mut telemetry, Instant::now()) {
            tracing::info!("Kicking client {}: {}", index, message);
            connector.disconnect(notify_client, message, &mut link);
        }
        Ok(())
    }

    fn slot_connected(&self, index: usize) -> bool {
        self.connectors.get(index).is_some_and(Connector::is_connected)
    }

    fn receive(&mut self, telemetry: &mut Telemetry, now: Instant) {
        let datagrams = self.core.drain(telemetry);
        if let Some(mut link) = self.core.link(telemetry, now) {
            for (from, datagram) in datagrams {
                route(&mut self.connectors, &mut self.bad_passphrase_reports, from, datagram, &mut link);
            }
        }

        let mut index = 0;
        while index < self.connectors.len() {
            self.service_slot(index, telemetry, now);
            index += 1;
        }
    }

    /// Acks, dispatch and timeout check for one slot, in that order.
    fn service_slot(&mut self, index: usize, telemetry: &mut Telemetry, now: Instant) {
        let ready = {
            let Some(mut link) = self.core.link(telemetry, now) else {
                return;
            };
            let connector = &mut self.connectors[index];
            if connector.status() == ConnectorStatus::Disconnected {
                return;
            }
            connector.send_acks(&mut link);
            connector.take_ready()
        };

        self.dispatch(index, ready, telemetry, now);

        if let (Some(connector), Some(mut link)) = (self.connectors.get_mut(index), self.core.link(telemetry, now)) {
            connector.check_for_timeout(&mut link);
        }
    }

    fn dispatch(&mut self, index: usize, ready: Vec<Packet>, telemetry: &mut Telemetry, now: Instant) {
        let registry = Arc::clone(&self.core.registry);
        let policy = self.core.config.unknown_handler_policy;

        for mut packet in ready {
            if !self.slot_connected(index) {
                break;
            }

            self.sender_index = Some(index);
            let outcome = dispatch::run_handlers(self, &registry, &mut packet, policy, |server| {
                server.slot_connected(index)
            });
            self.sender_index = None;

            if let Err(ProtocolViolation(message)) = outcome {
                if let (Some(connector), Some(mut link)) =
                    (self.connectors.get_mut(index), self.core.link(telemetry, now))
                {
                    connector.terminate(message, &mut link);
                }
                break;
            }
        }
    }

    fn send(&mut self, telemetry: &mut Telemetry, now: Instant) {
        if let Some(mut link) = self.core.link(telemetry, now) {
            for connector in &mut self.connectors {
                connector.send(&mut link);
            }
        }
    }
}

/// Hand a datagram to the slot bound to its sender, or to the accept logic.
fn route(
    connectors: &mut [Connector],
    reports: &mut HashMap<SocketAddr, Instant>,
    from: SocketAddr,
    datagram: Datagram,
    link: &mut Link<'_>,
) {
    if let Some(connector) = connectors
        .iter_mut()
        .find(|c| c.status() != ConnectorStatus::Disconnected && c.address() == Some(from))
    {
        connector.receive(datagram, link);
        return;
    }

    match datagram {
        Datagram::Hello { passphrase } => {
            match connectors
                .iter_mut()
                .find(|c| c.status() == ConnectorStatus::Disconnected)
            {
                Some(slot) => {
                    let now = link.now;
                    reports.retain(|_, reported| now.saturating_duration_since(*reported) < BAD_PASSPHRASE_REPORT_INTERVAL);
                    let report = !reports.contains_key(&from);
                    if !slot.accept(from, passphrase, report, link) && report {
                        reports.insert(from, now);
                    }
                }
                None => {
                    tracing::warn!("Server full; rejecting connection request from {}", from);
                    link.transmit_datagram(
                        from,
                        &Datagram::Reject {
                            reason: RejectReason::ServerFull,
                        },
                    );
                }
            }
        }
        other => tracing::trace!("Ignoring {:?} from unknown sender {}", other.kind(), from),
    }
}

impl NodeInterface for UdpServer {
    fn update(&mut self, mode: UpdateMode) -> Telemetry {
        let mut telemetry = Telemetry::new();
        let now = Instant::now();
        match mode {
            UpdateMode::Receive => self.receive(&mut telemetry, now),
            UpdateMode::Send => self.send(&mut telemetry, now),
        }
        telemetry
    }

    fn poll_event(&mut self) -> Option<Event> {
        self.core.events.pop()
    }

    fn is_server(&self) -> bool {
        true
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
        self.sender_index
    }

    fn compose_message(&mut self, recipient: Recipient, message: &[u8], delivery: Delivery) {
        let append = |connector: &mut Connector| match delivery {
            Delivery::Reliable => connector.append_reliable(message),
            Delivery::Unsafe => connector.append_unsafe(message),
        };

        match recipient {
            Recipient::Slot(index) => {
                let size = self.connectors.len();
                let Some(connector) = self.connectors.get_mut(index) else {
                    panic!("cannot compose to client {index}: server has {size} slots");
                };
                assert!(
                    connector.is_connected(),
                    "cannot compose to client {index}: not connected"
                );
                append(connector);
            }
            Recipient::All => self
                .connectors
                .iter_mut()
                .filter(|c| c.is_connected())
                .for_each(append),
        }
    }

    fn timeout_limit(&self) -> Duration {
        self.core.config.timeout_limit
    }

    fn set_timeout_limit(&mut self, limit: Duration) {
        self.core.config.timeout_limit = limit;
        for connector in &mut self.connectors {
            connector.set_timeout_limit(limit);
        }
    }

    fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate) {
        for connector in &mut self.connectors {
            connector.set_retransmit_predicate(Arc::clone(&predicate));
        }
        self.core.retransmit = predicate;
    }

    fn as_server_mut(&mut self) -> Option<&mut UdpServer> {
        Some(self)
    }

    fn user_data(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.core.user_data.as_deref_mut()
    }

    fn replace_user_data(&mut self, data: Option<Box<dyn Any + Send>>) -> Option<Box<dyn Any + Send>> {
        self.core.replace_user_data(data)
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("local_addr", &self.core.local_addr())
            .field("slots", &self.connectors.len())
            .field("connected", &self.connected_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::node::NodeExt;
    use rigelnet_transport::MemoryTransport;

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", |_node: &mut dyn NodeInterface, _packet: &mut Packet| {
            Ok::<(), HandlerError>(())
        });
        registry.index();
        Arc::new(registry)
    }

    fn server(capacity: usize) -> UdpServer {
        UdpServer::new(NodeConfig::with_passphrase("pw"), capacity, registry()).unwrap()
    }

    #[test]
    fn test_new_server_is_stopped() {
        let server = server(4);
        assert!(!server.is_running());
        assert!(server.is_server());
        assert_eq!(server.size(), 4);
        assert_eq!(server.local_addr(), None);
        assert_eq!(server.passphrase(), "pw");
        assert!(server
            .client_connector(3)
            .is_some_and(|c| c.status() == ConnectorStatus::Disconnected));
    }

    #[test]
    fn test_start_twice_fails() {
        let mut server = server(1);
        let (a, _b) = MemoryTransport::pair("10.0.0.1:1".parse().unwrap(), "10.0.0.2:2".parse().unwrap());
        server.start_with_transport(Box::new(a)).unwrap();
        let (c, _d) = MemoryTransport::pair("10.0.0.1:3".parse().unwrap(), "10.0.0.2:4".parse().unwrap());
        assert!(matches!(
            server.start_with_transport(Box::new(c)),
            Err(NodeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut server = server(1);
        let (a, _b) = MemoryTransport::pair("10.0.0.1:1".parse().unwrap(), "10.0.0.2:2".parse().unwrap());
        server.start_with_transport(Box::new(a)).unwrap();
        server.stop(true);
        server.stop(true);
        assert!(!server.is_running());
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_resize() {
        let mut server = server(2);
        server.resize(5).unwrap();
        assert_eq!(server.size(), 5);
        assert_eq!(server.client_connector(4).and_then(Connector::client_index), Some(4));
        server.resize(1).unwrap();
        assert_eq!(server.size(), 1);
    }

    #[test]
    fn test_kick_unknown_slot() {
        let mut server = server(1);
        assert!(server.kick_client(5, true, "bye").is_err());
        assert!(server.kick_client(0, true, "bye").is_ok());
    }

    #[test]
    fn test_compose_all_skips_disconnected() {
        let mut server = server(3);
        server.compose(Recipient::All, "ping", &());
        assert!((0..3).all(|i| server.client_connector(i).is_some_and(|c| c.send_buffer_len() == 0)));
    }

    #[test]
    #[should_panic(expected = "not connected")]
    fn test_compose_to_disconnected_slot_panics() {
        let mut server = server(2);
        server.compose(1, "ping", &());
    }

    #[test]
    #[should_panic(expected = "server has 2 slots")]
    fn test_compose_out_of_range_panics() {
        let mut server = server(2);
        server.compose(7, "ping", &());
    }

    #[test]
    fn test_timeout_limit_applies_to_slots() {
        let mut server = server(2);
        server.set_timeout_limit(Duration::from_secs(30));
        assert_eq!(server.timeout_limit(), Duration::from_secs(30));
        server.resize(3).unwrap();
        assert!((0..3).all(|i| server
            .client_connector(i)
            .is_some_and(|c| c.timeout_limit() == Duration::from_secs(30))));
    }

    #[test]
    fn test_user_data() {
        let mut server = server(1);
        assert!(server.user_data_mut::<u32>().is_none());
        server.set_user_data(41u32);
        *server.user_data_mut::<u32>().unwrap() += 1;
        assert_eq!(server.user_data_mut::<u32>(), Some(&mut 42));
        assert!(server.user_data_mut::<String>().is_none());
    }

    #[test]
    fn test_full_server_rejects_hello() {
        let mut server = server(0);
        let client_addr: SocketAddr = "10.0.0.9:9".parse().unwrap();
        let (server_t, mut client_t) = MemoryTransport::pair("10.0.0.1:1".parse().unwrap(), client_addr);
        server.start_with_transport(Box::new(server_t)).unwrap();

        let hello = Datagram::Hello {
            passphrase: "pw".into(),
        };
        client_t.send_to(&hello.to_bytes(), "10.0.0.1:1".parse().unwrap()).unwrap();
        let telemetry = server.update(UpdateMode::Receive);
        assert!(telemetry.download_bytes > 0);
        assert!(telemetry.upload_bytes > 0);

        let mut buf = [0u8; 64];
        let (size, _) = client_t.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(
            Datagram::parse(&buf[..size]).unwrap(),
            Datagram::Reject {
                reason: RejectReason::ServerFull
            }
        );
    }

    #[test]
    fn test_bad_passphrase_reported_once_per_sender() {
        let mut server = server(1);
        let server_addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let (server_t, mut client_t) = MemoryTransport::pair(server_addr, "10.0.0.9:9".parse().unwrap());
        server.start_with_transport(Box::new(server_t)).unwrap();

        let hello = Datagram::Hello {
            passphrase: "nope".into(),
        };
        for _ in 0..3 {
            client_t.send_to(&hello.to_bytes(), server_addr).unwrap();
            server.update(UpdateMode::Receive);
        }

        // Every Hello is answered, but only the first is reported.
        assert_eq!(client_t.pending(), 3);
        assert_eq!(
            server.poll_event(),
            Some(Event::BadPassphrase {
                client_index: Some(0),
                passphrase: "nope".into()
            })
        );
        assert!(server.poll_event().is_none());
        assert_eq!(server.connected_count(), 0);
    }
}
