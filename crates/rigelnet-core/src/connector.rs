//! Per-peer connection state machine and reliable pipeline.
//!
//! A `Connector` tracks one remote peer: its handshake state, the reliable
//! send and receive windows, pending acknowledgements, unreliable payloads
//! and latency estimates. Connectors are reset rather than dropped when a
//! connection ends, so a server slot can be reused without reallocation.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --Connect ok--> Connected
//! Disconnected --Hello ok---> Accepting  --Data/Acks---> Connected
//! any --------disconnect / timeout / remote Disconnect--> Disconnected
//! ```
//!
//! Only `Connected` connectors exchange Data, Acks and UnsafeData.
//!
//! # Acknowledgements
//!
//! Every received Data ordinal is queued for acknowledgement. During the
//! receive phase the queue goes out as a standalone Acks datagram (a weak
//! ack: the sender stops retransmitting). The same queue is then folded into
//! the next sealed Data slot (a strong ack: the sender may forget the slot)
//! and cleared. Since Data slots are themselves reliable, strong acks are
//! eventually delivered even if every Acks datagram is lost.
//!
//! # Fragmentation
//!
//! A reliable message larger than the maximum packet size is sealed as a
//! run of DataMore slots closed by a DataTail slot, one chunk per ordinal.
//! Unreliable messages are never fragmented.

use crate::buffer::{RecvBuffer, SendBuffer, StoreOutcome};
use crate::event::{ConnectFailReason, DisconnectReason, Event, EventQueue};
use crate::latency::LatencyEstimator;
use crate::node::NodeConfig;
use crate::packet::Packet;
use crate::retransmit::RetransmitPredicate;
use crate::telemetry::Telemetry;
use crate::wire::{self, Datagram, Fragment, RejectReason};
use rigelnet_transport::Transport;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectorStatus {
    /// No peer; initial and terminal state
    #[default]
    Disconnected,
    /// Server side: request accepted, waiting for the first Data
    Accepting,
    /// Client side: request sent, waiting for the acknowledgement
    Connecting,
    /// Handshake complete
    Connected,
}

impl ConnectorStatus {
    /// Check if a transition to `to` is allowed
    #[must_use]
    pub fn can_transition_to(self, to: ConnectorStatus) -> bool {
        use ConnectorStatus::{Accepting, Connected, Connecting, Disconnected};

        matches!(
            (self, to),
            (Disconnected, Connecting | Accepting)
                | (Connecting | Accepting, Connected)
                | (Connecting | Accepting | Connected, Disconnected)
        )
    }
}

/// What is known about the remote end of a connector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    /// Remote address, `None` while disconnected
    pub address: Option<SocketAddr>,
    /// Connection state
    pub status: ConnectorStatus,
    /// Smoothed round-trip latency
    pub mean_latency: Duration,
    /// Round-trip latency of recent quiet exchanges
    pub optimistic_latency: Duration,
    /// Recent worst-case round-trip latency
    pub pessimistic_latency: Duration,
}

/// I/O context a connector needs for one step of an update.
pub(crate) struct Link<'a> {
    pub transport: &'a mut dyn Transport,
    pub telemetry: &'a mut Telemetry,
    pub events: &'a mut EventQueue,
    pub now: Instant,
}

impl Link<'_> {
    pub fn transmit(&mut self, to: SocketAddr, bytes: &[u8]) {
        match self.transport.send_to(bytes, to) {
            Ok(_) => {
                tracing::trace!("Sent {} bytes to {}", bytes.len(), to);
                self.telemetry.record_upload(bytes.len());
            }
            Err(e) => tracing::warn!("Failed to send {} bytes to {}: {}", bytes.len(), to, e),
        }
    }

    pub fn transmit_datagram(&mut self, to: SocketAddr, datagram: &Datagram) {
        self.transmit(to, &datagram.to_bytes());
    }
}

/// Per-peer connection
pub struct Connector {
    slot: Option<usize>,
    info: RemoteInfo,
    client_index: Option<usize>,
    passphrase: String,
    timeout_limit: Duration,
    max_packet_size: usize,
    heartbeat_interval: u32,
    retransmit: RetransmitPredicate,
    send_buffer: SendBuffer,
    recv_buffer: RecvBuffer,
    pending_acks: Vec<u32>,
    outgoing: Packet,
    cycles_since_seal: u32,
    unsafe_outgoing: Vec<Packet>,
    unsafe_incoming: Vec<Packet>,
    latency: LatencyEstimator,
    last_heard: Instant,
}

impl Connector {
    /// Create a disconnected connector.
    ///
    /// `slot` is the server slot this connector occupies, `None` on clients.
    pub(crate) fn new(slot: Option<usize>, config: &NodeConfig, retransmit: RetransmitPredicate) -> Self {
        Self {
            slot,
            info: RemoteInfo::default(),
            client_index: slot,
            passphrase: config.passphrase.clone(),
            timeout_limit: config.timeout_limit,
            max_packet_size: config.max_packet_size,
            heartbeat_interval: config.heartbeat_interval,
            retransmit,
            send_buffer: SendBuffer::new(),
            recv_buffer: RecvBuffer::new(config.recv_window),
            pending_acks: Vec::new(),
            outgoing: Packet::new(),
            cycles_since_seal: 0,
            unsafe_outgoing: Vec::new(),
            unsafe_incoming: Vec::new(),
            latency: LatencyEstimator::new(),
            last_heard: Instant::now(),
        }
    }

    /// Current connection state
    #[must_use]
    pub fn status(&self) -> ConnectorStatus {
        self.info.status
    }

    /// Whether the handshake is complete
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.info.status == ConnectorStatus::Connected
    }

    /// Remote address, state and latency estimates
    #[must_use]
    pub fn remote_info(&self) -> &RemoteInfo {
        &self.info
    }

    /// Server slot of this connection.
    ///
    /// On a server this is the connector's own slot; on a client it is the
    /// slot the server assigned, known once connected.
    #[must_use]
    pub fn client_index(&self) -> Option<usize> {
        self.client_index
    }

    /// Reliable slots awaiting acknowledgement or release
    #[must_use]
    pub fn send_buffer_len(&self) -> usize {
        self.send_buffer.len()
    }

    /// Reliable slots received out of order or awaited
    #[must_use]
    pub fn recv_buffer_len(&self) -> usize {
        self.recv_buffer.len()
    }

    /// Current timeout limit
    #[must_use]
    pub fn timeout_limit(&self) -> Duration {
        self.timeout_limit
    }

    pub(crate) fn address(&self) -> Option<SocketAddr> {
        self.info.address
    }

    pub(crate) fn set_timeout_limit(&mut self, limit: Duration) {
        self.timeout_limit = limit;
    }

    pub(crate) fn set_retransmit_predicate(&mut self, predicate: RetransmitPredicate) {
        self.retransmit = predicate;
    }

    fn set_status(&mut self, to: ConnectorStatus) {
        let from = self.info.status;
        debug_assert!(
            from.can_transition_to(to),
            "invalid connector transition {from:?} -> {to:?}"
        );
        tracing::debug!(
            "Connector state transition: {:?} -> {:?} (slot {:?}, remote {:?})",
            from,
            to,
            self.slot,
            self.info.address
        );
        self.info.status = to;
    }

    /// Drop the peer and every buffered message.
    pub(crate) fn reset(&mut self) {
        if self.info.status != ConnectorStatus::Disconnected {
            self.set_status(ConnectorStatus::Disconnected);
        }
        self.info = RemoteInfo::default();
        self.client_index = self.slot;
        self.send_buffer.clear();
        self.recv_buffer.clear();
        self.pending_acks.clear();
        self.outgoing.clear();
        self.cycles_since_seal = 0;
        self.unsafe_outgoing.clear();
        self.unsafe_incoming.clear();
        self.latency.reset();
    }

    /// Start a client handshake towards `address`.
    pub(crate) fn connect(&mut self, address: SocketAddr, now: Instant) {
        self.reset();
        self.info.address = Some(address);
        self.last_heard = now;
        self.set_status(ConnectorStatus::Connecting);
        tracing::info!("Connecting to {}", address);
    }

    /// Offer a connection request from `address` to this free server slot.
    ///
    /// Returns `true` if the passphrase matched and the slot is now
    /// accepting. On a mismatch the requester receives a one-shot Reject and
    /// the slot stays disconnected; `report` controls whether a
    /// `BadPassphrase` event is queued as well.
    pub(crate) fn accept(&mut self, address: SocketAddr, passphrase: String, report: bool, link: &mut Link<'_>) -> bool {
        debug_assert_eq!(self.info.status, ConnectorStatus::Disconnected);

        if passphrase != self.passphrase {
            tracing::warn!(
                "Rejected connection request from {}: bad passphrase",
                address
            );
            link.transmit_datagram(
                address,
                &Datagram::Reject {
                    reason: RejectReason::BadPassphrase,
                },
            );
            if report {
                link.events.push(Event::BadPassphrase {
                    client_index: self.slot,
                    passphrase,
                });
            }
            return false;
        }

        self.reset();
        self.info.address = Some(address);
        self.last_heard = link.now;
        self.set_status(ConnectorStatus::Accepting);
        tracing::info!("Accepting connection from {} into slot {:?}", address, self.slot);
        true
    }

    /// Process one datagram received from this connector's peer.
    pub(crate) fn receive(&mut self, datagram: Datagram, link: &mut Link<'_>) {
        let status = self.info.status;
        if status == ConnectorStatus::Disconnected {
            return;
        }

        // A connected peer that starts over with Hello has lost its state;
        // let the slot run into its timeout instead of keeping it alive.
        let stale_hello = matches!(datagram, Datagram::Hello { .. }) && status == ConnectorStatus::Connected;
        if !stale_hello {
            self.last_heard = link.now;
        }

        match datagram {
            Datagram::Hello { .. } => {}
            Datagram::Connect {
                passphrase,
                client_index,
            } => self.receive_connect(passphrase, client_index, link),
            Datagram::Reject { reason } => self.receive_reject(reason, link),
            Datagram::Disconnect { message } => self.receive_disconnect(&message, link),
            Datagram::Data {
                fragment,
                ordinal,
                acks,
                payload,
            } => {
                if self.promote_on_traffic(link) {
                    self.receive_data(fragment, ordinal, &acks, payload, link.now);
                }
            }
            Datagram::Acks { ordinals } => {
                if self.promote_on_traffic(link) {
                    for ordinal in ordinals {
                        self.on_ack(ordinal, false, link.now);
                    }
                }
            }
            Datagram::UnsafeData { payload } => {
                if self.is_connected() && !payload.is_empty() {
                    self.unsafe_incoming.push(payload);
                }
            }
        }
    }

    /// First Data or Acks from the client completes a server handshake.
    fn promote_on_traffic(&mut self, link: &mut Link<'_>) -> bool {
        match self.info.status {
            ConnectorStatus::Connected => true,
            ConnectorStatus::Accepting => {
                self.set_status(ConnectorStatus::Connected);
                tracing::info!(
                    "Client {:?} connected from {:?}",
                    self.slot,
                    self.info.address
                );
                link.events.push(Event::Connected {
                    client_index: self.slot,
                });
                true
            }
            ConnectorStatus::Connecting | ConnectorStatus::Disconnected => false,
        }
    }

    fn receive_connect(&mut self, passphrase: String, client_index: u32, link: &mut Link<'_>) {
        if self.slot.is_some() || self.info.status != ConnectorStatus::Connecting {
            return;
        }

        if passphrase != self.passphrase {
            tracing::warn!(
                "Server {:?} answered with a different passphrase",
                self.info.address
            );
            link.events.push(Event::BadPassphrase {
                client_index: None,
                passphrase,
            });
            self.reset();
            return;
        }

        self.client_index = Some(client_index as usize);
        self.set_status(ConnectorStatus::Connected);
        tracing::info!(
            "Connected to {:?} as client {}",
            self.info.address,
            client_index
        );
        link.events.push(Event::Connected { client_index: None });
    }

    fn receive_reject(&mut self, reason: RejectReason, link: &mut Link<'_>) {
        if self.slot.is_some() || self.info.status != ConnectorStatus::Connecting {
            return;
        }

        tracing::warn!(
            "Connection request to {:?} rejected: {:?}",
            self.info.address,
            reason
        );
        let event = match reason {
            RejectReason::BadPassphrase => Event::BadPassphrase {
                client_index: None,
                passphrase: self.passphrase.clone(),
            },
            RejectReason::ServerFull => Event::ConnectAttemptFailed {
                client_index: None,
                reason: ConnectFailReason::ServerFull,
            },
        };
        link.events.push(event);
        self.reset();
    }

    fn receive_disconnect(&mut self, message: &str, link: &mut Link<'_>) {
        let event = if self.is_connected() {
            tracing::info!(
                "Remote {:?} terminated the connection: {}",
                self.info.address,
                message
            );
            Event::Disconnected {
                client_index: self.slot,
                reason: DisconnectReason::Graceful,
                message: format!("Remote terminated the connection: {message}"),
            }
        } else {
            Event::ConnectAttemptFailed {
                client_index: self.slot,
                reason: ConnectFailReason::Error,
            }
        };
        link.events.push(event);
        self.reset();
    }

    fn receive_data(&mut self, fragment: Fragment, ordinal: u32, acks: &[u32], payload: Packet, now: Instant) {
        for &ack in acks {
            self.on_ack(ack, true, now);
        }

        match self.recv_buffer.store_fragment(ordinal, fragment, payload) {
            StoreOutcome::Stored => self.queue_ack(ordinal),
            StoreOutcome::Duplicate => {
                tracing::trace!("Duplicate ordinal {} from {:?}", ordinal, self.info.address);
                self.queue_ack(ordinal);
            }
            StoreOutcome::OutOfWindow => tracing::warn!(
                "Discarding ordinal {} from {:?}: outside receive window (head {})",
                ordinal,
                self.info.address,
                self.recv_buffer.head()
            ),
        }
    }

    fn queue_ack(&mut self, ordinal: u32) {
        if !self.pending_acks.contains(&ordinal) {
            self.pending_acks.push(ordinal);
        }
    }

    fn on_ack(&mut self, ordinal: u32, strong: bool, now: Instant) {
        if let Some(sample) = self.send_buffer.ack(ordinal, strong, now) {
            self.latency.record(sample);
        }
    }

    /// Receive phase: publish latency and send queued acks weakly.
    pub(crate) fn send_acks(&mut self, link: &mut Link<'_>) {
        if !self.is_connected() {
            return;
        }

        if self.latency.finish_cycle() {
            self.info.mean_latency = self.latency.mean();
            self.info.optimistic_latency = self.latency.optimistic();
            self.info.pessimistic_latency = self.latency.pessimistic();
        }

        if let (Some(address), false) = (self.info.address, self.pending_acks.is_empty()) {
            link.transmit_datagram(
                address,
                &Datagram::Acks {
                    ordinals: self.pending_acks.clone(),
                },
            );
        }
    }

    /// Take every payload ready for dispatch: reliable ones in ordinal order,
    /// then unreliable ones in arrival order.
    pub(crate) fn take_ready(&mut self) -> Vec<Packet> {
        if !self.is_connected() {
            return Vec::new();
        }
        let mut ready = self.recv_buffer.drain_ready();
        ready.append(&mut self.unsafe_incoming);
        ready
    }

    /// Drop the peer if nothing was heard within the timeout limit.
    pub(crate) fn check_for_timeout(&mut self, link: &mut Link<'_>) {
        if self.timeout_limit.is_zero() || self.info.status == ConnectorStatus::Disconnected {
            return;
        }
        if link.now.saturating_duration_since(self.last_heard) <= self.timeout_limit {
            return;
        }

        tracing::warn!(
            "Connection to {:?} timed out in state {:?}",
            self.info.address,
            self.info.status
        );
        let event = if self.is_connected() {
            Event::Disconnected {
                client_index: self.slot,
                reason: DisconnectReason::TimedOut,
                message: "Connection timed out".to_string(),
            }
        } else {
            Event::ConnectAttemptFailed {
                client_index: self.slot,
                reason: ConnectFailReason::TimedOut,
            }
        };
        link.events.push(event);
        self.reset();
    }

    /// Send phase: handshake retries, or sealing and (re)transmission.
    pub(crate) fn send(&mut self, link: &mut Link<'_>) {
        let Some(address) = self.info.address else {
            return;
        };

        match self.info.status {
            ConnectorStatus::Disconnected => {}
            ConnectorStatus::Connecting => link.transmit_datagram(
                address,
                &Datagram::Hello {
                    passphrase: self.passphrase.clone(),
                },
            ),
            ConnectorStatus::Accepting => link.transmit_datagram(
                address,
                &Datagram::Connect {
                    passphrase: self.passphrase.clone(),
                    client_index: self.slot.unwrap_or_default() as u32,
                },
            ),
            ConnectorStatus::Connected => {
                self.cycles_since_seal += 1;
                if !self.outgoing.is_empty() || self.cycles_since_seal >= self.heartbeat_interval {
                    self.seal();
                }

                let now = link.now;
                let latency = self.latency.mean();
                self.send_buffer
                    .transmit_due(now, latency, &self.retransmit, |bytes| link.transmit(address, bytes));

                for payload in self.unsafe_outgoing.drain(..) {
                    link.transmit_datagram(address, &Datagram::UnsafeData { payload });
                }
            }
        }
    }

    /// Close the open payload into a new sequenced slot carrying the pending
    /// acks strongly.
    fn seal(&mut self) {
        self.seal_as(Fragment::Whole);
    }

    fn seal_as(&mut self, fragment: Fragment) {
        let ordinal = self.send_buffer.next_ordinal();
        let datagram = wire::encode_fragment(fragment, ordinal, &self.pending_acks, self.outgoing.as_bytes());
        let has_data = !self.outgoing.is_empty();
        self.send_buffer.push(Packet::from_bytes(datagram), has_data);

        self.pending_acks.clear();
        self.outgoing.clear();
        self.cycles_since_seal = 0;
    }

    /// Queue an encoded handler message for reliable delivery.
    ///
    /// Messages larger than the maximum packet size are split across
    /// consecutive slots right away.
    pub(crate) fn append_reliable(&mut self, message: &[u8]) {
        if message.len() > self.max_packet_size {
            self.append_fragmented(message);
            return;
        }
        if self.outgoing.data_size() + message.len() > self.max_packet_size {
            self.seal();
        }
        self.outgoing.append_bytes(message);
    }

    fn append_fragmented(&mut self, message: &[u8]) {
        if !self.outgoing.is_empty() {
            self.seal();
        }

        let mut chunks = message.chunks(self.max_packet_size).peekable();
        tracing::debug!(
            "Fragmenting {}-byte message into {} slots",
            message.len(),
            message.len().div_ceil(self.max_packet_size)
        );
        while let Some(chunk) = chunks.next() {
            self.outgoing.append_bytes(chunk);
            if chunks.peek().is_some() {
                self.seal_as(Fragment::More);
            } else {
                self.seal_as(Fragment::Tail);
            }
        }
    }

    /// Queue an encoded handler message for one unreliable transmission.
    ///
    /// # Panics
    ///
    /// Panics if the message alone exceeds the maximum packet size.
    pub(crate) fn append_unsafe(&mut self, message: &[u8]) {
        self.check_message_size(message);
        match self.unsafe_outgoing.last_mut() {
            Some(open) if open.data_size() + message.len() <= self.max_packet_size => {
                open.append_bytes(message);
            }
            _ => self.unsafe_outgoing.push(Packet::from_bytes(message)),
        }
    }

    fn check_message_size(&self, message: &[u8]) {
        assert!(
            message.len() <= self.max_packet_size,
            "message of {} bytes exceeds the maximum packet size of {} bytes",
            message.len(),
            self.max_packet_size
        );
    }

    /// Local disconnect, optionally notifying the peer.
    pub(crate) fn disconnect(&mut self, notify_remote: bool, message: &str, link: &mut Link<'_>) {
        let event = match self.info.status {
            ConnectorStatus::Disconnected => return,
            ConnectorStatus::Connected => Event::Disconnected {
                client_index: self.slot,
                reason: DisconnectReason::Graceful,
                message: message.to_string(),
            },
            ConnectorStatus::Connecting | ConnectorStatus::Accepting => Event::ConnectAttemptFailed {
                client_index: self.slot,
                reason: ConnectFailReason::Error,
            },
        };

        if let (true, Some(address)) = (notify_remote, self.info.address) {
            link.transmit_datagram(
                address,
                &Datagram::Disconnect {
                    message: message.to_string(),
                },
            );
        }

        tracing::info!("Disconnecting from {:?}: {}", self.info.address, message);
        link.events.push(event);
        self.reset();
    }

    /// Drop a peer that violated the protocol, telling it why.
    pub(crate) fn terminate(&mut self, message: String, link: &mut Link<'_>) {
        if self.info.status == ConnectorStatus::Disconnected {
            return;
        }
        if let Some(address) = self.info.address {
            link.transmit_datagram(
                address,
                &Datagram::Disconnect {
                    message: message.clone(),
                },
            );
        }

        tracing::warn!(
            "Dropping {:?} after protocol error: {}",
            self.info.address,
            message
        );
        link.events.push(Event::Disconnected {
            client_index: self.slot,
            reason: DisconnectReason::Error,
            message,
        });
        self.reset();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("slot", &self.slot)
            .field("info", &self.info)
            .field("client_index", &self.client_index)
            .field("send_buffer", &self.send_buffer.len())
            .field("recv_buffer", &self.recv_buffer.len())
            .field("pending_acks", &self.pending_acks.len())
            .finish()
    }
}
