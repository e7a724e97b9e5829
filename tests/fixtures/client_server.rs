//! One server and any number of clients on localhost UDP.
//!
//! The fixture drives every node through the same cycle an application
//! would (clients send, server receives and sends, clients receive) and
//! collects their events so tests can wait on them.

use crate::test_helpers::{ci_timeout, init_tracing};
use rigelnet_core::node::{NodeConfig, NodeExt, NodeInterface, UdpClient, UdpServer, UpdateMode};
use rigelnet_core::{ConnectorStatus, Event, HandlerError, HandlerRegistry, Packet, Telemetry};
use rigelnet_transport::{LossyTransport, Transport, UdpTransport};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Messages received by a node, in dispatch order
#[derive(Debug, Default)]
pub struct Inbox {
    /// `text` messages with the sender slot (servers only)
    pub texts: Vec<(Option<usize>, String)>,
    /// `number` messages
    pub numbers: Vec<u32>,
    /// `blob` messages
    pub blobs: Vec<Vec<u8>>,
}

/// Registry shared by most tests.
///
/// - `blob(Vec<u8>)`: recorded in the [`Inbox`]
/// - `echo(String)`: servers reply to the sender with `text("echo: ...")`
/// - `number(u32)`: recorded in the [`Inbox`]
/// - `text(String)`: recorded in the [`Inbox`] with the sender slot
pub fn test_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("blob", |node, packet: &mut Packet| {
            let bytes: Vec<u8> = packet.extract_or_err()?;
            if let Some(inbox) = node.user_data_mut::<Inbox>() {
                inbox.blobs.push(bytes);
            }
            Ok(())
        })
        .register("echo", |node, packet: &mut Packet| {
            let text: String = packet.extract_or_err()?;
            let sender = node
                .sender_index()
                .ok_or_else(|| HandlerError::Illegal("echo is client-to-server only".into()))?;
            node.compose(sender, "text", &format!("echo: {text}"));
            Ok(())
        })
        .register("number", |node, packet: &mut Packet| {
            let value: u32 = packet.extract_or_err()?;
            if let Some(inbox) = node.user_data_mut::<Inbox>() {
                inbox.numbers.push(value);
            }
            Ok(())
        })
        .register("text", |node, packet: &mut Packet| {
            let text: String = packet.extract_or_err()?;
            let sender = node.sender_index();
            if let Some(inbox) = node.user_data_mut::<Inbox>() {
                inbox.texts.push((sender, text));
            }
            Ok(())
        });
    registry.index();
    registry
}

/// Configures a [`ClientServerFixture`]
pub struct FixtureBuilder {
    server_config: NodeConfig,
    client_config: NodeConfig,
    server_registry: Arc<HandlerRegistry>,
    client_registry: Arc<HandlerRegistry>,
    capacity: usize,
    clients: usize,
    loss: Option<(f64, u64)>,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        let registry = Arc::new(test_registry());
        Self {
            server_config: NodeConfig::with_passphrase("beetlejuice"),
            client_config: NodeConfig::with_passphrase("beetlejuice"),
            server_registry: Arc::clone(&registry),
            client_registry: registry,
            capacity: 4,
            clients: 1,
            loss: None,
        }
    }
}

impl FixtureBuilder {
    /// Server configuration
    pub fn server_config(mut self, config: NodeConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Configuration shared by every client
    pub fn client_config(mut self, config: NodeConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Timeout limit on both sides
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.server_config.timeout_limit = limit;
        self.client_config.timeout_limit = limit;
        self
    }

    /// Registry used by the clients (defaults to [`test_registry`])
    pub fn client_registry(mut self, registry: HandlerRegistry) -> Self {
        self.client_registry = Arc::new(registry);
        self
    }

    /// Number of server slots
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Number of clients
    pub fn clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    /// Drop `rate` of all datagrams sent and received by every node
    pub fn loss(mut self, rate: f64, seed: u64) -> Self {
        self.loss = Some((rate, seed));
        self
    }

    /// Start the server and create the (still disconnected) clients
    pub fn build(self) -> ClientServerFixture {
        init_tracing();

        let mut server = UdpServer::new(self.server_config, self.capacity, self.server_registry)
            .expect("server config");
        server.set_user_data(Inbox::default());
        server
            .start_with_transport(bind(self.loss, 0))
            .expect("start server");
        let port = server.local_addr().expect("server address").port();

        let clients = (0..self.clients)
            .map(|_| {
                let mut client = UdpClient::new(self.client_config.clone(), Arc::clone(&self.client_registry))
                    .expect("client config");
                client.set_user_data(Inbox::default());
                client
            })
            .collect();

        ClientServerFixture {
            server,
            clients,
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            server_events: Vec::new(),
            client_events: vec![Vec::new(); self.clients],
            telemetry: Telemetry::new(),
            loss: self.loss,
        }
    }
}

fn bind(loss: Option<(f64, u64)>, salt: u64) -> Box<dyn Transport> {
    let transport = UdpTransport::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind localhost");
    match loss {
        Some((rate, seed)) => Box::new(
            LossyTransport::new(transport, rate, seed.wrapping_add(salt))
                .and_then(|lossy| lossy.with_recv_drop_rate(rate))
                .expect("loss rate"),
        ),
        None => Box::new(transport),
    }
}

/// A running server plus clients on localhost
pub struct ClientServerFixture {
    /// The server, already started
    pub server: UdpServer,
    /// Clients, connected on demand
    pub clients: Vec<UdpClient>,
    /// Where clients connect to
    pub server_addr: SocketAddr,
    /// Events polled from the server so far
    pub server_events: Vec<Event>,
    /// Events polled from each client so far
    pub client_events: Vec<Vec<Event>>,
    /// Traffic of every node since the fixture was built
    pub telemetry: Telemetry,
    loss: Option<(f64, u64)>,
}

impl ClientServerFixture {
    /// Fixture builder with a `beetlejuice` passphrase, 4 slots and 1 client
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder::default()
    }

    /// Start the handshake of client `index`
    pub fn connect(&mut self, index: usize) {
        let transport = bind(self.loss, index as u64 + 1);
        self.clients[index]
            .connect_with_transport(transport, self.server_addr)
            .expect("connect client");
    }

    /// Connect every client and wait until all are established.
    ///
    /// # Panics
    ///
    /// Panics if any handshake does not finish in time.
    pub fn establish(&mut self) {
        for index in 0..self.clients.len() {
            self.connect(index);
        }
        let connected = self.run_until(Duration::from_secs(5), |fixture| {
            fixture
                .clients
                .iter()
                .all(|client| client.status() == ConnectorStatus::Connected)
                && fixture.server.connected_count() == fixture.clients.len()
        });
        assert!(connected, "handshake did not complete");
    }

    /// One full update cycle of every node
    pub fn cycle(&mut self) {
        for client in &mut self.clients {
            self.telemetry += client.update(UpdateMode::Send);
        }
        self.cycle_server();
        for client in &mut self.clients {
            self.telemetry += client.update(UpdateMode::Receive);
        }
        self.collect_events();
    }

    /// Update only the server, as if every client went silent
    pub fn cycle_server(&mut self) {
        self.telemetry += self.server.update(UpdateMode::Receive);
        self.telemetry += self.server.update(UpdateMode::Send);
        self.collect_events();
    }

    /// Cycle until `done` holds or `limit` (CI-adjusted) elapses.
    ///
    /// Returns whether `done` held.
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&mut Self) -> bool,
    {
        let deadline = Instant::now() + ci_timeout(limit);
        loop {
            self.cycle();
            if done(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Cycle for `duration` regardless of what happens
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.cycle();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Messages the server has dispatched
    pub fn server_inbox(&mut self) -> &mut Inbox {
        self.server.user_data_mut::<Inbox>().expect("server inbox")
    }

    /// Messages client `index` has dispatched
    pub fn client_inbox(&mut self, index: usize) -> &mut Inbox {
        self.clients[index].user_data_mut::<Inbox>().expect("client inbox")
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.server.poll_event() {
            self.server_events.push(event);
        }
        for (client, events) in self.clients.iter_mut().zip(&mut self.client_events) {
            while let Some(event) = client.poll_event() {
                events.push(event);
            }
        }
    }
}
