//! Chat and latency-probe RPC handlers.
//!
//! Both ends build the same registry, so handler IDs agree without any
//! negotiation.

use rigelnet_core::node::{NodeExt, NodeInterface, Recipient};
use rigelnet_core::{HandlerError, HandlerRegistry, Packet};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Client announces its display name
pub const JOIN: &str = "chat.join";
/// Client posts a line of text
pub const SAY: &str = "chat.say";
/// Server relays a line to every client
pub const LINE: &str = "chat.line";
/// Probe timestamp, client to server
pub const PING: &str = "probe.ping";
/// Echoed probe timestamp, server to client
pub const PONG: &str = "probe.pong";

const MAX_NAME_LEN: usize = 32;

/// Display names of the clients in each server slot
#[derive(Debug, Default)]
pub struct ChatRoom {
    names: HashMap<usize, String>,
}

impl ChatRoom {
    /// Name of the client in `slot`
    pub fn name_of(&self, slot: usize) -> String {
        self.names
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| format!("client{slot}"))
    }

    /// Forget the client in `slot`, returning its name if it had joined
    pub fn leave(&mut self, slot: usize) -> Option<String> {
        self.names.remove(&slot)
    }

    /// Joined clients, ordered by slot
    pub fn members(&self) -> Vec<(usize, &str)> {
        let mut members: Vec<_> = self.names.iter().map(|(slot, name)| (*slot, name.as_str())).collect();
        members.sort_unstable();
        members
    }
}

/// Round-trip samples collected by the probe command
#[derive(Debug)]
pub struct Probe {
    start: Instant,
    /// Measured round trips
    pub rtts: Vec<Duration>,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            rtts: Vec::new(),
        }
    }
}

impl Probe {
    /// Microseconds since the probe started
    pub fn stamp(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn record(&mut self, stamp: u64) {
        let sent = Duration::from_micros(stamp);
        self.rtts.push(self.start.elapsed().saturating_sub(sent));
    }
}

/// Build and index the registry used by every rigel command
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(JOIN, on_join)
        .register(SAY, on_say)
        .register(LINE, on_line)
        .register(PING, on_ping)
        .register(PONG, on_pong);
    registry.index();
    registry
}

/// Slot of the sending client; only servers have one.
fn sender(node: &dyn NodeInterface, handler: &str) -> Result<usize, HandlerError> {
    node.sender_index()
        .ok_or_else(|| HandlerError::Illegal(format!("{handler} is client-to-server only")))
}

fn on_join(node: &mut dyn NodeInterface, packet: &mut Packet) -> Result<(), HandlerError> {
    let slot = sender(node, JOIN)?;
    let name: String = packet.extract_or_err()?;
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(HandlerError::Illegal(format!(
            "name must be 1 to {MAX_NAME_LEN} bytes"
        )));
    }

    if let Some(room) = node.user_data_mut::<ChatRoom>() {
        room.names.insert(slot, name.to_string());
    }
    tracing::info!("Client {} joined as '{}'", slot, name);
    node.compose(Recipient::All, LINE, &("server", format!("{name} joined")));
    Ok(())
}

fn on_say(node: &mut dyn NodeInterface, packet: &mut Packet) -> Result<(), HandlerError> {
    let slot = sender(node, SAY)?;
    let text: String = packet.extract_or_err()?;
    let name = node
        .user_data_mut::<ChatRoom>()
        .map_or_else(|| format!("client{slot}"), |room| room.name_of(slot));

    tracing::debug!("<{}> {}", name, text);
    node.compose(Recipient::All, LINE, &(name, text));
    Ok(())
}

fn on_line(node: &mut dyn NodeInterface, packet: &mut Packet) -> Result<(), HandlerError> {
    if node.is_server() {
        return Err(HandlerError::Illegal(format!("{LINE} is server-to-client only")));
    }
    let (name, text): (String, String) = packet.extract_or_err()?;
    println!("<{name}> {text}");
    Ok(())
}

fn on_ping(node: &mut dyn NodeInterface, packet: &mut Packet) -> Result<(), HandlerError> {
    let slot = sender(node, PING)?;
    let stamp: u64 = packet.extract_or_err()?;
    node.compose_unsafe(slot, PONG, &stamp);
    Ok(())
}

fn on_pong(node: &mut dyn NodeInterface, packet: &mut Packet) -> Result<(), HandlerError> {
    let stamp: u64 = packet.extract_or_err()?;
    if let Some(probe) = node.user_data_mut::<Probe>() {
        probe.record(stamp);
    }
    Ok(())
}
