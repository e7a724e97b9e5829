//! Sequenced send and receive windows.
//!
//! Both windows are deques indexed by ordinal: slot `i` holds ordinal
//! `head + i`. Ordinals start at 1 and grow by one per sealed slot, so a
//! window never has holes in its ordinal space, only slots whose contents
//! have not arrived (receive side) or have not been acknowledged (send side).
//!
//! The receive window also joins fragmented messages: a run of `More`
//! chunks ending in a `Tail` is delivered as one payload once the tail
//! reaches the head.

use crate::packet::Packet;
use crate::retransmit::RetransmitPredicate;
use crate::wire::Fragment;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// First ordinal used by a fresh window
pub const FIRST_ORDINAL: u32 = 1;

/// One reliable slot of the send window
#[derive(Debug, Clone)]
pub struct TaggedPacket {
    /// Complete Data datagram, emptied once the slot is weakly acked
    pub packet: Packet,
    /// Whether the slot carries handler messages (false for heartbeats)
    pub has_data: bool,
    /// When the slot was last transmitted
    pub send_clock: Option<Instant>,
    cycles_since_send: u32,
    transmissions: u32,
    weak_acked: bool,
    strong_acked: bool,
}

impl TaggedPacket {
    fn new(packet: Packet, has_data: bool) -> Self {
        Self {
            packet,
            has_data,
            send_clock: None,
            cycles_since_send: 0,
            transmissions: 0,
            weak_acked: false,
            strong_acked: false,
        }
    }

    /// Whether the remote has confirmed receipt
    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.weak_acked || self.strong_acked
    }
}

/// Reliable outgoing window
#[derive(Debug)]
pub struct SendBuffer {
    head: u32,
    slots: VecDeque<TaggedPacket>,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self {
            head: FIRST_ORDINAL,
            slots: VecDeque::new(),
        }
    }
}

impl SendBuffer {
    /// Create an empty window starting at ordinal 1
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal the next pushed slot will receive
    #[must_use]
    pub fn next_ordinal(&self) -> u32 {
        self.head.wrapping_add(self.slots.len() as u32)
    }

    /// Ordinal of the oldest slot still held
    #[must_use]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Append a sealed datagram, returning its ordinal
    pub fn push(&mut self, datagram: Packet, has_data: bool) -> u32 {
        let ordinal = self.next_ordinal();
        self.slots.push_back(TaggedPacket::new(datagram, has_data));
        ordinal
    }

    /// Record an acknowledgement of `ordinal`.
    ///
    /// A weak ack stops retransmission; a strong ack additionally allows the
    /// slot to leave the window once every older slot has too. Returns a
    /// round-trip sample if this is the first ack of a slot that was put on
    /// the wire exactly once.
    pub fn ack(&mut self, ordinal: u32, strong: bool, now: Instant) -> Option<Duration> {
        let offset = ordinal.wrapping_sub(self.head) as usize;
        let slot = self.slots.get_mut(offset)?;

        let first_ack = !slot.is_acked();
        let sample = match slot.send_clock {
            Some(sent) if first_ack && slot.transmissions == 1 => Some(now.saturating_duration_since(sent)),
            _ => None,
        };

        if !slot.weak_acked {
            slot.weak_acked = true;
            slot.packet = Packet::new();
        }
        if strong {
            slot.strong_acked = true;
            while self.slots.front().is_some_and(|s| s.strong_acked) {
                self.slots.pop_front();
                self.head = self.head.wrapping_add(1);
            }
        }
        sample
    }

    /// Put every due slot on the wire through `transmit`.
    ///
    /// Fresh slots always go out. Slots sent before go out again only if
    /// `predicate` agrees; otherwise their cycle counter advances.
    pub fn transmit_due<F>(
        &mut self,
        now: Instant,
        latency: Duration,
        predicate: &RetransmitPredicate,
        mut transmit: F,
    ) -> usize
    where
        F: FnMut(&[u8]),
    {
        let mut sent = 0;
        for slot in self.slots.iter_mut().filter(|s| !s.is_acked()) {
            let due = match slot.send_clock {
                None => true,
                Some(last) => {
                    slot.cycles_since_send += 1;
                    predicate(
                        slot.cycles_since_send,
                        now.saturating_duration_since(last),
                        latency,
                    )
                }
            };
            if due {
                transmit(slot.packet.as_bytes());
                slot.send_clock = Some(now);
                slot.cycles_since_send = 0;
                slot.transmissions += 1;
                sent += 1;
            }
        }
        sent
    }

    /// Slots still held
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots not yet acknowledged in any way
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_acked()).count()
    }

    /// Drop every slot and restart at ordinal 1
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of offering a received ordinal to the receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First copy of this ordinal, now buffered
    Stored,
    /// Already delivered or already buffered
    Duplicate,
    /// Too far ahead of the window head
    OutOfWindow,
}

/// Reliable incoming window
#[derive(Debug)]
pub struct RecvBuffer {
    head: u32,
    window: usize,
    slots: VecDeque<Option<(Fragment, Packet)>>,
    assembly: Option<Packet>,
}

impl RecvBuffer {
    /// Create an empty window that accepts ordinals up to `window` ahead of
    /// the next expected one.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    #[must_use]
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "receive window must be non-zero");
        Self {
            head: FIRST_ORDINAL,
            window,
            slots: VecDeque::new(),
            assembly: None,
        }
    }

    /// Next ordinal expected for in-order delivery
    #[must_use]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Buffer the payload of `ordinal` unless it is a duplicate
    pub fn store(&mut self, ordinal: u32, payload: Packet) -> StoreOutcome {
        self.store_fragment(ordinal, Fragment::Whole, payload)
    }

    /// Buffer one chunk of a possibly fragmented message
    pub fn store_fragment(&mut self, ordinal: u32, fragment: Fragment, payload: Packet) -> StoreOutcome {
        // Ordinals behind the head wrap to huge offsets.
        let offset = ordinal.wrapping_sub(self.head) as usize;
        if offset > u32::MAX as usize / 2 {
            return StoreOutcome::Duplicate;
        }
        if offset >= self.window {
            return StoreOutcome::OutOfWindow;
        }

        if self.slots.len() <= offset {
            self.slots.resize(offset + 1, None);
        }
        let slot = &mut self.slots[offset];
        if slot.is_some() {
            return StoreOutcome::Duplicate;
        }
        *slot = Some((fragment, payload));
        StoreOutcome::Stored
    }

    /// Pop every contiguous slot at the head, in ordinal order.
    ///
    /// Empty heartbeat slots advance the head but are not returned. Chunks
    /// of a fragmented message also advance the head; they are held back
    /// and returned as one payload when the tail is popped.
    pub fn drain_ready(&mut self) -> Vec<Packet> {
        let mut ready = Vec::new();
        while let Some(Some(_)) = self.slots.front() {
            let Some(Some((fragment, packet))) = self.slots.pop_front() else {
                break;
            };
            self.head = self.head.wrapping_add(1);

            match fragment {
                Fragment::Whole => {
                    if let Some(partial) = self.assembly.take() {
                        tracing::warn!(
                            "Discarding {} bytes of a fragmented message cut off at ordinal {}",
                            partial.data_size(),
                            self.head.wrapping_sub(1)
                        );
                    }
                    if !packet.is_empty() {
                        ready.push(packet);
                    }
                }
                Fragment::More => {
                    self.assembly
                        .get_or_insert_with(Packet::new)
                        .append_bytes(packet.as_bytes());
                }
                Fragment::Tail => {
                    let mut message = self.assembly.take().unwrap_or_default();
                    message.append_bytes(packet.as_bytes());
                    ready.push(message);
                }
            }
        }
        ready
    }

    /// Bytes of a fragmented message joined so far, waiting for its tail
    #[must_use]
    pub fn assembling(&self) -> usize {
        self.assembly.as_ref().map_or(0, Packet::data_size)
    }

    /// Slots buffered or awaited ahead of the head
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every slot and restart at ordinal 1
    pub fn clear(&mut self) {
        self.head = FIRST_ORDINAL;
        self.slots.clear();
        self.assembly = None;
    }
}
