//! Protocol events and the per-node event queue.

use std::collections::VecDeque;
use std::fmt;

/// Why an established connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// One side asked to disconnect
    Graceful,
    /// Nothing was heard from the peer within the timeout limit
    TimedOut,
    /// The peer violated the protocol
    Error,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Why a connection attempt did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailReason {
    /// The handshake did not finish within the timeout limit
    TimedOut,
    /// The attempt was aborted locally or by a protocol fault
    Error,
    /// The server had no free slot
    ServerFull,
}

impl fmt::Display for ConnectFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out"),
            Self::Error => write!(f, "error"),
            Self::ServerFull => write!(f, "server full"),
        }
    }
}

/// Something that happened to a connection.
///
/// `client_index` is the server slot the event concerns; clients always
/// report `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A handshake failed the passphrase check
    BadPassphrase {
        /// Server slot, if raised on a server
        client_index: Option<usize>,
        /// The passphrase that was rejected
        passphrase: String,
    },
    /// A connection attempt was abandoned
    ConnectAttemptFailed {
        /// Server slot, if raised on a server
        client_index: Option<usize>,
        /// Cause of the failure
        reason: ConnectFailReason,
    },
    /// A connection was established
    Connected {
        /// Server slot, if raised on a server
        client_index: Option<usize>,
    },
    /// An established connection ended
    Disconnected {
        /// Server slot, if raised on a server
        client_index: Option<usize>,
        /// Cause of the disconnect
        reason: DisconnectReason,
        /// Human-readable detail
        message: String,
    },
}

impl Event {
    /// Server slot this event concerns
    #[must_use]
    pub fn client_index(&self) -> Option<usize> {
        match self {
            Self::BadPassphrase { client_index, .. }
            | Self::ConnectAttemptFailed { client_index, .. }
            | Self::Connected { client_index }
            | Self::Disconnected { client_index, .. } => *client_index,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPassphrase { passphrase, .. } => {
                write!(f, "bad passphrase '{passphrase}'")
            }
            Self::ConnectAttemptFailed { reason, .. } => {
                write!(f, "connection attempt failed ({reason})")
            }
            Self::Connected { .. } => write!(f, "connected"),
            Self::Disconnected {
                reason, message, ..
            } => write!(f, "disconnected ({reason}): {message}"),
        }?;
        if let Some(index) = self.client_index() {
            write!(f, " [client {index}]")?;
        }
        Ok(())
    }
}

/// FIFO of pending events
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn push(&mut self, event: Event) {
        tracing::trace!("Event queued: {}", event);
        self.events.push_back(event);
    }

    /// Remove the oldest event
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Number of queued events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no event is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every queued event
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
