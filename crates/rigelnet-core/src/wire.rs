//! Datagram framing.
//!
//! Every RigelNet datagram begins with a big-endian `u32` message kind. The
//! tags are arbitrary 32-bit constants rather than small integers so that
//! stray traffic on the port is rejected instead of misparsed.
//!
//! ```text
//! Hello       kind | passphrase: str
//! Connect     kind | passphrase: str | client index: u32
//! Disconnect  kind | message: str (may be absent)
//! Data        kind | ordinal: u32 | strong acks: u32... 0 | messages
//! DataMore    kind | ordinal: u32 | strong acks: u32... 0 | message bytes
//! DataTail    kind | ordinal: u32 | strong acks: u32... 0 | message bytes
//! Acks        kind | ordinal: u32 ...
//! UnsafeData  kind | messages
//! Reject      kind | reason: u8
//! ```
//!
//! `messages` is a back-to-back run of `HandlerId (u16) | arguments`.
//!
//! A reliable message too large for one slot is cut into chunks carried by
//! consecutive ordinals: every chunk but the last travels as DataMore, the
//! last as DataTail. The receiver joins the run back into one message.

use crate::error::{PacketError, WireError};
use crate::packet::Packet;

/// Size of the message kind prefix
pub const KIND_SIZE: usize = 4;

/// Fixed overhead of a Data datagram with no acks
pub const DATA_HEADER_SIZE: usize = KIND_SIZE + 4 + 4;

/// Leading tag of every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Client connection request
    Hello = 0x3BF0_E110,
    /// Server acknowledgement of a connection request
    Connect = 0x83C9_6CA4,
    /// Graceful termination notice
    Disconnect = 0xD0F2_35AB,
    /// Sequenced, acknowledged payload
    Data = 0xA765_B8F6,
    /// Standalone acknowledgements
    Acks = 0x71AC_2519,
    /// Fire-and-forget payload
    UnsafeData = 0x5E1F_0B7D,
    /// Server refusal of a connection request
    Reject = 0x4EC7_D15A,
    /// Leading or middle chunk of a fragmented reliable message
    DataMore = 0x9C2E_41D3,
    /// Final chunk of a fragmented reliable message
    DataTail = 0x2B8F_D06E,
}

impl MessageKind {
    /// Wire value of this kind
    #[must_use]
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x3BF0_E110 => Ok(Self::Hello),
            0x83C9_6CA4 => Ok(Self::Connect),
            0xD0F2_35AB => Ok(Self::Disconnect),
            0xA765_B8F6 => Ok(Self::Data),
            0x71AC_2519 => Ok(Self::Acks),
            0x5E1F_0B7D => Ok(Self::UnsafeData),
            0x4EC7_D15A => Ok(Self::Reject),
            0x9C2E_41D3 => Ok(Self::DataMore),
            0x2B8F_D06E => Ok(Self::DataTail),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Why a server refused a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// Passphrase did not match
    BadPassphrase = 1,
    /// No free client slot
    ServerFull = 2,
}

impl TryFrom<u8> for RejectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BadPassphrase),
            2 => Ok(Self::ServerFull),
            other => Err(WireError::UnknownRejectReason(other)),
        }
    }
}

/// Position of a Data payload within a reliable message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Fragment {
    /// Complete handler messages
    #[default]
    Whole,
    /// A chunk followed by more chunks of the same message
    More,
    /// The last chunk of a fragmented message
    Tail,
}

impl Fragment {
    /// Message kind carrying this fragment
    #[must_use]
    pub fn kind(self) -> MessageKind {
        match self {
            Self::Whole => MessageKind::Data,
            Self::More => MessageKind::DataMore,
            Self::Tail => MessageKind::DataTail,
        }
    }
}

/// A parsed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Connection request
    Hello {
        /// Passphrase offered by the client
        passphrase: String,
    },
    /// Connection acknowledgement
    Connect {
        /// Passphrase configured on the server
        passphrase: String,
        /// Server slot assigned to the client
        client_index: u32,
    },
    /// Termination notice
    Disconnect {
        /// Human-readable reason, empty if absent
        message: String,
    },
    /// Reliable payload
    Data {
        /// Whole messages or one chunk of a fragmented message
        fragment: Fragment,
        /// Sequence ordinal, never zero
        ordinal: u32,
        /// Remote ordinals acknowledged strongly
        acks: Vec<u32>,
        /// Handler messages, possibly empty
        payload: Packet,
    },
    /// Weak acknowledgements
    Acks {
        /// Acknowledged ordinals
        ordinals: Vec<u32>,
    },
    /// Unreliable payload
    UnsafeData {
        /// Handler messages
        payload: Packet,
    },
    /// Connection refusal
    Reject {
        /// Why the request was refused
        reason: RejectReason,
    },
}

impl Datagram {
    /// Kind tag of this datagram
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello { .. } => MessageKind::Hello,
            Self::Connect { .. } => MessageKind::Connect,
            Self::Disconnect { .. } => MessageKind::Disconnect,
            Self::Data { fragment, .. } => fragment.kind(),
            Self::Acks { .. } => MessageKind::Acks,
            Self::UnsafeData { .. } => MessageKind::UnsafeData,
            Self::Reject { .. } => MessageKind::Reject,
        }
    }

    /// Parse a received datagram.
    ///
    /// # Errors
    /// Returns `WireError` if the kind is unknown or the body is truncated
    /// or inconsistent.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < KIND_SIZE {
            return Err(WireError::TooShort {
                expected: KIND_SIZE,
                actual: bytes.len(),
            });
        }

        let mut packet = Packet::from_bytes(bytes);
        let kind = MessageKind::try_from(packet.extract_or_err::<u32>()?)?;

        let datagram = match kind {
            MessageKind::Hello => Self::Hello {
                passphrase: packet.extract_or_err()?,
            },
            MessageKind::Connect => Self::Connect {
                passphrase: packet.extract_or_err()?,
                client_index: packet.extract_or_err()?,
            },
            MessageKind::Disconnect => Self::Disconnect {
                message: if packet.end_of_packet() {
                    String::new()
                } else {
                    packet.extract_or_err()?
                },
            },
            MessageKind::Data | MessageKind::DataMore | MessageKind::DataTail => {
                let fragment = match kind {
                    MessageKind::DataMore => Fragment::More,
                    MessageKind::DataTail => Fragment::Tail,
                    _ => Fragment::Whole,
                };
                let ordinal: u32 = packet.extract_or_err()?;
                if ordinal == 0 {
                    return Err(WireError::InvalidOrdinal);
                }
                let mut acks = Vec::new();
                loop {
                    match packet.extract_or_err::<u32>()? {
                        0 => break,
                        ack => acks.push(ack),
                    }
                }
                Self::Data {
                    fragment,
                    ordinal,
                    acks,
                    payload: Packet::from_bytes(packet.remaining_bytes()),
                }
            }
            MessageKind::Acks => {
                if packet.remaining_data_size() % 4 != 0 {
                    return Err(WireError::Malformed(PacketError::ReadPastEnd {
                        requested: 4,
                        remaining: packet.remaining_data_size() % 4,
                    }));
                }
                let mut ordinals = Vec::with_capacity(packet.remaining_data_size() / 4);
                while !packet.end_of_packet() {
                    match packet.extract_or_err::<u32>()? {
                        0 => return Err(WireError::InvalidOrdinal),
                        ordinal => ordinals.push(ordinal),
                    }
                }
                Self::Acks { ordinals }
            }
            MessageKind::UnsafeData => Self::UnsafeData {
                payload: Packet::from_bytes(packet.remaining_bytes()),
            },
            MessageKind::Reject => Self::Reject {
                reason: RejectReason::try_from(packet.extract_or_err::<u8>()?)?,
            },
        };

        Ok(datagram)
    }

    /// Serialize for transmission
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = Packet::new();
        packet.append(&self.kind().to_u32());
        match self {
            Self::Hello { passphrase } => {
                packet.append(passphrase);
            }
            Self::Connect {
                passphrase,
                client_index,
            } => {
                packet.append(passphrase).append(client_index);
            }
            Self::Disconnect { message } => {
                packet.append(message);
            }
            Self::Data {
                fragment,
                ordinal,
                acks,
                payload,
            } => return encode_fragment(*fragment, *ordinal, acks, payload.as_bytes()),
            Self::Acks { ordinals } => {
                for ordinal in ordinals {
                    packet.append(ordinal);
                }
            }
            Self::UnsafeData { payload } => {
                packet.append_bytes(payload.as_bytes());
            }
            Self::Reject { reason } => {
                packet.append(&(*reason as u8));
            }
        }
        packet.into_bytes()
    }
}

/// Build a Data datagram without an intermediate [`Datagram`] value.
#[must_use]
pub fn encode_data(ordinal: u32, acks: &[u32], payload: &[u8]) -> Vec<u8> {
    encode_fragment(Fragment::Whole, ordinal, acks, payload)
}

/// Build a Data, DataMore or DataTail datagram.
#[must_use]
pub fn encode_fragment(fragment: Fragment, ordinal: u32, acks: &[u32], payload: &[u8]) -> Vec<u8> {
    let mut packet = Packet::with_capacity(DATA_HEADER_SIZE + acks.len() * 4 + payload.len());
    packet.append(&fragment.kind().to_u32()).append(&ordinal);
    for ack in acks {
        packet.append(ack);
    }
    packet.append(&0u32).append_bytes(payload);
    packet.into_bytes()
}

/// Short hex preview of a datagram for diagnostics
#[must_use]
pub fn hex_preview(bytes: &[u8]) -> String {
    const PREVIEW: usize = 32;
    if bytes.len() > PREVIEW {
        format!("{}..", hex::encode(&bytes[..PREVIEW]))
    } else {
        hex::encode(bytes)
    }
}
