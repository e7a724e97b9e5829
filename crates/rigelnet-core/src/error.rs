//! Error types for the RigelNet core protocol.

use thiserror::Error;

/// Packet extraction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Read would run past the end of the packet
    #[error("read past end of packet: requested {requested} bytes, {remaining} remaining")]
    ReadPastEnd {
        /// Bytes the read needed
        requested: usize,
        /// Bytes left in the packet
        remaining: usize,
    },

    /// Packet was poisoned by an earlier failed extraction
    #[error("packet is invalid after a failed extraction")]
    Poisoned,

    /// String field did not contain UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors returned by RPC handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler arguments could not be extracted
    #[error("malformed handler arguments: {0}")]
    Packet(#[from] PacketError),

    /// Handler rejected the message as a protocol violation
    #[error("illegal message: {0}")]
    Illegal(String),
}

/// Datagram framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Datagram too short to carry a message kind
    #[error("datagram too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown message kind tag
    #[error("unknown message kind: 0x{0:08X}")]
    UnknownKind(u32),

    /// Ordinal zero is reserved
    #[error("ordinal 0 is not a valid sequence number")]
    InvalidOrdinal,

    /// Unknown reject reason byte
    #[error("unknown reject reason: {0}")]
    UnknownRejectReason(u8),

    /// Message body could not be decoded
    #[error("malformed body: {0}")]
    Malformed(#[from] PacketError),
}
