//! Error types for the Node API
//!
//! Node errors only surface from setup calls (constructing a node, binding
//! its socket, resizing a server). Faults that happen while traffic flows are
//! reported through the event queue instead.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (port briefly in use, name lookup)
//! - **Permanent**: needs intervention (invalid config, wrong call order)
//!
//! # Example
//!
//! ```no_run
//! use rigelnet_core::node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use rigelnet_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Failed to bind or configure the socket
    #[error("Transport initialization failed: {0}")]
    TransportInit(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Remote host name could not be resolved
    #[error("Address resolution failed: {0}")]
    AddressResolution(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Handler registry was not indexed before use
    #[error("Handler registry must be indexed before creating a node")]
    RegistryNotIndexed,
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::TransportInit(_) | NodeError::Transport(_) | NodeError::AddressResolution(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::BindFailed { .. } => NodeError::TransportInit(Cow::Owned(err.to_string())),
            other => NodeError::Transport(Cow::Owned(other.to_string())),
        }
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;
