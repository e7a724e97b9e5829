//! Node configuration

use super::error::{NodeError, Result};
use rigelnet_transport::MAX_DATAGRAM_SIZE;
use std::borrow::Cow;
use std::time::Duration;

/// Smallest accepted reliable payload size
pub const MIN_PACKET_SIZE: usize = 64;

/// What to do when a datagram names a handler ID that is not registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownHandlerPolicy {
    /// Treat it as a version mismatch and drop the peer
    #[default]
    Disconnect,
    /// Log it and skip the rest of that datagram
    Ignore,
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Shared secret compared verbatim during the handshake
    pub passphrase: String,

    /// Silence after which a connection or attempt is dropped (zero disables)
    pub timeout_limit: Duration,

    /// Maximum reliable payload bytes per datagram
    pub max_packet_size: usize,

    /// Send cycles between empty heartbeat slots
    pub heartbeat_interval: u32,

    /// Maximum ordinal distance accepted ahead of the receive head
    pub recv_window: usize,

    /// Handling of unregistered handler IDs
    pub unknown_handler_policy: UnknownHandlerPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            timeout_limit: Duration::from_secs(5),
            max_packet_size: 1200,
            heartbeat_interval: 1,
            recv_window: 4096,
            unknown_handler_policy: UnknownHandlerPolicy::Disconnect,
        }
    }
}

impl NodeConfig {
    /// Create a default configuration with the given passphrase
    #[must_use]
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PACKET_SIZE..=MAX_DATAGRAM_SIZE).contains(&self.max_packet_size) {
            return Err(NodeError::InvalidConfig(Cow::Owned(format!(
                "max_packet_size must be between {} and {}, got {}",
                MIN_PACKET_SIZE, MAX_DATAGRAM_SIZE, self.max_packet_size
            ))));
        }

        if self.heartbeat_interval == 0 {
            return Err(NodeError::invalid_config(
                "heartbeat_interval must be at least 1",
            ));
        }

        if self.recv_window == 0 || self.recv_window > u32::MAX as usize / 2 {
            return Err(NodeError::invalid_config(
                "recv_window must be between 1 and 2^31",
            ));
        }

        if self.passphrase.len() > self.max_packet_size {
            return Err(NodeError::invalid_config(
                "passphrase does not fit in a single datagram",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_packet_size, 1200);
        assert_eq!(config.heartbeat_interval, 1);
        assert_eq!(config.unknown_handler_policy, UnknownHandlerPolicy::Disconnect);
    }

    #[test]
    fn test_with_passphrase() {
        let config = NodeConfig::with_passphrase("beetlejuice");
        assert_eq!(config.passphrase, "beetlejuice");
        assert_eq!(config.timeout_limit, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig {
            max_packet_size: 10,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        config.max_packet_size = 1200;
        config.heartbeat_interval = 0;
        assert!(config.validate().is_err());

        config.heartbeat_interval = 4;
        config.recv_window = 0;
        assert!(config.validate().is_err());

        config.recv_window = 64;
        config.passphrase = "x".repeat(2000);
        assert!(config.validate().is_err());

        config.passphrase = "ok".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_allowed() {
        let config = NodeConfig {
            timeout_limit: Duration::ZERO,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
