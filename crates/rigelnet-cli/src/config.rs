//! Configuration system for the rigel CLI.

use rigelnet_core::node::{NodeConfig, UnknownHandlerPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// rigel configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Protocol settings shared by every command
    #[serde(default)]
    pub node: NodeSettings,
    /// Chat server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Chat client and probe settings
    #[serde(default)]
    pub client: ClientConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Shared passphrase checked during the handshake
    #[serde(default = "default_passphrase")]
    pub passphrase: String,
    /// Connection timeout in milliseconds (0 disables)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum reliable payload per datagram
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Send cycles between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u32,
    /// Receive window in ordinals
    #[serde(default = "default_recv_window")]
    pub recv_window: usize,
    /// Skip unknown handler IDs instead of disconnecting
    #[serde(default)]
    pub ignore_unknown_handlers: bool,
    /// Delay between update cycles in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Chat server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of client slots
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// Chat client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address as host:port
    #[serde(default = "default_server")]
    pub server: String,
    /// Local UDP port (0 for ephemeral)
    #[serde(default)]
    pub local_port: u16,
    /// Name shown to other chat users
    #[serde(default = "default_name")]
    pub name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_passphrase() -> String {
    "rigelnet".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_packet_size() -> usize {
    1200
}

fn default_heartbeat_interval() -> u32 {
    1
}

fn default_recv_window() -> usize {
    4096
}

fn default_tick_ms() -> u64 {
    16
}

fn default_port() -> u16 {
    7777
}

fn default_capacity() -> usize {
    16
}

fn default_server() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_name() -> String {
    "anonymous".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            passphrase: default_passphrase(),
            timeout_ms: default_timeout_ms(),
            max_packet_size: default_max_packet_size(),
            heartbeat_interval: default_heartbeat_interval(),
            recv_window: default_recv_window(),
            ignore_unknown_handlers: false,
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            capacity: default_capacity(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            local_port: 0,
            name: default_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("rigelnet/config.toml")
    }

    /// Load config from the default path, or the built-in defaults if no
    /// file exists there
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Protocol configuration for a node
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            passphrase: self.node.passphrase.clone(),
            timeout_limit: Duration::from_millis(self.node.timeout_ms),
            max_packet_size: self.node.max_packet_size,
            heartbeat_interval: self.node.heartbeat_interval,
            recv_window: self.node.recv_window,
            unknown_handler_policy: if self.node.ignore_unknown_handlers {
                UnknownHandlerPolicy::Ignore
            } else {
                UnknownHandlerPolicy::Disconnect
            },
        }
    }

    /// Delay between update cycles
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.node.tick_ms)
    }

    /// Split the configured server address into host and port
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `host:port`.
    pub fn server_host_port(&self) -> anyhow::Result<(String, u16)> {
        parse_host_port(&self.client.server, "Server address")
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.node_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid [node] section: {}", e))?;

        self.server_host_port()?;

        if self.server.capacity == 0 || self.server.capacity > 4096 {
            anyhow::bail!("Server capacity must be between 1 and 4096");
        }

        if self.node.tick_ms == 0 || self.node.tick_ms > 1000 {
            anyhow::bail!("Tick must be between 1 and 1000 ms");
        }

        if self.client.name.trim().is_empty() {
            anyhow::bail!("Client name must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Split `host:port`, rejecting empty hosts and port 0.
pub fn parse_host_port(addr: &str, name: &str) -> anyhow::Result<(String, u16)> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;
    if port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    // Bracketed IPv6 literals: [::1]:7777
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }

    Ok((host.to_string(), port))
}
