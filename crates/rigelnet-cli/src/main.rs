//! RigelNet CLI
//!
//! Chat server, chat client and latency probe over RigelNet.

mod chat;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, TryRecvError};
use rigelnet_core::node::{NodeExt, NodeInterface, Recipient, UdpClient, UdpServer, UpdateMode};
use rigelnet_core::{ConnectorStatus, Event, RemoteInfo, Telemetry, TransportStats};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chat::{ChatRoom, Probe};
use config::Config;

/// Interval between probe pings
const PING_INTERVAL: Duration = Duration::from_millis(100);

/// rigel - reliable RPC over UDP
#[derive(Parser)]
#[command(name = "rigel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared passphrase, overriding the configuration file
    #[arg(long, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chat server (type /help for operator commands)
    Server {
        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of client slots
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Join a chat server; every line typed is sent to the room
    Client {
        /// Server address (host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Measure round-trip latency to a server
    Probe {
        /// Server address (host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// How long to probe, in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    // Load configuration
    let mut config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else if cli.config.is_some() {
        anyhow::bail!("Config file not found: {}", config_path.display());
    } else {
        Config::load_or_default()?
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
        .init();

    match cli.command {
        Commands::Server { .. } => run_server(&config),
        Commands::Client { .. } => run_client(&config),
        Commands::Probe { seconds, .. } => run_probe(&config, Duration::from_secs(seconds)),
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(passphrase) = &cli.passphrase {
        config.node.passphrase.clone_from(passphrase);
    }

    match &cli.command {
        Commands::Server { port, capacity } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(capacity) = capacity {
                config.server.capacity = *capacity;
            }
        }
        Commands::Client { server, name } => {
            if let Some(server) = server {
                config.client.server.clone_from(server);
            }
            if let Some(name) = name {
                config.client.name.clone_from(name);
            }
        }
        Commands::Probe { server, .. } => {
            if let Some(server) = server {
                config.client.server.clone_from(server);
            }
        }
        Commands::InitConfig { .. } => {}
    }
}

/// Write the default configuration
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Forward stdin lines to the update loop without blocking it
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Run the chat server until `/quit`
fn run_server(config: &Config) -> anyhow::Result<()> {
    let registry = Arc::new(chat::registry());
    let mut server = UdpServer::new(config.node_config(), config.server.capacity, registry)?;
    server.set_user_data(ChatRoom::default());
    server
        .start(config.server.port)
        .with_context(|| format!("Failed to listen on port {}", config.server.port))?;

    println!("RigelNet chat server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(addr) = server.local_addr() {
        println!("Listening: {}", addr);
    }
    println!("Slots: {}", server.size());
    println!("Type /help for commands");

    let commands = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut total = Telemetry::new();
    let tick = config.tick();

    loop {
        total += server.update(UpdateMode::Receive);
        while let Some(event) = server.poll_event() {
            on_server_event(&mut server, &event);
        }

        if stdin_open {
            match commands.try_recv() {
                Ok(line) => {
                    if !server_command(&mut server, line.trim()) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => stdin_open = false,
            }
        }

        total += server.update(UpdateMode::Send);
        std::thread::sleep(tick);
    }

    let datagrams = server.transport_stats();
    server.stop(true);
    while let Some(event) = server.poll_event() {
        tracing::debug!("{}", event);
    }
    println!(
        "\nShutting down (sent {}, received {})",
        format_bytes(total.upload_bytes),
        format_bytes(total.download_bytes)
    );
    if let Some(stats) = datagrams {
        println!("{}", describe_datagrams(&stats));
    }
    Ok(())
}

fn on_server_event(server: &mut UdpServer, event: &Event) {
    println!("* {event}");

    if let Event::Disconnected {
        client_index: Some(slot),
        ..
    } = event
    {
        let left = server
            .user_data_mut::<ChatRoom>()
            .and_then(|room| room.leave(*slot));
        if let Some(name) = left {
            server.compose(Recipient::All, chat::LINE, &("server", format!("{name} left")));
        }
    }
}

/// Execute one operator command. Returns false on `/quit`.
fn server_command(server: &mut UdpServer, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("/quit") => return false,
        Some("/help") => {
            println!("/list             show slots");
            println!("/kick <slot>      disconnect a client");
            println!("/resize <slots>   change the number of slots");
            println!("/quit             stop the server");
            println!("anything else is broadcast to the room");
        }
        Some("/list") => list_slots(server),
        Some("/kick") => match words.next().and_then(|w| w.parse::<usize>().ok()) {
            Some(slot) => {
                if let Err(e) = server.kick_client(slot, true, "Kicked by the operator.") {
                    println!("Cannot kick {slot}: {e}");
                }
            }
            None => println!("Usage: /kick <slot>"),
        },
        Some("/resize") => match words.next().and_then(|w| w.parse::<usize>().ok()) {
            Some(size) => match server.resize(size) {
                Ok(()) => println!("Server now has {} slots", server.size()),
                Err(e) => println!("Cannot resize: {e}"),
            },
            None => println!("Usage: /resize <slots>"),
        },
        Some(_) => {
            server.compose(Recipient::All, chat::LINE, &("server", line));
        }
    }
    true
}

fn list_slots(server: &mut UdpServer) {
    let rows: Vec<(usize, RemoteInfo)> = (0..server.size())
        .filter_map(|slot| Some((slot, server.client_connector(slot)?.remote_info().clone())))
        .filter(|(_, info)| info.status != ConnectorStatus::Disconnected)
        .collect();

    if rows.is_empty() {
        println!("No clients ({} free slots)", server.size());
        return;
    }

    let names = server.user_data_mut::<ChatRoom>().map(|room| {
        rows.iter()
            .map(|(slot, _)| room.name_of(*slot))
            .collect::<Vec<_>>()
    });
    for (row, (slot, info)) in rows.iter().enumerate() {
        let name = names.as_ref().map_or("?", |names| names[row].as_str());
        println!(
            "{:>4}  {:<16} {:<22} {:<10} rtt {:?}",
            slot,
            name,
            info.address.map(|a| a.to_string()).unwrap_or_default(),
            format!("{:?}", info.status),
            info.mean_latency
        );
    }
}

/// Run the chat client until `/quit`, end of input or disconnection
fn run_client(config: &Config) -> anyhow::Result<()> {
    let (host, port) = config.server_host_port()?;
    let mut client = UdpClient::new(config.node_config(), Arc::new(chat::registry()))?;
    client
        .connect(config.client.local_port, &host, port)
        .with_context(|| format!("Failed to connect to {}", config.client.server))?;
    println!("Connecting to {} as '{}'...", config.client.server, config.client.name);

    // Held until the handshake completes.
    client.compose(Recipient::All, chat::JOIN, config.client.name.as_str());

    let lines = spawn_stdin_reader();
    let tick = config.tick();

    'run: loop {
        client.update(UpdateMode::Receive);
        while let Some(event) = client.poll_event() {
            match event {
                Event::Connected { .. } => {
                    println!("* connected (client {:?})", client.client_index());
                }
                other => {
                    println!("* {other}");
                    break 'run;
                }
            }
        }

        match lines.try_recv() {
            Ok(line) => match line.trim() {
                "/quit" => break,
                "" => {}
                text => client.compose(Recipient::All, chat::SAY, text),
            },
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        client.update(UpdateMode::Send);
        std::thread::sleep(tick);
    }

    client.disconnect(true);
    Ok(())
}

/// Ping the server for `duration` and report round-trip statistics
fn run_probe(config: &Config, duration: Duration) -> anyhow::Result<()> {
    let (host, port) = config.server_host_port()?;
    let mut client = UdpClient::new(config.node_config(), Arc::new(chat::registry()))?;
    client.set_user_data(Probe::default());
    client
        .connect(config.client.local_port, &host, port)
        .with_context(|| format!("Failed to connect to {}", config.client.server))?;

    let deadline = Instant::now() + duration;
    let tick = config.tick();
    let mut last_ping: Option<Instant> = None;
    let mut total = Telemetry::new();

    while Instant::now() < deadline {
        total += client.update(UpdateMode::Receive);
        while let Some(event) = client.poll_event() {
            if let Event::Connected { .. } = event {
                println!("Connected to {}", config.client.server);
            } else {
                client.disconnect(false);
                anyhow::bail!("Probe aborted: {event}");
            }
        }

        if client.status() == ConnectorStatus::Connected
            && last_ping.is_none_or(|sent| sent.elapsed() >= PING_INTERVAL)
        {
            let stamp = client.user_data_mut::<Probe>().map_or(0, |probe| probe.stamp());
            client.compose_unsafe(Recipient::All, chat::PING, &stamp);
            last_ping = Some(Instant::now());
        }

        total += client.update(UpdateMode::Send);
        std::thread::sleep(tick);
    }

    let info = client.server_connector().remote_info().clone();
    let datagrams = client.transport_stats();
    client.disconnect(true);
    let rtts = client
        .user_data_mut::<Probe>()
        .map(|probe| std::mem::take(&mut probe.rtts))
        .unwrap_or_default();

    let Some(stats) = RttStats::from_samples(&rtts) else {
        anyhow::bail!("No replies from {} within {:?}", config.client.server, duration);
    };
    println!("Samples: {}", stats.count);
    println!("RTT min/avg/max: {:?} / {:?} / {:?}", stats.min, stats.avg, stats.max);
    println!(
        "Estimator mean/optimistic/pessimistic: {:?} / {:?} / {:?}",
        info.mean_latency, info.optimistic_latency, info.pessimistic_latency
    );
    println!(
        "Traffic: sent {}, received {}",
        format_bytes(total.upload_bytes),
        format_bytes(total.download_bytes)
    );
    if let Some(stats) = datagrams {
        println!("{}", describe_datagrams(&stats));
    }
    Ok(())
}

/// Summary of probe round trips
#[derive(Debug, PartialEq, Eq)]
struct RttStats {
    count: usize,
    min: Duration,
    avg: Duration,
    max: Duration,
}

impl RttStats {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = samples.iter().copied().min()?;
        let max = samples.iter().copied().max()?;
        let total: Duration = samples.iter().sum();
        let count = samples.len();
        Some(Self {
            count,
            min,
            avg: total / u32::try_from(count).unwrap_or(u32::MAX),
            max,
        })
    }
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One-line summary of socket-level datagram counters
fn describe_datagrams(stats: &TransportStats) -> String {
    format!(
        "Datagrams: sent {}, received {}, dropped {}, errors {}",
        stats.packets_sent,
        stats.packets_received,
        stats.packets_dropped,
        stats.send_errors + stats.recv_errors
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_describe_datagrams() {
        let mut stats = TransportStats::new();
        stats.record_send(10);
        stats.record_send(10);
        stats.record_recv(10);
        stats.record_drop();
        stats.record_recv_error();
        assert_eq!(
            describe_datagrams(&stats),
            "Datagrams: sent 2, received 1, dropped 1, errors 1"
        );
    }

    #[test]
    fn test_rtt_stats() {
        assert_eq!(RttStats::from_samples(&[]), None);
        let stats = RttStats::from_samples(&[
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ])
        .unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.avg, Duration::from_millis(20));
        assert_eq!(stats.max, Duration::from_millis(30));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["rigel", "--passphrase", "pw", "server", "--port", "9000"]);
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.node.passphrase, "pw");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.capacity, 16);
    }

    #[test]
    fn test_server_commands() {
        let mut server =
            UdpServer::new(Config::default().node_config(), 2, Arc::new(chat::registry())).unwrap();
        assert!(server_command(&mut server, "/help"));
        assert!(server_command(&mut server, "/resize 4"));
        assert_eq!(server.size(), 4);
        assert!(server_command(&mut server, "/kick 9"));
        assert!(server_command(&mut server, "hello room"));
        assert!(!server_command(&mut server, "/quit"));
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
        assert!(Config::load(&path).is_ok());
    }
}
