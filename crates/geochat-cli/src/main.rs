//! GeoChat CLI
//!
//! Runs a node with an interactive console.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use geochat_core::types::MessageKind;
use geochat_network::JsonRpcClient;
use geochat_node::config::{BrokerKind, LoggingConfig};
use geochat_node::{
    connect_transport, shutdown_signal, GeoChatNode, NodeConfig, NodeEvent, PendingReason, SendOutcome,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "geochat")]
#[command(version)]
#[command(about = "GeoChat - proximity-gated chat with store-and-forward delivery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node with an interactive console
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "geochat.toml")]
        config: PathBuf,

        /// Identity on the network
        #[arg(short, long, env = "GEOCHAT_IDENTITY")]
        identity: Option<String>,

        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,

        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,

        /// RPC listen port
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        broker_host: Option<String>,

        #[arg(long)]
        broker_port: Option<u16>,

        /// Use a private in-process broker instead of MQTT
        #[arg(long)]
        memory: bool,
    },

    /// Print a default configuration file
    Config,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let json = logging.format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_target(true)))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
        }))
        .init();
}

/// One console command
#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Message { recipient: String, text: String },
    Location { latitude: f64, longitude: f64 },
    Refresh,
    Peers,
    History,
    Clear { recipient: String },
    Republish { recipient: String },
    Help,
    Quit,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let command = match cmd {
            "m" => {
                let (recipient, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("usage: m <recipient> <text>")?;
                Self::Message {
                    recipient: recipient.to_string(),
                    text: text.trim().to_string(),
                }
            }
            "l" => {
                let mut parts = rest.split_whitespace();
                let (Some(lat), Some(lon), None) = (parts.next(), parts.next(), parts.next()) else {
                    return Err("usage: l <lat> <lon>".to_string());
                };
                Self::Location {
                    latitude: lat.parse().map_err(|_| format!("invalid latitude '{lat}'"))?,
                    longitude: lon.parse().map_err(|_| format!("invalid longitude '{lon}'"))?,
                }
            }
            "c" | "u" if rest.is_empty() => return Err(format!("usage: {cmd} <recipient>")),
            "c" => Self::Clear {
                recipient: rest.to_string(),
            },
            "u" => Self::Republish {
                recipient: rest.to_string(),
            },
            "r" => Self::Refresh,
            "p" => Self::Peers,
            "h" => Self::History,
            "?" | "help" => Self::Help,
            "q" | "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '{other}', type ? for help")),
        };
        Ok(Some(command))
    }
}

const HELP: &str = "\
  m <recipient> <text>   send a message
  l <lat> <lon>          update location and re-announce
  r                      refresh neighbors now
  p                      list peers and pending messages
  h                      show chat history
  c <recipient>          clear pending messages for recipient
  u <recipient>          republish pending messages for recipient
  q                      quit";

/// Returns `false` when the console should exit
async fn execute(node: &GeoChatNode, command: ConsoleCommand) -> bool {
    match command {
        ConsoleCommand::Message { recipient, text } => match node.send_message(&recipient, &text).await {
            Ok(SendOutcome::Delivered) => println!("✅ sent to {recipient}"),
            Ok(SendOutcome::Queued { reason, .. }) => match reason {
                PendingReason::OutOfRange { distance_m } => {
                    println!("📦 {recipient} is {distance_m:.1} m away, message queued")
                }
                PendingReason::Unreachable { error } => {
                    println!("📦 {recipient} unreachable ({error}), message queued")
                }
            },
            Err(e) => println!("⚠️  {e}"),
        },
        ConsoleCommand::Location { latitude, longitude } => {
            match node.update_location(latitude, longitude).await {
                Ok(()) => println!("📍 location updated to {}", node.coordinate()),
                Err(e) => println!("⚠️  {e}"),
            }
        }
        ConsoleCommand::Refresh => {
            let report = node.refresh_neighbors().await;
            if report.pulled {
                println!("🔄 backlog pulled");
            }
            if report.flushed > 0 {
                println!("📨 {} pending message(s) delivered", report.flushed);
            }
        }
        ConsoleCommand::Peers => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("no peers known yet");
            }
            for peer in peers {
                let zone = if peer.in_zone { "in zone" } else { "out of zone" };
                println!("   {} ({}): {:.2} m ({zone})", peer.identity, peer.address, peer.distance_m);
            }
            for recipient in node.pending_recipients() {
                if let Some(text) = node.pending(&recipient) {
                    println!("   pending for {recipient}:");
                    for line in text.lines() {
                        println!("     {line}");
                    }
                }
            }
        }
        ConsoleCommand::History => {
            for entry in node.history() {
                println!("   [{}] {} {}: {}", entry.timestamp, entry.kind, entry.peer, entry.text);
            }
        }
        ConsoleCommand::Clear { recipient } => match node.clear_pending(&recipient) {
            Some(_) => println!("🗑  cleared pending messages for {recipient}"),
            None => println!("nothing pending for {recipient}"),
        },
        ConsoleCommand::Republish { recipient } => match node.republish_pending(&recipient).await {
            Ok(true) => println!("📤 republished backlog for {recipient}"),
            Ok(false) => println!("nothing pending for {recipient}"),
            Err(e) => println!("⚠️  {e}"),
        },
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => return false,
    }
    true
}

fn print_event(event: NodeEvent) {
    match event {
        NodeEvent::MessageReceived {
            timestamp,
            sender,
            text,
            kind,
        } => {
            let tag = if kind == MessageKind::WasPending { " (was pending)" } else { "" };
            println!("\n📩 [{timestamp}] {sender}{tag}: {text}");
        }
        NodeEvent::PeerListChanged(peers) => {
            if peers.is_empty() {
                return;
            }
            println!("\n🔄 distances:");
            for peer in peers {
                let zone = if peer.in_zone { "in zone" } else { "out of zone" };
                println!("   - {} ({}): {:.2} m ({zone})", peer.identity, peer.address, peer.distance_m);
            }
        }
        _ => {}
    }
}

async fn print_events(mut rx: broadcast::Receiver<NodeEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Console lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn console(node: &GeoChatNode) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => {
                        if !execute(node, command).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => println!("{usage}"),
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_overrides(
    config: &mut NodeConfig,
    identity: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    port: Option<u16>,
    broker_host: Option<String>,
    broker_port: Option<u16>,
    memory: bool,
) {
    if let Some(identity) = identity {
        config.node.identity = identity;
    }
    if let Some(lat) = lat {
        config.node.latitude = lat;
    }
    if let Some(lon) = lon {
        config.node.longitude = lon;
    }
    if let Some(port) = port {
        config.rpc.port = port;
    }
    if let Some(host) = broker_host {
        config.broker.host = host;
    }
    if let Some(port) = broker_port {
        config.broker.port = port;
    }
    if memory {
        config.broker.kind = BrokerKind::Memory;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            identity,
            lat,
            lon,
            port,
            broker_host,
            broker_port,
            memory,
        } => {
            let mut node_config = if config.exists() {
                NodeConfig::from_file(&config)?
            } else {
                NodeConfig::default()
            };
            init_logging(cli.verbose, &node_config.logging);
            if !config.exists() {
                tracing::info!("Config {:?} not found, using defaults", config);
            }

            apply_overrides(
                &mut node_config,
                identity,
                lat,
                lon,
                port,
                broker_host,
                broker_port,
                memory,
            );
            node_config.validate()?;

            let (transport, inbound_rx) =
                connect_transport(&node_config.broker, &node_config.node.identity).await?;
            let rpc = Arc::new(JsonRpcClient::new(node_config.rpc_config().request_timeout)?);
            let node = GeoChatNode::start(node_config, transport, inbound_rx, rpc).await?;

            let printer = tokio::spawn(print_events(node.subscribe_events()));
            let result = console(&node).await;

            node.shutdown().await;
            printer.abort();
            result?;
        }

        Commands::Config => {
            print!("{}", NodeConfig::default().to_toml()?);
        }
    }

    Ok(())
}
