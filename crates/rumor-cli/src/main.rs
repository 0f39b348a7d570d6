//! Rumor CLI
//!
//! Line-oriented chat over a gossip topic. Every line typed is broadcast to
//! the topic; every message received is printed.
//!
//! ## Usage
//!
//! ```bash
//! # Start alone on the default topic
//! rumor --no-relay
//!
//! # Join through a known peer
//! rumor <node_id_hex> <ip:port or relay url>
//!
//! # Custom topic and tuning
//! rumor --topic 0x0123... --config gossip.json -vv
//! ```
//!
//! Type `exit` (any case) or close stdin to quit.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use iroh::SecretKey;
use tokio::io::AsyncBufReadExt;
use tracing::debug;

use rumor_core::{
    hex, AddressBook, Event, GossipConfig, GossipNode, IrohOptions, IrohTransport, NodeId,
    TopicId,
};

/// Topic joined when none is given on the command line
const DEFAULT_TOPIC: &str = "fbfdf8a045484d2f57bb678ffb792e0db647aa1c996e559937d6529aefdbf5bf";

/// Rumor - topic-based gossip chat
#[derive(Parser)]
#[command(name = "rumor")]
#[command(version = "0.1.0")]
#[command(about = "Rumor - topic-based gossip chat")]
#[command(
    long_about = "Join a gossip topic, broadcast each line read from stdin and print every message received. With no bootstrap peer the node starts as the only member of the topic."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Topic to join (32 bytes of hex)
    #[arg(short, long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Secret key for this node (32 bytes of hex); random when omitted
    #[arg(long)]
    secret_key: Option<String>,

    /// JSON file with gossip configuration overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable relay servers (direct addresses only)
    #[arg(long)]
    no_relay: bool,

    /// Node id of a bootstrap peer
    #[arg(requires = "endpoint")]
    node_id: Option<String>,

    /// Endpoint of the bootstrap peer
    #[arg(requires = "node_id")]
    endpoint: Option<String>,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<GossipConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => GossipConfig::default(),
    };

    if let Err(reason) = config.validate() {
        bail!("Invalid config: {}", reason);
    }
    debug!(?config, "Loaded gossip config");
    Ok(config)
}

fn parse_secret_key(s: &str) -> Result<SecretKey> {
    let bytes = hex::decode_fixed::<32>(s).context("Invalid secret key")?;
    Ok(SecretKey::from_bytes(&bytes))
}

/// What to do with one line of stdin
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Exit,
    Blank,
    /// Broadcast the line as typed
    Message,
}

/// Surrounding whitespace only matters for recognizing `exit` and blank
/// lines; messages are sent verbatim.
fn classify_line(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.eq_ignore_ascii_case("exit") {
        Line::Exit
    } else if trimmed.is_empty() {
        Line::Blank
    } else {
        Line::Message
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    // Validate everything before touching the network
    let topic = TopicId::from_hex(&cli.topic).context("Invalid topic")?;
    let config = load_config(cli.config.as_deref())?;
    let secret_key = cli.secret_key.as_deref().map(parse_secret_key).transpose()?;

    let address_book = AddressBook::new();
    let mut bootstrap: Vec<NodeId> = Vec::new();
    if let (Some(node_id), Some(endpoint)) = (&cli.node_id, &cli.endpoint) {
        let addr = AddressBook::resolve_from_string(node_id, endpoint)
            .context("Invalid bootstrap peer")?;
        bootstrap.push(addr.id());
        address_book.add_or_merge(addr);
    }

    let options = IrohOptions {
        relay: !cli.no_relay,
    };
    let transport = IrohTransport::bind(secret_key, options)
        .await
        .context("Failed to start endpoint")?;
    let node = GossipNode::spawn(transport, address_book, config);

    println!("[App] Node ID: {}", node.local_id());
    for endpoint in node.local_endpoints() {
        println!("[App] Listening on: {}", endpoint);
    }
    println!("[App] Topic: {}", topic);

    let (sender, receiver) = match node.join(topic, &bootstrap).await {
        Ok(handles) => handles,
        Err(e) => {
            node.shutdown().await;
            return Err(e).context("Failed to join topic");
        }
    };
    println!("[App] Joined topic. Type a message and press Enter to send, 'exit' to quit.");

    let printer = receiver.dispatch(|event| match event {
        Event::Received(msg) => {
            println!(
                "[Received] {}: {}",
                msg.from.fmt_short(),
                String::from_utf8_lossy(&msg.content)
            );
        }
        Event::NeighborUp(peer) => println!("[App] Neighbor up: {}", peer.fmt_short()),
        Event::NeighborDown(peer) => println!("[App] Neighbor down: {}", peer.fmt_short()),
        Event::Joined => {}
    });

    let stdin = tokio::io::stdin();
    let reader = tokio::io::BufReader::new(stdin);
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => match classify_line(&text) {
                        Line::Exit => break,
                        Line::Blank => continue,
                        Line::Message => {
                            if let Err(e) = sender.broadcast(text).await {
                                eprintln!("[Error] Failed to send: {}", e);
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("[Error] Read error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("[App] Leaving topic...");
    node.leave(topic).await;
    node.shutdown().await;
    let _ = printer.await;
    println!("[App] Application finished.");
    Ok(())
}
