use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crnode::{BootstrapPeer, Node, NodeConfig};

#[derive(Clone, Debug)]
struct KeyValue {
    key: String,
    value: String,
}

impl FromStr for KeyValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s
            .split_once('=')
            .context("write must be given as KEY=VALUE")?;
        Ok(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "crnode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name, e.g. N:alice
    #[arg(short, long)]
    name: String,

    #[arg(short, long, default_value = "20110")]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Rendezvous peer as N:name@host:port
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Option<BootstrapPeer>,

    /// Addresses to greet on startup
    #[arg(short, long, value_name = "ADDR")]
    greet: Vec<SocketAddr>,

    /// Relays, first one outermost
    #[arg(short, long, value_name = "NODE")]
    relay: Vec<String>,

    #[arg(short, long, value_name = "KEY=VALUE")]
    write: Vec<KeyValue>,

    #[arg(long, value_name = "KEY")]
    read: Vec<String>,

    #[arg(long, value_name = "KEY")]
    exists: Vec<String>,

    /// Milliseconds to keep handling messages afterwards; 0 runs until Ctrl+C
    #[arg(short, long, default_value = "0")]
    duration: u64,

    #[arg(long, default_value = "1000")]
    query_timeout_ms: u64,

    /// Probability of discarding each received datagram
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if !(0.0..=1.0).contains(&args.drop_rate) {
        anyhow::bail!("drop rate must be between 0 and 1");
    }

    let mut config = NodeConfig {
        bind_ip: args.bind_ip,
        query_timeout: Duration::from_millis(args.query_timeout_ms),
        drop_rate: args.drop_rate,
        ..NodeConfig::default()
    };
    if let Some(bootstrap) = args.bootstrap {
        config.bootstrap = Some(bootstrap);
    }

    let mut node = Node::new(config);
    node.set_node_name(&args.name)
        .context("failed to set node name")?;
    let addr = node
        .open_port(args.port)
        .await
        .context("failed to open port")?;
    info!(name = %args.name, addr = %addr, "node started");
    if let Some(bootstrap) = &node.config().bootstrap {
        info!(peer = %bootstrap, "bootstrap peer");
    }

    for relay in &args.relay {
        node.push_relay(relay)
            .with_context(|| format!("invalid relay {}", relay))?;
    }

    for peer in &args.greet {
        node.greet(*peer).await?;
    }
    if !args.greet.is_empty() {
        node.handle_incoming_messages(Duration::from_millis(500)).await?;
        info!(known = ?node.known_node_names(), "greeting complete");
    }

    for kv in &args.write {
        match node.write(&kv.key, &kv.value) {
            Ok(_) => info!(key = %kv.key, "written"),
            Err(e) => warn!(key = %kv.key, error = %e, "write failed"),
        }
    }

    for key in &args.exists {
        match node.exists(key).await {
            Ok(found) => info!(key = %key, found, "exists"),
            Err(e) => warn!(key = %key, error = %e, "exists failed"),
        }
    }

    for key in &args.read {
        match node.read(key).await {
            Ok(Some(value)) => info!(key = %key, value = %value, "read"),
            Ok(None) => info!(key = %key, "not found"),
            Err(e) => warn!(key = %key, error = %e, "read failed"),
        }
    }

    let duration = Duration::from_millis(args.duration);

    // Graceful shutdown on Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting gracefully");
        }
        result = node.handle_incoming_messages(duration) => {
            result?;
        }
    }

    for text in node.info_messages() {
        info!(text = %text, "information received");
    }

    Ok(())
}
