//! Kestrel DHT node.
//!
//! Runs a standalone node: binds the UDP endpoint, joins the network through
//! the given seeds, optionally announces a set of blob hashes, and logs a
//! status line every 30 seconds.

use clap::Parser;
use kestrel::dht::{BlobAnnouncer, Id384, MemoryAnnouncementStorage, Node, NodeConfig};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "kestrel", version, about = "Kestrel: content distribution DHT node")]
struct Args {
    /// UDP port for the DHT endpoint
    #[arg(short, long, default_value = "4444")]
    port: u16,

    /// TCP port announced for blob exchange
    #[arg(long, default_value = "3333")]
    peer_port: u16,

    /// Seed nodes (comma-separated host:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Externally reachable IPv4 address, advertised in findValue replies
    #[arg(short = 'e', long, default_value = "127.0.0.1")]
    external_ip: Ipv4Addr,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    interface: Ipv4Addr,

    /// Node identity as 96 hex characters (generated when omitted)
    #[arg(long)]
    node_id: Option<String>,

    /// Blob hashes (96 hex characters each) to serve and announce
    #[arg(long)]
    announce: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kestrel=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let node_id = match args.node_id.as_deref().map(Id384::from_hex) {
        Some(None) => {
            error!("--node-id must be 96 hex characters");
            return;
        }
        Some(id) => id,
        None => None,
    };

    let seeds: Vec<(String, u16)> = match args.seeds.as_deref().map(parse_seeds) {
        Some(Ok(seeds)) => seeds,
        Some(Err(bad)) => {
            error!("invalid seed entry: {}", bad);
            return;
        }
        None => Vec::new(),
    };

    let announce: Vec<Id384> = match args.announce.iter().map(|s| Id384::from_hex(s)).collect() {
        Some(keys) => keys,
        None => {
            error!("--announce entries must be 96 hex characters");
            return;
        }
    };

    let node = Node::new(NodeConfig {
        node_id,
        external_ip: args.external_ip,
        udp_port: args.port,
        peer_port: args.peer_port,
        ..NodeConfig::default()
    });

    info!("kestrel v{} | node id {}…", VERSION, &node.node_id().to_hex()[..16]);
    info!("udp port {} | peer port {}", args.port, args.peer_port);
    if !seeds.is_empty() {
        info!("seeds: {:?}", seeds);
    }

    node.start(args.interface, seeds);

    // Blobs named on the command line are served and announced by this node.
    let storage = Arc::new(MemoryAnnouncementStorage::new());
    for key in &announce {
        node.protocol().peer_store().add_completed(*key);
        storage.add_blob(*key);
    }
    let announcer = BlobAnnouncer::new(Arc::clone(&node), Arc::clone(&storage));
    if !announce.is_empty() {
        info!("announcing {} blobs", announce.len());
        announcer.start();
    }

    // Status printer
    let status_node = Arc::clone(&node);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let peers = status_node.protocol().routing_table().get_peers().len();
            let buckets = status_node
                .protocol()
                .routing_table()
                .buckets_with_contacts();
            let stored = status_node.protocol().peer_store().key_count();
            info!(
                "status: {} peers in {} buckets | {} keys stored | joined: {}",
                peers,
                buckets,
                stored,
                status_node.joined()
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    if announcer.running() {
        announcer.stop();
    }
    node.stop();
}

fn parse_seeds(input: &str) -> Result<Vec<(String, u16)>, String> {
    let mut seeds = Vec::new();
    for entry in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((host, port)) = entry.rsplit_once(':') else {
            return Err(entry.to_string());
        };
        let port: u16 = port.parse().map_err(|_| entry.to_string())?;
        seeds.push((host.to_string(), port));
    }
    Ok(seeds)
}
