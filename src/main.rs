//! Filament node runner
//!
//! Starts the backend with a CLI-built configuration, prints peer and chat
//! activity, and shuts down cleanly on ctrl-c.

use clap::Parser;
use filament::config::{Config, SeedPeer};
use filament::net::Backend;
use std::path::PathBuf;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "filament", version, about = "Filament: peer networking node")]
struct Args {
    /// Listen addresses (ip[:port], comma-separated). Empty = all adapters.
    #[arg(short, long)]
    listen: Option<String>,

    /// Private key file (hex). Created with a fresh key when missing.
    #[arg(short, long, default_value = "./filament.key")]
    key_file: PathBuf,

    /// Seed peers as pubkeyhex@ip:port, comma-separated.
    #[arg(short, long)]
    seeds: Option<String>,

    /// Decode worker count.
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Manually forwarded external port (disables UPnP).
    #[arg(long, default_value = "0")]
    port_forward: u16,

    /// Send this chat line to all peers every 30 seconds (demo traffic).
    #[arg(long)]
    chat: Option<String>,
}

fn load_or_create_key(path: &PathBuf) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(hex_key) => Ok(hex_key.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = filament::Identity::generate();
            let hex_key = identity.private_key_hex();
            std::fs::write(path, &hex_key)?;
            info!("generated new identity at {}", path.display());
            Ok(hex_key)
        }
        Err(e) => Err(e),
    }
}

fn parse_seeds(input: &str) -> Vec<SeedPeer> {
    input
        .split(',')
        .filter_map(|entry| {
            let (key, addr) = entry.trim().split_once('@')?;
            Some(SeedPeer {
                public_key: key.to_string(),
                addresses: vec![addr.to_string()],
            })
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("filament=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let private_key = match load_or_create_key(&args.key_file) {
        Ok(key) => key,
        Err(e) => {
            error!("cannot read key file {}: {}", args.key_file.display(), e);
            std::process::exit(filament::EXIT_INIT_FAILURE);
        }
    };

    let config = Config {
        listen: args
            .listen
            .map(|l| l.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        listen_workers: args.workers,
        private_key,
        seed_list: args.seeds.as_deref().map(parse_seeds).unwrap_or_default(),
        port_forward: args.port_forward,
        ..Default::default()
    };

    let backend = match Backend::init(config) {
        Ok(backend) => backend,
        Err(e) => {
            error!("init failed: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    info!("filament v{} | peer id {}", VERSION, hex::encode(backend.identity.peer_id()));

    if let Err(e) = backend.connect().await {
        error!("connect failed: {}", e);
        std::process::exit(filament::EXIT_INIT_FAILURE);
    }

    // Chat printer.
    let mut chat_rx = backend.chat_events();
    tokio::spawn(async move {
        while let Ok(event) = chat_rx.recv().await {
            info!("[chat] {}: {}", hex::encode(&event.from[..8]), event.text);
        }
    });

    // Status printer.
    let status_backend = backend.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let peers = status_backend.peers.len().await;
            let connected = status_backend.peers.connected_count().await;
            let dht = status_backend.dht.len().await;
            info!("status: {} peers ({} connected) | {} dht contacts", peers, connected, dht);
        }
    });

    // Optional demo chatter.
    if let Some(line) = args.chat {
        let chat_backend = backend.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let sent = chat_backend.send_chat_all(&line).await;
                if sent > 0 {
                    info!("chat sent to {} peers", sent);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    backend.shutdown().await;
}
