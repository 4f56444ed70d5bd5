use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use lattica::{Config, ConnectionAdapter, Node, NodeIdentity, PeerId, PublicKey, TcpDialer};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    public_key: PublicKey,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, key_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a public key (format: IP:PORT/PUBKEY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let public_key =
            PublicKey::from_hex(key_part).context("public key must be 64 hex characters")?;

        Ok(BootstrapPeer { addr, public_key })
    }
}

#[derive(Parser, Debug)]
#[command(name = "lattica")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Static cryptopuzzle difficulty.
    #[arg(long, default_value_t = 16)]
    c1: u32,

    /// Dynamic cryptopuzzle difficulty.
    #[arg(long, default_value_t = 16)]
    c2: u32,

    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    info!(c1 = args.c1, c2 = args.c2, "solving identity cryptopuzzles");
    let identity = Arc::new(NodeIdentity::generate(args.c1, args.c2));

    let config = Config {
        c1: args.c1,
        c2: args.c2,
        ..Config::default()
    };
    let node = Node::new(identity, config);

    let listener = TcpListener::bind(args.bind)
        .await
        .context("failed to bind listener")?;
    let adapter = ConnectionAdapter::new(listener, Arc::new(TcpDialer::default()), &node)?;
    node.start();

    info!(
        addr = %adapter.local_addr(),
        key = %node.public_key(),
        "node up"
    );

    if !args.bootstrap.is_empty() {
        let seeds: Vec<PeerId> = args
            .bootstrap
            .iter()
            .map(|peer| PeerId::new(peer.addr.to_string(), peer.public_key))
            .collect();
        match adapter.bootstrap(&node, &seeds).await {
            Ok(()) => info!(seeds = seeds.len(), "bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                node.stop().await;
                break;
            }
            _ = interval.tick() => {
                let routes = adapter.routes();
                info!(
                    peers = routes.len(),
                    sessions = node.established_peers().len(),
                    "status"
                );
            }
        }
    }

    Ok(())
}
