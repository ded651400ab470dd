//! Mini-P2P node
//!
//! Runs a peer pool against the in-memory chain and mempool.

use clap::{Parser, ValueEnum};
use mini_p2p::chain::{Chain, MemoryChain, MemoryMempool, Mempool};
use mini_p2p::core::NetworkType;
use mini_p2p::network::{Pool, PoolOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NetworkArg {
    Main,
    Testnet,
    Regtest,
}

impl From<NetworkArg> for NetworkType {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Main => NetworkType::Main,
            NetworkArg::Testnet => NetworkType::Testnet,
            NetworkArg::Regtest => NetworkType::Regtest,
        }
    }
}

#[derive(Parser)]
#[command(name = "p2pnode")]
#[command(version)]
#[command(about = "Peer-to-peer node for a Bitcoin-style network", long_about = None)]
struct Cli {
    /// Network to join
    #[arg(short, long, value_enum)]
    network: Option<NetworkArg>,

    /// Port to listen on (defaults to the network port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory for the host list
    #[arg(short, long, default_value = ".p2p_data")]
    data_dir: PathBuf,

    /// Peer to connect to (host:port), may be repeated
    #[arg(short, long)]
    connect: Vec<String>,

    /// Do not accept inbound connections
    #[arg(long)]
    no_listen: bool,

    /// Maximum outbound peers
    #[arg(long)]
    max_outbound: Option<usize>,

    /// JSON file with pool options; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn options(&self) -> Result<PoolOptions, Box<dyn std::error::Error>> {
        let mut options = match &self.config {
            Some(path) => PoolOptions::load(path)?,
            None => PoolOptions::default(),
        };

        if let Some(network) = self.network {
            options.network = network.into();
        }
        if self.port.is_some() {
            options.port = self.port;
        }
        if self.no_listen {
            options.listen = false;
        }
        if let Some(max) = self.max_outbound {
            options.max_outbound = max;
        }
        if !self.connect.is_empty() {
            options.nodes.extend(self.connect.iter().cloned());
        }
        if options.host_file.is_none() {
            options.host_file = Some(self.data_dir.join("hosts.json"));
        }

        Ok(options)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let options = cli.options()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(options))
}

async fn run(options: PoolOptions) -> Result<(), Box<dyn std::error::Error>> {
    let network = options.network();
    println!("🌐 Starting P2P node on {:?} (port {})...", network.kind, options.port());

    let chain: Arc<dyn Chain> = Arc::new(MemoryChain::new(network));
    let mempool: Arc<dyn Mempool> = Arc::new(MemoryMempool::new());

    let pool = Pool::new(options, chain, Some(mempool))?;
    pool.open().await?;
    pool.connect().await?;
    pool.start_sync().await;

    if let Some(addr) = pool.listen_addr().await {
        println!("   Listening on {}", addr);
    }

    tokio::signal::ctrl_c().await?;
    println!("\n📴 Shutting down node...");

    pool.close().await?;

    Ok(())
}
