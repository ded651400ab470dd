//! Mini-P2P: the peer-to-peer layer of a Bitcoin-style full node
//!
//! This crate provides:
//! - Binary wire codec with streaming frame parser and a tokio codec
//! - Address manager with persisted, bucketed host tables
//! - Peer connections with handshake, liveness and stall detection
//! - A peer pool that syncs blocks from a loader peer (header-first below
//!   the last checkpoint), relays inventory and serves chain data
//! - Compact block relay (BIP152) and SPV filtered blocks (BIP37)
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_p2p::chain::{Chain, Mempool, MemoryChain, MemoryMempool};
//! use mini_p2p::core::{Network, NetworkType};
//! use mini_p2p::network::{Pool, PoolOptions};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mini_p2p::network::PoolError> {
//! let options = PoolOptions::new(NetworkType::Regtest);
//! let chain: Arc<dyn Chain> = Arc::new(MemoryChain::new(Network::regtest()));
//! let mempool: Arc<dyn Mempool> = Arc::new(MemoryMempool::new());
//!
//! let pool = Pool::new(options, chain, Some(mempool))?;
//! pool.open().await?;
//! pool.connect().await?;
//! pool.start_sync().await;
//! # Ok(())
//! # }
//! ```

pub mod bip152;
pub mod chain;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod wire;

// Re-export commonly used types
pub use bip152::{CompactBlock, TxRequest, TxResponse};
pub use chain::{Chain, ChainEntry, ChainError, MemoryChain, MemoryMempool, Mempool};
pub use core::{Block, BlockHeader, MerkleBlock, Network, NetworkType, Transaction};
pub use crypto::Hash256;
pub use network::{
    BroadcastOutcome, HostList, HostListOptions, Peer, PeerError, Pool, PoolError, PoolOptions,
};
pub use storage::{Storage, StorageConfig};
pub use wire::{InvItem, InvType, NetAddress, Packet, PacketCodec, RejectCode, Services};
