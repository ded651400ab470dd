//! P2P Networking module
//!
//! Connection management for a Bitcoin-style node.
//!
//! # Features
//! - Address manager with fresh/used buckets and bans
//! - Version handshake, ping liveness and stall detection
//! - Loader-driven block sync, header-first up to the last checkpoint
//! - Compact block relay (BIP152) and SPV filtered blocks (BIP37)
//! - Broadcast tracking with ack/reject/timeout outcomes

pub mod addrman;
pub mod broadcast;
pub mod config;
pub mod filter;
pub mod locker;
pub mod peer;
pub mod pool;
pub mod server;
pub mod sync;

pub use addrman::{HostEntry, HostList, HostListError, HostListJson, HostListOptions};
pub use broadcast::{BroadcastData, BroadcastHandle, BroadcastOutcome};
pub use config::{ConfigError, PoolOptions, BAN_SCORE, MAX_INBOUND, MAX_OUTBOUND};
pub use filter::{BloomFilter, RollingFilter};
pub use locker::Locker;
pub use peer::{NonceList, Peer, PeerError, PeerOptions, PeerState};
pub use pool::{Pool, PoolError};
pub use server::{connect, resolve, Server};
pub use sync::{HeaderChain, HeaderChainError};
