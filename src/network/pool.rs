//! Peer pool
//!
//! The `Pool` owns every connection: it dials outbound peers picked from
//! the address manager, accepts inbound ones, elects a loader peer to
//! drive block sync, serves chain and mempool data, relays inventory and
//! tracks caller broadcasts until a peer acknowledges them.
//!
//! Each peer runs in its own task. The pool state sits behind one async
//! mutex; peers keep their own synchronous lock that is never held across
//! an await. Locks are always taken pool state first, then hosts, then
//! the peer.

use crate::bip152::{TxRequest, TxResponse};
use crate::chain::{BlockFlags, Chain, ChainEntry, ChainError, Mempool};
use crate::core::{Block, BlockHeader, MerkleBlock, Network, Transaction};
use crate::crypto::Hash256;
use crate::network::addrman::HostList;
use crate::network::broadcast::{
    resolve_jobs, BroadcastData, BroadcastHandle, BroadcastItem, BroadcastOutcome, ACK_DELAY,
};
use crate::network::config::{ConfigError, PoolOptions};
use crate::network::filter::{BloomFilter, RollingFilter, UPDATE_ALL};
use crate::network::locker::Locker;
use crate::network::peer::{
    PendingCompact, PendingMerkle, Peer, PeerError, PeerOptions, PeerReader, MAX_COMPACT_BLOCKS,
};
use crate::network::server::{self, Server, CONNECT_TIMEOUT};
use crate::network::sync::{HeaderChain, HeaderChainError, HeadersOutcome, ResolveOutcome};
use crate::storage::{Storage, StorageConfig, StorageError};
use crate::wire::packets::{
    BlockPacket, BlockTxnPacket, CmpctBlockPacket, LocatorPacket, Packet, RejectPacket,
    TxPacket, VersionPacket,
};
use crate::wire::types::{InvItem, InvType, Services, MAX_HEADERS, MAX_INV};
use crate::wire::NetAddress;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Interval between DNS seed checks
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);

/// Interval between host list flushes
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(120);

/// Delay before replacing closed outbound peers
pub const REFILL_DELAY: Duration = Duration::from_secs(3);

/// Blocks in flight per peer before it is dropped
pub const MAX_BLOCK_REQUEST: usize = 50_000 + 1000;

/// Transactions in flight per peer before it is dropped
pub const MAX_TX_REQUEST: usize = 10_000;

/// Longest locator served by `getblocks` and `getheaders`
///
/// Stricter than the `MAX_INV` limit enforced while decoding; a locator
/// between the two decodes fine and is refused here.
pub const MAX_LOCATOR: usize = 2000;

/// Hashes answered per `getblocks`
const GETBLOCKS_LIMIT: usize = 500;

/// Blocks below the tip still served as compact blocks
const COMPACT_DEPTH: u32 = 10;

/// Blocks below the tip still answered with `blocktxn`
const BLOCKTXN_DEPTH: u32 = 15;

/// Addresses answered per `getaddr`
const GETADDR_LIMIT: usize = 1000;

/// Host selection attempts per outbound slot
const HOST_ATTEMPTS: usize = 100;

/// Seconds before a recently tried host may be tried again
const RETRY_SECS: i64 = 600;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Timed out")]
    Timeout,
    #[error("Pool closed")]
    Closed,
    #[error("Pool is not open")]
    NotOpen,
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Pool State
// =============================================================================

struct PoolState {
    opened: bool,
    connected: bool,
    disconnecting: bool,
    syncing: bool,
    /// Whether "fully synced" was reported already
    was_synced: bool,
    peers: BTreeMap<u64, Arc<Peer>>,
    loader: Option<u64>,
    block_map: HashSet<Hash256>,
    tx_map: HashSet<Hash256>,
    compact_blocks: HashSet<Hash256>,
    header_chain: HeaderChain,
    inv_map: HashMap<Hash256, BroadcastItem>,
    spv_filter: Option<BloomFilter>,
    /// Recently seen transactions when running without a mempool
    tx_filter: RollingFilter,
    pending_refill: bool,
    listen_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PoolState {
    fn new(spv_filter: Option<BloomFilter>) -> Self {
        Self {
            opened: false,
            connected: false,
            disconnecting: false,
            syncing: false,
            was_synced: false,
            peers: BTreeMap::new(),
            loader: None,
            block_map: HashSet::new(),
            tx_map: HashSet::new(),
            compact_blocks: HashSet::new(),
            header_chain: HeaderChain::new(),
            inv_map: HashMap::new(),
            spv_filter,
            tx_filter: RollingFilter::new(50_000, 0.000001),
            pending_refill: false,
            listen_addr: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    fn has_host(&self, hostname: &str) -> bool {
        self.peers.values().any(|peer| peer.hostname() == hostname)
    }

    fn outbound(&self) -> usize {
        self.peers.values().filter(|peer| peer.outbound).count()
    }

    fn inbound(&self) -> usize {
        self.peers.values().filter(|peer| !peer.outbound).count()
    }

    fn loader_peer(&self) -> Option<Arc<Peer>> {
        self.loader.and_then(|id| self.peers.get(&id).cloned())
    }

    /// Clear an in-flight block request; false if `peer` never asked for it
    fn resolve_block(&mut self, peer: &Peer, hash: &Hash256) -> bool {
        if peer.lock().block_map.remove(hash).is_none() {
            return false;
        }
        self.block_map.remove(hash);
        true
    }

    fn resolve_tx(&mut self, peer: &Peer, hash: &Hash256) -> bool {
        if peer.lock().tx_map.remove(hash).is_none() {
            return false;
        }
        self.tx_map.remove(hash);
        true
    }
}

/// Outcome of a transaction arriving while a filtered block is pending
enum MerkleTx {
    Unmatched,
    Duplicate,
    Pending,
    Complete(PendingMerkle),
}

// =============================================================================
// Pool
// =============================================================================

/// Peer pool
pub struct Pool {
    options: PoolOptions,
    network: Network,
    chain: Arc<dyn Chain>,
    mempool: Option<Arc<dyn Mempool>>,
    peer_options: Arc<PeerOptions>,
    hosts: RwLock<HostList>,
    storage: Option<Storage>,
    state: Mutex<PoolState>,
    locker: Locker<Hash256>,
    next_id: AtomicU64,
}

impl Pool {
    /// Create a pool. Nothing is loaded or dialed until `open`/`connect`.
    pub fn new(
        options: PoolOptions,
        chain: Arc<dyn Chain>,
        mempool: Option<Arc<dyn Mempool>>,
    ) -> Result<Arc<Self>, PoolError> {
        let network = options.network();
        Self::with_network(options, network, chain, mempool)
    }

    /// Create a pool for explicit network parameters (custom checkpoints,
    /// magic or seeds) instead of the preset named by `options.network`
    pub fn with_network(
        options: PoolOptions,
        network: Network,
        chain: Arc<dyn Chain>,
        mempool: Option<Arc<dyn Mempool>>,
    ) -> Result<Arc<Self>, PoolError> {
        let mut peer_options = PeerOptions::new(network.clone(), chain.clone());
        peer_options.mempool = mempool.clone();
        peer_options.agent = options.agent.clone();
        peer_options.services = options.services();
        peer_options.witness = options.witness;
        peer_options.spv = options.spv;
        peer_options.bip37 = options.bip37;
        peer_options.compact = options.compact;
        peer_options.no_relay = options.no_relay || options.spv;
        peer_options.ban_score = options.ban_score;

        let storage = match &options.host_file {
            Some(path) => Some(Storage::new(StorageConfig::for_file(path))?),
            None => None,
        };

        let spv_filter = options
            .spv
            .then(|| BloomFilter::for_elements(20_000, 0.001, UPDATE_ALL));

        let hosts = HostList::new(options.host_list_options_for(network.clone()));

        Ok(Arc::new(Self {
            network,
            chain,
            mempool,
            peer_options: Arc::new(peer_options),
            hosts: RwLock::new(hosts),
            storage,
            state: Mutex::new(PoolState::new(spv_filter)),
            locker: Locker::new(),
            next_id: AtomicU64::new(1),
            options,
        }))
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Address manager
    pub fn hosts(&self) -> &RwLock<HostList> {
        &self.hosts
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.lock().await.peers.values().cloned().collect()
    }

    pub async fn loader(&self) -> Option<Arc<Peer>> {
        self.state.lock().await.loader_peer()
    }

    pub async fn is_syncing(&self) -> bool {
        self.state.lock().await.syncing
    }

    /// Address the listener is bound to, once connected
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.listen_addr
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Load the host list and prepare header sync
    pub async fn open(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if state.opened {
            return Ok(());
        }

        self.reset_chain(&mut state);

        {
            let mut hosts = self.hosts.write().await;

            if let Some(storage) = &self.storage {
                match storage.load() {
                    Ok(Some(json)) => match hosts.from_json(&json) {
                        Ok(()) => log::info!(
                            "Loaded {} hosts from {}.",
                            hosts.size(),
                            storage.hosts_path().display()
                        ),
                        Err(err) => log::warn!("Could not load host list: {}", err),
                    },
                    Ok(None) => {}
                    Err(err) => log::warn!("Could not read host list: {}", err),
                }
            }

            let nodes = hosts.nodes().to_vec();
            for node in nodes {
                hosts.add(node, None);
            }

            let seeded = hosts.add_seed_nodes();
            if seeded > 0 {
                log::debug!("Added {} seed nodes.", seeded);
            }
        }

        state.opened = true;

        log::info!(
            "Pool loaded (maxpeers={}, network={:?}).",
            self.options.max_outbound,
            self.network.kind
        );

        Ok(())
    }

    /// Start listening, discovering and dialing peers
    pub async fn connect(self: &Arc<Self>) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock().await;
            if !state.opened {
                return Err(PoolError::NotOpen);
            }
            if state.connected {
                return Ok(());
            }

            state.shutdown = CancellationToken::new();

            if self.options.listen {
                self.listen(&mut state).await?;
            }

            self.start_timer(&mut state);
            state.connected = true;
        }

        if self.options.discover {
            self.discover_seeds(false).await;
        }

        self.fill_outbound().await;

        Ok(())
    }

    /// Drop every peer, fail pending broadcasts and flush the host list
    pub async fn disconnect(&self) -> Result<(), PoolError> {
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.lock().await;

            for (_, mut item) in state.inv_map.drain() {
                item.reject(|| PoolError::Closed);
            }

            if !state.connected {
                return Ok(());
            }

            state.disconnecting = true;
            state.shutdown.cancel();
            for task in state.tasks.drain(..) {
                task.abort();
            }

            state.block_map.clear();
            state.tx_map.clear();
            state.compact_blocks.clear();
            state.header_chain.reset();
            state.loader = None;

            std::mem::take(&mut state.peers).into_values().collect()
        };

        for peer in &peers {
            peer.destroy();
        }

        let result = self.flush_hosts().await;

        {
            let mut state = self.state.lock().await;
            state.disconnecting = false;
            state.connected = false;
            state.syncing = false;
            state.pending_refill = false;
            state.listen_addr = None;
        }

        log::info!("Pool disconnected ({} peers).", peers.len());

        result
    }

    pub async fn close(&self) -> Result<(), PoolError> {
        self.disconnect().await?;
        self.state.lock().await.opened = false;
        Ok(())
    }

    /// Begin syncing from every outbound peer
    pub async fn start_sync(&self) {
        let mut state = self.state.lock().await;
        if !state.opened || !state.connected {
            return;
        }
        state.syncing = true;
        self.resync(&state, false);
    }

    pub async fn stop_sync(&self) {
        let mut state = self.state.lock().await;
        if !state.syncing {
            return;
        }
        state.syncing = false;
        for peer in state.peers.values() {
            let mut peer = peer.lock();
            peer.syncing = false;
            peer.merkle = None;
        }
    }

    async fn listen(self: &Arc<Self>, state: &mut PoolState) -> Result<(), PoolError> {
        let addr = self.options.bind_address()?.socket_addr();
        let server = Server::bind(addr).await?;
        state.listen_addr = Some(server.local_addr());

        let pool = Arc::downgrade(self);
        let shutdown = state.shutdown.clone();
        state.tasks.push(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = server.accept() => accepted,
                };
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                match accepted {
                    Ok((stream, remote)) => pool.handle_socket(stream, remote).await,
                    Err(err) => log::warn!("Error accepting connection: {}", err),
                }
            }
        }));

        Ok(())
    }

    fn start_timer(self: &Arc<Self>, state: &mut PoolState) {
        let pool = Arc::downgrade(self);
        let shutdown = state.shutdown.clone();
        state.tasks.push(tokio::spawn(async move {
            let mut discover = time::interval_at(Instant::now() + DISCOVERY_INTERVAL, DISCOVERY_INTERVAL);
            let mut flush = time::interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = discover.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        if pool.options.discover {
                            pool.discover_seeds(true).await;
                        }
                    }
                    _ = flush.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        if let Err(err) = pool.flush_hosts().await {
                            log::warn!("Could not flush host list: {}", err);
                        }
                    }
                }
            }
        }));
    }

    /// Write the host list if it changed since the last flush
    pub async fn flush_hosts(&self) -> Result<(), PoolError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let json = {
            let hosts = self.hosts.read().await;
            if !hosts.needs_flush() {
                return Ok(());
            }
            hosts.to_json()
        };

        storage.save(&json)?;
        self.hosts.write().await.mark_flushed();

        Ok(())
    }

    /// Resolve DNS seeds when the host list is empty, or when `check_peers`
    /// and too few outbound peers are connected
    async fn discover_seeds(self: &Arc<Self>, check_peers: bool) {
        let (seeds, size) = {
            let hosts = self.hosts.read().await;
            (hosts.dns_seeds().to_vec(), hosts.size())
        };

        if seeds.is_empty() {
            return;
        }

        let max = self.options.max_outbound.min(2);
        let connected = {
            let state = self.state.lock().await;
            state
                .peers
                .values()
                .filter(|peer| peer.outbound && peer.lock().connected)
                .count()
        };

        if size > 0 && !(check_peers && connected < max) {
            return;
        }

        log::warn!("Could not find enough peers.");
        log::warn!("Hitting DNS seeds...");

        let services = self.options.required_services();
        let mut found = Vec::new();
        for seed in &seeds {
            match server::resolve(seed, self.network.port).await {
                Ok(addrs) => found.extend(addrs),
                Err(err) => log::warn!("Could not resolve {}: {}", seed, err),
            }
        }

        let mut added = 0;
        {
            let mut hosts = self.hosts.write().await;
            for mut addr in found {
                addr.services = services;
                if hosts.add(addr, None) {
                    added += 1;
                }
            }
        }

        log::info!("Resolved {} hosts from DNS seeds.", added);

        let mut state = self.state.lock().await;
        self.refill(&mut state);
    }

    fn reset_chain(&self, state: &mut PoolState) {
        state.header_chain.reset();
        if !self.options.checkpoints {
            return;
        }
        state.header_chain.init(&self.chain.tip(), &self.network);
    }

    // -------------------------------------------------------------------------
    // Peer Management
    // -------------------------------------------------------------------------

    fn create_peer(&self, addr: NetAddress, outbound: bool) -> Arc<Peer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Peer::new(id, addr, outbound, self.peer_options.clone())
    }

    async fn handle_socket(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        self.add_inbound_stream(stream, NetAddress::from_socket(remote))
            .await;
    }

    /// Adopt an accepted connection as an inbound peer
    pub async fn add_inbound_stream<S>(self: &Arc<Self>, stream: S, addr: NetAddress) -> Option<Arc<Peer>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.hosts.write().await.is_banned(&addr.host()) {
            log::debug!("Ignoring banned peer ({}).", addr.hostname());
            return None;
        }

        let peer = {
            let mut state = self.state.lock().await;
            if !state.opened {
                return None;
            }
            if state.inbound() >= self.options.max_inbound {
                log::debug!("Ignoring peer: too many inbound ({}).", addr.hostname());
                return None;
            }
            let peer = self.create_peer(addr, false);
            state.peers.insert(peer.id, peer.clone());
            peer
        };

        log::info!("Added inbound peer ({}).", peer.hostname());

        self.spawn_peer(peer.clone(), stream);
        Some(peer)
    }

    /// Adopt an already connected stream as an outbound peer
    pub async fn connect_stream<S>(self: &Arc<Self>, stream: S, addr: NetAddress) -> Option<Arc<Peer>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = {
            let mut state = self.state.lock().await;
            if !state.opened || state.has_host(&addr.hostname()) {
                return None;
            }
            let peer = self.create_peer(addr, true);
            state.peers.insert(peer.id, peer.clone());
            peer
        };

        log::info!("Added outbound peer ({}).", peer.hostname());

        self.spawn_peer(peer.clone(), stream);
        Some(peer)
    }

    fn spawn_peer<S>(self: &Arc<Self>, peer: Arc<Peer>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move { pool.run_peer(peer, stream).await });
    }

    /// Dial a registered outbound peer and run it
    fn spawn_outbound(self: &Arc<Self>, peer: Arc<Peer>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let hostname = peer.hostname();
            pool.hosts.write().await.mark_attempt(&hostname);

            let result = tokio::select! {
                result = server::connect(peer.address.socket_addr(), CONNECT_TIMEOUT) => result,
                _ = peer.closed() => Err(PeerError::Destroyed),
            };

            match result {
                Ok(stream) => {
                    pool.hosts.write().await.mark_success(&hostname);
                    pool.run_peer(peer, stream).await;
                }
                Err(err) => {
                    log::debug!("Could not connect to {}: {}", hostname, err);
                    peer.destroy();
                    pool.handle_close(&peer).await;
                }
            }
        });
    }

    async fn run_peer<S>(self: &Arc<Self>, peer: Arc<Peer>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let reader = match peer.attach(stream) {
            Ok(reader) => reader,
            Err(err) => {
                log::warn!("Could not attach peer ({}): {}", peer.hostname(), err);
                peer.destroy();
                self.handle_close(&peer).await;
                return;
            }
        };

        let open = async {
            match peer.handshake().await {
                Ok(()) => self.handle_open(&peer).await,
                Err(err) => {
                    log::debug!("Handshake failed ({}): {}", peer.hostname(), err);
                    peer.destroy();
                }
            }
        };

        tokio::join!(self.read_loop(&peer, reader), open);

        self.handle_close(&peer).await;
    }

    async fn read_loop(self: &Arc<Self>, peer: &Arc<Peer>, mut reader: PeerReader) {
        loop {
            let item = tokio::select! {
                _ = peer.closed() => break,
                item = reader.next() => item,
            };

            match item {
                Some(Ok(Ok(packet))) => match peer.handle_packet(&packet) {
                    Ok(true) => self.handle_packet(peer, packet).await,
                    Ok(false) => {}
                    Err(err) => {
                        log::debug!("{} ({}).", err, peer.hostname());
                        peer.destroy();
                        break;
                    }
                },
                Some(Ok(Err(err))) => peer.handle_framing_error(&err),
                Some(Err(err)) => {
                    log::debug!("Socket error ({}): {}", peer.hostname(), err);
                    peer.destroy();
                    break;
                }
                None => {
                    log::debug!("Connection closed ({}).", peer.hostname());
                    peer.destroy();
                    break;
                }
            }

            if peer.is_destroyed() {
                break;
            }
        }
    }

    async fn handle_open(self: &Arc<Self>, peer: &Arc<Peer>) {
        let services = peer.lock().services();
        if peer.outbound {
            self.hosts.write().await.mark_ack(&peer.hostname(), services);
        }

        if !self.options.selfish && self.options.listen {
            let local = self.hosts.read().await.get_local(Some(&peer.address));
            if let Some(addr) = local {
                log::debug!("Advertising local address {} ({}).", addr.hostname(), peer.hostname());
                peer.send(Packet::Addr(vec![addr]));
            }
        }

        if self.options.compact {
            peer.send_compact(u8::from(self.options.high_bandwidth));
        }

        if !self.hosts.read().await.is_full() {
            peer.send_get_addr();
        }

        let mut state = self.state.lock().await;
        if !state.opened || peer.is_destroyed() {
            return;
        }

        if let Some(filter) = &state.spv_filter {
            peer.send_filter_load(&filter.to_packet());
        }

        for item in state.inv_map.values() {
            match &item.data {
                BroadcastData::Block(block) => peer.announce_block(slice::from_ref(block)),
                BroadcastData::Tx(tx) => peer.announce_tx(slice::from_ref(tx)),
            }
        }

        if self.options.fee_rate >= 0 {
            peer.send_fee_rate(self.options.fee_rate);
        }

        if peer.outbound && !peer.is_loader() {
            // A loader that never finished its handshake is replaced.
            if let Some(loader) = state.loader_peer() {
                if !loader.is_handshake() {
                    loader.lock().loader = false;
                    state.loader = None;
                }
            }
            if state.loader.is_none() {
                self.set_loader(&mut state, peer);
                return;
            }
        }

        self.send_sync(&state, peer);
    }

    async fn handle_close(self: &Arc<Self>, peer: &Arc<Peer>) {
        peer.destroy();
        self.peer_options.nonces.remove(&peer.hostname());

        if peer.is_banned() {
            let mut hosts = self.hosts.write().await;
            hosts.ban(&peer.address.host());
            hosts.remove(&peer.hostname());
            log::info!("Banning peer ({}).", peer.hostname());
        }

        let mut state = self.state.lock().await;
        if state.peers.remove(&peer.id).is_none() {
            return;
        }

        let (blocks, txs, compact, loader) = {
            let mut p = peer.lock();
            (
                std::mem::take(&mut p.block_map),
                std::mem::take(&mut p.tx_map),
                std::mem::take(&mut p.compact_blocks),
                p.loader,
            )
        };

        for hash in blocks.keys() {
            state.block_map.remove(hash);
        }
        for hash in txs.keys() {
            state.tx_map.remove(hash);
        }
        for hash in compact.keys() {
            state.compact_blocks.remove(hash);
        }

        log::info!("Removed peer ({}).", peer.hostname());

        if loader && state.loader == Some(peer.id) {
            log::info!("Removed loader peer ({}).", peer.hostname());
            state.loader = None;
            if state.header_chain.is_active() {
                self.reset_chain(&mut state);
            }
        }

        if !state.opened || !state.connected || state.disconnecting {
            return;
        }

        if self.chain.synced() && !blocks.is_empty() {
            log::warn!("Peer disconnected with requested blocks.");
            log::warn!("Resending sync...");
            self.resync(&state, true);
        }

        self.refill(&mut state);
    }

    /// Schedule an outbound refill unless one is pending
    fn refill(self: &Arc<Self>, state: &mut PoolState) {
        if state.pending_refill || !state.connected {
            return;
        }
        state.pending_refill = true;

        let pool = Arc::downgrade(self);
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = time::sleep(REFILL_DELAY) => {}
            }
            if let Some(pool) = pool.upgrade() {
                pool.fill_outbound().await;
            }
        });
    }

    async fn fill_outbound(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.pending_refill = false;

        if !state.connected || state.disconnecting {
            return;
        }

        let mut hosts = self.hosts.write().await;

        if state.loader.is_none() {
            self.add_loader(&mut state, &mut hosts);
        }

        let outbound = state.outbound();
        if outbound >= self.options.max_outbound {
            return;
        }

        let need = self.options.max_outbound - outbound;
        log::debug!(
            "Refilling {} peers ({}/{}).",
            need,
            outbound,
            self.options.max_outbound
        );

        for _ in 0..need {
            self.add_outbound(&mut state, &mut hosts);
        }
    }

    fn add_loader(self: &Arc<Self>, state: &mut PoolState, hosts: &mut HostList) {
        let candidate = state
            .peers
            .values()
            .find(|peer| peer.outbound && !peer.is_destroyed())
            .cloned();

        if let Some(peer) = candidate {
            log::info!("Repurposing peer for loader ({}).", peer.hostname());
            self.set_loader(state, &peer);
            return;
        }

        let Some(addr) = self.get_host(state, hosts) else {
            return;
        };

        let peer = self.create_peer(addr, true);
        log::info!("Adding loader peer ({}).", peer.hostname());
        state.peers.insert(peer.id, peer.clone());
        self.set_loader(state, &peer);
        self.spawn_outbound(peer);
    }

    fn add_outbound(self: &Arc<Self>, state: &mut PoolState, hosts: &mut HostList) {
        if state.outbound() >= self.options.max_outbound || state.loader.is_none() {
            return;
        }

        let Some(addr) = self.get_host(state, hosts) else {
            return;
        };

        let peer = self.create_peer(addr, true);
        state.peers.insert(peer.id, peer.clone());
        self.spawn_outbound(peer);
    }

    fn set_loader(&self, state: &mut PoolState, peer: &Arc<Peer>) {
        if !state.opened {
            return;
        }
        peer.lock().loader = true;
        state.loader = Some(peer.id);
        self.send_sync(state, peer);
    }

    /// Next address to dial: configured nodes first, then the address
    /// manager with progressively looser filters
    fn get_host(&self, state: &PoolState, hosts: &mut HostList) -> Option<NetAddress> {
        for addr in hosts.nodes() {
            if !state.has_host(&addr.hostname()) {
                return Some(*addr);
            }
        }

        let services = self.options.required_services();
        let now = chrono::Utc::now().timestamp();

        for i in 0..HOST_ATTEMPTS {
            let Some(entry) = hosts.get_host() else {
                break;
            };
            let (addr, last_attempt) = (entry.addr, entry.last_attempt);

            if state.has_host(&addr.hostname()) {
                continue;
            }
            if !addr.is_valid() {
                continue;
            }
            if !addr.has_services(services) {
                continue;
            }
            if i < 30 && now - last_attempt < RETRY_SECS {
                continue;
            }
            if i < 50 && addr.port != self.network.port {
                continue;
            }
            if i < 95 && hosts.is_banned(&addr.host()) {
                continue;
            }

            return Some(addr);
        }

        None
    }

    /// Ban an address and drop any peer connected from it
    pub async fn ban(&self, addr: &NetAddress) {
        let peer = {
            let state = self.state.lock().await;
            let mut hosts = self.hosts.write().await;
            hosts.ban(&addr.host());
            hosts.remove(&addr.hostname());
            state
                .peers
                .values()
                .find(|peer| peer.hostname() == addr.hostname())
                .cloned()
        };

        log::debug!("Banning peer ({}).", addr.hostname());

        if let Some(peer) = peer {
            peer.destroy();
        }
    }

    pub async fn unban(&self, addr: &NetAddress) {
        self.hosts.write().await.unban(&addr.host());
    }

    // -------------------------------------------------------------------------
    // Sync
    // -------------------------------------------------------------------------

    fn is_syncable(&self, state: &PoolState, peer: &Peer) -> bool {
        if !state.syncing {
            return false;
        }

        let p = peer.lock();
        if p.destroyed || !p.handshake {
            return false;
        }
        if !p.services().contains(Services::NETWORK) {
            return false;
        }
        if self.options.witness && !p.has_witness() {
            return false;
        }
        if !p.loader && !self.chain.synced() {
            return false;
        }

        true
    }

    fn send_sync(&self, state: &PoolState, peer: &Peer) -> bool {
        if peer.lock().syncing {
            return false;
        }
        if !self.is_syncable(state, peer) {
            return false;
        }
        let locator = self.chain.get_locator(None);
        self.send_locator(state, locator, peer)
    }

    fn send_locator(&self, state: &PoolState, locator: Vec<Hash256>, peer: &Peer) -> bool {
        if !self.is_syncable(state, peer) {
            return false;
        }

        if self.network.request_mempool && peer.is_loader() && self.chain.synced() {
            log::debug!("Requesting mempool ({}).", peer.hostname());
            peer.send_mempool();
        }

        {
            let mut p = peer.lock();
            p.syncing = true;
            p.block_time = Some(Instant::now());
        }

        if let Some(checkpoint) = state.header_chain.tip() {
            peer.send_get_headers(locator, Some(checkpoint.hash));
            return true;
        }

        peer.send_get_blocks(locator, None);
        true
    }

    /// Send a fresh locator to outbound peers; `force` includes peers
    /// already syncing
    fn resync(&self, state: &PoolState, force: bool) {
        if !state.syncing {
            return;
        }

        let locator = self.chain.get_locator(None);
        for peer in state.peers.values() {
            if !peer.outbound {
                continue;
            }
            if !force && peer.lock().syncing {
                continue;
            }
            self.send_locator(state, locator.clone(), peer);
        }
    }

    fn get_blocks(&self, peer: &Peer, tip: Option<Hash256>, stop: Option<Hash256>) {
        peer.send_get_blocks(self.chain.get_locator(tip), stop);
    }

    fn resolve_orphan(&self, peer: &Peer, orphan: &Hash256) {
        let Some(root) = self.chain.get_orphan_root(orphan) else {
            return;
        };
        peer.send_get_blocks(self.chain.get_locator(None), Some(root));
    }

    fn resolve_headers(&self, state: &mut PoolState, peer: &Peer) {
        let hashes = state.header_chain.take_pending(MAX_INV);
        self.get_block(state, peer, &hashes);
    }

    /// Advance header sync after `hash` was connected
    fn resolve_chain(&self, state: &mut PoolState, peer: &Peer, hash: &Hash256) {
        if !state.header_chain.is_active() || !peer.is_loader() {
            return;
        }

        match state.header_chain.resolve(hash) {
            Ok(ResolveOutcome::NextCheckpoint(checkpoint)) => {
                log::info!(
                    "Received checkpoint {} ({}).",
                    hash,
                    peer.hostname()
                );
                peer.send_get_headers(vec![*hash], Some(checkpoint.hash));
            }
            Ok(ResolveOutcome::Continue) => self.resolve_headers(state, peer),
            Ok(ResolveOutcome::Switch) => {
                log::info!("Switching to getblocks ({}).", peer.hostname());
                self.get_blocks(peer, Some(*hash), None);
            }
            Err(err) => {
                log::warn!("{} ({}).", err, peer.hostname());
                peer.destroy();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    fn has_block(&self, hash: &Hash256) -> bool {
        self.locker.has(hash) || self.chain.has(hash)
    }

    fn has_tx(&self, state: &mut PoolState, hash: &Hash256) -> bool {
        if self.locker.has(hash) {
            return true;
        }

        match &self.mempool {
            Some(mempool) => mempool.has(hash) || mempool.has_reject(hash),
            None => !state.tx_filter.added(hash.as_bytes()),
        }
    }

    /// Request blocks not already in flight from any peer
    fn get_block(&self, state: &mut PoolState, peer: &Peer, hashes: &[Hash256]) {
        if !state.opened || !peer.is_handshake() || peer.is_destroyed() {
            return;
        }

        let synced = self.chain.synced();
        let mut now = Instant::now();
        let mut items = Vec::new();

        let overflow = {
            let mut p = peer.lock();
            for hash in hashes {
                if !state.block_map.insert(*hash) {
                    continue;
                }
                p.block_map.insert(*hash, now);
                if synced {
                    now += Duration::from_millis(100);
                }
                items.push(*hash);
            }
            p.block_map.len() >= MAX_BLOCK_REQUEST
        };

        if items.is_empty() {
            return;
        }

        if overflow {
            log::warn!("Peer advertised too many blocks ({}).", peer.hostname());
            peer.destroy();
            return;
        }

        log::debug!(
            "Requesting {}/{} blocks from peer with getdata ({}).",
            items.len(),
            state.block_map.len(),
            peer.hostname()
        );

        peer.get_block(&items);
    }

    fn get_tx(&self, state: &mut PoolState, peer: &Peer, hashes: &[Hash256]) {
        if !state.opened || !peer.is_handshake() || peer.is_destroyed() {
            return;
        }

        let mut now = Instant::now();
        let mut items = Vec::new();

        let overflow = {
            let mut p = peer.lock();
            for hash in hashes {
                if !state.tx_map.insert(*hash) {
                    continue;
                }
                p.tx_map.insert(*hash, now);
                now += Duration::from_millis(50);
                items.push(*hash);
            }
            p.tx_map.len() >= MAX_TX_REQUEST
        };

        if items.is_empty() {
            return;
        }

        if overflow {
            log::warn!("Peer advertised too many txs ({}).", peer.hostname());
            peer.destroy();
            return;
        }

        log::debug!(
            "Requesting {}/{} txs from peer with getdata ({}).",
            items.len(),
            state.tx_map.len(),
            peer.hostname()
        );

        peer.get_tx(&items);
    }

    fn ensure_tx(&self, state: &mut PoolState, peer: &Peer, hashes: &[Hash256]) {
        let items: Vec<Hash256> = hashes
            .iter()
            .copied()
            .filter(|hash| !self.has_tx(state, hash))
            .collect();
        self.get_tx(state, peer, &items);
    }

    /// Request a full block after compact reconstruction failed
    fn get_full_block(&self, peer: &Peer, hash: Hash256) {
        let kind = if peer.lock().has_witness() {
            InvType::WitnessBlock
        } else {
            InvType::Block
        };
        peer.get_data(vec![InvItem::new(kind, hash)]);
    }

    // -------------------------------------------------------------------------
    // Broadcast
    // -------------------------------------------------------------------------

    /// Announce a block or transaction to every peer. The handle resolves
    /// once a peer requests or rejects it, or fails when the broadcast
    /// timeout passes without either.
    pub async fn broadcast(self: &Arc<Self>, data: impl Into<BroadcastData>) -> BroadcastHandle {
        let data = data.into();
        let hash = data.hash();
        let timeout = self.options.inv_timeout();
        let pool = Arc::downgrade(self);

        let mut state = self.state.lock().await;

        let item = state
            .inv_map
            .entry(hash)
            .or_insert_with(|| BroadcastItem::new(data));
        let handle = item.add_job();
        item.refresh(|generation| {
            tokio::spawn(async move {
                time::sleep(timeout).await;
                if let Some(pool) = pool.upgrade() {
                    pool.handle_broadcast_timeout(hash, generation).await;
                }
            })
        });
        let data = item.data.clone();

        for peer in state.peers.values() {
            match &data {
                BroadcastData::Block(block) => peer.announce_block(slice::from_ref(block)),
                BroadcastData::Tx(tx) => peer.announce_tx(slice::from_ref(tx)),
            }
        }

        handle
    }

    async fn handle_broadcast_timeout(&self, hash: Hash256, generation: u64) {
        let mut state = self.state.lock().await;
        let current = state
            .inv_map
            .get(&hash)
            .is_some_and(|item| item.generation() == generation);
        if !current {
            return;
        }
        if let Some(mut item) = state.inv_map.remove(&hash) {
            log::debug!("Broadcast of {} timed out.", hash);
            item.reject(|| PoolError::Timeout);
        }
    }

    /// Look up a broadcast item a peer requested, acknowledging its callers
    async fn get_broadcasted(&self, peer: &Peer, item: &InvItem) -> Option<BroadcastData> {
        let mut state = self.state.lock().await;
        let entry = state.inv_map.get_mut(&item.hash)?;

        if item.is_tx() == entry.data.is_block() {
            log::debug!(
                "Peer requested broadcast {} with the wrong type ({}).",
                item.hash,
                peer.hostname()
            );
            return None;
        }

        log::debug!(
            "Peer requested {} {} as a {} packet ({}).",
            if entry.data.is_block() { "block" } else { "tx" },
            item.hash,
            item.kind,
            peer.hostname()
        );

        let jobs = entry.take_jobs();
        if !jobs.is_empty() {
            tokio::spawn(async move {
                time::sleep(ACK_DELAY).await;
                resolve_jobs(jobs, BroadcastOutcome::Acked);
            });
        }

        Some(entry.data.clone())
    }

    async fn get_item(&self, peer: &Peer, item: &InvItem) -> Option<BroadcastData> {
        if let Some(data) = self.get_broadcasted(peer, item).await {
            return Some(data);
        }

        if self.options.selfish {
            return None;
        }

        if item.is_tx() {
            let mempool = self.mempool.as_ref()?;
            return mempool.get_tx(&item.hash).map(BroadcastData::Tx);
        }

        if self.options.spv {
            return None;
        }

        self.chain.get_block(&item.hash).map(BroadcastData::Block)
    }

    async fn get_block_item(&self, peer: &Peer, item: &InvItem) -> Option<Block> {
        match self.get_item(peer, item).await {
            Some(BroadcastData::Block(block)) => Some(block),
            _ => None,
        }
    }

    async fn send_block(&self, peer: &Peer, item: &InvItem, witness: bool) -> bool {
        if let Some(BroadcastData::Block(block)) = self.get_broadcasted(peer, item).await {
            peer.send(Packet::Block(BlockPacket { block, witness }));
            return true;
        }

        if self.options.selfish || self.options.spv {
            return false;
        }

        if witness || !self.options.witness {
            return match self.chain.get_raw_block(&item.hash, witness) {
                Some(raw) => {
                    peer.send_raw("block", raw);
                    true
                }
                None => false,
            };
        }

        match self.chain.get_block(&item.hash) {
            Some(block) => {
                peer.send(Packet::Block(BlockPacket { block, witness }));
                true
            }
            None => false,
        }
    }

    /// Relay a block to every connected peer
    pub async fn announce_block(&self, block: &Block) {
        let state = self.state.lock().await;
        for peer in state.peers.values() {
            peer.announce_block(slice::from_ref(block));
        }
    }

    /// Relay a transaction to every connected peer
    pub async fn announce_tx(&self, tx: &Transaction) {
        let state = self.state.lock().await;
        for peer in state.peers.values() {
            peer.announce_tx(slice::from_ref(tx));
        }
    }

    // -------------------------------------------------------------------------
    // SPV Filter
    // -------------------------------------------------------------------------

    /// Replace the filter sent to peers in SPV mode
    pub async fn set_filter(&self, filter: BloomFilter) {
        let mut state = self.state.lock().await;
        let packet = filter.to_packet();
        state.spv_filter = Some(filter);
        for peer in state.peers.values() {
            if peer.is_handshake() {
                peer.send_filter_load(&packet);
            }
        }
    }

    /// Add data to the SPV filter and resend it
    pub async fn watch(&self, data: &[u8]) {
        let mut state = self.state.lock().await;
        let Some(filter) = state.spv_filter.as_mut() else {
            return;
        };
        filter.add(data);
        let packet = filter.to_packet();
        for peer in state.peers.values() {
            if peer.is_handshake() {
                peer.send_filter_load(&packet);
            }
        }
    }

    // =========================================================================
    // Packet Handlers
    // =========================================================================

    async fn handle_packet(self: &Arc<Self>, peer: &Arc<Peer>, packet: Packet) {
        match packet {
            Packet::Version(version) => self.handle_version(peer, &version).await,
            Packet::Addr(addrs) => self.handle_addr(peer, addrs).await,
            Packet::GetAddr => self.handle_get_addr(peer).await,
            Packet::Inv(items) => self.handle_inv(peer, items).await,
            Packet::GetData(items) => self.handle_get_data(peer, items).await,
            Packet::NotFound(items) => self.handle_not_found(peer, items).await,
            Packet::GetBlocks(packet) => self.handle_get_blocks(peer, packet).await,
            Packet::GetHeaders(packet) => self.handle_get_headers(peer, packet).await,
            Packet::Headers(headers) => self.handle_headers(peer, headers).await,
            Packet::Block(packet) => self.handle_block(peer, packet.block).await,
            Packet::Tx(packet) => self.handle_tx(peer, packet.tx).await,
            Packet::Reject(packet) => self.handle_reject(peer, packet).await,
            Packet::Mempool => self.handle_mempool(peer).await,
            Packet::MerkleBlock(block) => self.handle_merkle_block(peer, block).await,
            Packet::CmpctBlock(packet) => self.handle_compact_block(peer, packet).await,
            Packet::GetBlockTxn(request) => self.handle_get_block_txn(peer, request).await,
            Packet::BlockTxn(packet) => self.handle_block_txn(peer, packet).await,
            Packet::Unknown(packet) => {
                log::debug!(
                    "Unknown packet: {} ({}).",
                    packet.command,
                    peer.hostname()
                );
            }
            // Handled by the peer.
            Packet::Verack
            | Packet::Ping(_)
            | Packet::Pong(_)
            | Packet::SendHeaders
            | Packet::FilterLoad(_)
            | Packet::FilterAdd(_)
            | Packet::FilterClear
            | Packet::FeeFilter(_)
            | Packet::SendCmpct(_) => {}
        }
    }

    async fn handle_version(&self, peer: &Peer, packet: &VersionPacket) {
        log::info!(
            "Received version ({}): version={} height={} services={:?} agent={}",
            peer.hostname(),
            packet.version,
            packet.height,
            packet.services,
            packet.agent
        );

        self.hosts.write().await.mark_local(&packet.remote);
    }

    // -------------------------------------------------------------------------
    // Addresses
    // -------------------------------------------------------------------------

    async fn handle_addr(self: &Arc<Self>, peer: &Arc<Peer>, addrs: Vec<NetAddress>) {
        if self.options.selfish {
            return;
        }

        let now = chrono::Utc::now().timestamp() as u64;
        let services = self.options.required_services();
        let total = addrs.len();
        let mut added = 0;

        {
            let mut hosts = self.hosts.write().await;
            for mut addr in addrs {
                peer.lock().addr_filter.add(addr.hostname().as_bytes());

                if !addr.is_routable() {
                    continue;
                }
                if !addr.has_services(services) {
                    continue;
                }
                if addr.time <= 100_000_000 || addr.time > now + 10 * 60 {
                    addr.time = now - 5 * 24 * 60 * 60;
                }
                if addr.port == 0 {
                    continue;
                }

                if hosts.add(addr, Some(&peer.address)) {
                    added += 1;
                }
            }
        }

        let mut state = self.state.lock().await;

        log::info!(
            "Received {} addrs (hosts={}, peers={}) ({}).",
            total,
            added,
            state.peers.len(),
            peer.hostname()
        );

        self.refill(&mut state);
    }

    async fn handle_get_addr(&self, peer: &Peer) {
        if self.options.selfish {
            return;
        }

        if peer.lock().sent_addr {
            log::debug!("Ignoring repeated getaddr ({}).", peer.hostname());
            return;
        }
        peer.lock().sent_addr = true;

        let addrs = self.hosts.read().await.to_array();
        let mut items = Vec::new();
        {
            let mut p = peer.lock();
            for addr in addrs {
                if !p.addr_filter.added(addr.hostname().as_bytes()) {
                    continue;
                }
                items.push(addr);
                if items.len() == GETADDR_LIMIT {
                    break;
                }
            }
        }

        if items.is_empty() {
            return;
        }

        log::debug!(
            "Sending {} addrs to peer ({}).",
            items.len(),
            peer.hostname()
        );

        peer.send(Packet::Addr(items));
    }

    // -------------------------------------------------------------------------
    // Inventory
    // -------------------------------------------------------------------------

    async fn handle_inv(self: &Arc<Self>, peer: &Arc<Peer>, items: Vec<InvItem>) {
        let mut blocks = Vec::new();
        let mut txs = Vec::new();
        let mut unknown = None;

        {
            let mut p = peer.lock();
            for item in &items {
                match item.kind {
                    InvType::Block => blocks.push(item.hash),
                    InvType::Tx => txs.push(item.hash),
                    kind => {
                        unknown = Some(kind);
                        continue;
                    }
                }
                p.inv_filter.add(item.hash.as_bytes());
            }
        }

        log::debug!(
            "Received inv packet with {} items: blocks={} txs={} ({}).",
            items.len(),
            blocks.len(),
            txs.len(),
            peer.hostname()
        );

        if let Some(kind) = unknown {
            log::warn!("Peer sent an unknown inv type: {} ({}).", kind, peer.hostname());
        }

        if !blocks.is_empty() {
            self.handle_block_inv(peer, blocks).await;
        }

        if !txs.is_empty() {
            self.handle_tx_inv(peer, txs).await;
        }
    }

    async fn handle_block_inv(&self, peer: &Peer, hashes: Vec<Hash256>) {
        let mut state = self.state.lock().await;
        if !state.syncing {
            return;
        }

        let synced = self.chain.synced();
        let loader = peer.is_loader();

        // Remember the last announced hash.
        if !loader || synced {
            peer.lock().best_hash = hashes.last().copied();
        }

        // Ignore non-loader announcements during the initial sync.
        if !synced && !loader {
            return;
        }

        if self.options.witness && !peer.lock().has_witness() {
            return;
        }

        // Header sync drives requests until the last checkpoint.
        if state.header_chain.is_active() {
            return;
        }

        log::debug!(
            "Received {} block hashes from peer ({}).",
            hashes.len(),
            peer.hostname()
        );

        let mut items = Vec::new();
        let mut exists = None;

        for (i, hash) in hashes.iter().enumerate() {
            if self.chain.has_orphan(hash) {
                log::debug!("Received known orphan hash ({}).", peer.hostname());
                self.resolve_orphan(peer, hash);
                continue;
            }

            if !self.has_block(hash) {
                items.push(*hash);
                continue;
            }

            exists = Some(*hash);

            // The last hash is known: the peer is ahead on another branch.
            if i == hashes.len() - 1 {
                log::debug!("Received existing hash ({}).", peer.hostname());
                self.get_blocks(peer, Some(*hash), None);
            }
        }

        if let Some(hash) = exists {
            if synced {
                if let Some(entry) = self.chain.get_entry(&hash) {
                    peer.lock().best_height = Some(entry.height);
                }
            }
        }

        self.get_block(&mut state, peer, &items);
    }

    async fn handle_tx_inv(&self, peer: &Peer, hashes: Vec<Hash256>) {
        let mut state = self.state.lock().await;
        if state.syncing && !self.chain.synced() {
            return;
        }
        self.ensure_tx(&mut state, peer, &hashes);
    }

    async fn handle_not_found(&self, peer: &Peer, items: Vec<InvItem>) {
        let mut state = self.state.lock().await;
        for item in &items {
            let requested = if item.is_block() {
                state.resolve_block(peer, &item.hash)
            } else if item.is_tx() {
                state.resolve_tx(peer, &item.hash)
            } else {
                false
            };

            if !requested {
                log::warn!(
                    "Peer sent notfound for unrequested item: {} ({}).",
                    item.hash,
                    peer.hostname()
                );
                peer.destroy();
                return;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Serving
    // -------------------------------------------------------------------------

    async fn handle_get_data(&self, peer: &Peer, items: Vec<InvItem>) {
        let mut not_found = Vec::new();
        let mut txs = 0;
        let mut blocks = 0;
        let mut compact = 0;
        let mut unknown = None;

        for item in items {
            match item.kind {
                InvType::Tx | InvType::WitnessTx => {
                    let tx = match self.get_item(peer, &item).await {
                        Some(BroadcastData::Tx(tx)) => tx,
                        _ => {
                            not_found.push(item);
                            continue;
                        }
                    };

                    if tx.is_coinbase() {
                        not_found.push(item);
                        log::warn!("Failsafe: tried to relay a coinbase.");
                        continue;
                    }

                    peer.send(Packet::Tx(TxPacket {
                        tx,
                        witness: item.has_witness(),
                    }));
                    txs += 1;
                }
                InvType::Block | InvType::WitnessBlock => {
                    if !self.send_block(peer, &item, item.has_witness()).await {
                        not_found.push(item);
                        continue;
                    }
                    blocks += 1;
                }
                InvType::FilteredBlock | InvType::WitnessFilteredBlock => {
                    if !self.options.bip37 {
                        log::debug!(
                            "Peer requested a merkleblock without bip37 enabled ({}).",
                            peer.hostname()
                        );
                        peer.destroy();
                        return;
                    }

                    let Some(block) = self.get_block_item(peer, &item).await else {
                        not_found.push(item);
                        continue;
                    };

                    let Some((merkle, matched)) = filter_block(peer, &block) else {
                        not_found.push(item);
                        continue;
                    };

                    peer.send(Packet::MerkleBlock(merkle));
                    for tx in matched {
                        peer.send(Packet::Tx(TxPacket {
                            tx,
                            witness: item.has_witness(),
                        }));
                        txs += 1;
                    }
                    blocks += 1;
                }
                InvType::CmpctBlock => {
                    let height = self.chain.get_entry(&item.hash).map(|entry| entry.height);

                    // Fall back to a full block when it is too deep.
                    let deep = height.map_or(true, |height| height + COMPACT_DEPTH < self.chain.height());
                    if deep {
                        let witness = peer.lock().compact_witness;
                        if !self.send_block(peer, &item, witness).await {
                            not_found.push(item);
                            continue;
                        }
                        blocks += 1;
                    } else {
                        let Some(block) = self.get_block_item(peer, &item).await else {
                            not_found.push(item);
                            continue;
                        };
                        peer.send_compact_block(&block);
                        blocks += 1;
                        compact += 1;
                    }
                }
                kind => {
                    unknown = Some(kind);
                    not_found.push(item);
                    continue;
                }
            }

            let continue_hash = {
                let mut p = peer.lock();
                if p.hash_continue == Some(item.hash) {
                    p.hash_continue = None;
                    true
                } else {
                    false
                }
            };

            if continue_hash {
                let tip = self.chain.tip().hash;
                log::debug!("Sending inv continue {} ({}).", tip, peer.hostname());
                peer.send_inv(vec![InvItem::block(tip)]);
            }

            if peer.drain().await.is_err() {
                return;
            }
        }

        if !not_found.is_empty() {
            peer.send(Packet::NotFound(not_found.clone()));
        }

        if txs > 0 {
            log::debug!("Served {} txs with getdata (notfound={}) ({}).", txs, not_found.len(), peer.hostname());
        }

        if blocks > 0 {
            log::debug!(
                "Served {} blocks with getdata (notfound={}, cmpct={}) ({}).",
                blocks,
                not_found.len(),
                compact,
                peer.hostname()
            );
        }

        if let Some(kind) = unknown {
            log::warn!("Peer sent an unknown getdata type: {} ({}).", kind, peer.hostname());
        }
    }

    async fn handle_get_blocks(&self, peer: &Peer, packet: LocatorPacket) {
        if packet.locator.len() > MAX_LOCATOR {
            log::warn!("Peer sent a locator with {} hashes ({}).", packet.locator.len(), peer.hostname());
            peer.destroy();
            return;
        }

        if !self.chain.synced() || self.options.selfish || self.options.spv {
            return;
        }

        let start = self.chain.find_locator(&packet.locator);
        let mut hash = self.chain.get_next_hash(&start);
        let mut blocks = Vec::new();

        while let Some(next) = hash {
            blocks.push(InvItem::block(next));

            if packet.stop == Some(next) {
                break;
            }

            if blocks.len() == GETBLOCKS_LIMIT {
                peer.lock().hash_continue = Some(next);
                break;
            }

            hash = self.chain.get_next_hash(&next);
        }

        peer.send_inv(blocks);
    }

    async fn handle_get_headers(&self, peer: &Peer, packet: LocatorPacket) {
        if packet.locator.len() > MAX_LOCATOR {
            log::warn!("Peer sent a locator with {} hashes ({}).", packet.locator.len(), peer.hostname());
            peer.destroy();
            return;
        }

        if !self.chain.synced() || self.options.selfish || self.options.spv {
            return;
        }

        let mut hash = if packet.locator.is_empty() {
            packet.stop
        } else {
            let start = self.chain.find_locator(&packet.locator);
            self.chain.get_next_hash(&start)
        };

        let mut headers = Vec::new();
        while let Some(next) = hash {
            let Some(entry) = self.chain.get_entry(&next) else {
                break;
            };
            headers.push(entry.header);

            if packet.stop == Some(next) || headers.len() == MAX_HEADERS {
                break;
            }

            hash = self.chain.get_next_hash(&next);
        }

        peer.send_headers(headers);
    }

    async fn handle_mempool(&self, peer: &Peer) {
        let Some(mempool) = &self.mempool else {
            return;
        };

        if !self.chain.synced() || self.options.selfish {
            return;
        }

        if !self.options.bip37 {
            log::debug!("Peer requested mempool without bip37 enabled ({}).", peer.hostname());
            peer.destroy();
            return;
        }

        let txs = mempool.transactions();
        log::debug!("Sending mempool snapshot with {} txs ({}).", txs.len(), peer.hostname());
        peer.announce_tx(&txs);
    }

    async fn handle_get_block_txn(&self, peer: &Peer, request: TxRequest) {
        if self.options.spv || self.options.selfish {
            return;
        }

        let item = InvItem::block(request.hash);
        let Some(block) = self.get_block_item(peer, &item).await else {
            log::debug!("Peer sent getblocktxn for non-existent block ({}).", peer.hostname());
            peer.increase_ban(100);
            return;
        };

        if let Some(entry) = self.chain.get_entry(&request.hash) {
            if entry.height + BLOCKTXN_DEPTH < self.chain.height() {
                log::debug!("Peer sent a getblocktxn for a block > 15 deep ({}).", peer.hostname());
                return;
            }
        }

        log::debug!("Sending blocktxn for {} to peer ({}).", request.hash, peer.hostname());

        let response = TxResponse::from_block(&block, &request);
        let witness = peer.lock().compact_witness;
        peer.send(Packet::BlockTxn(BlockTxnPacket { response, witness }));
    }

    async fn handle_reject(&self, peer: &Peer, packet: RejectPacket) {
        log::warn!(
            "Received reject ({}): msg={} code={} reason={} hash={}.",
            peer.hostname(),
            packet.message,
            packet.code,
            packet.reason,
            packet.hash.map(|hash| hash.to_string()).unwrap_or_default()
        );

        let Some(hash) = packet.hash else {
            return;
        };

        let mut state = self.state.lock().await;
        if let Some(item) = state.inv_map.get_mut(&hash) {
            item.resolve(BroadcastOutcome::Rejected);
        }
    }

    // -------------------------------------------------------------------------
    // Headers and Blocks
    // -------------------------------------------------------------------------

    async fn handle_headers(&self, peer: &Peer, headers: Vec<BlockHeader>) {
        if headers.len() > MAX_HEADERS {
            peer.increase_ban(100);
            return;
        }

        let mut state = self.state.lock().await;

        // Outside header sync, headers are block announcements.
        if !state.header_chain.is_active() {
            drop(state);
            let hashes: Vec<Hash256> = headers
                .iter()
                .map(BlockHeader::hash)
                .filter(|hash| !self.chain.has(hash))
                .collect();
            if !hashes.is_empty() {
                self.handle_block_inv(peer, hashes).await;
            }
            return;
        }

        if !state.syncing || !peer.is_loader() || headers.is_empty() {
            return;
        }

        match state.header_chain.add_headers(&headers) {
            Ok(outcome) => {
                log::debug!(
                    "Received {} headers from peer ({}).",
                    headers.len(),
                    peer.hostname()
                );
                peer.lock().block_time = Some(Instant::now());

                match outcome {
                    HeadersOutcome::Checkpoint => self.resolve_headers(&mut state, peer),
                    HeadersOutcome::Continue(hash) => {
                        let stop = state.header_chain.tip().map(|checkpoint| checkpoint.hash);
                        peer.send_get_headers(vec![hash], stop);
                    }
                }
            }
            Err(HeaderChainError::InvalidHeader(hash)) => {
                log::warn!("Peer sent an invalid header {} ({}).", hash, peer.hostname());
                peer.increase_ban(100);
                peer.destroy();
            }
            Err(err) => {
                log::warn!("{} ({}).", err, peer.hostname());
                peer.destroy();
            }
        }
    }

    async fn handle_block(&self, peer: &Peer, block: Block) {
        if self.options.spv {
            log::warn!("Peer sent unsolicited block ({}).", peer.hostname());
            return;
        }
        self.add_block(peer, block, BlockFlags::DEFAULT).await;
    }

    async fn add_block(&self, peer: &Peer, block: Block, flags: BlockFlags) {
        let hash = block.hash();
        let _guard = self.locker.lock(hash).await;

        let mut state = self.state.lock().await;
        if !state.syncing {
            return;
        }

        if !state.resolve_block(peer, &hash) {
            log::warn!("Received unrequested block: {} ({}).", hash, peer.hostname());
            peer.destroy();
            return;
        }

        peer.lock().block_time = Some(Instant::now());

        let entry = match self.chain.add(block.clone(), flags, Some(peer.id)) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if state.header_chain.is_active() {
                    log::warn!("Peer sent orphan block with getheaders ({}).", peer.hostname());
                    return;
                }
                log::debug!("Peer sent an orphan block. Resolving ({}).", peer.hostname());
                self.resolve_orphan(peer, &hash);
                return;
            }
            Err(ChainError::Verify(err)) => {
                log::warn!("{} ({}).", err, peer.hostname());
                peer.reject("block", err.code, &err.reason, Some(err.hash), err.score);
                return;
            }
            Err(err) => {
                log::error!("Could not add block {}: {}", hash, err);
                return;
            }
        };

        let synced = self.chain.synced();

        if synced {
            let mut p = peer.lock();
            p.best_hash = Some(entry.hash);
            p.best_height = Some(entry.height);

            drop(p);
            for other in state.peers.values() {
                if other.id != peer.id {
                    other.announce_block(slice::from_ref(&block));
                }
            }
        }

        self.log_status(&state, &entry);

        if synced && !state.was_synced {
            state.was_synced = true;
            log::info!("Chain is fully synced (height={}).", entry.height);
            self.resync(&state, false);
        }

        self.resolve_chain(&mut state, peer, &hash);
    }

    fn log_status(&self, state: &PoolState, entry: &ChainEntry) {
        if entry.height % 20 != 0 && self.chain.synced() {
            log::debug!("Received block {} (height={}).", entry.hash, entry.height);
            return;
        }

        log::info!(
            "Status: tip={} height={} peers={} inflight={}",
            entry.hash,
            entry.height,
            state.peers.len(),
            state.block_map.len()
        );
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    async fn handle_tx(&self, peer: &Peer, tx: Transaction) {
        let hash = tx.txid();

        match take_merkle_tx(peer, &hash, &tx) {
            MerkleTx::Unmatched => {}
            MerkleTx::Pending => return,
            MerkleTx::Duplicate => {
                log::warn!("Peer sent a duplicate merkle tx: {} ({}).", hash, peer.hostname());
                peer.increase_ban(100);
                return;
            }
            MerkleTx::Complete(pending) => {
                let block = Block::new(pending.block.header, pending.txs);
                self.add_block(peer, block, BlockFlags::VERIFY_POW).await;
                return;
            }
        }

        {
            let mut state = self.state.lock().await;
            if !state.resolve_tx(peer, &hash) {
                log::warn!("Peer sent unrequested tx: {} ({}).", hash, peer.hostname());
                peer.destroy();
                return;
            }
        }

        let Some(mempool) = &self.mempool else {
            log::debug!("Received tx {} without a mempool ({}).", hash, peer.hostname());
            return;
        };

        let _guard = self.locker.lock(hash).await;

        let missing = match mempool.add_tx(tx.clone(), Some(peer.id)) {
            Ok(missing) => missing,
            Err(ChainError::Verify(err)) => {
                log::info!("{} ({}).", err, peer.hostname());
                peer.reject("tx", err.code, &err.reason, Some(err.hash), err.score);
                return;
            }
            Err(err) => {
                log::error!("Could not add tx {}: {}", hash, err);
                return;
            }
        };

        let mut state = self.state.lock().await;

        for other in state.peers.values() {
            if other.id != peer.id {
                other.announce_tx(slice::from_ref(&tx));
            }
        }

        if !missing.is_empty() {
            log::debug!(
                "Requesting {} missing transactions ({}).",
                missing.len(),
                peer.hostname()
            );
            self.ensure_tx(&mut state, peer, &missing);
        }
    }

    async fn handle_merkle_block(&self, peer: &Peer, block: MerkleBlock) {
        let syncing = self.state.lock().await.syncing;
        if !syncing {
            return;
        }

        if !self.options.spv {
            log::warn!("Peer sent unsolicited merkleblock ({}).", peer.hostname());
            peer.increase_ban(100);
            return;
        }

        let hash = block.hash();
        let (requested, pending) = {
            let p = peer.lock();
            (p.block_map.contains_key(&hash), p.merkle.is_some())
        };

        if !requested {
            log::warn!("Peer sent an unrequested merkleblock ({}).", peer.hostname());
            peer.destroy();
            return;
        }

        if pending {
            log::warn!("Peer sent a merkleblock prematurely ({}).", peer.hostname());
            peer.increase_ban(100);
            return;
        }

        let tree = match block.matches() {
            Some(tree) if block.header.verify_pow() && tree.root == block.header.merkle_root => tree,
            _ => {
                log::warn!("Peer sent an invalid merkleblock ({}).", peer.hostname());
                peer.increase_ban(100);
                return;
            }
        };

        if tree.matches.is_empty() {
            let header = block.header;
            self.add_block(peer, Block::new(header, Vec::new()), BlockFlags::VERIFY_POW)
                .await;
            return;
        }

        peer.lock().merkle = Some(PendingMerkle {
            block,
            time: Instant::now(),
            remaining: tree.matches.into_iter().collect(),
            txs: Vec::new(),
        });
    }

    // -------------------------------------------------------------------------
    // Compact Blocks
    // -------------------------------------------------------------------------

    async fn handle_compact_block(&self, peer: &Peer, packet: CmpctBlockPacket) {
        let mut block = packet.block;
        let hash = block.hash();

        {
            let mut state = self.state.lock().await;
            if !state.syncing {
                return;
            }

            if !self.options.compact || !peer.has_compact_support() || !peer.has_compact() {
                log::info!("Peer sent unsolicited cmpctblock ({}).", peer.hostname());
                peer.destroy();
                return;
            }

            if peer.lock().compact_blocks.contains_key(&hash) {
                log::debug!("Peer sent us a duplicate compact block ({}).", peer.hostname());
                return;
            }

            if state.compact_blocks.contains(&hash) {
                log::debug!("Already waiting for compact block {} ({}).", hash, peer.hostname());
                return;
            }

            let requested = peer.lock().block_map.contains_key(&hash);
            if !requested {
                if !self.options.high_bandwidth {
                    log::warn!("Peer sent us an unrequested compact block ({}).", peer.hostname());
                    peer.destroy();
                    return;
                }

                if self.has_block(&hash) || !state.block_map.insert(hash) {
                    log::debug!("Compact block {} is already known ({}).", hash, peer.hostname());
                    return;
                }
                peer.lock().block_map.insert(hash, Instant::now());
            }
        }

        let Some(mempool) = &self.mempool else {
            log::warn!("Requesting compact blocks without a mempool!");
            return;
        };

        if !block.header.verify_pow() {
            log::debug!("Peer sent an invalid compact block ({}).", peer.hostname());
            peer.increase_ban(100);
            return;
        }

        match block.init() {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "Siphash collision for {}. Requesting full block ({}).",
                    hash,
                    peer.hostname()
                );
                self.get_full_block(peer, hash);
                return;
            }
            Err(err) => {
                log::debug!("Peer sent an invalid compact block ({}): {}", peer.hostname(), err);
                peer.increase_ban(100);
                return;
            }
        }

        let witness = peer.lock().compact_witness;
        let txs = mempool.transactions();

        if block.fill_mempool(witness, txs.iter()) {
            log::debug!("Received full compact block {} ({}).", hash, peer.hostname());
            match block.to_block() {
                Ok(full) => self.add_block(peer, full, BlockFlags::DEFAULT).await,
                Err(err) => log::warn!("Could not rebuild compact block {}: {}", hash, err),
            }
            return;
        }

        let mut state = self.state.lock().await;

        if peer.lock().compact_blocks.len() >= MAX_COMPACT_BLOCKS {
            log::warn!("Compact block DoS attempt ({}).", peer.hostname());
            peer.destroy();
            return;
        }

        let request = block.to_request();

        log::debug!(
            "Received non-full compact block {} tx={} missing={} ({}).",
            hash,
            block.total_tx(),
            request.indexes.len(),
            peer.hostname()
        );

        peer.lock().compact_blocks.insert(
            hash,
            PendingCompact {
                block,
                time: Instant::now(),
            },
        );
        state.compact_blocks.insert(hash);

        peer.send(Packet::GetBlockTxn(request));
    }

    async fn handle_block_txn(&self, peer: &Peer, packet: BlockTxnPacket) {
        let response = packet.response;
        let hash = response.hash;

        let pending = {
            let mut state = self.state.lock().await;
            let pending = peer.lock().compact_blocks.remove(&hash);
            let Some(pending) = pending else {
                log::debug!("Peer sent unsolicited blocktxn ({}).", peer.hostname());
                return;
            };
            state.compact_blocks.remove(&hash);
            pending
        };

        let mut block = pending.block;

        if !block.fill_missing(&response) {
            log::warn!(
                "Peer sent non-full blocktxn for {}. Requesting full block ({}).",
                hash,
                peer.hostname()
            );
            self.get_full_block(peer, hash);
            peer.increase_ban(10);
            return;
        }

        log::debug!("Filled compact block {} ({}).", hash, peer.hostname());

        match block.to_block() {
            Ok(full) => self.add_block(peer, full, BlockFlags::DEFAULT).await,
            Err(err) => log::warn!("Could not rebuild compact block {}: {}", hash, err),
        }
    }
}

/// Build a merkle block of the transactions matching the peer's filter
fn filter_block(peer: &Peer, block: &Block) -> Option<(MerkleBlock, Vec<Transaction>)> {
    let mut p = peer.lock();
    let filter = p.spv_filter.as_mut()?;

    let matched: Vec<Transaction> = block
        .txs
        .iter()
        .filter(|tx| filter.is_watched(tx))
        .cloned()
        .collect();
    let hashes: HashSet<Hash256> = matched.iter().map(Transaction::txid).collect();

    Some((MerkleBlock::from_block(block, &hashes), matched))
}

/// Feed a transaction to the peer's pending filtered block, if any
fn take_merkle_tx(peer: &Peer, hash: &Hash256, tx: &Transaction) -> MerkleTx {
    let mut p = peer.lock();

    let complete = {
        let Some(pending) = p.merkle.as_mut() else {
            return MerkleTx::Unmatched;
        };

        if !pending.remaining.remove(hash) {
            if pending.txs.iter().any(|known| known.txid() == *hash) {
                return MerkleTx::Duplicate;
            }
            return MerkleTx::Unmatched;
        }

        pending.txs.push(tx.clone());
        pending.remaining.is_empty()
    };

    if !complete {
        return MerkleTx::Pending;
    }

    match p.merkle.take() {
        Some(pending) => MerkleTx::Complete(pending),
        None => MerkleTx::Unmatched,
    }
}
