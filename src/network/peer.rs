//! Peer connection
//!
//! A `Peer` owns one remote connection: the version handshake, correlated
//! request/response waits, write backpressure, stall detection, ping
//! liveness and inventory batching. Everything chain-specific is left to
//! the `Pool`, which drives the read loop and receives each packet after
//! the peer has done its own bookkeeping.

use crate::bip152::CompactBlock;
use crate::chain::{Chain, Mempool};
use crate::core::{Block, BlockHeader, MerkleBlock, Network, Transaction};
use crate::crypto::Hash256;
use crate::network::filter::{BloomFilter, RollingFilter};
use crate::wire::framing::{PacketCodec, HEADER_LEN};
use crate::wire::netaddress::NetAddress;
use crate::wire::packets::{
    CmpctBlockPacket, FilterLoadPacket, LocatorPacket, Packet, PacketType, RejectPacket,
    SendCmpctPacket, UnknownPacket, VersionPacket, MAX_FILTERADD,
};
use crate::wire::types::{
    InvItem, InvType, RejectCode, Services, COMPACT_VERSION, COMPACT_WITNESS_VERSION,
    HEADERS_VERSION, MAX_MONEY, MIN_VERSION, PONG_VERSION, PROTOCOL_VERSION, BLOOM_VERSION,
};
use crate::wire::WireError;
use futures::sink::SinkExt;
use futures::stream::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Time allowed for each half of the version handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Base deadline for correlated requests
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a requested block
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for a requested transaction
pub const TX_TIMEOUT: Duration = Duration::from_secs(120);

pub const STALL_INTERVAL: Duration = Duration::from_secs(5);

pub const PING_INTERVAL: Duration = Duration::from_secs(30);

pub const INV_INTERVAL: Duration = Duration::from_secs(5);

/// Idle limit for sends and receives
pub const TIMEOUT_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Unflushed bytes allowed before the peer is dropped
pub const DRAIN_MAX: usize = 10 << 20;

/// Partially reconstructed compact blocks allowed per peer
pub const MAX_COMPACT_BLOCKS: usize = 15;

/// Queued inventory that forces an immediate flush
pub const MAX_INV_QUEUE: usize = 500;

/// Inventory items per `inv` message
const INV_CHUNK: usize = 1000;

/// Headers per `headers` message
const HEADERS_CHUNK: usize = 2000;

/// Grace period before the idle checks apply
const IDLE_GRACE: Duration = Duration::from_secs(60);

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer is destroyed")]
    Destroyed,
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("Peer sent a duplicate version")]
    DuplicateVersion,
    #[error("We connected to ourself")]
    SelfConnect,
    #[error("Peer does not support required protocol version ({0})")]
    Version(i32),
    #[error("Peer does not support {0}")]
    Services(&'static str),
    #[error("Peer is already attached to a socket")]
    Attached,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Nonce List
// =============================================================================

#[derive(Debug, Default)]
struct Nonces {
    by_nonce: HashMap<u64, String>,
    by_host: HashMap<String, u64>,
}

/// Nonces we sent in `version`, used to detect self connections
#[derive(Debug, Default)]
pub struct NonceList {
    inner: Mutex<Nonces>,
}

impl NonceList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Nonces> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh nonce for `hostname`
    pub fn alloc(&self, hostname: &str) -> u64 {
        let mut nonces = self.lock();
        let nonce = loop {
            let nonce: u64 = rand::random();
            if nonce != 0 && !nonces.by_nonce.contains_key(&nonce) {
                break nonce;
            }
        };

        if let Some(old) = nonces.by_host.insert(hostname.to_string(), nonce) {
            nonces.by_nonce.remove(&old);
        }
        nonces.by_nonce.insert(nonce, hostname.to_string());
        nonce
    }

    pub fn has(&self, nonce: u64) -> bool {
        self.lock().by_nonce.contains_key(&nonce)
    }

    pub fn remove(&self, hostname: &str) {
        let mut nonces = self.lock();
        if let Some(nonce) = nonces.by_host.remove(hostname) {
            nonces.by_nonce.remove(&nonce);
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Settings and collaborators shared by every peer of a pool
pub struct PeerOptions {
    pub network: Network,
    pub chain: Arc<dyn Chain>,
    pub mempool: Option<Arc<dyn Mempool>>,
    pub nonces: Arc<NonceList>,
    pub agent: String,
    /// Services we advertise
    pub services: Services,
    /// Require witness support from outbound peers
    pub witness: bool,
    pub spv: bool,
    pub bip37: bool,
    pub compact: bool,
    pub no_relay: bool,
    pub ban_score: u32,
}

impl PeerOptions {
    pub fn new(network: Network, chain: Arc<dyn Chain>) -> Self {
        Self {
            network,
            chain,
            mempool: None,
            nonces: Arc::new(NonceList::new()),
            agent: format!("/mini-p2p:{}/", env!("CARGO_PKG_VERSION")),
            services: Services::NETWORK | Services::WITNESS,
            witness: true,
            spv: false,
            bip37: false,
            compact: true,
            no_relay: false,
            ban_score: 100,
        }
    }
}

// =============================================================================
// Peer State
// =============================================================================

struct ResponseEntry {
    deadline: Instant,
    jobs: Vec<oneshot::Sender<Result<Packet, PeerError>>>,
}

/// Compact block waiting for `blocktxn`
#[derive(Debug, Clone)]
pub struct PendingCompact {
    pub block: CompactBlock,
    pub time: Instant,
}

/// Filtered block waiting for its matched transactions
#[derive(Debug, Clone)]
pub struct PendingMerkle {
    pub block: MerkleBlock,
    pub time: Instant,
    /// Matched hashes still to arrive
    pub remaining: HashSet<Hash256>,
    pub txs: Vec<Transaction>,
}

/// Mutable per-connection state. Never held across an await.
pub struct PeerState {
    pub connected: bool,
    pub destroyed: bool,
    pub ack: bool,
    pub handshake: bool,
    pub version: Option<VersionPacket>,
    /// Our address as the peer sees it
    pub local: Option<NetAddress>,
    pub time: Option<Instant>,
    pub last_send: Option<Instant>,
    pub last_recv: Option<Instant>,
    drain_size: usize,
    drain_queue: Vec<oneshot::Sender<Result<(), PeerError>>>,
    pub ban_score: u32,
    pub banned: bool,
    inv_queue: Vec<InvItem>,
    pub inv_filter: RollingFilter,
    pub addr_filter: RollingFilter,
    pub prefer_headers: bool,
    /// Tip re-announced after the peer requests this getblocks hash
    pub hash_continue: Option<Hash256>,
    pub spv_filter: Option<BloomFilter>,
    pub no_relay: bool,
    pub fee_rate: Option<i64>,
    pub compact_mode: Option<u8>,
    pub compact_witness: bool,
    pub merkle: Option<PendingMerkle>,
    pub syncing: bool,
    pub loader: bool,
    pub sent_addr: bool,
    pub sent_get_addr: bool,
    pub challenge: Option<u64>,
    pub last_ping: Option<Instant>,
    pub last_pong: Option<Instant>,
    pub min_ping: Option<Duration>,
    /// Last time a block (or header batch) arrived while syncing
    pub block_time: Option<Instant>,
    pub best_hash: Option<Hash256>,
    pub best_height: Option<u32>,
    pub block_map: HashMap<Hash256, Instant>,
    pub tx_map: HashMap<Hash256, Instant>,
    pub compact_blocks: HashMap<Hash256, PendingCompact>,
    response_map: HashMap<PacketType, ResponseEntry>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            connected: false,
            destroyed: false,
            ack: false,
            handshake: false,
            version: None,
            local: None,
            time: None,
            last_send: None,
            last_recv: None,
            drain_size: 0,
            drain_queue: Vec::new(),
            ban_score: 0,
            banned: false,
            inv_queue: Vec::new(),
            inv_filter: RollingFilter::new(50_000, 0.000001),
            addr_filter: RollingFilter::new(5000, 0.001),
            prefer_headers: false,
            hash_continue: None,
            spv_filter: None,
            no_relay: false,
            fee_rate: None,
            compact_mode: None,
            compact_witness: false,
            merkle: None,
            syncing: false,
            loader: false,
            sent_addr: false,
            sent_get_addr: false,
            challenge: None,
            last_ping: None,
            last_pong: None,
            min_ping: None,
            block_time: None,
            best_hash: None,
            best_height: None,
            block_map: HashMap::new(),
            tx_map: HashMap::new(),
            compact_blocks: HashMap::new(),
            response_map: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    pub fn protocol_version(&self) -> i32 {
        self.version.as_ref().map(|v| v.version).unwrap_or(0)
    }

    pub fn services(&self) -> Services {
        self.version
            .as_ref()
            .map(|v| v.services)
            .unwrap_or_else(Services::empty)
    }

    pub fn height(&self) -> i32 {
        self.version.as_ref().map(|v| v.height).unwrap_or(0)
    }

    pub fn agent(&self) -> &str {
        self.version.as_ref().map(|v| v.agent.as_str()).unwrap_or("")
    }

    pub fn has_witness(&self) -> bool {
        self.services().contains(Services::WITNESS)
    }

    fn request(&mut self, kind: PacketType, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.response_map
            .entry(kind)
            .and_modify(|entry| entry.deadline = deadline)
            .or_insert(ResponseEntry {
                deadline,
                jobs: Vec::new(),
            });
    }

    fn response(&mut self, kind: PacketType) -> Option<ResponseEntry> {
        self.response_map.remove(&kind)
    }
}

// =============================================================================
// Reader
// =============================================================================

type PacketStream =
    Pin<Box<dyn Stream<Item = Result<Result<Packet, WireError>, std::io::Error>> + Send>>;

/// Read half of an attached connection
pub struct PeerReader {
    inner: PacketStream,
}

impl PeerReader {
    /// Next frame: `Err` is a socket error, `Ok(Err)` a framing error the
    /// connection survives.
    pub async fn next(&mut self) -> Option<Result<Result<Packet, WireError>, std::io::Error>> {
        self.inner.next().await
    }
}

// =============================================================================
// Peer
// =============================================================================

pub struct Peer {
    pub id: u64,
    pub address: NetAddress,
    pub outbound: bool,
    options: Arc<PeerOptions>,
    state: Mutex<PeerState>,
    writer: mpsc::UnboundedSender<(Packet, usize)>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<(Packet, usize)>>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.hostname())
            .field("outbound", &self.outbound)
            .finish()
    }
}

impl Peer {
    pub fn new(id: u64, address: NetAddress, outbound: bool, options: Arc<PeerOptions>) -> Arc<Self> {
        let (writer, writer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            address,
            outbound,
            options,
            state: Mutex::new(PeerState::new()),
            writer,
            writer_rx: Mutex::new(Some(writer_rx)),
            closed: CancellationToken::new(),
        })
    }

    pub fn hostname(&self) -> String {
        self.address.hostname()
    }

    pub fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn is_handshake(&self) -> bool {
        self.lock().handshake
    }

    pub fn is_loader(&self) -> bool {
        self.lock().loader
    }

    /// Resolves once the peer is destroyed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Bind the peer to a connected stream. Starts the writer and the stall
    /// timer; the caller drives the returned reader.
    pub fn attach<S>(self: &Arc<Self>, stream: S) -> Result<PeerReader, PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut rx = self
            .writer_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PeerError::Attached)?;

        let magic = self.options.network.magic;
        let (read, write) = tokio::io::split(stream);
        let mut sink = FramedWrite::new(write, PacketCodec::new(magic));

        let weak = Arc::downgrade(self);
        let writer = tokio::spawn(async move {
            while let Some((packet, size)) = rx.recv().await {
                let result = sink.send(packet).await;
                let Some(peer) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = result {
                    log::debug!("Write error ({}): {}", peer.hostname(), err);
                    peer.destroy();
                    break;
                }
                peer.handle_drain(size);
            }
        });

        let stall = self.spawn_timer(STALL_INTERVAL, |peer| peer.maybe_timeout());

        {
            let mut state = self.lock();
            state.connected = true;
            state.time = Some(Instant::now());
            state.tasks.push(writer);
            state.tasks.push(stall);
        }

        log::debug!("Connected to {}.", self.hostname());

        Ok(PeerReader {
            inner: Box::pin(FramedRead::new(read, PacketCodec::new(magic))),
        })
    }

    fn spawn_timer(
        self: &Arc<Self>,
        period: Duration,
        tick: impl Fn(&Peer) + Send + 'static,
    ) -> JoinHandle<()> {
        let weak: Weak<Peer> = Arc::downgrade(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(peer) = weak.upgrade() else {
                            break;
                        };
                        tick(&peer);
                    }
                }
            }
        })
    }

    /// Run the version handshake. The read loop must be running.
    pub async fn handshake(self: &Arc<Self>) -> Result<(), PeerError> {
        self.send_version();

        self.wait_unless(PacketType::Verack, HANDSHAKE_TIMEOUT, |state| state.ack)
            .await?;

        let missing = self.lock().version.is_none();
        if missing {
            log::debug!(
                "Peer sent a verack without a version ({}).",
                self.hostname()
            );
        }

        self.wait_unless(PacketType::Version, HANDSHAKE_TIMEOUT, |state| {
            state.version.is_some()
        })
        .await?;

        {
            let mut state = self.lock();
            if state.destroyed {
                return Err(PeerError::Destroyed);
            }
            state.handshake = true;
        }

        log::debug!("Version handshake complete ({}).", self.hostname());

        self.finalize();

        Ok(())
    }

    /// Start the ping and inventory timers
    fn finalize(self: &Arc<Self>) {
        let ping = self.spawn_timer(PING_INTERVAL, |peer| peer.send_ping());
        let inv = self.spawn_timer(INV_INTERVAL, |peer| peer.flush_inv());
        let mut state = self.lock();
        state.tasks.push(ping);
        state.tasks.push(inv);
    }

    /// Tear the connection down. Idempotent.
    pub fn destroy(&self) {
        let (drain, responses, tasks) = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.connected = false;
            state.inv_queue.clear();
            (
                std::mem::take(&mut state.drain_queue),
                std::mem::take(&mut state.response_map),
                std::mem::take(&mut state.tasks),
            )
        };

        self.closed.cancel();

        for job in drain {
            let _ = job.send(Err(PeerError::Destroyed));
        }

        for (_, entry) in responses {
            for job in entry.jobs {
                let _ = job.send(Err(PeerError::Destroyed));
            }
        }

        for task in tasks {
            task.abort();
        }

        log::debug!("Peer destroyed ({}).", self.hostname());
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Queue a packet for the socket, arming a response deadline for
    /// requests that expect a reply.
    pub fn send(&self, packet: Packet) {
        let size = HEADER_LEN + packet.size();
        let overflow = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }

            if self.outbound {
                match packet.kind() {
                    PacketType::Mempool => state.request(PacketType::Inv, RESPONSE_TIMEOUT),
                    PacketType::GetBlocks => {
                        if !self.options.chain.synced() {
                            state.request(PacketType::Inv, RESPONSE_TIMEOUT);
                        }
                    }
                    PacketType::GetHeaders => {
                        state.request(PacketType::Headers, RESPONSE_TIMEOUT * 2)
                    }
                    PacketType::GetData => state.request(PacketType::Data, RESPONSE_TIMEOUT * 2),
                    PacketType::GetBlockTxn => {
                        state.request(PacketType::BlockTxn, RESPONSE_TIMEOUT)
                    }
                    _ => {}
                }
            }

            state.last_send = Some(Instant::now());
            state.drain_size += size;
            state.drain_size >= DRAIN_MAX
        };

        if overflow {
            log::warn!(
                "Peer is not reading: {}mb buffered ({}).",
                self.lock().drain_size >> 20,
                self.hostname()
            );
            self.destroy();
            return;
        }

        if self.writer.send((packet, size)).is_err() {
            self.destroy();
        }
    }

    fn handle_drain(&self, size: usize) {
        let jobs = {
            let mut state = self.lock();
            state.drain_size = state.drain_size.saturating_sub(size);
            if state.drain_size > 0 {
                return;
            }
            std::mem::take(&mut state.drain_queue)
        };

        for job in jobs {
            let _ = job.send(Ok(()));
        }
    }

    /// Wait until everything queued so far has been written
    pub async fn drain(&self) -> Result<(), PeerError> {
        let rx = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(PeerError::Destroyed);
            }
            if state.drain_size == 0 {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.drain_queue.push(tx);
            rx
        };

        rx.await.unwrap_or(Err(PeerError::Destroyed))
    }

    pub fn drain_size(&self) -> usize {
        self.lock().drain_size
    }

    // -------------------------------------------------------------------------
    // Request / Response
    // -------------------------------------------------------------------------

    /// Wait for the next packet of `kind`; the stall timer enforces the
    /// deadline by destroying the peer.
    pub async fn wait(&self, kind: PacketType, timeout: Duration) -> Result<Packet, PeerError> {
        self.wait_unless(kind, timeout, |_| false)
            .await?
            .ok_or(PeerError::Destroyed)
    }

    /// Like `wait`, but returns `None` right away when `done` already holds
    async fn wait_unless(
        &self,
        kind: PacketType,
        timeout: Duration,
        done: impl Fn(&PeerState) -> bool,
    ) -> Result<Option<Packet>, PeerError> {
        let rx = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(PeerError::Destroyed);
            }
            if done(&state) {
                return Ok(None);
            }
            state.request(kind, timeout);
            let (tx, rx) = oneshot::channel();
            if let Some(entry) = state.response_map.get_mut(&kind) {
                entry.jobs.push(tx);
            }
            rx
        };

        match rx.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(PeerError::Destroyed),
        }
    }

    /// Whether a correlated request of `kind` is outstanding
    pub fn is_waiting(&self, kind: PacketType) -> bool {
        self.lock().response_map.contains_key(&kind)
    }

    fn fulfill(&self, state: &mut PeerState, packet: &Packet) -> Vec<ResponseEntry> {
        let mut entries = Vec::new();
        if matches!(
            packet.kind(),
            PacketType::Block
                | PacketType::CmpctBlock
                | PacketType::MerkleBlock
                | PacketType::Tx
                | PacketType::NotFound
        ) {
            entries.extend(state.response(PacketType::Data));
        }
        entries.extend(state.response(packet.kind()));
        entries
    }

    // -------------------------------------------------------------------------
    // Stall Detection
    // -------------------------------------------------------------------------

    fn stall_reason(&self, state: &PeerState, now: Instant) -> Option<String> {
        for (kind, entry) in &state.response_map {
            if now > entry.deadline {
                return Some(kind.command().to_string());
            }
        }

        if let Some(merkle) = &state.merkle {
            if now > merkle.time + BLOCK_TIMEOUT {
                return Some("merkleblock".to_string());
            }
        }

        let synced = self.options.chain.synced();

        if state.syncing && state.loader && !synced {
            if let Some(block_time) = state.block_time {
                if now > block_time + BLOCK_TIMEOUT {
                    return Some("block".to_string());
                }
            }
        }

        if synced || !state.syncing {
            if state.block_map.values().any(|t| now > *t + BLOCK_TIMEOUT) {
                return Some("block".to_string());
            }
            if state.tx_map.values().any(|t| now > *t + TX_TIMEOUT) {
                return Some("tx".to_string());
            }
            if state
                .compact_blocks
                .values()
                .any(|pending| now > pending.time + RESPONSE_TIMEOUT)
            {
                return Some("blocktxn".to_string());
            }
        }

        if state.compact_blocks.len() > MAX_COMPACT_BLOCKS {
            return Some("cmpctblock".to_string());
        }

        let connected = state.time?;
        if now > connected + IDLE_GRACE {
            let (Some(last_send), Some(last_recv)) = (state.last_send, state.last_recv) else {
                return Some("no message".to_string());
            };

            if now > last_send + TIMEOUT_INTERVAL {
                return Some("send".to_string());
            }

            let mult = if state.protocol_version() <= PONG_VERSION { 4 } else { 1 };
            if now > last_recv + TIMEOUT_INTERVAL * mult {
                return Some("recv".to_string());
            }

            if let (Some(_), Some(last_ping)) = (state.challenge, state.last_ping) {
                if now > last_ping + TIMEOUT_INTERVAL {
                    return Some("ping".to_string());
                }
            }
        }

        None
    }

    /// Destroy the peer if it has stalled
    pub fn maybe_timeout(&self) {
        let reason = {
            let state = self.lock();
            if state.destroyed {
                return;
            }
            self.stall_reason(&state, Instant::now())
        };

        if let Some(reason) = reason {
            log::warn!("Peer is stalling ({}) ({}).", reason, self.hostname());
            self.destroy();
        }
    }

    // -------------------------------------------------------------------------
    // Ban Score
    // -------------------------------------------------------------------------

    /// Add to the ban score, banning the peer at the threshold
    pub fn increase_ban(&self, score: u32) -> bool {
        let exceeded = {
            let mut state = self.lock();
            state.ban_score += score;
            state.ban_score >= self.options.ban_score
        };

        if exceeded {
            log::debug!("Ban threshold exceeded ({}).", self.hostname());
            self.ban();
        }

        exceeded
    }

    /// Mark the peer banned and drop it; the pool records the ban on close
    pub fn ban(&self) {
        self.lock().banned = true;
        self.destroy();
    }

    pub fn is_banned(&self) -> bool {
        self.lock().banned
    }

    /// Send a `reject` and penalize the peer
    pub fn reject(&self, message: &str, code: RejectCode, reason: &str, hash: Option<Hash256>, score: u32) {
        self.send_reject(message, code, reason, hash);
        if score > 0 {
            self.increase_ban(score);
        }
    }

    pub fn send_reject(&self, message: &str, code: RejectCode, reason: &str, hash: Option<Hash256>) {
        if let Some(hash) = hash {
            log::debug!(
                "Rejecting {} {} ({}): code={} reason={}.",
                message,
                hash,
                self.hostname(),
                code,
                reason
            );
        }

        self.send(Packet::Reject(RejectPacket {
            message: message.to_string(),
            code,
            reason: reason.to_string(),
            hash,
        }));
    }

    /// A frame failed to parse; the connection survives with a penalty
    /// unless the frame broke a hard protocol limit
    pub fn handle_framing_error(&self, err: &WireError) {
        if err.is_violation() {
            log::warn!("{} ({}).", err, self.hostname());
            self.destroy();
            return;
        }

        log::warn!("Parse error ({}): {}", self.hostname(), err);
        self.send_reject("", RejectCode::Malformed, "error parsing message", None);
        self.increase_ban(10);
    }

    // -------------------------------------------------------------------------
    // Outbound Messages
    // -------------------------------------------------------------------------

    pub fn send_version(&self) {
        let mut local = NetAddress::default();
        local.services = self.options.services;

        let packet = VersionPacket {
            version: PROTOCOL_VERSION,
            services: self.options.services,
            time: chrono::Utc::now().timestamp(),
            remote: self.address,
            local,
            nonce: self.options.nonces.alloc(&self.hostname()),
            agent: self.options.agent.clone(),
            height: self.options.chain.height() as i32,
            no_relay: self.options.no_relay,
        };

        self.send(Packet::Version(packet));
    }

    pub fn send_get_addr(&self) {
        {
            let mut state = self.lock();
            if state.sent_get_addr {
                return;
            }
            state.sent_get_addr = true;
        }
        self.send(Packet::GetAddr);
    }

    pub fn send_ping(&self) {
        let packet = {
            let mut state = self.lock();
            if !state.handshake {
                return;
            }

            if state.protocol_version() <= PONG_VERSION {
                Packet::Ping(None)
            } else if state.challenge.is_some() {
                log::debug!("Peer has not responded to ping ({}).", self.hostname());
                return;
            } else {
                let nonce = loop {
                    let nonce: u64 = rand::random();
                    if nonce != 0 {
                        break nonce;
                    }
                };
                state.last_ping = Some(Instant::now());
                state.challenge = Some(nonce);
                Packet::Ping(Some(nonce))
            }
        };

        self.send(packet);
    }

    pub fn send_get_headers(&self, locator: Vec<Hash256>, stop: Option<Hash256>) {
        log::debug!(
            "Requesting headers packet from peer with getheaders ({}).",
            self.hostname()
        );
        if let (Some(first), Some(stop)) = (locator.first(), stop) {
            log::debug!("Sending getheaders (hash={}, stop={}).", first, stop);
        }
        self.send(Packet::GetHeaders(LocatorPacket::new(locator, stop)));
    }

    pub fn send_get_blocks(&self, locator: Vec<Hash256>, stop: Option<Hash256>) {
        log::debug!(
            "Requesting inv packet from peer with getblocks ({}).",
            self.hostname()
        );
        self.send(Packet::GetBlocks(LocatorPacket::new(locator, stop)));
    }

    pub fn send_mempool(&self) {
        {
            let state = self.lock();
            if !state.handshake {
                return;
            }
            if !state.services().contains(Services::BLOOM) {
                log::debug!(
                    "Cannot request mempool for non-bloom peer ({}).",
                    self.hostname()
                );
                return;
            }
        }

        log::debug!(
            "Requesting inv packet from peer with mempool ({}).",
            self.hostname()
        );
        self.send(Packet::Mempool);
    }

    /// Ask for compact block relay in `mode` (1 = high bandwidth)
    pub fn send_compact(&self, mode: u8) {
        let (witness, version) = {
            let state = self.lock();
            (state.has_witness(), state.protocol_version())
        };

        if witness && version >= COMPACT_WITNESS_VERSION {
            log::info!("Initializing witness compact blocks ({}).", self.hostname());
            self.send(Packet::SendCmpct(SendCmpctPacket { mode, version: 2 }));
            return;
        }

        if version >= COMPACT_VERSION {
            log::info!("Initializing normal compact blocks ({}).", self.hostname());
            self.send(Packet::SendCmpct(SendCmpctPacket { mode, version: 1 }));
        }
    }

    pub fn send_fee_rate(&self, rate: i64) {
        self.send(Packet::FeeFilter(rate));
    }

    pub fn send_filter_load(&self, filter: &FilterLoadPacket) {
        if !self.lock().services().contains(Services::BLOOM) {
            return;
        }
        self.send(Packet::FilterLoad(filter.clone()));
    }

    // -------------------------------------------------------------------------
    // Inventory
    // -------------------------------------------------------------------------

    /// Announce blocks according to the peer's preference (headers, high
    /// bandwidth compact blocks or plain inv)
    pub fn announce_block(&self, blocks: &[Block]) {
        let mut inv = Vec::new();
        let mut headers = Vec::new();
        let mut compact = Vec::new();
        let prefer_headers;

        {
            let mut state = self.lock();
            if !state.handshake || state.destroyed {
                return;
            }
            prefer_headers = state.prefer_headers;

            for block in blocks {
                let hash = block.hash();

                if state.inv_filter.test(hash.as_bytes()) {
                    continue;
                }

                if prefer_headers {
                    headers.push(block.header);
                    continue;
                }

                if state.compact_mode == Some(1) {
                    state.inv_filter.add(hash.as_bytes());
                    compact.push(block);
                    continue;
                }

                inv.push(InvItem::block(hash));
            }
        }

        for block in compact {
            self.send_compact_block(block);
        }

        if prefer_headers {
            self.send_headers(headers);
            return;
        }

        self.queue_inv(inv);
    }

    /// Announce transactions, honoring relay, bloom and fee filters
    pub fn announce_tx(&self, txs: &[Transaction]) {
        let mut inv = Vec::new();

        {
            let mut state = self.lock();
            if !state.handshake || state.destroyed {
                return;
            }

            if state.no_relay {
                return;
            }

            for tx in txs {
                let hash = tx.txid();

                if state.inv_filter.test(hash.as_bytes()) {
                    continue;
                }

                if let Some(filter) = state.spv_filter.as_mut() {
                    if !filter.is_watched(tx) {
                        continue;
                    }
                }

                if let Some(fee_rate) = state.fee_rate {
                    let rate = self
                        .options
                        .mempool
                        .as_ref()
                        .and_then(|mempool| mempool.fee_rate(&hash));
                    if matches!(rate, Some(rate) if rate < fee_rate) {
                        continue;
                    }
                }

                inv.push(InvItem::tx(hash));
            }
        }

        self.queue_inv(inv);
    }

    /// Queue inventory, flushing at once for blocks or a full queue
    pub fn queue_inv(&self, items: Vec<InvItem>) {
        let flush = {
            let mut state = self.lock();
            if !state.handshake || state.destroyed {
                return;
            }
            let has_block = items.iter().any(InvItem::is_block);
            state.inv_queue.extend(items);
            state.inv_queue.len() >= MAX_INV_QUEUE || has_block
        };

        if flush {
            self.flush_inv();
        }
    }

    pub fn flush_inv(&self) {
        let items: Vec<InvItem> = {
            let mut state = self.lock();
            if state.destroyed || state.inv_queue.is_empty() {
                return;
            }
            let queue = std::mem::take(&mut state.inv_queue);
            queue
                .into_iter()
                .filter(|item| state.inv_filter.added(item.hash.as_bytes()))
                .collect()
        };

        if items.is_empty() {
            return;
        }

        log::debug!("Serving {} inv items to {}.", items.len(), self.hostname());

        for chunk in items.chunks(INV_CHUNK) {
            self.send(Packet::Inv(chunk.to_vec()));
        }
    }

    /// Send inventory immediately, bypassing the queue
    pub fn send_inv(&self, items: Vec<InvItem>) {
        {
            let mut state = self.lock();
            if !state.handshake || state.destroyed {
                return;
            }
            for item in &items {
                state.inv_filter.add(item.hash.as_bytes());
            }
        }

        if items.is_empty() {
            return;
        }

        log::debug!("Serving {} inv items to {}.", items.len(), self.hostname());

        for chunk in items.chunks(INV_CHUNK) {
            self.send(Packet::Inv(chunk.to_vec()));
        }
    }

    pub fn send_headers(&self, headers: Vec<BlockHeader>) {
        {
            let mut state = self.lock();
            if !state.handshake || state.destroyed {
                return;
            }
            for header in &headers {
                state.inv_filter.add(header.hash().as_bytes());
            }
        }

        if headers.is_empty() {
            return;
        }

        log::debug!("Serving {} headers to {}.", headers.len(), self.hostname());

        for chunk in headers.chunks(HEADERS_CHUNK) {
            self.send(Packet::Headers(chunk.to_vec()));
        }
    }

    pub fn send_compact_block(&self, block: &Block) {
        let witness = self.lock().compact_witness;
        let compact = CompactBlock::from_block(block, witness, None);
        self.send(Packet::CmpctBlock(CmpctBlockPacket {
            block: compact,
            witness,
        }));
    }

    /// Send an already serialized payload under `command`
    pub fn send_raw(&self, command: &str, payload: Vec<u8>) {
        self.send(Packet::Unknown(UnknownPacket {
            command: command.to_string(),
            payload,
        }));
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    pub fn has_compact_support(&self) -> bool {
        let state = self.lock();
        let version = state.protocol_version();
        if version < COMPACT_VERSION {
            return false;
        }
        if !self.options.witness {
            return true;
        }
        if !state.has_witness() {
            return false;
        }
        version >= COMPACT_WITNESS_VERSION
    }

    pub fn has_compact(&self) -> bool {
        let state = self.lock();
        match state.compact_mode {
            None => false,
            Some(_) => !self.options.witness || state.compact_witness,
        }
    }

    /// Inventory type used when requesting blocks
    pub fn block_type(&self) -> InvType {
        if self.options.spv {
            return InvType::FilteredBlock;
        }

        if self.options.compact
            && self.options.chain.synced()
            && self.has_compact_support()
            && self.has_compact()
        {
            return InvType::CmpctBlock;
        }

        if self.lock().has_witness() {
            return InvType::WitnessBlock;
        }

        InvType::Block
    }

    pub fn tx_type(&self) -> InvType {
        if self.lock().has_witness() {
            InvType::WitnessTx
        } else {
            InvType::Tx
        }
    }

    pub fn get_data(&self, items: Vec<InvItem>) {
        if items.is_empty() {
            return;
        }
        self.send(Packet::GetData(items));
    }

    pub fn get_block(&self, hashes: &[Hash256]) {
        let kind = self.block_type();
        self.get_data(hashes.iter().map(|hash| InvItem::new(kind, *hash)).collect());
    }

    pub fn get_tx(&self, hashes: &[Hash256]) {
        let kind = self.tx_type();
        self.get_data(hashes.iter().map(|hash| InvItem::new(kind, *hash)).collect());
    }

    // -------------------------------------------------------------------------
    // Inbound Messages
    // -------------------------------------------------------------------------

    /// Peer-level handling of an incoming packet. Returns whether the pool
    /// should see it; an error means the peer must be destroyed.
    pub fn handle_packet(&self, packet: &Packet) -> Result<bool, PeerError> {
        let entries = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(PeerError::Destroyed);
            }
            state.last_recv = Some(Instant::now());
            self.fulfill(&mut state, packet)
        };

        let result = self.dispatch(packet);

        for entry in entries {
            for job in entry.jobs {
                let _ = job.send(Ok(packet.clone()));
            }
        }

        result
    }

    fn dispatch(&self, packet: &Packet) -> Result<bool, PeerError> {
        match packet {
            Packet::Version(version) => {
                self.handle_version(version)?;
                return Ok(true);
            }
            Packet::Verack => {
                self.handle_verack();
                return Ok(true);
            }
            _ => {}
        }

        if !self.is_handshake() {
            log::debug!(
                "Ignoring {} before handshake ({}).",
                packet.command(),
                self.hostname()
            );
            return Ok(false);
        }

        match packet {
            Packet::Ping(nonce) => self.handle_ping(*nonce),
            Packet::Pong(nonce) => self.handle_pong(*nonce),
            Packet::SendHeaders => self.handle_send_headers(),
            Packet::FilterLoad(filter) => self.handle_filter_load(filter),
            Packet::FilterAdd(data) => self.handle_filter_add(data),
            Packet::FilterClear => self.handle_filter_clear(),
            Packet::FeeFilter(rate) => self.handle_fee_filter(*rate),
            Packet::SendCmpct(packet) => self.handle_send_cmpct(packet),
            _ => {}
        }

        Ok(true)
    }

    fn handle_version(&self, packet: &VersionPacket) -> Result<(), PeerError> {
        {
            let mut state = self.lock();
            if state.version.is_some() {
                return Err(PeerError::DuplicateVersion);
            }
            state.no_relay = packet.no_relay;
            state.local = Some(packet.remote);
            state.version = Some(packet.clone());
        }

        if !self.options.network.self_connect && self.options.nonces.has(packet.nonce) {
            return Err(PeerError::SelfConnect);
        }

        if packet.version < MIN_VERSION {
            return Err(PeerError::Version(packet.version));
        }

        if self.outbound {
            if !packet.services.contains(Services::NETWORK) {
                return Err(PeerError::Services("network services"));
            }

            if packet.version < HEADERS_VERSION {
                return Err(PeerError::Services("getheaders"));
            }

            if self.options.spv {
                if !packet.services.contains(Services::BLOOM) {
                    return Err(PeerError::Services("BIP37"));
                }
                if packet.version < BLOOM_VERSION {
                    return Err(PeerError::Services("BIP37"));
                }
            }

            if self.options.witness && !packet.services.contains(Services::WITNESS) {
                return Err(PeerError::Services("segregated witness"));
            }

            if self.options.compact && !self.has_compact_support() {
                log::debug!("Peer does not support compact blocks ({}).", self.hostname());
            }
        }

        self.send(Packet::Verack);
        self.check_handshake();

        Ok(())
    }

    fn handle_verack(&self) {
        {
            let mut state = self.lock();
            if state.ack {
                log::debug!("Peer sent duplicate ack ({}).", self.hostname());
                return;
            }
            state.ack = true;
        }
        log::debug!("Received verack ({}).", self.hostname());
        self.check_handshake();
    }

    fn check_handshake(&self) {
        let mut state = self.lock();
        if state.ack && state.version.is_some() {
            state.handshake = true;
        }
    }

    fn handle_ping(&self, nonce: Option<u64>) {
        if let Some(nonce) = nonce {
            self.send(Packet::Pong(nonce));
        }
    }

    fn handle_pong(&self, nonce: u64) {
        let mut state = self.lock();
        let now = Instant::now();

        let Some(challenge) = state.challenge else {
            log::debug!("Peer sent an unsolicited pong ({}).", self.hostname());
            return;
        };

        if nonce != challenge {
            if nonce == 0 {
                log::debug!("Peer sent a zero nonce ({}).", self.hostname());
                state.challenge = None;
                return;
            }
            log::debug!("Peer sent the wrong nonce ({}).", self.hostname());
            return;
        }

        if let Some(last_ping) = state.last_ping {
            let rtt = now.duration_since(last_ping);
            state.last_pong = Some(now);
            state.min_ping = Some(state.min_ping.map_or(rtt, |min| min.min(rtt)));
        }

        state.challenge = None;
    }

    fn handle_send_headers(&self) {
        let mut state = self.lock();
        if state.prefer_headers {
            log::debug!("Peer sent a duplicate sendheaders ({}).", self.hostname());
            return;
        }
        state.prefer_headers = true;
    }

    fn handle_filter_load(&self, packet: &FilterLoadPacket) {
        if !self.options.bip37 || !packet.is_within_constraints() {
            self.increase_ban(100);
            return;
        }
        let mut state = self.lock();
        state.spv_filter = Some(BloomFilter::from_packet(packet));
        state.no_relay = false;
    }

    fn handle_filter_add(&self, data: &[u8]) {
        if !self.options.bip37 || data.len() > MAX_FILTERADD {
            self.increase_ban(100);
            return;
        }
        let mut state = self.lock();
        if let Some(filter) = state.spv_filter.as_mut() {
            filter.add(data);
        }
        state.no_relay = false;
    }

    fn handle_filter_clear(&self) {
        if !self.options.bip37 {
            self.increase_ban(100);
            return;
        }
        let mut state = self.lock();
        if let Some(filter) = state.spv_filter.as_mut() {
            filter.reset();
        }
        state.no_relay = false;
    }

    fn handle_fee_filter(&self, rate: i64) {
        if !(0..=MAX_MONEY).contains(&rate) {
            self.increase_ban(100);
            return;
        }
        self.lock().fee_rate = Some(rate);
    }

    fn handle_send_cmpct(&self, packet: &SendCmpctPacket) {
        let mut state = self.lock();

        if state.compact_mode.is_some() {
            log::debug!("Peer sent a duplicate sendcmpct ({}).", self.hostname());
            return;
        }

        if packet.version > 2 {
            log::info!(
                "Peer request compact blocks version {} ({}).",
                packet.version,
                self.hostname()
            );
            return;
        }

        if packet.mode > 1 {
            log::info!(
                "Peer request compact blocks mode {} ({}).",
                packet.mode,
                self.hostname()
            );
            return;
        }

        log::info!(
            "Peer initialized compact blocks (mode={}, version={}) ({}).",
            packet.mode,
            packet.version,
            self.hostname()
        );

        state.compact_mode = Some(packet.mode);
        state.compact_witness = packet.version == 2;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::core::block::tests::make_block;
    use crate::wire::Framer;
    use futures::SinkExt;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Framed;

    pub type Remote = Framed<DuplexStream, PacketCodec>;

    pub fn test_options() -> Arc<PeerOptions> {
        let network = Network::regtest();
        let chain = Arc::new(MemoryChain::new(network.clone()));
        Arc::new(PeerOptions::new(network, chain))
    }

    pub fn remote_version(services: Services) -> VersionPacket {
        VersionPacket {
            version: PROTOCOL_VERSION,
            services,
            nonce: 42,
            agent: "/remote:1.0/".to_string(),
            height: 10,
            ..VersionPacket::default()
        }
    }

    pub async fn expect(remote: &mut Remote, kind: PacketType) -> Packet {
        loop {
            let packet = remote.next().await.unwrap().unwrap().unwrap();
            if packet.kind() == kind {
                return packet;
            }
        }
    }

    fn spawn_reader(peer: Arc<Peer>, mut reader: PeerReader) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = peer.closed() => break,
                    item = reader.next() => match item {
                        Some(Ok(Ok(packet))) => {
                            if peer.handle_packet(&packet).is_err() {
                                peer.destroy();
                                break;
                            }
                        }
                        Some(Ok(Err(err))) => peer.handle_framing_error(&err),
                        _ => {
                            peer.destroy();
                            break;
                        }
                    }
                }
            }
        });
    }

    fn connect(options: Arc<PeerOptions>, outbound: bool) -> (Arc<Peer>, Remote) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let addr = NetAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 18444, Services::empty(), 0);
        let peer = Peer::new(1, addr, outbound, options.clone());
        let reader = peer.attach(local).unwrap();
        spawn_reader(peer.clone(), reader);
        (peer, Framed::new(remote, PacketCodec::new(options.network.magic)))
    }

    async fn handshaken(options: Arc<PeerOptions>) -> (Arc<Peer>, Remote) {
        let (peer, mut remote) = connect(options, true);
        let task = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handshake().await })
        };

        expect(&mut remote, PacketType::Version).await;
        remote
            .send(Packet::Version(remote_version(
                Services::NETWORK | Services::WITNESS | Services::BLOOM,
            )))
            .await
            .unwrap();
        remote.send(Packet::Verack).await.unwrap();
        expect(&mut remote, PacketType::Verack).await;

        task.await.unwrap().unwrap();
        (peer, remote)
    }

    #[tokio::test]
    async fn test_handshake() {
        let (peer, _remote) = handshaken(test_options()).await;
        assert!(peer.is_handshake());
        let state = peer.lock();
        assert_eq!(state.height(), 10);
        assert_eq!(state.agent(), "/remote:1.0/");
    }

    #[tokio::test]
    async fn test_duplicate_version_destroys() {
        let (peer, mut remote) = handshaken(test_options()).await;
        remote
            .send(Packet::Version(remote_version(Services::NETWORK)))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), peer.closed())
            .await
            .unwrap();
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_outbound_requires_witness() {
        let (peer, mut remote) = connect(test_options(), true);
        let task = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handshake().await })
        };
        expect(&mut remote, PacketType::Version).await;
        remote
            .send(Packet::Version(remote_version(Services::NETWORK)))
            .await
            .unwrap();
        assert!(matches!(task.await.unwrap(), Err(PeerError::Destroyed)));
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_self_connection() {
        let base = test_options();
        let mut options = PeerOptions::new(Network::regtest(), base.chain.clone());
        options.network.self_connect = false;
        let options = Arc::new(options);

        let (peer, mut remote) = connect(options, false);
        let task = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handshake().await })
        };

        let Packet::Version(ours) = expect(&mut remote, PacketType::Version).await else {
            unreachable!()
        };
        let mut echo = remote_version(Services::NETWORK);
        echo.nonce = ours.nonce;
        remote.send(Packet::Version(echo)).await.unwrap();

        assert!(task.await.unwrap().is_err());
        assert!(peer.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (peer, mut remote) = connect(test_options(), true);
        let task = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handshake().await })
        };
        expect(&mut remote, PacketType::Version).await;

        // Silence: the stall timer fires once the verack deadline passes.
        assert!(matches!(task.await.unwrap(), Err(PeerError::Destroyed)));
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroy_rejects_waiters() {
        let (peer, _remote) = handshaken(test_options()).await;
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.wait(PacketType::Headers, RESPONSE_TIMEOUT).await })
        };
        tokio::task::yield_now().await;
        while !peer.is_waiting(PacketType::Headers) {
            tokio::task::yield_now().await;
        }

        peer.destroy();
        peer.destroy();
        assert!(matches!(waiter.await.unwrap(), Err(PeerError::Destroyed)));
        assert!(matches!(peer.drain().await, Err(PeerError::Destroyed)));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (peer, mut remote) = handshaken(test_options()).await;

        peer.send_ping();
        let Packet::Ping(Some(nonce)) = expect(&mut remote, PacketType::Ping).await else {
            unreachable!()
        };
        assert_eq!(peer.lock().challenge, Some(nonce));

        // A second ping waits for the outstanding challenge.
        peer.send_ping();

        remote.send(Packet::Pong(nonce)).await.unwrap();
        remote.send(Packet::Ping(Some(7))).await.unwrap();
        assert_eq!(expect(&mut remote, PacketType::Pong).await, Packet::Pong(7));

        let state = peer.lock();
        assert!(state.challenge.is_none());
        assert!(state.min_ping.is_some());
    }

    #[tokio::test]
    async fn test_inv_queue_dedup() {
        let (peer, mut remote) = handshaken(test_options()).await;
        let tx = crate::core::transaction::tests::spend(Hash256::new([1; 32]), 0, false);

        peer.announce_tx(&[tx.clone(), tx.clone()]);
        peer.flush_inv();
        let Packet::Inv(items) = expect(&mut remote, PacketType::Inv).await else {
            unreachable!()
        };
        assert_eq!(items, vec![InvItem::tx(tx.txid())]);

        // Already announced.
        peer.announce_tx(&[tx]);
        let block = make_block(Hash256::ZERO, 1, 0, false);
        peer.announce_block(&[block.clone()]);
        let Packet::Inv(items) = expect(&mut remote, PacketType::Inv).await else {
            unreachable!()
        };
        assert_eq!(items, vec![InvItem::block(block.hash())]);
    }

    #[tokio::test]
    async fn test_prefer_headers_announcement() {
        let (peer, mut remote) = handshaken(test_options()).await;
        remote.send(Packet::SendHeaders).await.unwrap();
        while !peer.lock().prefer_headers {
            tokio::task::yield_now().await;
        }

        let block = make_block(Hash256::ZERO, 2, 0, false);
        peer.announce_block(&[block.clone()]);
        assert_eq!(
            expect(&mut remote, PacketType::Headers).await,
            Packet::Headers(vec![block.header])
        );
    }

    #[tokio::test]
    async fn test_fee_filter_bounds() {
        let (peer, mut remote) = handshaken(test_options()).await;
        remote.send(Packet::FeeFilter(MAX_MONEY + 1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), peer.closed())
            .await
            .unwrap();
        assert!(peer.is_banned());
    }

    #[tokio::test]
    async fn test_framing_error_penalty() {
        let (peer, mut remote) = handshaken(test_options()).await;
        let framer = Framer::new(0x1234_5678);
        remote
            .get_mut()
            .write_all(&framer.frame(&Packet::Verack))
            .await
            .unwrap();

        let Packet::Reject(reject) = expect(&mut remote, PacketType::Reject).await else {
            unreachable!()
        };
        assert_eq!(reject.code, RejectCode::Malformed);
        assert_eq!(peer.lock().ban_score, 10);
        assert!(!peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_oversized_locator_destroys() {
        let (peer, mut remote) = handshaken(test_options()).await;
        let locator = vec![Hash256::ZERO; crate::wire::types::MAX_INV + 1];
        remote
            .send(Packet::GetHeaders(LocatorPacket::new(locator, None)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), peer.closed())
            .await
            .unwrap();
        assert_eq!(peer.lock().ban_score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_deadline_stalls() {
        let (peer, _remote) = handshaken(test_options()).await;
        peer.send_get_headers(vec![Hash256::ZERO], None);
        assert!(peer.is_waiting(PacketType::Headers));

        tokio::time::sleep(RESPONSE_TIMEOUT * 2 + STALL_INTERVAL * 2).await;
        assert!(peer.is_destroyed());
    }

    #[tokio::test]
    async fn test_ban_threshold() {
        let (peer, _remote) = handshaken(test_options()).await;
        assert!(!peer.increase_ban(60));
        assert!(peer.increase_ban(40));
        assert!(peer.is_banned());
        assert!(peer.is_destroyed());
    }

    #[test]
    fn test_nonce_list() {
        let nonces = NonceList::new();
        let a = nonces.alloc("1.2.3.4:8333");
        assert!(nonces.has(a));
        let b = nonces.alloc("1.2.3.4:8333");
        assert!(!nonces.has(a) || a == b);
        nonces.remove("1.2.3.4:8333");
        assert!(!nonces.has(b));
    }
}
