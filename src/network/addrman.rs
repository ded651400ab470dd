//! Address Manager (HostList) for peer discovery
//!
//! Bitcoin-style address manager that maintains:
//! - Fresh addresses: heard about but never handshaken with
//! - Used addresses: peers that completed a handshake
//!
//! Fresh buckets are picked by hashing the address together with the peer
//! that told us about it, so a single source cannot flood the table. Used
//! buckets are doubly linked lists (linked by hostname) so an entry can be
//! unlinked or swapped in O(1).

use crate::core::{Network, NetworkType};
use crate::crypto::sha256;
use crate::wire::netaddress::NetAddress;
use crate::wire::types::Services;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Serialization version of the host file
pub const VERSION: u32 = 0;

/// Maximum fresh buckets a single address may live in
pub const MAX_REFS: u32 = 8;

/// Addresses not seen for this many days are stale
pub const HORIZON_DAYS: i64 = 30;

/// Attempts without any success before an address is stale
pub const RETRIES: u32 = 3;

/// Days since the last success before failures count
pub const MIN_FAIL_DAYS: i64 = 7;

/// Failures (after `MIN_FAIL_DAYS`) before an address is stale
pub const MAX_FAILURES: u32 = 10;

/// Default bucket count for both tables
pub const DEFAULT_BUCKETS: usize = 20;

/// Default entries per bucket
pub const DEFAULT_ENTRIES: usize = 50;

/// Default ban duration (24 hours)
pub const DEFAULT_BAN_TIME: i64 = 24 * 60 * 60;

/// Local address scores
pub mod scores {
    pub const NONE: u32 = 0;
    pub const IF: u32 = 1;
    pub const BIND: u32 = 2;
    pub const UPNP: u32 = 3;
    pub const DNS: u32 = 3;
    pub const MANUAL: u32 = 4;
    pub const MAX: u32 = 5;
}

const DAY: i64 = 24 * 60 * 60;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostListError {
    #[error("Bad address serialization version: {0}")]
    Version(u32),
    #[error("Network mismatch: {0}")]
    Network(String),
    #[error("Buckets mismatch")]
    Buckets,
    #[error("Bucket size mismatch")]
    BucketSize,
    #[error("Unknown host in bucket: {0}")]
    UnknownHost(String),
    #[error("Host is in more than one table: {0}")]
    Duplicate(String),
    #[error("Host is in no bucket: {0}")]
    Unreferenced(String),
    #[error("Invalid address: {0}")]
    Address(String),
    #[error("Invalid services: {0}")]
    Services(String),
}

// =============================================================================
// Host Entry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub addr: NetAddress,
    /// Peer that told us about this address
    pub src: NetAddress,
    pub attempts: u32,
    pub last_success: i64,
    pub last_attempt: i64,
    /// Number of fresh buckets referencing this entry
    pub ref_count: u32,
    pub used: bool,
    prev: Option<String>,
    next: Option<String>,
    /// Used bucket holding the entry, if any
    bucket: Option<usize>,
}

impl HostEntry {
    pub fn new(addr: NetAddress, src: NetAddress) -> Self {
        Self {
            addr,
            src,
            attempts: 0,
            last_success: 0,
            last_attempt: 0,
            ref_count: 0,
            used: false,
            prev: None,
            next: None,
            bucket: None,
        }
    }

    pub fn key(&self) -> String {
        self.addr.hostname()
    }

    /// Selection weight, penalizing recent and repeated attempts
    pub fn chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;

        if now - self.last_attempt < 60 * 10 {
            chance *= 0.01;
        }

        chance * 0.66f64.powi(self.attempts.min(8) as i32)
    }
}

/// One of our own addresses with a preference score
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    pub addr: NetAddress,
    pub score: u32,
}

#[derive(Debug, Clone, Default)]
struct UsedBucket {
    head: Option<String>,
    tail: Option<String>,
    size: usize,
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub struct HostListOptions {
    pub network: Network,
    /// Our advertised address; also the source of manual inserts
    pub address: NetAddress,
    pub services: Services,
    pub max_buckets: usize,
    pub max_entries: usize,
    /// Ban duration in seconds
    pub ban_time: i64,
    /// DNS seeds (names) or seed IPs
    pub seeds: Vec<String>,
    /// Manually configured peers
    pub nodes: Vec<String>,
}

impl HostListOptions {
    pub fn new(network: Network) -> Self {
        let address = NetAddress::new(
            IpAddr::from([0, 0, 0, 0]),
            network.port,
            Services::NETWORK | Services::WITNESS,
            0,
        );
        let seeds = network.seeds.iter().map(|s| s.to_string()).collect();
        Self {
            network,
            address,
            services: Services::NETWORK | Services::WITNESS,
            max_buckets: DEFAULT_BUCKETS,
            max_entries: DEFAULT_ENTRIES,
            ban_time: DEFAULT_BAN_TIME,
            seeds,
            nodes: Vec::new(),
        }
    }
}

impl Default for HostListOptions {
    fn default() -> Self {
        Self::new(Network::main())
    }
}

// =============================================================================
// Serialized Form
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEntryJson {
    pub addr: String,
    pub src: String,
    /// Service bits as a binary string
    pub services: String,
    pub time: u64,
    pub attempts: u32,
    pub last_success: i64,
    pub last_attempt: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostListJson {
    pub version: u32,
    pub network: NetworkType,
    pub addrs: Vec<HostEntryJson>,
    pub fresh: Vec<Vec<String>>,
    pub used: Vec<Vec<String>>,
}

// =============================================================================
// Host List
// =============================================================================

/// Bucketed, scored address book
#[derive(Debug, Clone)]
pub struct HostList {
    options: HostListOptions,
    map: HashMap<String, HostEntry>,
    fresh: Vec<Vec<String>>,
    total_fresh: usize,
    used: Vec<UsedBucket>,
    total_used: usize,
    dns_seeds: Vec<String>,
    seed_nodes: Vec<NetAddress>,
    nodes: Vec<NetAddress>,
    local: HashMap<String, LocalAddress>,
    banned: HashMap<String, i64>,
    needs_flush: bool,
}

impl HostList {
    pub fn new(options: HostListOptions) -> Self {
        let mut list = Self {
            fresh: vec![Vec::new(); options.max_buckets],
            used: vec![UsedBucket::default(); options.max_buckets],
            options,
            map: HashMap::new(),
            total_fresh: 0,
            total_used: 0,
            dns_seeds: Vec::new(),
            seed_nodes: Vec::new(),
            nodes: Vec::new(),
            local: HashMap::new(),
            banned: HashMap::new(),
            needs_flush: false,
        };

        let seeds = list.options.seeds.clone();
        for seed in &seeds {
            list.add_seed(seed);
        }

        let nodes = list.options.nodes.clone();
        for node in &nodes {
            list.add_node(node);
        }

        let address = list.options.address;
        list.push_local(address, scores::MANUAL);

        list
    }

    pub fn options(&self) -> &HostListOptions {
        &self.options
    }

    pub fn network(&self) -> &Network {
        &self.options.network
    }

    pub fn size(&self) -> usize {
        self.total_fresh + self.total_used
    }

    pub fn total_fresh(&self) -> usize {
        self.total_fresh
    }

    pub fn total_used(&self) -> usize {
        self.total_used
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.options.max_buckets * self.options.max_entries
    }

    pub fn needs_flush(&self) -> bool {
        self.needs_flush
    }

    pub fn mark_flushed(&mut self) {
        self.needs_flush = false;
    }

    /// Drop every known address
    pub fn reset(&mut self) {
        self.map.clear();
        self.fresh = vec![Vec::new(); self.options.max_buckets];
        self.used = vec![UsedBucket::default(); self.options.max_buckets];
        self.total_fresh = 0;
        self.total_used = 0;
        self.needs_flush = true;
    }

    // =========================================================================
    // Bans
    // =========================================================================

    pub fn ban(&mut self, host: &str) {
        self.banned.insert(host.to_string(), now());
    }

    pub fn unban(&mut self, host: &str) {
        self.banned.remove(host);
    }

    /// Expired bans are dropped on lookup
    pub fn is_banned(&mut self, host: &str) -> bool {
        let Some(time) = self.banned.get(host).copied() else {
            return false;
        };

        if now() > time + self.options.ban_time {
            self.banned.remove(host);
            return false;
        }

        true
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get(&self, hostname: &str) -> Option<&HostEntry> {
        self.map.get(hostname)
    }

    pub fn has(&self, hostname: &str) -> bool {
        self.map.contains_key(hostname)
    }

    /// Every known address, fresh and used
    pub fn to_array(&self) -> Vec<NetAddress> {
        self.map.values().map(|entry| entry.addr).collect()
    }

    /// Pick a host to dial, weighted by `chance`
    pub fn get_host(&self) -> Option<&HostEntry> {
        let mut rng = rand::thread_rng();

        let mut use_used = false;
        if self.total_used > 0 && (self.total_fresh == 0 || rng.gen_range(0..2) == 0) {
            use_used = true;
        }
        if !use_used && self.total_fresh == 0 {
            return None;
        }

        let now = now();
        let mut factor = 1.0;

        loop {
            let index = rng.gen_range(0..self.options.max_buckets);

            let key = if use_used {
                let bucket = &self.used[index];
                if bucket.size == 0 {
                    continue;
                }
                let mut pos = rng.gen_range(0..bucket.size);
                let mut key = bucket.head.clone();
                while pos > 0 {
                    key = key.and_then(|k| self.map.get(&k).and_then(|e| e.next.clone()));
                    pos -= 1;
                }
                key
            } else {
                let bucket = &self.fresh[index];
                if bucket.is_empty() {
                    continue;
                }
                bucket.get(rng.gen_range(0..bucket.len())).cloned()
            };

            let Some(entry) = key.and_then(|k| self.map.get(&k)) else {
                continue;
            };

            let num = rng.gen_range(0..(1u32 << 30)) as f64;
            if num < factor * entry.chance(now) * (1u32 << 30) as f64 {
                return Some(entry);
            }

            factor *= 1.2;
        }
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    fn bucket_index(&self, data: &[u8]) -> usize {
        let hash = sha256(data);
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        value as usize % self.options.max_buckets
    }

    fn fresh_bucket(&self, addr: &NetAddress, src: &NetAddress) -> usize {
        let mut data = [0u8; 32];
        data[..16].copy_from_slice(&addr.raw);
        data[16..].copy_from_slice(&src.raw);
        self.bucket_index(&data)
    }

    fn used_bucket(&self, addr: &NetAddress) -> usize {
        self.bucket_index(&addr.raw)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Add an address heard from `src` (`None` for our own inserts)
    pub fn add(&mut self, addr: NetAddress, src: Option<&NetAddress>) -> bool {
        if addr.port == 0 {
            return false;
        }

        let key = addr.hostname();
        let src_addr = src.copied().unwrap_or(self.options.address);

        if let Some(entry) = self.map.get_mut(&key) {
            let mut penalty = 2 * 60 * 60;
            let mut interval = DAY;

            // No source means we are inserting it ourselves.
            if src.is_none() {
                penalty = 0;
            }

            entry.addr.services |= addr.services;

            let now = now();
            if now - (addr.time as i64) < DAY {
                interval = 60 * 60;
            }

            if (entry.addr.time as i64) < addr.time as i64 - interval - penalty {
                entry.addr.time = addr.time;
                self.needs_flush = true;
            }

            if entry.addr.time != 0 && addr.time <= entry.addr.time {
                return false;
            }

            if entry.used {
                return false;
            }

            if entry.ref_count >= MAX_REFS {
                return false;
            }

            // 2^refs times harder to add another reference.
            let factor = 1u32 << entry.ref_count;
            if rand::thread_rng().gen_range(0..factor) != 0 {
                return false;
            }
        } else {
            if self.is_full() {
                return false;
            }
            self.map.insert(key.clone(), HostEntry::new(addr, src_addr));
            self.total_fresh += 1;
        }

        let index = self.fresh_bucket(&addr, &src_addr);

        if self.fresh[index].contains(&key) {
            self.drop_unreferenced(&key);
            return false;
        }

        if self.fresh[index].len() >= self.options.max_entries {
            self.evict_fresh(index);
        }

        self.fresh[index].push(key.clone());
        if let Some(entry) = self.map.get_mut(&key) {
            entry.ref_count += 1;
        }

        self.needs_flush = true;
        true
    }

    /// Forget a brand new entry that never made it into a bucket
    fn drop_unreferenced(&mut self, key: &str) {
        let orphaned = self
            .map
            .get(key)
            .map(|entry| !entry.used && entry.ref_count == 0)
            .unwrap_or(false);
        if orphaned {
            self.map.remove(key);
            self.total_fresh = self.total_fresh.saturating_sub(1);
        }
    }

    /// Make room in a fresh bucket by evicting one entry: the stale entry with
    /// the earliest timestamp, otherwise the entry with the earliest timestamp.
    pub fn evict_fresh(&mut self, index: usize) {
        let Some(bucket) = self.fresh.get(index) else {
            return;
        };

        let mut stale: Option<(u64, &String)> = None;
        let mut oldest: Option<(u64, &String)> = None;

        for key in bucket {
            let Some(entry) = self.map.get(key) else {
                continue;
            };
            let time = entry.addr.time;

            if self.is_stale(entry) && stale.map(|(t, _)| time < t).unwrap_or(true) {
                stale = Some((time, key));
            }

            if oldest.map(|(t, _)| time < t).unwrap_or(true) {
                oldest = Some((time, key));
            }
        }

        let Some((_, victim)) = stale.or(oldest) else {
            return;
        };
        let victim = victim.clone();

        self.fresh[index].retain(|key| *key != victim);

        let gone = match self.map.get_mut(&victim) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count == 0 && !entry.used
            }
            None => false,
        };

        if gone {
            self.map.remove(&victim);
            self.total_fresh = self.total_fresh.saturating_sub(1);
        }
    }

    pub fn is_stale(&self, entry: &HostEntry) -> bool {
        let now = now();
        let time = entry.addr.time as i64;

        if entry.last_attempt != 0 && entry.last_attempt >= now - 60 {
            return false;
        }

        if time > now + 10 * 60 {
            return true;
        }

        if time == 0 {
            return true;
        }

        if now - time > HORIZON_DAYS * DAY {
            return true;
        }

        if entry.last_success == 0 && entry.attempts >= RETRIES {
            return true;
        }

        if now - entry.last_success > MIN_FAIL_DAYS * DAY && entry.attempts >= MAX_FAILURES {
            return true;
        }

        false
    }

    // =========================================================================
    // Used Lists
    // =========================================================================

    fn link_tail(&mut self, index: usize, key: &str) {
        let tail = self.used[index].tail.clone();

        if let Some(entry) = self.map.get_mut(key) {
            entry.prev = tail.clone();
            entry.next = None;
            entry.bucket = Some(index);
        }

        match tail {
            Some(tail) => {
                if let Some(prev) = self.map.get_mut(&tail) {
                    prev.next = Some(key.to_string());
                }
            }
            None => self.used[index].head = Some(key.to_string()),
        }

        self.used[index].tail = Some(key.to_string());
        self.used[index].size += 1;
    }

    fn unlink(&mut self, index: usize, key: &str) {
        let (prev, next) = match self.map.get_mut(key) {
            Some(entry) => (entry.prev.take(), entry.next.take()),
            None => return,
        };

        match &prev {
            Some(prev_key) => {
                if let Some(entry) = self.map.get_mut(prev_key) {
                    entry.next = next.clone();
                }
            }
            None => self.used[index].head = next.clone(),
        }

        match &next {
            Some(next_key) => {
                if let Some(entry) = self.map.get_mut(next_key) {
                    entry.prev = prev.clone();
                }
            }
            None => self.used[index].tail = prev.clone(),
        }

        if let Some(entry) = self.map.get_mut(key) {
            entry.bucket = None;
        }

        self.used[index].size = self.used[index].size.saturating_sub(1);
    }

    /// Put `new` in the list position currently held by `old`
    fn replace(&mut self, index: usize, old: &str, new: &str) {
        let (prev, next) = match self.map.get_mut(old) {
            Some(entry) => {
                entry.bucket = None;
                (entry.prev.take(), entry.next.take())
            }
            None => return,
        };

        match &prev {
            Some(prev_key) => {
                if let Some(entry) = self.map.get_mut(prev_key) {
                    entry.next = Some(new.to_string());
                }
            }
            None => self.used[index].head = Some(new.to_string()),
        }

        match &next {
            Some(next_key) => {
                if let Some(entry) = self.map.get_mut(next_key) {
                    entry.prev = Some(new.to_string());
                }
            }
            None => self.used[index].tail = Some(new.to_string()),
        }

        if let Some(entry) = self.map.get_mut(new) {
            entry.prev = prev;
            entry.next = next;
            entry.bucket = Some(index);
        }
    }

    fn used_keys(&self, index: usize) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.used[index].size);
        let mut cursor = self.used[index].head.clone();
        while let Some(key) = cursor {
            cursor = self.map.get(&key).and_then(|entry| entry.next.clone());
            keys.push(key);
        }
        keys
    }

    /// Entry with the oldest timestamp in a used bucket
    fn evict_used(&self, index: usize) -> Option<String> {
        self.used_keys(index)
            .into_iter()
            .filter_map(|key| self.map.get(&key).map(|entry| (entry.addr.time, key)))
            .min_by_key(|(time, _)| *time)
            .map(|(_, key)| key)
    }

    // =========================================================================
    // Connection Outcomes
    // =========================================================================

    pub fn mark_attempt(&mut self, hostname: &str) {
        if let Some(entry) = self.map.get_mut(hostname) {
            entry.attempts += 1;
            entry.last_attempt = now();
        }
    }

    /// Socket connected: refresh the timestamp if it is older than 20 minutes
    pub fn mark_success(&mut self, hostname: &str) {
        let now = now();
        if let Some(entry) = self.map.get_mut(hostname) {
            if now - entry.addr.time as i64 > 20 * 60 {
                entry.addr.time = now as u64;
            }
        }
    }

    /// Handshake completed: promote the entry to the used table
    pub fn mark_ack(&mut self, hostname: &str, services: Services) {
        let now = now();

        let Some(entry) = self.map.get_mut(hostname) else {
            return;
        };

        entry.addr.services |= services;
        entry.last_success = now;
        entry.last_attempt = now;
        entry.attempts = 0;

        if entry.used {
            return;
        }

        let addr = entry.addr;

        // Remove from every fresh bucket, remembering the first.
        let mut old = None;
        for (index, bucket) in self.fresh.iter_mut().enumerate() {
            let before = bucket.len();
            bucket.retain(|key| key != hostname);
            if bucket.len() != before && old.is_none() {
                old = Some(index);
            }
        }

        if let Some(entry) = self.map.get_mut(hostname) {
            entry.ref_count = 0;
        }
        self.total_fresh = self.total_fresh.saturating_sub(1);

        let index = self.used_bucket(&addr);

        if self.used[index].size < self.options.max_entries {
            if let Some(entry) = self.map.get_mut(hostname) {
                entry.used = true;
            }
            self.link_tail(index, hostname);
            self.total_used += 1;
            self.needs_flush = true;
            return;
        }

        // No room: swap with the oldest used entry, which goes back to fresh.
        let Some(evicted) = self.evict_used(index) else {
            return;
        };

        let Some((evicted_addr, evicted_src)) =
            self.map.get(&evicted).map(|entry| (entry.addr, entry.src))
        else {
            return;
        };

        let mut fresh = self.fresh_bucket(&evicted_addr, &evicted_src);
        if self.fresh[fresh].len() >= self.options.max_entries {
            fresh = old.unwrap_or(fresh);
        }

        self.replace(index, &evicted, hostname);

        if let Some(entry) = self.map.get_mut(hostname) {
            entry.used = true;
        }

        if let Some(entry) = self.map.get_mut(&evicted) {
            entry.used = false;
            entry.ref_count += 1;
        }

        self.fresh[fresh].push(evicted);
        self.total_fresh += 1;
        self.needs_flush = true;
    }

    /// Forget an address entirely
    pub fn remove(&mut self, hostname: &str) -> Option<NetAddress> {
        let (used, bucket, addr) = {
            let entry = self.map.get(hostname)?;
            (entry.used, entry.bucket, entry.addr)
        };

        if used {
            if let Some(index) = bucket {
                self.unlink(index, hostname);
            }
            self.total_used = self.total_used.saturating_sub(1);
        } else {
            for bucket in self.fresh.iter_mut() {
                bucket.retain(|key| key != hostname);
            }
            self.total_fresh = self.total_fresh.saturating_sub(1);
        }

        self.map.remove(hostname);
        self.needs_flush = true;

        Some(addr)
    }

    // =========================================================================
    // Seeds and Nodes
    // =========================================================================

    /// A seed is either a DNS name or a literal address
    pub fn add_seed(&mut self, host: &str) {
        match NetAddress::from_hostname(host, self.options.network.port) {
            Ok(addr) => self.seed_nodes.push(addr),
            Err(_) => self.dns_seeds.push(host.to_string()),
        }
    }

    pub fn dns_seeds(&self) -> &[String] {
        &self.dns_seeds
    }

    /// Add the literal seed addresses to the table
    pub fn add_seed_nodes(&mut self) -> usize {
        let now = now() as u64;
        let services = self.options.services;
        let seeds = self.seed_nodes.clone();
        seeds
            .into_iter()
            .filter(|addr| {
                let mut addr = *addr;
                addr.time = now;
                addr.services = services;
                self.add(addr, None)
            })
            .count()
    }

    /// Register a manual peer
    pub fn add_node(&mut self, host: &str) -> bool {
        let Ok(mut addr) = NetAddress::from_hostname(host, self.options.network.port) else {
            log::warn!("Ignoring invalid node address: {}", host);
            return false;
        };
        addr.services = self.options.services;
        addr.time = now() as u64;
        self.nodes.push(addr);
        self.add(addr, None);
        true
    }

    pub fn nodes(&self) -> &[NetAddress] {
        &self.nodes
    }

    // =========================================================================
    // Local Addresses
    // =========================================================================

    pub fn add_local(&mut self, host: &str, port: u16, score: u32) -> bool {
        let Ok(mut addr) = NetAddress::from_hostname(host, port) else {
            return false;
        };
        addr.port = port;
        addr.services = self.options.services;
        self.push_local(addr, score)
    }

    pub fn push_local(&mut self, addr: NetAddress, score: u32) -> bool {
        if !addr.is_routable() {
            return false;
        }

        let key = addr.hostname();
        if self.local.contains_key(&key) {
            return false;
        }

        self.local.insert(key, LocalAddress { addr, score });
        true
    }

    /// Best local address to advertise to `src`
    pub fn get_local(&self, src: Option<&NetAddress>) -> Option<NetAddress> {
        let src = src.copied().unwrap_or(self.options.address);

        let mut best: Option<(u8, u32, NetAddress)> = None;
        for local in self.local.values() {
            let reach = src.reachability(&local.addr);
            let better = match best {
                None => true,
                Some((best_reach, best_score, _)) => {
                    reach > best_reach || (reach == best_reach && local.score > best_score)
                }
            };
            if better {
                best = Some((reach, local.score, local.addr));
            }
        }

        best.map(|(_, _, mut addr)| {
            addr.time = now() as u64;
            addr
        })
    }

    pub fn mark_local(&mut self, addr: &NetAddress) -> bool {
        match self.local.get_mut(&addr.hostname()) {
            Some(local) => {
                local.score += 1;
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    pub fn to_json(&self) -> HostListJson {
        let mut addrs: Vec<HostEntryJson> = self
            .map
            .values()
            .map(|entry| HostEntryJson {
                addr: entry.addr.hostname(),
                src: entry.src.hostname(),
                services: format!("{:b}", entry.addr.services.bits()),
                time: entry.addr.time,
                attempts: entry.attempts,
                last_success: entry.last_success,
                last_attempt: entry.last_attempt,
            })
            .collect();
        addrs.sort_by(|a, b| a.addr.cmp(&b.addr));

        HostListJson {
            version: VERSION,
            network: self.options.network.kind,
            addrs,
            fresh: self.fresh.clone(),
            used: (0..self.used.len()).map(|i| self.used_keys(i)).collect(),
        }
    }

    /// Replace the table contents with a serialized host list.
    ///
    /// Nothing is modified unless the whole document validates.
    pub fn from_json(&mut self, json: &HostListJson) -> Result<(), HostListError> {
        if json.version != VERSION {
            return Err(HostListError::Version(json.version));
        }

        if json.network != self.options.network.kind {
            return Err(HostListError::Network(json.network.to_string()));
        }

        let port = self.options.network.port;
        let mut map = HashMap::new();

        for item in &json.addrs {
            let mut addr = NetAddress::from_hostname(&item.addr, port)
                .map_err(|_| HostListError::Address(item.addr.clone()))?;
            let src = NetAddress::from_hostname(&item.src, port)
                .map_err(|_| HostListError::Address(item.src.clone()))?;

            if item.services.len() > 64 {
                return Err(HostListError::Services(item.services.clone()));
            }
            let bits = u64::from_str_radix(&item.services, 2)
                .map_err(|_| HostListError::Services(item.services.clone()))?;

            addr.services = Services::from_bits_retain(bits);
            addr.time = item.time;

            let mut entry = HostEntry::new(addr, src);
            entry.attempts = item.attempts;
            entry.last_success = item.last_success;
            entry.last_attempt = item.last_attempt;

            map.insert(entry.key(), entry);
        }

        if json.fresh.len() != self.options.max_buckets {
            return Err(HostListError::Buckets);
        }

        let mut total_fresh = 0;
        for bucket in &json.fresh {
            if bucket.len() > self.options.max_entries {
                return Err(HostListError::BucketSize);
            }
            for key in bucket {
                let entry = map
                    .get_mut(key)
                    .ok_or_else(|| HostListError::UnknownHost(key.clone()))?;
                if entry.ref_count == 0 {
                    total_fresh += 1;
                }
                entry.ref_count += 1;
            }
        }

        if json.used.len() != self.options.max_buckets {
            return Err(HostListError::Buckets);
        }

        for bucket in &json.used {
            if bucket.len() > self.options.max_entries {
                return Err(HostListError::BucketSize);
            }
            for key in bucket {
                let entry = map
                    .get_mut(key)
                    .ok_or_else(|| HostListError::UnknownHost(key.clone()))?;
                if entry.ref_count != 0 || entry.used {
                    return Err(HostListError::Duplicate(key.clone()));
                }
                entry.used = true;
            }
        }

        if let Some(entry) = map.values().find(|e| !e.used && e.ref_count == 0) {
            return Err(HostListError::Unreferenced(entry.key()));
        }

        self.map = map;
        self.fresh = json.fresh.clone();
        self.total_fresh = total_fresh;
        self.used = vec![UsedBucket::default(); self.options.max_buckets];
        self.total_used = 0;

        for (index, bucket) in json.used.iter().enumerate() {
            for key in bucket {
                self.link_tail(index, key);
                self.total_used += 1;
            }
        }

        self.needs_flush = false;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options(buckets: usize, entries: usize) -> HostListOptions {
        let mut options = HostListOptions::new(Network::main());
        options.seeds.clear();
        options.max_buckets = buckets;
        options.max_entries = entries;
        options
    }

    fn addr(host: &str) -> NetAddress {
        let mut addr = NetAddress::from_hostname(host, 8333).unwrap();
        addr.services = Services::NETWORK;
        addr.time = now() as u64;
        addr
    }

    /// Every entry is referenced from exactly one table
    fn check_invariants(list: &HostList) {
        let mut fresh_refs: HashMap<&String, u32> = HashMap::new();
        for bucket in &list.fresh {
            assert!(bucket.len() <= list.options.max_entries);
            for key in bucket {
                *fresh_refs.entry(key).or_default() += 1;
            }
        }

        let mut used_count = 0;
        for index in 0..list.used.len() {
            let keys = list.used_keys(index);
            assert_eq!(keys.len(), list.used[index].size);
            for key in &keys {
                let entry = list.get(key).unwrap();
                assert!(entry.used);
                assert_eq!(entry.ref_count, 0);
                assert!(!fresh_refs.contains_key(key));
            }
            used_count += keys.len();
        }

        for (key, entry) in &list.map {
            if !entry.used {
                assert_eq!(fresh_refs.get(key).copied().unwrap_or(0), entry.ref_count);
                assert!(entry.ref_count > 0 && entry.ref_count <= MAX_REFS);
            }
        }

        assert_eq!(used_count, list.total_used);
        assert_eq!(fresh_refs.len(), list.total_fresh);
        assert_eq!(list.size(), list.map.len());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut list = HostList::new(options(20, 50));
        let a = addr("8.8.8.8:8333");
        let src = addr("1.1.1.1:8333");

        assert!(list.add(a, Some(&src)));
        for _ in 0..10 {
            assert!(!list.add(a, Some(&src)));
        }

        assert_eq!(list.total_fresh(), 1);
        assert_eq!(list.get("8.8.8.8:8333").unwrap().ref_count, 1);
        check_invariants(&list);
    }

    #[test]
    fn test_add_merges_services() {
        let mut list = HostList::new(options(20, 50));
        let mut a = addr("8.8.8.8:8333");
        list.add(a, None);

        a.services = Services::WITNESS;
        list.add(a, None);

        let entry = list.get("8.8.8.8:8333").unwrap();
        assert!(entry.addr.services.contains(Services::NETWORK | Services::WITNESS));
    }

    #[test]
    fn test_port_zero_rejected() {
        let mut list = HostList::new(options(20, 50));
        let mut a = addr("8.8.8.8:8333");
        a.port = 0;
        assert!(!list.add(a, None));
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_small_table_stays_bounded() {
        let mut list = HostList::new(options(3, 2));
        for i in 1..=7 {
            let src = addr(&format!("2.2.2.{}:8333", i));
            list.add(addr(&format!("9.9.9.{}:8333", i)), Some(&src));
        }

        assert!(list.total_fresh() <= 6);
        assert!(list.map.values().all(|e| e.ref_count <= MAX_REFS));
        check_invariants(&list);
    }

    #[test]
    fn test_mark_ack_promotes() {
        let mut list = HostList::new(options(20, 50));
        for i in 1..=5 {
            let src = addr(&format!("3.3.3.{}:8333", i));
            list.add(addr("8.8.4.4:8333"), Some(&src));
        }
        list.add(addr("8.8.8.8:8333"), None);

        list.mark_ack("8.8.4.4:8333", Services::WITNESS);

        let entry = list.get("8.8.4.4:8333").unwrap();
        assert!(entry.used);
        assert_eq!(entry.ref_count, 0);
        assert_eq!(entry.attempts, 0);
        assert!(entry.addr.services.contains(Services::WITNESS));
        assert_eq!(list.total_used(), 1);
        assert_eq!(list.total_fresh(), 1);
        check_invariants(&list);

        // Acking again is a no-op for placement.
        list.mark_ack("8.8.4.4:8333", Services::empty());
        assert_eq!(list.total_used(), 1);
        check_invariants(&list);
    }

    #[test]
    fn test_mark_ack_swaps_when_used_bucket_full() {
        // Two buckets of one entry: find two hosts sharing a used bucket.
        let layout = HostList::new(options(2, 1));
        let first = addr("8.8.8.1:8333");
        let second = (2..60)
            .map(|i| addr(&format!("8.8.8.{}:8333", i)))
            .find(|a| layout.used_bucket(a) == layout.used_bucket(&first))
            .unwrap();

        let mut list = HostList::new(options(2, 1));
        assert!(list.add(first, None));
        list.mark_ack(&first.hostname(), Services::empty());
        assert_eq!(list.total_used(), 1);

        assert!(list.add(second, None));
        list.mark_ack(&second.hostname(), Services::empty());

        assert_eq!(list.total_used(), 1);
        assert_eq!(list.total_fresh(), 1);
        assert!(list.get(&second.hostname()).unwrap().used);

        let demoted = list.get(&first.hostname()).unwrap();
        assert!(!demoted.used);
        assert_eq!(demoted.ref_count, 1);
        check_invariants(&list);
    }

    #[test]
    fn test_remove() {
        let mut list = HostList::new(options(20, 50));
        list.add(addr("8.8.8.8:8333"), None);
        list.add(addr("8.8.4.4:8333"), None);
        list.mark_ack("8.8.4.4:8333", Services::empty());

        assert!(list.remove("8.8.8.8:8333").is_some());
        assert!(list.remove("8.8.4.4:8333").is_some());
        assert!(list.remove("8.8.4.4:8333").is_none());
        assert_eq!(list.size(), 0);
        check_invariants(&list);
    }

    #[test]
    fn test_staleness_rules() {
        let list = HostList::new(options(20, 50));
        let now = now();
        let fresh = HostEntry::new(addr("8.8.8.8:8333"), addr("1.1.1.1:8333"));
        assert!(!list.is_stale(&fresh));

        let mut zero = fresh.clone();
        zero.addr.time = 0;
        assert!(list.is_stale(&zero));

        let mut future = fresh.clone();
        future.addr.time = (now + 20 * 60) as u64;
        assert!(list.is_stale(&future));

        let mut ancient = fresh.clone();
        ancient.addr.time = (now - 31 * DAY) as u64;
        assert!(list.is_stale(&ancient));

        let mut retried = fresh.clone();
        retried.attempts = RETRIES;
        retried.last_attempt = now - 3600;
        assert!(list.is_stale(&retried));

        // A very recent attempt shields the entry.
        retried.last_attempt = now;
        assert!(!list.is_stale(&retried));

        let mut failing = fresh.clone();
        failing.last_success = now - 8 * DAY;
        failing.last_attempt = now - 3600;
        failing.attempts = MAX_FAILURES;
        assert!(list.is_stale(&failing));
    }

    #[test]
    fn test_evict_fresh_never_underflows() {
        let mut list = HostList::new(options(2, 3));
        for i in 1..=4 {
            let mut a = addr(&format!("7.7.7.{}:8333", i));
            a.time = 0;
            list.add(a, None);
        }

        for _ in 0..10 {
            list.evict_fresh(0);
            list.evict_fresh(1);
            check_invariants(&list);
        }
        assert_eq!(list.total_fresh(), 0);
    }

    #[test]
    fn test_chance() {
        let now = now();
        let mut entry = HostEntry::new(addr("8.8.8.8:8333"), addr("1.1.1.1:8333"));
        assert_eq!(entry.chance(now), 1.0);

        entry.attempts = 2;
        assert!((entry.chance(now) - 0.66 * 0.66).abs() < 1e-9);

        entry.last_attempt = now - 60;
        assert!((entry.chance(now) - 0.01 * 0.66 * 0.66).abs() < 1e-9);

        entry.attempts = 100;
        entry.last_attempt = 0;
        assert!((entry.chance(now) - 0.66f64.powi(8)).abs() < 1e-9);
    }

    #[test]
    fn test_get_host() {
        let mut list = HostList::new(options(20, 50));
        assert!(list.get_host().is_none());

        list.add(addr("8.8.8.8:8333"), None);
        list.add(addr("8.8.4.4:8333"), None);
        list.mark_ack("8.8.4.4:8333", Services::empty());

        for _ in 0..20 {
            let host = list.get_host().unwrap();
            assert!(list.has(&host.key()));
        }
    }

    #[test]
    fn test_bans_expire() {
        let mut opts = options(20, 50);
        opts.ban_time = 0;
        let mut list = HostList::new(opts);
        list.banned.insert("1.2.3.4".to_string(), now() - 10);
        assert!(!list.is_banned("1.2.3.4"));

        let mut list = HostList::new(options(20, 50));
        list.ban("1.2.3.4");
        assert!(list.is_banned("1.2.3.4"));
        list.unban("1.2.3.4");
        assert!(!list.is_banned("1.2.3.4"));
    }

    #[test]
    fn test_local_addresses() {
        let mut list = HostList::new(options(20, 50));
        assert!(!list.add_local("127.0.0.1", 8333, scores::BIND));
        assert!(list.add_local("8.8.8.8", 8333, scores::BIND));
        assert!(list.add_local("9.9.9.9", 8333, scores::MANUAL));

        let best = list.get_local(Some(&addr("1.1.1.1:8333"))).unwrap();
        assert_eq!(best.hostname(), "9.9.9.9:8333");

        let eight = addr("8.8.8.8:8333");
        for _ in 0..3 {
            assert!(list.mark_local(&eight));
        }
        let best = list.get_local(Some(&addr("1.1.1.1:8333"))).unwrap();
        assert_eq!(best.hostname(), "8.8.8.8:8333");
    }

    #[test]
    fn test_seeds_split() {
        let mut opts = options(20, 50);
        opts.seeds = vec!["seed.example.org".to_string(), "5.5.5.5".to_string()];
        let mut list = HostList::new(opts);
        assert_eq!(list.dns_seeds(), &["seed.example.org".to_string()]);
        assert_eq!(list.add_seed_nodes(), 1);
        assert!(list.has("5.5.5.5:8333"));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut list = HostList::new(options(20, 50));
        for i in 1..=6 {
            let src = addr(&format!("6.6.6.{}:8333", i));
            list.add(addr(&format!("8.8.{}.1:8333", i)), Some(&src));
        }
        list.mark_ack("8.8.2.1:8333", Services::WITNESS);
        list.mark_attempt("8.8.3.1:8333");

        let json = list.to_json();
        let text = serde_json::to_string(&json).unwrap();
        assert!(text.contains("\"lastSuccess\""));

        let parsed: HostListJson = serde_json::from_str(&text).unwrap();
        let mut restored = HostList::new(options(20, 50));
        restored.from_json(&parsed).unwrap();

        assert_eq!(restored.total_fresh(), list.total_fresh());
        assert_eq!(restored.total_used(), list.total_used());
        assert_eq!(restored.to_json(), json);
        check_invariants(&restored);
    }

    #[test]
    fn test_json_validation() {
        let list = HostList::new(options(20, 50));
        let good = list.to_json();

        let mut restored = HostList::new(options(20, 50));

        let mut bad = good.clone();
        bad.version = 7;
        assert_eq!(restored.from_json(&bad), Err(HostListError::Version(7)));

        let mut bad = good.clone();
        bad.network = NetworkType::Testnet;
        assert!(matches!(restored.from_json(&bad), Err(HostListError::Network(_))));

        let mut other = HostList::new(options(10, 50));
        assert_eq!(other.from_json(&good), Err(HostListError::Buckets));

        let mut bad = good;
        bad.fresh[0].push("1.2.3.4:8333".to_string());
        assert!(matches!(
            restored.from_json(&bad),
            Err(HostListError::UnknownHost(_))
        ));
    }
}
