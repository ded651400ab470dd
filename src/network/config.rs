//! Pool configuration
//!
//! `PoolOptions` carries every knob of the networking engine. It has sane
//! defaults and can be loaded from a JSON file; missing fields fall back to
//! the defaults.

use crate::core::{Network, NetworkType};
use crate::network::addrman::{HostListOptions, DEFAULT_BAN_TIME};
use crate::wire::netaddress::NetAddress;
use crate::wire::types::Services;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default outbound peer count
pub const MAX_OUTBOUND: usize = 8;

/// Default inbound peer count
pub const MAX_INBOUND: usize = 8;

/// Ban score at which a peer is banned
pub const BAN_SCORE: u32 = 100;

/// Broadcast inventory timeout in seconds
pub const INV_TIMEOUT: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid address: {0}")]
    Address(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub network: NetworkType,
    /// Bind address for the listener
    pub host: String,
    /// Listen port (network default when unset)
    pub port: Option<u16>,
    /// Address advertised to peers
    pub public_host: Option<String>,
    pub public_port: Option<u16>,
    pub listen: bool,
    pub max_outbound: usize,
    pub max_inbound: usize,
    /// Request and relay witness data
    pub witness: bool,
    /// BIP152 compact block relay
    pub compact: bool,
    /// Ask peers for high-bandwidth compact relay (sendcmpct mode 1)
    pub high_bandwidth: bool,
    /// Run as a filtered (BIP37) client
    pub spv: bool,
    /// Header-first sync up to the last checkpoint
    pub checkpoints: bool,
    /// Serve BIP37 filters and `mempool`
    pub bip37: bool,
    /// Never advertise our address or serve data
    pub selfish: bool,
    pub ban_score: u32,
    /// Ban duration in seconds
    pub ban_time: i64,
    /// Minimum relay fee rate sent as `feefilter` (negative disables)
    pub fee_rate: i64,
    /// Broadcast timeout in seconds
    pub inv_timeout: u64,
    /// DNS seeds or seed IPs (network seeds when empty)
    pub seeds: Vec<String>,
    /// Manually configured peers, always preferred
    pub nodes: Vec<String>,
    /// JSON host list location
    pub host_file: Option<PathBuf>,
    pub agent: String,
    /// Ask peers not to relay transactions until we load a filter
    pub no_relay: bool,
    /// Resolve DNS seeds and refill periodically
    pub discover: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            network: NetworkType::Main,
            host: "0.0.0.0".to_string(),
            port: None,
            public_host: None,
            public_port: None,
            listen: true,
            max_outbound: MAX_OUTBOUND,
            max_inbound: MAX_INBOUND,
            witness: true,
            compact: true,
            high_bandwidth: false,
            spv: false,
            checkpoints: true,
            bip37: false,
            selfish: false,
            ban_score: BAN_SCORE,
            ban_time: DEFAULT_BAN_TIME,
            fee_rate: -1,
            inv_timeout: INV_TIMEOUT,
            seeds: Vec::new(),
            nodes: Vec::new(),
            host_file: None,
            agent: format!("/mini-p2p:{}/", env!("CARGO_PKG_VERSION")),
            no_relay: false,
            discover: true,
        }
    }
}

impl PoolOptions {
    pub fn new(network: NetworkType) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn network(&self) -> Network {
        Network::get(self.network)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.network().port)
    }

    /// Services we advertise
    pub fn services(&self) -> Services {
        let mut services = Services::empty();
        if !self.spv {
            services |= Services::NETWORK;
        }
        if self.witness {
            services |= Services::WITNESS;
        }
        if self.bip37 {
            services |= Services::BLOOM;
        }
        services
    }

    /// Services an outbound peer must advertise
    pub fn required_services(&self) -> Services {
        let mut services = Services::NETWORK;
        if self.witness {
            services |= Services::WITNESS;
        }
        if self.spv {
            services |= Services::BLOOM;
        }
        services
    }

    pub fn inv_timeout(&self) -> Duration {
        Duration::from_secs(self.inv_timeout)
    }

    /// Address we bind the listener to
    pub fn bind_address(&self) -> Result<NetAddress, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Address(self.host.clone()))?;
        Ok(NetAddress::new(ip, self.port(), self.services(), 0))
    }

    /// Address advertised to peers
    pub fn public_address(&self) -> Result<NetAddress, ConfigError> {
        let host = self.public_host.as_deref().unwrap_or("0.0.0.0");
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::Address(host.to_string()))?;
        let port = self.public_port.unwrap_or_else(|| self.port());
        Ok(NetAddress::new(ip, port, self.services(), 0))
    }

    pub fn host_list_options(&self) -> HostListOptions {
        self.host_list_options_for(self.network())
    }

    /// Host list options for explicit network parameters
    pub fn host_list_options_for(&self, network: Network) -> HostListOptions {
        let mut options = HostListOptions::new(network);
        if let Ok(address) = self.public_address() {
            options.address = address;
        }
        options.services = self.required_services();
        options.ban_time = self.ban_time;
        if !self.seeds.is_empty() {
            options.seeds = self.seeds.clone();
        }
        options.nodes = self.nodes.clone();
        options
    }
}
