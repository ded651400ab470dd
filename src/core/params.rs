//! Network parameters
//!
//! Each network supplies its magic number, default port, DNS seeds, genesis
//! header and the hardcoded checkpoints that bound header-first sync.

use crate::core::header::BlockHeader;
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Checkpoint Entry
// =============================================================================

/// A checkpoint representing a known-good block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Block height
    pub height: u32,
    /// Block hash
    pub hash: Hash256,
}

impl Checkpoint {
    fn parse(height: u32, hash: &str) -> Self {
        Self {
            height,
            hash: Hash256::from_hex(hash).unwrap_or_default(),
        }
    }
}

// =============================================================================
// Network Type
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Main,
    Testnet,
    Regtest,
}

impl NetworkType {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkType::Main => "main",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(NetworkType::Main),
            "testnet" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(format!("Unknown network: {}", other)),
        }
    }
}

// =============================================================================
// Network
// =============================================================================

/// Per-network protocol parameters
#[derive(Debug, Clone)]
pub struct Network {
    pub kind: NetworkType,
    pub magic: u32,
    pub port: u16,
    pub seeds: Vec<&'static str>,
    pub checkpoints: Vec<Checkpoint>,
    pub genesis: BlockHeader,
    /// A tip older than this many seconds means the chain is still syncing
    pub max_tip_age: i64,
    /// Allow connecting to our own nonce (useful for local testing)
    pub self_connect: bool,
    /// Ask the loader for its mempool once synced
    pub request_mempool: bool,
}

fn genesis(time: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: Hash256::ZERO,
        merkle_root: Hash256::from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .unwrap_or_default(),
        time,
        bits,
        nonce,
    }
}

impl Network {
    pub fn get(kind: NetworkType) -> Self {
        match kind {
            NetworkType::Main => Self::main(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        let checkpoints = [
            (11111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            (33333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            (74000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
            (105000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
            (134444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
            (168000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
            (193000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
            (210000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            (216116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
            (225430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
            (250000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
            (279000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
            (295000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
        ];

        Self {
            kind: NetworkType::Main,
            magic: 0xd9b4bef9,
            port: 8333,
            seeds: vec![
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
                "seed.btc.petertodd.org",
            ],
            checkpoints: checkpoints
                .iter()
                .map(|(height, hash)| Checkpoint::parse(*height, hash))
                .collect(),
            genesis: genesis(1231006505, 0x1d00ffff, 2083236893),
            max_tip_age: 24 * 60 * 60,
            self_connect: false,
            request_mempool: false,
        }
    }

    pub fn testnet() -> Self {
        let checkpoints = [
            (546, "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
        ];

        Self {
            kind: NetworkType::Testnet,
            magic: 0x0709110b,
            port: 18333,
            seeds: vec![
                "testnet-seed.bitcoin.jonasschnelli.ch",
                "seed.tbtc.petertodd.org",
                "testnet-seed.bluematt.me",
            ],
            checkpoints: checkpoints
                .iter()
                .map(|(height, hash)| Checkpoint::parse(*height, hash))
                .collect(),
            genesis: genesis(1296688602, 0x1d00ffff, 414098458),
            max_tip_age: 24 * 60 * 60,
            self_connect: false,
            request_mempool: false,
        }
    }

    pub fn regtest() -> Self {
        Self {
            kind: NetworkType::Regtest,
            magic: 0xdab5bffa,
            port: 18444,
            seeds: Vec::new(),
            checkpoints: Vec::new(),
            genesis: genesis(1296688602, 0x207fffff, 2),
            max_tip_age: 0xffff_ffff,
            self_connect: true,
            request_mempool: true,
        }
    }

    /// Height of the last hardcoded checkpoint (0 when there are none)
    pub fn last_checkpoint(&self) -> u32 {
        self.checkpoints.last().map(|c| c.height).unwrap_or(0)
    }

    /// First checkpoint strictly above `height`
    pub fn next_checkpoint(&self, height: u32) -> Option<Checkpoint> {
        self.checkpoints.iter().find(|c| c.height > height).copied()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            Network::main().genesis_hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            Network::testnet().genesis_hash().to_hex(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            Network::regtest().genesis_hash().to_hex(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_genesis_pow() {
        for kind in [NetworkType::Main, NetworkType::Testnet, NetworkType::Regtest] {
            assert!(Network::get(kind).genesis.verify_pow());
        }
    }

    #[test]
    fn test_checkpoints_parse_and_ascend() {
        let network = Network::main();
        assert_eq!(network.last_checkpoint(), 295000);
        assert!(network.checkpoints.iter().all(|c| !c.hash.is_zero()));
        assert!(network
            .checkpoints
            .windows(2)
            .all(|pair| pair[0].height < pair[1].height));
        assert_eq!(network.next_checkpoint(11111).unwrap().height, 33333);
        assert!(network.next_checkpoint(295000).is_none());
    }

    #[test]
    fn test_network_names() {
        assert_eq!("regtest".parse::<NetworkType>().unwrap(), NetworkType::Regtest);
        assert_eq!(NetworkType::Testnet.to_string(), "testnet");
        assert!("foo".parse::<NetworkType>().is_err());
    }
}
