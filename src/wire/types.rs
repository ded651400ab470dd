//! Protocol constants, service bits, inventory items and reject codes

use crate::crypto::Hash256;
use crate::wire::encoding::{write_hash, Reader, WireError};
use bitflags::bitflags;
use bytes::BufMut;
use std::fmt;

// =============================================================================
// Protocol Versions
// =============================================================================

/// Protocol version we speak
pub const PROTOCOL_VERSION: i32 = 70015;

/// Oldest peer version we accept
pub const MIN_VERSION: i32 = 70001;

/// First version supporting `getheaders`
pub const HEADERS_VERSION: i32 = 31800;

/// Versions at or below this do not answer pings with a nonce
pub const PONG_VERSION: i32 = 60000;

/// First version supporting bloom filters
pub const BLOOM_VERSION: i32 = 70011;

/// First version supporting `sendheaders`
pub const SENDHEADERS_VERSION: i32 = 70012;

/// First version supporting compact blocks
pub const COMPACT_VERSION: i32 = 70014;

/// First version supporting witness compact blocks
pub const COMPACT_WITNESS_VERSION: i32 = 70015;

// =============================================================================
// Limits
// =============================================================================

/// Maximum frame payload
pub const MAX_MESSAGE: usize = 4_000_000;

/// Maximum inventory items per message
pub const MAX_INV: usize = 50_000;

/// Maximum addresses per `addr` message
pub const MAX_ADDR: usize = 1000;

/// Maximum headers per `headers` message
pub const MAX_HEADERS: usize = 2000;

/// Maximum outstanding block requests per peer
pub const MAX_BLOCK_REQUEST: usize = 50_000 + 1000;

/// Maximum outstanding tx requests per peer
pub const MAX_TX_REQUEST: usize = 10_000;

/// Maximum user agent length
pub const MAX_AGENT: usize = 256;

/// Maximum money supply in base units
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Inventory type flag requesting witness serialization
pub const WITNESS_FLAG: u32 = 1 << 30;

// =============================================================================
// Services
// =============================================================================

bitflags! {
    /// Service bits advertised in `version` and `addr`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Services: u64 {
        const NETWORK = 1 << 0;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CmpctBlock,
    WitnessTx,
    WitnessBlock,
    WitnessFilteredBlock,
    Unknown(u32),
}

impl InvType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CmpctBlock,
            v if v == 1 | WITNESS_FLAG => InvType::WitnessTx,
            v if v == 2 | WITNESS_FLAG => InvType::WitnessBlock,
            v if v == 3 | WITNESS_FLAG => InvType::WitnessFilteredBlock,
            other => InvType::Unknown(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CmpctBlock => 4,
            InvType::WitnessTx => 1 | WITNESS_FLAG,
            InvType::WitnessBlock => 2 | WITNESS_FLAG,
            InvType::WitnessFilteredBlock => 3 | WITNESS_FLAG,
            InvType::Unknown(value) => value,
        }
    }

    pub fn is_tx(self) -> bool {
        matches!(self, InvType::Tx | InvType::WitnessTx)
    }

    pub fn is_block(self) -> bool {
        matches!(
            self,
            InvType::Block
                | InvType::WitnessBlock
                | InvType::FilteredBlock
                | InvType::WitnessFilteredBlock
                | InvType::CmpctBlock
        )
    }

    pub fn has_witness(self) -> bool {
        self.to_u32() & WITNESS_FLAG != 0
    }
}

impl fmt::Display for InvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvType::Error => write!(f, "error"),
            InvType::Tx => write!(f, "tx"),
            InvType::Block => write!(f, "block"),
            InvType::FilteredBlock => write!(f, "filtered block"),
            InvType::CmpctBlock => write!(f, "cmpctblock"),
            InvType::WitnessTx => write!(f, "witness tx"),
            InvType::WitnessBlock => write!(f, "witness block"),
            InvType::WitnessFilteredBlock => write!(f, "witness filtered block"),
            InvType::Unknown(value) => write!(f, "unknown({})", value),
        }
    }
}

/// A (type, hash) inventory vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub const SIZE: usize = 36;

    pub fn new(kind: InvType, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InvType::Block, hash)
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InvType::Tx, hash)
    }

    pub fn is_tx(&self) -> bool {
        self.kind.is_tx()
    }

    pub fn is_block(&self) -> bool {
        self.kind.is_block()
    }

    pub fn has_witness(&self) -> bool {
        self.kind.has_witness()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.kind.to_u32());
        write_hash(buf, &self.hash);
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            kind: InvType::from_u32(reader.read_u32()?),
            hash: reader.read_hash()?,
        })
    }
}

// =============================================================================
// Reject Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Other(u8),
}

impl RejectCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(value) => value,
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectCode::Malformed => write!(f, "malformed"),
            RejectCode::Invalid => write!(f, "invalid"),
            RejectCode::Obsolete => write!(f, "obsolete"),
            RejectCode::Duplicate => write!(f, "duplicate"),
            RejectCode::Nonstandard => write!(f, "nonstandard"),
            RejectCode::Dust => write!(f, "dust"),
            RejectCode::InsufficientFee => write!(f, "insufficientfee"),
            RejectCode::Checkpoint => write!(f, "checkpoint"),
            RejectCode::Other(value) => write!(f, "{:#04x}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inv_type_values() {
        for value in [0, 1, 2, 3, 4, 1 | WITNESS_FLAG, 2 | WITNESS_FLAG, 3 | WITNESS_FLAG, 99] {
            assert_eq!(InvType::from_u32(value).to_u32(), value);
        }
        assert!(InvType::WitnessBlock.is_block());
        assert!(InvType::WitnessBlock.has_witness());
        assert!(InvType::CmpctBlock.is_block());
        assert!(!InvType::Tx.has_witness());
        assert!(!InvType::Unknown(7).is_tx());
    }

    #[test]
    fn test_reject_codes() {
        for value in [0x01, 0x10, 0x11, 0x12, 0x40, 0x41, 0x42, 0x43, 0x99] {
            assert_eq!(RejectCode::from_u8(value).to_u8(), value);
        }
        assert_eq!(RejectCode::Invalid.to_string(), "invalid");
    }

    #[test]
    fn test_unknown_service_bits_survive() {
        let services = Services::from_bits_retain(1 << 10 | 1);
        assert!(services.contains(Services::NETWORK));
        assert_eq!(services.bits(), 1 << 10 | 1);
    }
}
