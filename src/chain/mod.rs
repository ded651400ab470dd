//! Chain and mempool collaborators
//!
//! The networking engine never validates consensus rules itself. It talks to
//! a block chain and a transaction pool through the two traits below;
//! `memory.rs` provides in-memory implementations used by the binary and the
//! tests.

pub mod memory;

use crate::core::{Block, BlockHeader, Transaction};
use crate::crypto::Hash256;
use crate::wire::types::RejectCode;
use bitflags::bitflags;
use thiserror::Error;

pub use memory::{MemoryChain, MemoryMempool};

// =============================================================================
// Errors
// =============================================================================

/// A block or transaction failed verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Verification failure: {reason} (code={code} score={score} hash={hash})")]
pub struct VerifyError {
    pub code: RejectCode,
    pub reason: String,
    /// Ban score to apply to the peer that relayed the item
    pub score: u32,
    pub hash: Hash256,
}

impl VerifyError {
    pub fn new(hash: Hash256, code: RejectCode, reason: &str, score: u32) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            score,
            hash,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("Chain error: {0}")]
    Internal(String),
}

// =============================================================================
// Chain
// =============================================================================

bitflags! {
    /// Verification performed by `Chain::add`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        const VERIFY_POW = 1 << 0;
        const VERIFY_BODY = 1 << 1;
        const DEFAULT = Self::VERIFY_POW.bits() | Self::VERIFY_BODY.bits();
    }
}

/// A block's position in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: Hash256,
    pub height: u32,
    pub header: BlockHeader,
}

pub trait Chain: Send + Sync {
    fn height(&self) -> u32;

    fn tip(&self) -> ChainEntry;

    /// True once the tip is recent enough to relay and serve
    fn synced(&self) -> bool;

    /// Block locator starting at `start` (the tip when `None`)
    fn get_locator(&self, start: Option<Hash256>) -> Vec<Hash256>;

    /// Connect a block. `Ok(None)` means it was stored as an orphan.
    fn add(
        &self,
        block: Block,
        flags: BlockFlags,
        peer: Option<u64>,
    ) -> Result<Option<ChainEntry>, ChainError>;

    /// Known block (main chain, side chain or orphan)
    fn has(&self, hash: &Hash256) -> bool;

    fn get_entry(&self, hash: &Hash256) -> Option<ChainEntry>;

    fn get_entry_by_height(&self, height: u32) -> Option<ChainEntry>;

    fn is_main_chain(&self, entry: &ChainEntry) -> bool;

    fn get_block(&self, hash: &Hash256) -> Option<Block>;

    fn get_raw_block(&self, hash: &Hash256, witness: bool) -> Option<Vec<u8>> {
        self.get_block(hash).map(|block| block.to_bytes(witness))
    }

    fn get_next_hash(&self, hash: &Hash256) -> Option<Hash256>;

    fn get_next(&self, entry: &ChainEntry) -> Option<ChainEntry> {
        self.get_next_hash(&entry.hash)
            .and_then(|hash| self.get_entry(&hash))
    }

    /// Most recent locator hash on our main chain (genesis if none match)
    fn find_locator(&self, locator: &[Hash256]) -> Hash256;

    fn has_orphan(&self, hash: &Hash256) -> bool;

    /// Earliest known ancestor of an orphan chain
    fn get_orphan_root(&self, hash: &Hash256) -> Option<Hash256>;
}

// =============================================================================
// Mempool
// =============================================================================

pub trait Mempool: Send + Sync {
    /// Accept a transaction, returning the parent hashes it is missing
    fn add_tx(&self, tx: Transaction, peer: Option<u64>) -> Result<Vec<Hash256>, ChainError>;

    fn get_tx(&self, hash: &Hash256) -> Option<Transaction>;

    fn has(&self, hash: &Hash256) -> bool;

    /// Recently rejected
    fn has_reject(&self, hash: &Hash256) -> bool;

    fn transactions(&self) -> Vec<Transaction>;

    /// Fee rate (per kB) of a pooled transaction
    fn fee_rate(&self, hash: &Hash256) -> Option<i64>;
}
