//! Core data structures carried over the wire
//!
//! This module contains:
//! - Block headers with compact-target proof of work
//! - Segwit-aware transactions
//! - Full and filtered (merkle) blocks
//! - Per-network parameters and checkpoints

pub mod block;
pub mod header;
pub mod params;
pub mod transaction;

pub use block::{Block, MerkleBlock, MAX_BLOCK_SIZE, MAX_BLOCK_WEIGHT};
pub use header::{target_from_bits, BlockHeader, HEADER_SIZE};
pub use params::{Checkpoint, Network, NetworkType};
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput, SEQUENCE_FINAL};
