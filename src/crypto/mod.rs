//! Cryptographic utilities for the wire protocol
//!
//! This module provides:
//! - SHA-256 and double SHA-256 hashing
//! - SipHash-2-4 short transaction IDs
//! - Merkle roots and BIP37 partial merkle trees

pub mod hash;
pub mod merkle;
pub mod siphash;

pub use hash::{checksum, double_sha256, hash256, sha256, Hash256, HashError};
pub use merkle::{merkle_root, MerkleError, PartialTree, TreeMatches};
pub use siphash::{SipKey, SHORT_ID_MASK};
