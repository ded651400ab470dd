//! Merkle root computation and partial merkle trees
//!
//! `merkle_root` follows the Bitcoin rule of pairing an odd trailing node
//! with itself. `PartialTree` is the BIP37 proof carried by `merkleblock`.

use super::hash::{double_sha256, Hash256};
use thiserror::Error;

/// Errors produced while walking a partial merkle tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Empty transaction set")]
    Empty,
    #[error("Too many hashes in partial tree")]
    TooManyHashes,
    #[error("Partial tree ran out of {0}")]
    Exhausted(&'static str),
    #[error("Partial tree has unused {0}")]
    Unused(&'static str),
    #[error("Duplicate subtree hash")]
    Mutated,
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    Hash256::new(double_sha256(&data))
}

/// Calculate the merkle root from a list of leaf hashes
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return Hash256::ZERO;
    }

    let mut level: Vec<Hash256> = hashes.to_vec();

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!(),
            })
            .collect();
    }

    level[0]
}

/// BIP37 partial merkle tree: a depth-first list of hashes plus flag bits
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialTree {
    pub total: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

/// Result of extracting a partial tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMatches {
    pub root: Hash256,
    pub matches: Vec<Hash256>,
    pub indexes: Vec<u32>,
}

fn tree_width(total: u32, height: u32) -> u32 {
    (total + (1 << height) - 1) >> height
}

fn tree_height(total: u32) -> u32 {
    let mut height = 0;
    while tree_width(total, height) > 1 {
        height += 1;
    }
    height
}

fn subtree_hash(leaves: &[Hash256], height: u32, pos: u32) -> Hash256 {
    if height == 0 {
        return leaves[pos as usize];
    }
    let total = leaves.len() as u32;
    let left = subtree_hash(leaves, height - 1, pos * 2);
    let right = if pos * 2 + 1 < tree_width(total, height - 1) {
        subtree_hash(leaves, height - 1, pos * 2 + 1)
    } else {
        left
    };
    hash_pair(&left, &right)
}

impl PartialTree {
    /// Build a proof for the leaves whose `matched` flag is set
    pub fn build(leaves: &[Hash256], matched: &[bool]) -> Self {
        let total = leaves.len() as u32;
        let mut bits = Vec::new();
        let mut hashes = Vec::new();

        if total > 0 {
            let height = tree_height(total);
            Self::traverse_build(leaves, matched, height, 0, &mut bits, &mut hashes);
        }

        let mut flags = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }

        Self {
            total,
            hashes,
            flags,
        }
    }

    fn traverse_build(
        leaves: &[Hash256],
        matched: &[bool],
        height: u32,
        pos: u32,
        bits: &mut Vec<bool>,
        hashes: &mut Vec<Hash256>,
    ) {
        let start = (pos << height) as usize;
        let end = (((pos + 1) << height) as usize).min(leaves.len());
        let parent = matched[start..end].iter().any(|m| *m);
        bits.push(parent);

        if height == 0 || !parent {
            hashes.push(subtree_hash(leaves, height, pos));
            return;
        }

        Self::traverse_build(leaves, matched, height - 1, pos * 2, bits, hashes);
        if pos * 2 + 1 < tree_width(leaves.len() as u32, height - 1) {
            Self::traverse_build(leaves, matched, height - 1, pos * 2 + 1, bits, hashes);
        }
    }

    /// Walk the tree, returning the computed root and matched leaves
    pub fn extract(&self) -> Result<TreeMatches, MerkleError> {
        if self.total == 0 {
            return Err(MerkleError::Empty);
        }
        if self.hashes.len() as u32 > self.total {
            return Err(MerkleError::TooManyHashes);
        }
        if self.flags.len() * 8 < self.hashes.len() {
            return Err(MerkleError::Exhausted("bits"));
        }

        let height = tree_height(self.total);
        let mut walker = Walker {
            tree: self,
            bit: 0,
            hash: 0,
            matches: Vec::new(),
            indexes: Vec::new(),
        };
        let root = walker.traverse(height, 0)?;

        if walker.hash != self.hashes.len() {
            return Err(MerkleError::Unused("hashes"));
        }
        if walker.bit.div_ceil(8) != self.flags.len() {
            return Err(MerkleError::Unused("bits"));
        }

        Ok(TreeMatches {
            root,
            matches: walker.matches,
            indexes: walker.indexes,
        })
    }
}

struct Walker<'a> {
    tree: &'a PartialTree,
    bit: usize,
    hash: usize,
    matches: Vec<Hash256>,
    indexes: Vec<u32>,
}

impl Walker<'_> {
    fn next_bit(&mut self) -> Result<bool, MerkleError> {
        let byte = self
            .tree
            .flags
            .get(self.bit / 8)
            .ok_or(MerkleError::Exhausted("bits"))?;
        let bit = (byte >> (self.bit % 8)) & 1 == 1;
        self.bit += 1;
        Ok(bit)
    }

    fn next_hash(&mut self) -> Result<Hash256, MerkleError> {
        let hash = *self
            .tree
            .hashes
            .get(self.hash)
            .ok_or(MerkleError::Exhausted("hashes"))?;
        self.hash += 1;
        Ok(hash)
    }

    fn traverse(&mut self, height: u32, pos: u32) -> Result<Hash256, MerkleError> {
        let parent = self.next_bit()?;

        if height == 0 || !parent {
            let hash = self.next_hash()?;
            if height == 0 && parent {
                self.matches.push(hash);
                self.indexes.push(pos);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, pos * 2)?;
        let right = if pos * 2 + 1 < tree_width(self.tree.total, height - 1) {
            let right = self.traverse(height - 1, pos * 2 + 1)?;
            if right == left {
                return Err(MerkleError::Mutated);
            }
            right
        } else {
            left
        };

        Ok(hash_pair(&left, &right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash256> {
        (0..n).map(|i| Hash256::new([i + 1; 32])).collect()
    }

    #[test]
    fn test_single_leaf_root() {
        let hashes = leaves(1);
        assert_eq!(merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_odd_leaf_is_duplicated() {
        let hashes = leaves(3);
        let left = hash_pair(&hashes[0], &hashes[1]);
        let right = hash_pair(&hashes[2], &hashes[2]);
        assert_eq!(merkle_root(&hashes), hash_pair(&left, &right));
    }

    #[test]
    fn test_partial_tree_extracts_matches() {
        let hashes = leaves(7);
        let matched = [false, true, false, false, true, false, false];
        let tree = PartialTree::build(&hashes, &matched);
        let result = tree.extract().unwrap();

        assert_eq!(result.root, merkle_root(&hashes));
        assert_eq!(result.matches, vec![hashes[1], hashes[4]]);
        assert_eq!(result.indexes, vec![1, 4]);
    }

    #[test]
    fn test_partial_tree_no_matches() {
        let hashes = leaves(4);
        let tree = PartialTree::build(&hashes, &[false; 4]);
        let result = tree.extract().unwrap();
        assert_eq!(result.root, merkle_root(&hashes));
        assert!(result.matches.is_empty());
        assert_eq!(tree.hashes.len(), 1);
    }

    #[test]
    fn test_truncated_tree_fails() {
        let hashes = leaves(5);
        let mut tree = PartialTree::build(&hashes, &[true; 5]);
        tree.hashes.pop();
        assert!(tree.extract().is_err());
    }
}
