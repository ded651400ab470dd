//! Full blocks and BIP37 filtered (merkle) blocks

use crate::core::header::{BlockHeader, HEADER_SIZE};
use crate::core::transaction::Transaction;
use crate::crypto::{merkle_root, Hash256, PartialTree, TreeMatches};
use crate::wire::encoding::{
    var_bytes_size, varint_size, write_hash, write_var_bytes, write_varint, Reader, WireError,
};
use bytes::BufMut;
use std::collections::HashSet;

// =============================================================================
// Constants
// =============================================================================

/// Maximum base block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum block weight
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Upper bound on transactions decoded from one block
const MAX_BLOCK_TXS: usize = MAX_BLOCK_WEIGHT / 60;

// =============================================================================
// Block
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, txs: Vec<Transaction>) -> Self {
        Self { header, txs }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn has_witness(&self) -> bool {
        self.txs.iter().any(Transaction::has_witness)
    }

    /// Merkle root over the txids of the block's transactions
    pub fn compute_merkle_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.txs.iter().map(Transaction::txid).collect();
        merkle_root(&hashes)
    }

    pub fn size(&self, witness: bool) -> usize {
        HEADER_SIZE
            + varint_size(self.txs.len() as u64)
            + self.txs.iter().map(|tx| tx.size(witness)).sum::<usize>()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        self.header.encode(buf);
        write_varint(buf, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(buf, witness);
        }
    }

    pub fn to_bytes(&self, witness: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size(witness));
        self.encode(&mut buf, witness);
        buf
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let header = BlockHeader::decode(reader)?;
        let count = reader.read_count(MAX_BLOCK_TXS, "block txs")?;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(Transaction::decode(reader)?);
        }
        Ok(Self { header, txs })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let block = Self::decode(&mut reader)?;
        if reader.left() != 0 {
            return Err(WireError::Trailing("block"));
        }
        Ok(block)
    }
}

// =============================================================================
// Merkle Block
// =============================================================================

/// Header plus a partial merkle tree proving a subset of transactions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub tree: PartialTree,
}

impl MerkleBlock {
    /// Build a filtered block proving the transactions in `matches`
    pub fn from_block(block: &Block, matches: &HashSet<Hash256>) -> Self {
        let hashes: Vec<Hash256> = block.txs.iter().map(Transaction::txid).collect();
        let flags: Vec<bool> = hashes.iter().map(|h| matches.contains(h)).collect();
        Self {
            header: block.header,
            tree: PartialTree::build(&hashes, &flags),
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Walk the tree and check it against the header's merkle root
    pub fn matches(&self) -> Option<TreeMatches> {
        let tree = self.tree.extract().ok()?;
        if tree.root != self.header.merkle_root {
            return None;
        }
        Some(tree)
    }

    /// Proof of work plus a consistent partial tree
    pub fn verify(&self) -> bool {
        self.header.verify_pow() && self.matches().is_some()
    }

    pub fn size(&self) -> usize {
        HEADER_SIZE
            + 4
            + varint_size(self.tree.hashes.len() as u64)
            + 32 * self.tree.hashes.len()
            + var_bytes_size(self.tree.flags.len())
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        buf.put_u32_le(self.tree.total);
        write_varint(buf, self.tree.hashes.len() as u64);
        for hash in &self.tree.hashes {
            write_hash(buf, hash);
        }
        write_var_bytes(buf, &self.tree.flags);
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let header = BlockHeader::decode(reader)?;
        let total = reader.read_u32()?;
        let count = reader.read_count(MAX_BLOCK_TXS, "merkle hashes")?;
        let mut hashes = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            hashes.push(reader.read_hash()?);
        }
        let flags = reader
            .read_var_bytes(MAX_BLOCK_TXS, "merkle flags")?
            .to_vec();
        Ok(Self {
            header,
            tree: PartialTree {
                total,
                hashes,
                flags,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::header::tests::mine;
    use crate::core::transaction::tests::spend;

    /// Mined regtest block on top of `prev` with a coinbase and `n` spends
    pub fn make_block(prev: Hash256, tag: u32, n: usize, witness: bool) -> Block {
        let mut txs = vec![Transaction::coinbase(&tag.to_le_bytes(), 50)];
        for i in 0..n {
            let mut seed = [0u8; 32];
            seed[..4].copy_from_slice(&tag.to_le_bytes());
            seed[4..8].copy_from_slice(&(i as u32).to_le_bytes());
            txs.push(spend(Hash256::new(seed), i as u32, witness));
        }
        let mut block = Block::new(
            BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: Hash256::ZERO,
                time: 1_600_000_000 + tag,
                bits: 0x207fffff,
                nonce: 0,
            },
            txs,
        );
        block.header.merkle_root = block.compute_merkle_root();
        block.header = mine(block.header);
        block
    }

    #[test]
    fn test_block_roundtrip() {
        let block = make_block(Hash256::ZERO, 1, 3, true);
        let raw = block.to_bytes(true);
        assert_eq!(raw.len(), block.size(true));
        assert_eq!(Block::from_bytes(&raw).unwrap(), block);

        let stripped = Block::from_bytes(&block.to_bytes(false)).unwrap();
        assert_eq!(stripped.hash(), block.hash());
        assert!(!stripped.has_witness());
    }

    #[test]
    fn test_merkle_block_matches() {
        let block = make_block(Hash256::ZERO, 2, 5, false);
        let wanted: HashSet<Hash256> = [block.txs[2].txid(), block.txs[4].txid()]
            .into_iter()
            .collect();
        let merkle = MerkleBlock::from_block(&block, &wanted);
        assert!(merkle.verify());

        let tree = merkle.matches().unwrap();
        assert_eq!(tree.matches, vec![block.txs[2].txid(), block.txs[4].txid()]);

        let mut raw = Vec::new();
        merkle.encode(&mut raw);
        assert_eq!(raw.len(), merkle.size());
        assert_eq!(MerkleBlock::decode(&mut Reader::new(&raw)).unwrap(), merkle);
    }

    #[test]
    fn test_merkle_block_wrong_root() {
        let block = make_block(Hash256::ZERO, 3, 2, false);
        let mut merkle = MerkleBlock::from_block(&block, &HashSet::new());
        merkle.header.merkle_root = Hash256::new([0xab; 32]);
        assert!(merkle.matches().is_none());
    }
}
