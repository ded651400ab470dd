//! Compact block reconstruction
//!
//! A compact block carries the header, a per-block nonce, 48-bit short IDs for
//! most transactions and a few prefilled transactions (always the coinbase
//! when we build one). The receiver matches short IDs against its own mempool
//! and asks only for what is still missing.

use super::request::{TxRequest, TxResponse};
use crate::core::{Block, BlockHeader, Transaction, MAX_BLOCK_SIZE, HEADER_SIZE};
use crate::crypto::{Hash256, SipKey};
use crate::wire::encoding::{varint_size, write_varint, Reader, WireError};
use bytes::BufMut;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Largest prefilled index representable on the wire
const MAX_PREFILLED_INDEX: usize = 0xffff;

/// Smallest plausible transaction (version, one input, one output, locktime)
const MIN_TX_SIZE: usize = 60;

/// Smallest plausible block header plus tx count
const MIN_HEADER_SIZE: usize = HEADER_SIZE + 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactError {
    #[error("Empty vectors")]
    Empty,
    #[error("Compact block too big ({0} transactions)")]
    TooBig(usize),
    #[error("Prefilled index out of range ({0})")]
    PrefilledOutOfRange(usize),
    #[error("Compact block is missing transactions")]
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub key_nonce: u64,
    /// Short IDs of the transactions not sent in full, in block order
    pub ids: Vec<u64>,
    /// Prefilled transactions with differential indexes
    pub prefilled: Vec<(usize, Transaction)>,
    sip_key: SipKey,
    /// Reconstruction slots, populated by `init`
    available: Vec<Option<Transaction>>,
    id_map: HashMap<u64, usize>,
    count: usize,
    total_tx: usize,
}

impl CompactBlock {
    pub fn new(
        header: BlockHeader,
        key_nonce: u64,
        ids: Vec<u64>,
        prefilled: Vec<(usize, Transaction)>,
    ) -> Self {
        let sip_key = SipKey::derive(&header.to_bytes(), key_nonce);
        Self {
            header,
            key_nonce,
            ids,
            prefilled,
            sip_key,
            ..Self::default()
        }
    }

    /// Build a compact block for relay; the coinbase is always prefilled
    pub fn from_block(block: &Block, witness: bool, nonce: Option<u64>) -> Self {
        let nonce = nonce.unwrap_or_else(rand::random);
        let mut compact = Self::new(block.header, nonce, Vec::new(), Vec::new());

        for (i, tx) in block.txs.iter().enumerate() {
            if i == 0 {
                compact.prefilled.push((0, tx.clone()));
                continue;
            }
            let hash = if witness { tx.wtxid() } else { tx.txid() };
            compact.ids.push(compact.sid(&hash));
        }

        compact
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Short ID of a transaction hash under this block's key
    pub fn sid(&self, hash: &Hash256) -> u64 {
        self.sip_key.short_id(hash)
    }

    pub fn has_witness(&self) -> bool {
        self.prefilled.iter().any(|(_, tx)| tx.has_witness())
    }

    pub fn total_tx(&self) -> usize {
        self.total_tx
    }

    pub fn is_complete(&self) -> bool {
        self.total_tx > 0 && self.count == self.total_tx
    }

    // =========================================================================
    // Reconstruction
    // =========================================================================

    /// Lay out the reconstruction slots.
    ///
    /// Returns `Ok(false)` when two short IDs collide; the caller must then
    /// fall back to requesting the full block.
    pub fn init(&mut self) -> Result<bool, CompactError> {
        let total = self.ids.len() + self.prefilled.len();

        if total == 0 {
            return Err(CompactError::Empty);
        }

        if total > MAX_BLOCK_SIZE / 10 {
            return Err(CompactError::TooBig(total));
        }

        if total > (MAX_BLOCK_SIZE - MIN_HEADER_SIZE) / MIN_TX_SIZE {
            return Err(CompactError::TooBig(total));
        }

        self.total_tx = total;
        self.available = vec![None; total];
        self.id_map.clear();
        self.count = 0;

        let mut last: isize = -1;
        for (i, (delta, tx)) in self.prefilled.iter().enumerate() {
            let index = (last + *delta as isize + 1) as usize;
            if index > MAX_PREFILLED_INDEX || index > self.ids.len() + i {
                return Err(CompactError::PrefilledOutOfRange(index));
            }
            last = index as isize;
            self.available[index] = Some(tx.clone());
            self.count += 1;
        }

        let mut offset = 0;
        for (i, id) in self.ids.iter().enumerate() {
            while self.available[i + offset].is_some() {
                offset += 1;
            }

            if self.id_map.contains_key(id) {
                return Ok(false);
            }

            self.id_map.insert(*id, i + offset);
        }

        Ok(true)
    }

    /// Fill slots from local mempool transactions.
    ///
    /// Returns true once every slot is resolved. Stops scanning as soon as
    /// that happens, even if a later transaction would collide.
    pub fn fill_mempool<'a, I>(&mut self, witness: bool, txs: I) -> bool
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        if self.count == self.total_tx {
            return true;
        }

        let mut seen = HashSet::new();

        for tx in txs {
            let hash = if witness { tx.wtxid() } else { tx.txid() };
            let id = self.sid(&hash);

            let Some(&index) = self.id_map.get(&id) else {
                continue;
            };

            if !seen.insert(index) {
                // Two pool transactions share this short ID; leave the slot
                // for the peer to fill.
                if self.available[index].take().is_some() {
                    self.count -= 1;
                }
                continue;
            }

            if self.available[index].is_some() {
                continue;
            }

            self.available[index] = Some(tx.clone());
            self.count += 1;

            if self.count == self.total_tx {
                return true;
            }
        }

        false
    }

    /// Fill the remaining gaps, in order, from a `blocktxn` response
    pub fn fill_missing(&mut self, res: &TxResponse) -> bool {
        let mut offset = 0;

        for slot in self.available.iter_mut() {
            if slot.is_some() {
                continue;
            }

            let Some(tx) = res.txs.get(offset) else {
                return false;
            };

            *slot = Some(tx.clone());
            offset += 1;
            self.count += 1;
        }

        offset == res.txs.len()
    }

    /// Request for every slot still empty
    pub fn to_request(&self) -> TxRequest {
        let indexes = self
            .available
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect();
        TxRequest::new(self.hash(), indexes)
    }

    pub fn to_block(&self) -> Result<Block, CompactError> {
        let txs = self
            .available
            .iter()
            .map(|slot| slot.clone().ok_or(CompactError::Incomplete))
            .collect::<Result<Vec<_>, _>>()?;
        if txs.is_empty() {
            return Err(CompactError::Incomplete);
        }
        Ok(Block::new(self.header, txs))
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    pub fn size(&self, witness: bool) -> usize {
        HEADER_SIZE
            + 8
            + varint_size(self.ids.len() as u64)
            + 6 * self.ids.len()
            + varint_size(self.prefilled.len() as u64)
            + self
                .prefilled
                .iter()
                .map(|(delta, tx)| varint_size(*delta as u64) + tx.size(witness))
                .sum::<usize>()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        self.header.encode(buf);
        buf.put_u64_le(self.key_nonce);

        write_varint(buf, self.ids.len() as u64);
        for id in &self.ids {
            buf.put_u32_le((*id & 0xffff_ffff) as u32);
            buf.put_u16_le(((*id >> 32) & 0xffff) as u16);
        }

        write_varint(buf, self.prefilled.len() as u64);
        for (delta, tx) in &self.prefilled {
            write_varint(buf, *delta as u64);
            tx.encode(buf, witness);
        }
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let header = BlockHeader::decode(reader)?;
        let key_nonce = reader.read_u64()?;

        let id_count = reader.read_count(MAX_BLOCK_SIZE / 10, "short ids")?;
        let mut ids = Vec::with_capacity(id_count.min(4096));
        for _ in 0..id_count {
            let lo = reader.read_u32()? as u64;
            let hi = reader.read_u16()? as u64;
            ids.push((hi << 32) | lo);
        }

        let tx_count = reader.read_count(MAX_BLOCK_SIZE / 10, "prefilled txs")?;
        let mut prefilled = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            let delta = reader.read_varint()?;
            if delta > MAX_PREFILLED_INDEX as u64 {
                return Err(WireError::TooLarge("prefilled index", delta));
            }
            prefilled.push((delta as usize, Transaction::decode(reader)?));
        }

        Ok(Self::new(header, key_nonce, ids, prefilled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::make_block;

    fn reencode(compact: &CompactBlock) -> CompactBlock {
        let mut buf = Vec::new();
        compact.encode(&mut buf, true);
        assert_eq!(buf.len(), compact.size(true));
        CompactBlock::decode(&mut Reader::new(&buf)).unwrap()
    }

    #[test]
    fn test_fill_mempool_rebuilds_block() {
        let block = make_block(Hash256::ZERO, 11, 6, true);
        let mut compact = reencode(&CompactBlock::from_block(&block, true, Some(77)));

        assert!(compact.init().unwrap());
        assert_eq!(compact.total_tx(), 7);
        assert!(!compact.is_complete());

        // Mempool holds every non-coinbase tx, in reverse order plus noise.
        let mut pool: Vec<Transaction> = block.txs[1..].iter().rev().cloned().collect();
        pool.push(make_block(Hash256::ZERO, 12, 1, false).txs[1].clone());

        assert!(compact.fill_mempool(true, &pool));
        let rebuilt = compact.to_block().unwrap();
        assert_eq!(rebuilt.to_bytes(true), block.to_bytes(true));
    }

    #[test]
    fn test_request_then_fill_missing() {
        let block = make_block(Hash256::ZERO, 13, 5, false);
        let mut compact = CompactBlock::from_block(&block, false, Some(1));
        assert!(compact.init().unwrap());

        let partial = vec![block.txs[2].clone(), block.txs[4].clone()];
        assert!(!compact.fill_mempool(false, &partial));

        let req = compact.to_request();
        assert_eq!(req.indexes, vec![1, 3, 5]);

        let res = TxResponse::from_block(&block, &req);
        assert!(compact.fill_missing(&res));
        assert!(compact.is_complete());
        assert_eq!(compact.to_block().unwrap(), block);
    }

    #[test]
    fn test_fill_missing_wrong_count() {
        let block = make_block(Hash256::ZERO, 14, 3, false);

        let mut short = CompactBlock::from_block(&block, false, Some(2));
        short.init().unwrap();
        let mut res = TxResponse::from_block(&block, &short.to_request());
        res.txs.pop();
        assert!(!short.fill_missing(&res));

        let mut long = CompactBlock::from_block(&block, false, Some(2));
        long.init().unwrap();
        let mut res = TxResponse::from_block(&block, &long.to_request());
        res.txs.push(block.txs[0].clone());
        assert!(!long.fill_missing(&res));
    }

    #[test]
    fn test_duplicate_short_id_fails_init() {
        let block = make_block(Hash256::ZERO, 15, 3, false);
        let mut compact = CompactBlock::from_block(&block, false, Some(3));
        compact.ids[2] = compact.ids[0];
        assert_eq!(compact.init(), Ok(false));
    }

    #[test]
    fn test_mempool_collision_leaves_slot_empty() {
        let block = make_block(Hash256::ZERO, 16, 2, false);
        let mut compact = CompactBlock::from_block(&block, false, Some(4));
        assert!(compact.init().unwrap());

        // The same short ID offered twice counts as a collision.
        let tx = block.txs[1].clone();
        let pool = vec![tx.clone(), tx];
        assert!(!compact.fill_mempool(false, &pool));
        assert_eq!(compact.to_request().indexes, vec![1, 2]);
    }

    #[test]
    fn test_size_limits() {
        let mut empty = CompactBlock::default();
        assert_eq!(empty.init(), Err(CompactError::Empty));

        let mut huge = CompactBlock::new(
            BlockHeader::default(),
            0,
            (0..(MAX_BLOCK_SIZE / 10) as u64 + 1).collect(),
            Vec::new(),
        );
        assert!(matches!(huge.init(), Err(CompactError::TooBig(_))));

        let mut hashdos = CompactBlock::new(
            BlockHeader::default(),
            0,
            (0..((MAX_BLOCK_SIZE - 81) / 60) as u64 + 1).collect(),
            Vec::new(),
        );
        assert!(matches!(hashdos.init(), Err(CompactError::TooBig(_))));
    }

    #[test]
    fn test_prefilled_out_of_range() {
        let block = make_block(Hash256::ZERO, 17, 1, false);
        let mut compact = CompactBlock::from_block(&block, false, Some(5));
        compact.prefilled[0].0 = 5;
        assert!(matches!(
            compact.init(),
            Err(CompactError::PrefilledOutOfRange(5))
        ));
    }
}
