//! `getblocktxn` / `blocktxn` payloads

use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use crate::wire::encoding::{varint_size, write_hash, write_varint, Reader, WireError};
use bytes::BufMut;

/// Indexes are carried as u16-sized differentials
const MAX_INDEX: u64 = 0xffff;

/// Request for the transactions at `indexes` (ascending, absolute)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxRequest {
    pub hash: Hash256,
    pub indexes: Vec<usize>,
}

impl TxRequest {
    pub fn new(hash: Hash256, indexes: Vec<usize>) -> Self {
        Self { hash, indexes }
    }

    /// Differential form: first index absolute, then gaps minus one
    fn deltas(&self) -> impl Iterator<Item = u64> + '_ {
        self.indexes.iter().enumerate().map(|(i, index)| {
            if i == 0 {
                *index as u64
            } else {
                (*index - (self.indexes[i - 1] + 1)) as u64
            }
        })
    }

    pub fn size(&self) -> usize {
        32 + varint_size(self.indexes.len() as u64) + self.deltas().map(varint_size).sum::<usize>()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        write_hash(buf, &self.hash);
        write_varint(buf, self.indexes.len() as u64);
        for delta in self.deltas() {
            write_varint(buf, delta);
        }
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let hash = reader.read_hash()?;
        let count = reader.read_count(MAX_INDEX as usize + 1, "blocktxn indexes")?;

        let mut indexes = Vec::with_capacity(count);
        let mut offset: u64 = 0;
        for _ in 0..count {
            let delta = reader.read_varint()?;
            if delta > MAX_INDEX {
                return Err(WireError::TooLarge("blocktxn index", delta));
            }
            let index = delta + offset;
            if index > MAX_INDEX {
                return Err(WireError::TooLarge("blocktxn index", index));
            }
            indexes.push(index as usize);
            offset = index + 1;
        }

        Ok(Self { hash, indexes })
    }
}

/// Transactions answering a [`TxRequest`], in request order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxResponse {
    pub hash: Hash256,
    pub txs: Vec<Transaction>,
}

impl TxResponse {
    /// Collect the requested transactions, stopping at the first index past
    /// the end of the block.
    pub fn from_block(block: &Block, req: &TxRequest) -> Self {
        let txs = req
            .indexes
            .iter()
            .map_while(|index| block.txs.get(*index).cloned())
            .collect();
        Self {
            hash: req.hash,
            txs,
        }
    }

    pub fn has_witness(&self) -> bool {
        self.txs.iter().any(Transaction::has_witness)
    }

    pub fn size(&self, witness: bool) -> usize {
        32 + varint_size(self.txs.len() as u64)
            + self.txs.iter().map(|tx| tx.size(witness)).sum::<usize>()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        write_hash(buf, &self.hash);
        write_varint(buf, self.txs.len() as u64);
        for tx in &self.txs {
            tx.encode(buf, witness);
        }
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let hash = reader.read_hash()?;
        let count = reader.read_count(MAX_INDEX as usize + 1, "blocktxn txs")?;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(Transaction::decode(reader)?);
        }
        Ok(Self { hash, txs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::make_block;

    #[test]
    fn test_request_delta_encoding() {
        let req = TxRequest::new(Hash256::new([9; 32]), vec![2, 5, 9]);
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(buf.len(), req.size());
        // count, then 2, 5-3, 9-6
        assert_eq!(&buf[32..], &[3, 2, 2, 3]);
        assert_eq!(TxRequest::decode(&mut Reader::new(&buf)).unwrap(), req);
    }

    #[test]
    fn test_request_index_overflow() {
        let mut buf = Vec::new();
        write_hash(&mut buf, &Hash256::ZERO);
        write_varint(&mut buf, 2);
        write_varint(&mut buf, 0xffff);
        write_varint(&mut buf, 0);
        assert!(matches!(
            TxRequest::decode(&mut Reader::new(&buf)),
            Err(WireError::TooLarge("blocktxn index", 0x10000))
        ));
    }

    #[test]
    fn test_response_stops_at_block_end() {
        let block = make_block(Hash256::ZERO, 21, 3, true);
        let req = TxRequest::new(block.hash(), vec![1, 3, 7, 2]);
        let res = TxResponse::from_block(&block, &req);
        assert_eq!(res.txs, vec![block.txs[1].clone(), block.txs[3].clone()]);

        let mut buf = Vec::new();
        res.encode(&mut buf, true);
        assert_eq!(buf.len(), res.size(true));
        assert_eq!(TxResponse::decode(&mut Reader::new(&buf)).unwrap(), res);
    }
}
