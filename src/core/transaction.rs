//! Transaction wire format
//!
//! Transactions are carried opaquely: the networking layer needs their
//! identifiers and an exact byte encoding (with or without witness data),
//! never their script semantics.

use crate::crypto::{hash256, Hash256};
use crate::wire::encoding::{
    var_bytes_size, varint_size, write_hash, write_var_bytes, write_varint, Reader, WireError,
};
use bytes::BufMut;

// =============================================================================
// Constants
// =============================================================================

/// Hard cap on inputs/outputs decoded from a single transaction
const MAX_TX_ITEMS: usize = 100_000;

/// Hard cap on a single script or witness item
const MAX_SCRIPT_SIZE: usize = 1_000_000;

/// Hard cap on items in one witness stack
const MAX_WITNESS_ITEMS: usize = 100_000;

pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

// =============================================================================
// Inputs and Outputs
// =============================================================================

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn null() -> Self {
        Self {
            hash: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxInput {
    pub prevout: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxOutput {
    pub value: i64,
    pub script: Vec<u8>,
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    /// Whether any input carries witness data
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Transaction ID (hash of the encoding without witness)
    pub fn txid(&self) -> Hash256 {
        hash256(&self.to_bytes(false))
    }

    /// Witness transaction ID; equals the txid for non-witness transactions
    pub fn wtxid(&self) -> Hash256 {
        if !self.has_witness() {
            return self.txid();
        }
        hash256(&self.to_bytes(true))
    }

    /// Encoded size; `witness` selects the segwit serialization when applicable
    pub fn size(&self, witness: bool) -> usize {
        let mut size = 4 + 4;
        size += varint_size(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 36 + var_bytes_size(input.script.len()) + 4;
        }
        size += varint_size(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + var_bytes_size(output.script.len());
        }
        if witness && self.has_witness() {
            size += 2;
            for input in &self.inputs {
                size += varint_size(input.witness.len() as u64);
                size += input
                    .witness
                    .iter()
                    .map(|item| var_bytes_size(item.len()))
                    .sum::<usize>();
            }
        }
        size
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B, witness: bool) {
        let witness = witness && self.has_witness();

        buf.put_i32_le(self.version);

        if witness {
            buf.put_u8(0);
            buf.put_u8(1);
        }

        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            write_hash(buf, &input.prevout.hash);
            buf.put_u32_le(input.prevout.index);
            write_var_bytes(buf, &input.script);
            buf.put_u32_le(input.sequence);
        }

        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.put_i64_le(output.value);
            write_var_bytes(buf, &output.script);
        }

        if witness {
            for input in &self.inputs {
                write_varint(buf, input.witness.len() as u64);
                for item in &input.witness {
                    write_var_bytes(buf, item);
                }
            }
        }

        buf.put_u32_le(self.locktime);
    }

    pub fn to_bytes(&self, witness: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size(witness));
        self.encode(&mut buf, witness);
        buf
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let version = reader.read_i32()?;

        let mut flag = 0u8;
        let mut input_count = reader.read_count(MAX_TX_ITEMS, "tx inputs")?;

        // Segwit marker: an empty input vector followed by a non-zero flag
        if input_count == 0 {
            flag = reader.read_u8()?;
            if flag != 0 {
                input_count = reader.read_count(MAX_TX_ITEMS, "tx inputs")?;
            }
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let hash = reader.read_hash()?;
            let index = reader.read_u32()?;
            let script = reader.read_var_bytes(MAX_SCRIPT_SIZE, "script")?.to_vec();
            let sequence = reader.read_u32()?;
            inputs.push(TxInput {
                prevout: OutPoint { hash, index },
                script,
                sequence,
                witness: Vec::new(),
            });
        }

        let output_count = if flag == 0 && input_count == 0 {
            // Empty input vector with a zero flag byte: the byte we consumed
            // was the output count.
            0
        } else {
            reader.read_count(MAX_TX_ITEMS, "tx outputs")?
        };

        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = reader.read_i64()?;
            let script = reader.read_var_bytes(MAX_SCRIPT_SIZE, "script")?.to_vec();
            outputs.push(TxOutput { value, script });
        }

        if flag & 1 != 0 {
            let mut found = false;
            for input in inputs.iter_mut() {
                let items = reader.read_count(MAX_WITNESS_ITEMS, "witness items")?;
                for _ in 0..items {
                    let item = reader.read_var_bytes(MAX_SCRIPT_SIZE, "witness item")?;
                    input.witness.push(item.to_vec());
                }
                found |= items > 0;
            }
            if !found {
                return Err(WireError::Invalid("empty witness".to_string()));
            }
        } else if flag != 0 {
            return Err(WireError::Invalid(format!("witness flag {}", flag)));
        }

        let locktime = reader.read_u32()?;

        Ok(Self {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let tx = Self::decode(&mut reader)?;
        if reader.left() != 0 {
            return Err(WireError::Trailing("tx"));
        }
        Ok(tx)
    }

    /// Minimal coinbase paying `value` to an empty script; `tag` makes it unique
    pub fn coinbase(tag: &[u8], value: i64) -> Self {
        Self {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::null(),
                script: tag.to_vec(),
                sequence: SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput {
                value,
                script: Vec::new(),
            }],
            locktime: 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A one-in one-out spend of `prev`, optionally with a witness stack
    pub fn spend(prev: Hash256, index: u32, witness: bool) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxInput {
                prevout: OutPoint { hash: prev, index },
                script: if witness { Vec::new() } else { vec![0x51] },
                sequence: SEQUENCE_FINAL - 1,
                witness: if witness {
                    vec![vec![0x30; 71], vec![0x02; 33]]
                } else {
                    Vec::new()
                },
            }],
            outputs: vec![TxOutput {
                value: 50_000,
                script: vec![0x00, 0x14, index as u8],
            }],
            locktime: 0,
        }
    }

    #[test]
    fn test_legacy_roundtrip() {
        let tx = spend(Hash256::new([9; 32]), 1, false);
        let raw = tx.to_bytes(true);
        assert_eq!(raw.len(), tx.size(true));
        assert_eq!(Transaction::from_bytes(&raw).unwrap(), tx);
        assert_eq!(tx.txid(), tx.wtxid());
    }

    #[test]
    fn test_witness_roundtrip() {
        let tx = spend(Hash256::new([3; 32]), 0, true);
        let full = tx.to_bytes(true);
        let stripped = tx.to_bytes(false);

        assert!(full.len() > stripped.len());
        assert_eq!(full.len(), tx.size(true));
        assert_eq!(stripped.len(), tx.size(false));
        assert_eq!(Transaction::from_bytes(&full).unwrap(), tx);
        assert_ne!(tx.txid(), tx.wtxid());

        let legacy = Transaction::from_bytes(&stripped).unwrap();
        assert!(!legacy.has_witness());
        assert_eq!(legacy.txid(), tx.txid());
    }

    #[test]
    fn test_coinbase_detection() {
        assert!(Transaction::coinbase(b"tag", 50).is_coinbase());
        assert!(!spend(Hash256::ZERO, 0, false).is_coinbase());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = spend(Hash256::ZERO, 0, false).to_bytes(false);
        raw.push(0);
        assert_eq!(
            Transaction::from_bytes(&raw),
            Err(WireError::Trailing("tx"))
        );
    }
}
