//! 80-byte block headers and compact-target proof of work

use crate::crypto::{hash256, Hash256};
use crate::wire::encoding::{write_hash, Reader, WireError};
use bytes::BufMut;

/// Serialized header size
pub const HEADER_SIZE: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        hash256(&self.to_bytes())
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        write_hash(buf, &self.prev_block);
        write_hash(buf, &self.merkle_root);
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: reader.read_i32()?,
            prev_block: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            time: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }

    /// Header self-consistency: the hash must not exceed the encoded target
    pub fn verify_pow(&self) -> bool {
        let Some(target) = target_from_bits(self.bits) else {
            return false;
        };
        let mut hash = *self.hash().as_bytes();
        hash.reverse();
        hash <= target
    }
}

/// Expand compact `bits` into a big-endian 256-bit target.
///
/// Returns `None` for negative, zero or overflowing encodings.
pub fn target_from_bits(bits: u32) -> Option<[u8; 32]> {
    let exponent = (bits >> 24) as i32;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return None;
    }

    let mut target = [0u8; 32];
    for i in 0..3 {
        let byte = ((mantissa >> (8 * (2 - i))) & 0xff) as u8;
        let pos = 32 - exponent + i;
        if pos < 0 {
            if byte != 0 {
                return None;
            }
            continue;
        }
        if pos < 32 {
            target[pos as usize] = byte;
        }
    }

    Some(target)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Grind the nonce until the header satisfies its own target
    pub fn mine(mut header: BlockHeader) -> BlockHeader {
        while !header.verify_pow() {
            header.nonce = header.nonce.wrapping_add(1);
        }
        header
    }

    #[test]
    fn test_target_from_bits() {
        let target = target_from_bits(0x1d00ffff).unwrap();
        assert_eq!(&target[..4], &[0, 0, 0, 0]);
        assert_eq!(&target[4..6], &[0xff, 0xff]);
        assert!(target[6..].iter().all(|b| *b == 0));

        let easy = target_from_bits(0x207fffff).unwrap();
        assert_eq!(&easy[..3], &[0x7f, 0xff, 0xff]);

        assert!(target_from_bits(0x1d80ffff).is_none());
        assert!(target_from_bits(0x23000001).is_none());
    }

    #[test]
    fn test_small_exponent_shifts_mantissa() {
        let target = target_from_bits(0x01123456).unwrap();
        assert_eq!(target[31], 0x12);
        assert!(target[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_header_roundtrip_and_pow() {
        let header = mine(BlockHeader {
            version: 4,
            prev_block: Hash256::new([1; 32]),
            merkle_root: Hash256::new([2; 32]),
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        });
        let raw = header.to_bytes();
        assert_eq!(raw.len(), HEADER_SIZE);
        assert_eq!(BlockHeader::decode(&mut Reader::new(&raw)).unwrap(), header);
        assert!(header.verify_pow());

        let hard = BlockHeader {
            bits: 0x1d00ffff,
            ..header
        };
        assert!(!hard.verify_pow());
    }
}
