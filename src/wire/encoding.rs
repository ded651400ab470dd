//! Little-endian primitive encoding shared by every wire structure
//!
//! `Reader` is a bounds-checked cursor over a payload; writing goes straight
//! into any `BufMut` through the free functions below.

use crate::crypto::Hash256;
use bytes::BufMut;
use thiserror::Error;

/// Errors raised while framing or decoding wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unexpected end of data (wanted {wanted}, have {have})")]
    Truncated { wanted: usize, have: usize },
    #[error("Non-canonical varint")]
    NonCanonical,
    #[error("{0} too large ({1})")]
    TooLarge(&'static str, u64),
    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Non NULL-terminated command")]
    BadCommand,
    #[error("Packet length too large: {0}")]
    PacketTooLarge(usize),
    #[error("Invalid checksum: {0}")]
    Checksum(String),
    #[error("Invalid {0}")]
    Invalid(String),
    #[error("Invalid utf-8 string")]
    Utf8,
    #[error("Trailing data after {0}")]
    Trailing(&'static str),
    #[error("Protocol violation: {0} with {1} entries")]
    Violation(&'static str, u64),
}

impl WireError {
    /// Whether the sender broke a hard protocol limit rather than sending garbage
    pub fn is_violation(&self) -> bool {
        matches!(self, WireError::Violation(..))
    }
}

/// Bounds-checked cursor over a byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed
    pub fn left(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Slice of everything read since `start`
    pub fn since(&self, start: usize) -> &'a [u8] {
        &self.data[start..self.offset]
    }

    fn ensure(&self, size: usize) -> Result<(), WireError> {
        if self.left() < size {
            return Err(WireError::Truncated {
                wanted: size,
                have: self.left(),
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, size: usize) -> Result<&'a [u8], WireError> {
        self.ensure(size)?;
        let out = &self.data[self.offset..self.offset + size];
        self.offset += size;
        Ok(out)
    }

    pub fn peek_u8(&self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.data[self.offset])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, WireError> {
        Ok(Hash256::new(self.read_array()?))
    }

    /// Bitcoin CompactSize; rejects values that had a shorter encoding
    pub fn read_varint(&mut self) -> Result<u64, WireError> {
        let first = self.read_u8()?;
        let (value, min) = match first {
            0xff => (self.read_u64()?, 0x1_0000_0000),
            0xfe => (self.read_u32()? as u64, 0x10000),
            0xfd => (self.read_u16()? as u64, 0xfd),
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(WireError::NonCanonical);
        }
        Ok(value)
    }

    /// Varint that must not exceed `max`; `what` names the field in errors
    pub fn read_count(&mut self, max: usize, what: &'static str) -> Result<usize, WireError> {
        let count = self.read_varint()?;
        if count > max as u64 {
            return Err(WireError::TooLarge(what, count));
        }
        Ok(count as usize)
    }

    /// Like `read_count`, but exceeding `max` is a protocol violation
    pub fn read_strict_count(&mut self, max: usize, what: &'static str) -> Result<usize, WireError> {
        let count = self.read_varint()?;
        if count > max as u64 {
            return Err(WireError::Violation(what, count));
        }
        Ok(count as usize)
    }

    pub fn read_var_bytes(&mut self, max: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        let size = self.read_count(max, what)?;
        self.read_bytes(size)
    }

    pub fn read_var_string(&mut self, max: usize, what: &'static str) -> Result<String, WireError> {
        let raw = self.read_var_bytes(max, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
    }
}

/// Encoded size of a varint
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn var_bytes_size(len: usize) -> usize {
    varint_size(len as u64) + len
}

pub fn write_varint<B: BufMut>(buf: &mut B, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

pub fn write_var_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn write_hash<B: BufMut>(buf: &mut B, hash: &Hash256) {
    buf.put_slice(hash.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_size(value));
            assert_eq!(Reader::new(&buf).read_varint().unwrap(), value);
        }
    }

    #[test]
    fn test_non_canonical_varint() {
        let data = [0xfd, 0x10, 0x00];
        assert_eq!(
            Reader::new(&data).read_varint(),
            Err(WireError::NonCanonical)
        );
    }

    #[test]
    fn test_truncated_read() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(matches!(
            reader.read_u32(),
            Err(WireError::Truncated { wanted: 4, have: 3 })
        ));
    }

    #[test]
    fn test_var_string_limit() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"hello world");
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.read_var_string(5, "agent"),
            Err(WireError::TooLarge("agent", 11))
        ));
    }
}
