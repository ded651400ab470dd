//! Keyed short transaction identifiers for compact block relay

use super::hash::{sha256, Hash256};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// Short IDs are truncated to 48 bits
pub const SHORT_ID_MASK: u64 = 0xffff_ffff_ffff;

/// SipHash key pair derived from a block header and nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SipKey {
    pub k0: u64,
    pub k1: u64,
}

impl SipKey {
    /// Derives the key from the first 16 bytes of `sha256(header ++ nonce)`
    pub fn derive(header: &[u8], nonce: u64) -> Self {
        let mut data = Vec::with_capacity(header.len() + 8);
        data.extend_from_slice(header);
        data.extend_from_slice(&nonce.to_le_bytes());
        let digest = sha256(&data);

        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&digest[0..8]);
        k1.copy_from_slice(&digest[8..16]);

        Self {
            k0: u64::from_le_bytes(k0),
            k1: u64::from_le_bytes(k1),
        }
    }

    /// 48-bit short ID of a transaction hash
    pub fn short_id(&self, hash: &Hash256) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write(hash.as_bytes());
        hasher.finish() & SHORT_ID_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_is_48_bits() {
        let key = SipKey::derive(&[7u8; 80], 42);
        for i in 0..64u8 {
            let id = key.short_id(&Hash256::new([i; 32]));
            assert_eq!(id >> 48, 0);
        }
    }

    #[test]
    fn test_key_depends_on_nonce() {
        let a = SipKey::derive(&[1u8; 80], 1);
        let b = SipKey::derive(&[1u8; 80], 2);
        assert_ne!(a, b);
        assert_eq!(a, SipKey::derive(&[1u8; 80], 1));
    }
}
