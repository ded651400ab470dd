//! Bloom filters
//!
//! - `RollingFilter`: remembers roughly the last `items` insertions with a
//!   bounded false positive rate. Two generations of bits are kept; once the
//!   current generation holds half the capacity the older one is discarded.
//! - `BloomFilter`: the BIP37 filter a client loads with `filterload`.

use crate::core::Transaction;
use crate::crypto::sha256;
use crate::wire::packets::FilterLoadPacket;

// =============================================================================
// BIP37 Filter
// =============================================================================

/// Seed multiplier for the n-th hash function
const SEED_MULTIPLIER: u32 = 0xFBA4_C795;

/// Update flag: add outpoints of matched outputs
pub const UPDATE_ALL: u8 = 1;

fn murmur3(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k1: u32 = 0;
    for (i, byte) in tail.iter().enumerate() {
        k1 ^= (*byte as u32) << (8 * i);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Data pushes of a script, in order
fn script_pushes(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let op = script[i];
        i += 1;

        let len = match op {
            0x01..=0x4b => op as usize,
            0x4c if i < script.len() => {
                i += 1;
                script[i - 1] as usize
            }
            0x4d if i + 2 <= script.len() => {
                i += 2;
                u16::from_le_bytes([script[i - 2], script[i - 1]]) as usize
            }
            0x4e if i + 4 <= script.len() => {
                i += 4;
                u32::from_le_bytes([script[i - 4], script[i - 3], script[i - 2], script[i - 1]])
                    as usize
            }
            0x4c..=0x4e => break,
            _ => continue,
        };

        if i + len > script.len() {
            break;
        }
        pushes.push(&script[i..i + len]);
        i += len;
    }

    pushes
}

/// Filter loaded by a BIP37 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    pub data: Vec<u8>,
    pub n_hash_funcs: u32,
    pub tweak: u32,
    pub update: u8,
}

impl BloomFilter {
    pub fn from_packet(packet: &FilterLoadPacket) -> Self {
        Self {
            data: packet.filter.clone(),
            n_hash_funcs: packet.n_hash_funcs,
            tweak: packet.tweak,
            update: packet.update,
        }
    }

    pub fn to_packet(&self) -> FilterLoadPacket {
        FilterLoadPacket {
            filter: self.data.clone(),
            n_hash_funcs: self.n_hash_funcs,
            tweak: self.tweak,
            update: self.update,
        }
    }

    /// Filter sized for `items` elements at false positive `rate`
    pub fn for_elements(items: usize, rate: f64, update: u8) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let items = items.max(1) as f64;
        let bytes = ((-items * rate.ln()) / (ln2 * ln2) / 8.0).ceil() as usize;
        let bytes = bytes.clamp(1, crate::wire::packets::MAX_BLOOM_FILTER_SIZE);
        let funcs = ((bytes * 8) as f64 / items * ln2).round() as u32;

        Self {
            data: vec![0u8; bytes],
            n_hash_funcs: funcs.clamp(1, crate::wire::packets::MAX_HASH_FUNCS),
            tweak: rand::random(),
            update,
        }
    }

    fn bit(&self, n: u32, data: &[u8]) -> usize {
        let seed = n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(data, seed) as usize % (self.data.len() * 8)
    }

    pub fn add(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.n_hash_funcs {
            let idx = self.bit(n, data);
            self.data[idx / 8] |= 1 << (idx % 8);
        }
    }

    pub fn test(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.n_hash_funcs).all(|n| {
            let idx = self.bit(n, data);
            self.data[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|byte| *byte = 0);
    }

    /// Test a transaction against the filter, adding matched outpoints
    /// when the filter asks for updates.
    pub fn is_watched(&mut self, tx: &Transaction) -> bool {
        let hash = tx.txid();
        let mut found = self.test(hash.as_bytes());

        for (index, output) in tx.outputs.iter().enumerate() {
            let matched = script_pushes(&output.script)
                .into_iter()
                .any(|push| self.test(push));
            if matched {
                found = true;
                if self.update == UPDATE_ALL {
                    let mut outpoint = hash.as_bytes().to_vec();
                    outpoint.extend_from_slice(&(index as u32).to_le_bytes());
                    self.add(&outpoint);
                }
            }
        }

        if found {
            return true;
        }

        for input in &tx.inputs {
            let mut outpoint = input.prevout.hash.as_bytes().to_vec();
            outpoint.extend_from_slice(&input.prevout.index.to_le_bytes());
            if self.test(&outpoint) {
                return true;
            }
            if script_pushes(&input.script)
                .into_iter()
                .any(|push| self.test(push))
            {
                return true;
            }
        }

        false
    }
}

// =============================================================================
// Rolling Filter
// =============================================================================

#[derive(Debug, Clone)]
struct Generation {
    bits: Vec<u8>,
    count: usize,
}

impl Generation {
    fn new(size_bits: usize) -> Self {
        Self {
            bits: vec![0u8; size_bits.div_ceil(8)],
            count: 0,
        }
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 8] |= 1 << (idx % 8);
    }

    fn get(&self, idx: usize) -> bool {
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }
}

#[derive(Debug, Clone)]
pub struct RollingFilter {
    current: Generation,
    previous: Generation,
    size_bits: usize,
    hash_funcs: u32,
    limit: usize,
    tweak: u32,
}

impl RollingFilter {
    /// Filter sized for `items` entries at false positive `rate`
    pub fn new(items: usize, rate: f64) -> Self {
        let items = items.max(2);
        let limit = items / 2;

        // Optimal size: -n * ln(p) / ln(2)^2, per generation of n/2 items
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let size_bits = ((-(limit as f64) * rate.ln()) / ln2_squared).ceil() as usize;
        let size_bits = size_bits.max(64);

        // Optimal hash functions: (m / n) * ln(2)
        let hash_funcs = ((size_bits as f64 / limit as f64) * std::f64::consts::LN_2).round() as u32;
        let hash_funcs = hash_funcs.clamp(1, 50);

        Self {
            current: Generation::new(size_bits),
            previous: Generation::new(size_bits),
            size_bits,
            hash_funcs,
            limit,
            tweak: rand::random(),
        }
    }

    fn indexes(&self, data: &[u8]) -> impl Iterator<Item = usize> {
        let mut input = Vec::with_capacity(data.len() + 4);
        input.extend_from_slice(&self.tweak.to_le_bytes());
        input.extend_from_slice(data);
        let digest = sha256(&input);

        let h1 = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let h2 = u64::from_le_bytes([
            digest[8], digest[9], digest[10], digest[11], digest[12], digest[13], digest[14],
            digest[15],
        ]);

        let size = self.size_bits as u64;
        (0..self.hash_funcs as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % size) as usize)
    }

    pub fn add(&mut self, data: &[u8]) {
        if self.current.count >= self.limit {
            self.previous = std::mem::replace(&mut self.current, Generation::new(self.size_bits));
        }

        let indexes: Vec<usize> = self.indexes(data).collect();
        for idx in indexes {
            self.current.set(idx);
        }
        self.current.count += 1;
    }

    /// Probably seen before
    pub fn test(&self, data: &[u8]) -> bool {
        let indexes: Vec<usize> = self.indexes(data).collect();
        indexes.iter().all(|idx| self.current.get(*idx))
            || indexes.iter().all(|idx| self.previous.get(*idx))
    }

    /// Insert `data`, returning true if it was not already present
    pub fn added(&mut self, data: &[u8]) -> bool {
        if self.test(data) {
            return false;
        }
        self.add(data);
        true
    }

    pub fn reset(&mut self) {
        self.current = Generation::new(self.size_bits);
        self.previous = Generation::new(self.size_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::tests::spend;
    use crate::crypto::Hash256;

    #[test]
    fn test_murmur3_vectors() {
        assert_eq!(murmur3(b"", 0), 0);
        assert_eq!(murmur3(b"", 0xFBA4_C795), 0x6a39_6f08);
        assert_eq!(murmur3(&[0x00], 0), 0x514e_28b7);
    }

    #[test]
    fn test_bloom_matches_txid_and_outpoint() {
        let tx = spend(Hash256::new([4; 32]), 1, false);
        let mut filter = BloomFilter::for_elements(10, 0.0001, UPDATE_ALL);
        assert!(!filter.is_watched(&tx));

        filter.add(tx.txid().as_bytes());
        assert!(filter.is_watched(&tx));

        let mut by_input = BloomFilter::for_elements(10, 0.0001, 0);
        let mut outpoint = [4u8; 32].to_vec();
        outpoint.extend_from_slice(&1u32.to_le_bytes());
        by_input.add(&outpoint);
        assert!(by_input.is_watched(&tx));

        filter.reset();
        assert!(!filter.test(tx.txid().as_bytes()));
    }

    #[test]
    fn test_script_pushes() {
        let script = [0x76, 0xa9, 0x02, 0xaa, 0xbb, 0x4c, 0x01, 0xcc, 0x88, 0x4d, 0x05];
        assert_eq!(script_pushes(&script), vec![&[0xaa, 0xbb][..], &[0xcc][..]]);
    }

    #[test]
    fn test_added_reports_new_items() {
        let mut filter = RollingFilter::new(1000, 0.0001);
        assert!(filter.added(b"alpha"));
        assert!(!filter.added(b"alpha"));
        assert!(filter.test(b"alpha"));
        assert!(!filter.test(b"beta"));
    }

    #[test]
    fn test_old_items_roll_out() {
        let mut filter = RollingFilter::new(100, 0.0001);
        filter.add(b"first");

        for i in 0u32..200 {
            filter.add(&i.to_le_bytes());
        }

        assert!(!filter.test(b"first"));
        // Recent items survive the roll.
        assert!(filter.test(&199u32.to_le_bytes()));
    }

    #[test]
    fn test_reset() {
        let mut filter = RollingFilter::new(100, 0.001);
        filter.add(b"x");
        filter.reset();
        assert!(!filter.test(b"x"));
    }
}
