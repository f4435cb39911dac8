//! Per-table bloom filter.
//!
//! Built once at table-write time from every key in the table, consulted on
//! point lookups to skip tables that definitely do not contain a key.
//!
//! Sizing follows the classic formulas: the bit array holds
//! `num_keys · bits_per_key` bits and the probe count is
//! `k = round(bits_per_key · ln 2)`. Probing uses double hashing —
//! `h(i) = h1 + i·h2` over two independent 32-bit FNV-1a hashes — so only
//! two hash computations are needed per key regardless of `k`.
//!
//! # Wire format
//!
//! ```text
//! [k: u8][bitset_len: u32 LE][bitset_bytes]
//! ```
//!
//! # Contract
//!
//! `may_contain` returns `true` for every key that was inserted — no false
//! negatives, ever. False positives occur at a rate of roughly
//! `(1 − e^(−kn/m))^k`; with the default 10 bits per key that is about 1%.

use crate::encoding::EncodingError;

/// Minimum bit-array size; avoids degenerate tiny filters with pathological
/// false-positive rates.
const MIN_BITS: usize = 64;

/// Upper bound on the probe count; beyond this more probes only cost time.
const MAX_PROBES: u32 = 30;

/// A bloom filter over a fixed set of keys.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Number of hash probes per key.
    k: u8,

    /// The bit array, little-endian bit order within each byte.
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Creates an empty filter sized for `num_keys` at `bits_per_key`.
    pub fn new(num_keys: usize, bits_per_key: u32) -> Self {
        let num_bits = (num_keys * bits_per_key as usize).max(MIN_BITS);
        let num_bytes = num_bits.div_ceil(8);

        // k = round(bits_per_key * ln 2), clamped to a sane range.
        let k = (bits_per_key as f64 * std::f64::consts::LN_2).round() as u32;
        let k = k.clamp(1, MAX_PROBES) as u8;

        Self {
            k,
            bits: vec![0u8; num_bytes],
        }
    }

    /// Computes the two independent 32-bit hashes for a key.
    ///
    /// Exposed so the table builder can hash keys as they stream past and
    /// defer filter construction until the exact key count is known.
    pub fn key_hash(key: &[u8]) -> (u32, u32) {
        let h1 = fnv1a_32(key, 0x811C_9DC5);
        let h2 = fnv1a_32(key, 0x0100_0193);
        (h1, h2)
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(Self::key_hash(key));
    }

    /// Inserts a pre-computed key hash.
    pub fn insert_hash(&mut self, (h1, h2): (u32, u32)) {
        let num_bits = (self.bits.len() * 8) as u32;
        for i in 0..self.k as u32 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `true` if the key **might** be in the set, `false` if it is
    /// **definitely not**.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::key_hash(key);
        let num_bits = (self.bits.len() * 8) as u32;
        for i in 0..self.k as u32 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serializes the filter as `[k][bitset_len][bitset]`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.k);
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.bits);
    }

    /// Deserializes a filter written by [`encode_to`](Self::encode_to).
    pub fn decode(buf: &[u8]) -> Result<Self, EncodingError> {
        if buf.len() < 5 {
            return Err(EncodingError::UnexpectedEof {
                needed: 5,
                available: buf.len(),
            });
        }
        let k = buf[0];
        if k == 0 || k as u32 > MAX_PROBES {
            return Err(EncodingError::Custom(format!(
                "bloom probe count {k} out of range"
            )));
        }

        let bitset_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() < 5 + bitset_len {
            return Err(EncodingError::UnexpectedEof {
                needed: 5 + bitset_len,
                available: buf.len(),
            });
        }
        if bitset_len == 0 {
            return Err(EncodingError::Custom("empty bloom bitset".into()));
        }

        Ok(Self {
            k,
            bits: buf[5..5 + bitset_len].to_vec(),
        })
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.bits.len()
    }

    /// Number of hash probes per key.
    pub fn probes(&self) -> u8 {
        self.k
    }
}

/// FNV-1a 32-bit hash with a configurable starting basis.
fn fnv1a_32(data: &[u8], basis: u32) -> u32 {
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
