//! Bloom Filter
//!
//! Guards the user cache against penetration by ids that were never seen.
//! Sizing follows the classic formulas for `n` expected items at target
//! false-positive rate `p`:
//!
//! ```text
//! m = ceil(-n * ln(p) / ln(2)^2)     bits
//! k = ceil(m / n * ln(2))            hash functions
//! ```
//!
//! Bits are stored in `AtomicU64` words so `add` and `contains` work through
//! a shared reference without locking. Keys cannot be removed; `reset`
//! clears everything.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{GatewayError, Result};

/// Probabilistic set with no false negatives
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
    fp_rate: f64,
    inserted: AtomicU64,
}

impl BloomFilter {
    /// Size a filter for `capacity` items at `fp_rate` false positives.
    ///
    /// Returns a config error if `capacity` is zero or `fp_rate` is not in
    /// the open interval (0, 1).
    pub fn new(capacity: usize, fp_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(GatewayError::Config(
                "bloom filter capacity must be positive".into(),
            ));
        }
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(GatewayError::Config(format!(
                "bloom filter false-positive rate must be in (0, 1), got {fp_rate}"
            )));
        }

        let (num_bits, num_hashes) = optimal_params(capacity, fp_rate);
        let words = num_bits.div_ceil(64) as usize;
        let bits = (0..words).map(|_| AtomicU64::new(0)).collect();

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            capacity,
            fp_rate,
            inserted: AtomicU64::new(0),
        })
    }

    /// Insert a key
    pub fn add(&self, data: &[u8]) {
        for seed in 0..self.num_hashes {
            let (word, mask) = self.locate(data, seed);
            self.bits[word].fetch_or(mask, Ordering::Relaxed);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// True if the key may have been added; false means definitely absent
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.num_hashes).all(|seed| {
            let (word, mask) = self.locate(data, seed);
            self.bits[word].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Clear all bits
    pub fn reset(&self) {
        for word in &self.bits {
            word.store(0, Ordering::Relaxed);
        }
        self.inserted.store(0, Ordering::Relaxed);
    }

    /// Size of the bit array
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions per key
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Configured item capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured target false-positive rate
    pub fn target_fp_rate(&self) -> f64 {
        self.fp_rate
    }

    /// Number of `add` calls since creation or the last reset (duplicates count)
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    fn locate(&self, data: &[u8], seed: u32) -> (usize, u64) {
        let bit = u64::from(murmur3_32(data, seed)) % self.num_bits;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }
}

fn optimal_params(capacity: usize, fp_rate: f64) -> (u64, u32) {
    let n = capacity as f64;
    let ln2 = std::f64::consts::LN_2;
    let m = (-n * fp_rate.ln() / (ln2 * ln2)).ceil().max(1.0);
    let k = (m / n * ln2).ceil().max(1.0);
    (m as u64, k as u32)
}

/// 32-bit MurmurHash3 (x86 variant) with an explicit seed
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k ^= u32::from(*byte) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
