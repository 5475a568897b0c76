use ahash::RandomState;
use std::sync::atomic::{AtomicU64, Ordering};

/// Probabilistic pre-check of API keys in front of the directory.
///
/// Never yields a false negative for an inserted key. A disabled filter
/// reports every key as possibly present, so admission always falls through
/// to the authoritative lookup.
pub struct KeyFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
    hasher_a: RandomState,
    hasher_b: RandomState,
}

impl KeyFilter {
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = ((m as f64 / n) * ln2).round().clamp(1.0, 32.0) as u32;
        let words = m.div_ceil(64) as usize;
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, || AtomicU64::new(0));
        Self {
            bits,
            num_bits: words as u64 * 64,
            num_hashes: k,
            hasher_a: RandomState::with_seeds(0x7467_6b65, 0x7931, 0x0f1e_2d3c, 0x4b5a_6978),
            hasher_b: RandomState::with_seeds(0x9e37_79b9, 0x7f4a_7c15, 0xbf58_476d, 0x94d0_49bb),
        }
    }

    pub fn disabled() -> Self {
        Self {
            bits: Vec::new(),
            num_bits: 0,
            num_hashes: 0,
            hasher_a: RandomState::with_seeds(0, 0, 0, 0),
            hasher_b: RandomState::with_seeds(0, 0, 0, 0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.num_bits > 0
    }

    pub fn insert(&self, key: &str) {
        if !self.is_enabled() {
            return;
        }
        let (h1, h2) = self.hashes(key);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    pub fn might_contain(&self, key: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let (h1, h2) = self.hashes(key);
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
        })
    }

    fn hashes(&self, key: &str) -> (u64, u64) {
        let h1 = self.hasher_a.hash_one(key);
        // odd step so hash positions cycle through distinct bits
        let h2 = self.hasher_b.hash_one(key) | 1;
        (h1, h2)
    }
}
