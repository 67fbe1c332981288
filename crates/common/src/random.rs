//! Seeded randomness shared by the stage planner and the checks.
//!
//! A run owns exactly one [`SeededRng`], created from the run seed and passed
//! by `&mut` to every call that needs randomness. Two runs with the same seed
//! and the same stage plan therefore select the same members, payloads and
//! probe pairs.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Deterministic generator used for one run.
#[derive(Debug, Clone)]
pub struct SeededRng {
    seed: i64,
    inner: ChaCha20Rng,
}

impl SeededRng {
    /// Create a generator from a signed 64-bit seed.
    ///
    /// The seed is reinterpreted bit-for-bit as `u64`, so negative seeds are
    /// as valid as positive ones.
    pub fn new(seed: i64) -> Self {
        Self {
            seed,
            inner: ChaCha20Rng::seed_from_u64(seed as u64),
        }
    }

    /// Seed this generator was created from.
    pub fn seed(&self) -> i64 {
        self.seed
    }

    /// Uniform index in `0..len`. Returns `None` for an empty range.
    pub fn pick_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.inner.gen_range(0..len))
    }

    /// Shuffle a slice in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.inner);
    }

    /// Fill `buf` with generator output.
    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.inner.fill_bytes(buf);
    }

    /// Fresh buffer of `len` generator bytes.
    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.inner.fill_bytes(&mut buf);
        buf
    }

    /// 32 random bytes, used for signed-chunk identifiers and key material.
    pub fn random_id(&mut self) -> [u8; 32] {
        let mut id = [0u8; 32];
        self.inner.fill_bytes(&mut id);
        id
    }

    /// Next raw 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }
}

/// A fresh seed from OS entropy, for runs that were not given one.
///
/// Callers are expected to log the value so the run can be reproduced.
pub fn random_seed() -> i64 {
    rand::rngs::OsRng.next_u64() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = SeededRng::new(42);
        let mut b = SeededRng::new(42);
        assert_eq!(a.bytes(64), b.bytes(64));
        assert_eq!(a.pick_index(1000), b.pick_index(1000));

        let mut xs: Vec<u32> = (0..32).collect();
        let mut ys = xs.clone();
        a.shuffle(&mut xs);
        b.shuffle(&mut ys);
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_different_seed_different_stream() {
        let mut a = SeededRng::new(1);
        let mut b = SeededRng::new(2);
        assert_ne!(a.bytes(32), b.bytes(32));
    }

    #[test]
    fn test_negative_seed_is_valid() {
        let mut a = SeededRng::new(-7);
        assert_eq!(a.seed(), -7);
        assert_eq!(a.random_id().len(), 32);
    }

    #[test]
    fn test_pick_index_empty() {
        let mut rng = SeededRng::new(0);
        assert_eq!(rng.pick_index(0), None);
        for _ in 0..100 {
            let i = rng.pick_index(3).expect("non-empty range");
            assert!(i < 3);
        }
    }
}
