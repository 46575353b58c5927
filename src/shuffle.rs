// src/shuffle.rs
//
//! Deterministic epoch shuffling.
//!
//! The traversal order for an epoch is fixed before the epoch starts: the
//! handle pool precomputes exact future-use distances from it, and every
//! rank must agree on it, so the permutation is seeded and reproducible.

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{RngCore, SeedableRng};

/// Produce the shuffled index permutation `0..len` for one epoch.
///
/// All ranks call this with the same `(len, seed)` and obtain the same
/// permutation.
pub fn shuffled_indices(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha20Rng::seed_from_u64(seed);

    // Manual Fisher–Yates shuffle
    for i in (1..len).rev() {
        let j = (rng.next_u32() as usize) % (i + 1);
        indices.swap(i, j);
    }
    indices
}
