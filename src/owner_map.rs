// src/owner_map.rs
//
//! Index -> owning-rank map.
//!
//! Every shuffled sample index has exactly one owner: the rank whose store
//! holds its compacted record. During exchange each rank consults the map to
//! decide which records to send and from whom to expect each index it will
//! consume.
//!
//! Two construction modes match the two staging modes. With preloading, each
//! rank stages a contiguous run of the shuffled permutation and the map is
//! rebuilt from the per-rank partition sizes. When staging happens on the fly
//! during the first epoch, ownership follows the position of the index in
//! the traversal: position `i` belongs to rank `(i % mb) % np`.

use std::collections::HashMap;

use crate::error::{Result, StageError};

/// Owner of the sample at traversal position `pos` under streaming staging,
/// for mini-batch size `mb` and world size `np`.
pub fn streaming_owner(pos: usize, mb: usize, np: usize) -> usize {
    (pos % mb.max(1)) % np.max(1)
}

#[derive(Debug, Clone, Default)]
pub struct OwnerMap {
    owners: HashMap<usize, usize>,
}

impl OwnerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from per-rank partition sizes, assigning contiguous runs of
    /// `shuffled` in rank order: rank 0 owns the first `sizes[0]` indices,
    /// rank 1 the next `sizes[1]`, and so on.
    pub fn build_preloaded(&mut self, sizes: &[u64], shuffled: &[usize]) -> Result<()> {
        let total: u64 = sizes.iter().sum();
        if total as usize != shuffled.len() {
            return Err(StageError::CountMismatch {
                context: "owner-map partition sizes".to_string(),
                expected: shuffled.len(),
                found: total as usize,
            });
        }
        self.owners.clear();
        let mut pos = 0usize;
        for (rank, &n) in sizes.iter().enumerate() {
            for _ in 0..n {
                self.owners.insert(shuffled[pos], rank);
                pos += 1;
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, index: usize, rank: usize) {
        self.owners.insert(index, rank);
    }

    pub fn remove(&mut self, index: usize) -> Option<usize> {
        self.owners.remove(&index)
    }

    /// Owning rank of `index`; an unmapped index at exchange time is a
    /// protocol violation, not a miss.
    pub fn owner_of(&self, index: usize) -> Result<usize> {
        self.owners
            .get(&index)
            .copied()
            .ok_or(StageError::UnknownIndex {
                index,
                map_len: self.owners.len(),
            })
    }

    pub fn contains(&self, index: usize) -> bool {
        self.owners.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.owners.iter().map(|(&i, &r)| (i, r))
    }
}
