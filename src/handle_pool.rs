// src/handle_pool.rs
//
//! Bounded pool of open bundle-file handles.
//!
//! The mini-batch traversal order is known one epoch ahead (the shuffled
//! permutation and the rank partition are fixed before the epoch starts), so
//! each file's exact future accesses can be precomputed as a FIFO of
//! `(step, substep)` points. Eviction closes the handle whose next access is
//! least imminent — offline-optimal (Belady) replacement rather than an LRU
//! approximation. A file with no remaining use this epoch sorts ahead of any
//! scheduled use, so unneeded handles go first.
//!
//! The open-handle budget is an explicit resource owned by each pool
//! instance, derived from the process fd-table size minus a safety margin;
//! there is no process-wide singleton.

use std::collections::{BinaryHeap, VecDeque};

use crate::constants::{DEFAULT_FD_TABLE_SIZE, MAX_OPEN_FILE_MARGIN};

/// `(step, substep)` at which a file's handle will be needed.
pub type UsePoint = (u32, u32);

/// Eviction key for an open handle.
///
/// Ordering is eviction priority: `Never` (no remaining use) is greatest and
/// is evicted before any scheduled use; among scheduled uses, the more
/// distant point is evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NextUse {
    At(u32, u32),
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    next: NextUse,
    file_id: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap: the popped entry is the eviction victim
        self.next
            .cmp(&other.next)
            .then_with(|| self.file_id.cmp(&other.file_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One entry in the file table: exactly one per distinct bundle file
/// referenced by the manifest.
#[derive(Debug)]
pub struct FileEntry<H> {
    pub filename: String,
    pub handle: Option<H>,
    /// Future accesses of this file, consumed front-to-back as steps
    /// progress. Monotonically non-decreasing once computed for an epoch.
    pub pending_uses: VecDeque<UsePoint>,
}

impl<H> FileEntry<H> {
    pub fn new(filename: String) -> Self {
        Self {
            filename,
            handle: None,
            pending_uses: VecDeque::new(),
        }
    }
}

/// Derive the default open-handle budget from the process fd-table size.
pub fn default_open_budget() -> usize {
    #[cfg(unix)]
    let table = {
        let n = unsafe { libc::getdtablesize() };
        if n > 0 { n as usize } else { DEFAULT_FD_TABLE_SIZE }
    };
    #[cfg(not(unix))]
    let table = DEFAULT_FD_TABLE_SIZE;
    table.saturating_sub(MAX_OPEN_FILE_MARGIN).max(1)
}

/// Priority queue of live handles, bounded by `max_open`.
#[derive(Debug)]
pub struct HandlePool {
    heap: BinaryHeap<HeapEntry>,
    max_open: usize,
}

impl Default for HandlePool {
    fn default() -> Self {
        Self::with_budget(default_open_budget())
    }
}

impl HandlePool {
    pub fn with_budget(max_open: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_open: max_open.max(1),
        }
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Number of handles currently tracked (and therefore open or stale).
    pub fn tracked(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Linear "remove if present" before a push; the file table is orders of
    /// magnitude smaller than the sample count, so this stays cheap.
    fn remove_entry(&mut self, file_id: usize) {
        if self.heap.iter().any(|e| e.file_id == file_id) {
            let mut kept: Vec<HeapEntry> = self.heap.drain().collect();
            kept.retain(|e| e.file_id != file_id);
            self.heap = BinaryHeap::from(kept);
        }
    }

    /// Register a (re)use of `file_id`'s handle and rebalance the pool.
    ///
    /// Called right after a handle was acquired. `predictive` marks a
    /// read-ahead acquisition: the front pending use has not happened yet
    /// and must not be consumed.
    pub fn manage<H>(
        &mut self,
        files: &mut [FileEntry<H>],
        file_id: usize,
        predictive: bool,
        close: &mut dyn FnMut(&mut H),
    ) {
        // over budget: close the single least-imminently-needed handle,
        // never the one being registered right now
        if self.heap.len() > self.max_open {
            let mut held_back = None;
            while let Some(victim) = self.heap.pop() {
                if victim.file_id == file_id {
                    held_back = Some(victim);
                    continue;
                }
                if let Some(mut h) = files[victim.file_id].handle.take() {
                    close(&mut h);
                }
                break;
            }
            if let Some(e) = held_back {
                self.heap.push(e);
            }
        }

        self.remove_entry(file_id);

        let entry = &mut files[file_id];
        if !predictive {
            entry.pending_uses.pop_front();
        }
        let next = match entry.pending_uses.front() {
            Some(&(step, substep)) => NextUse::At(step, substep),
            None => NextUse::Never,
        };
        self.heap.push(HeapEntry { next, file_id });
    }

    /// Close `file_id`'s handle if the epoch holds no further use for it.
    pub fn close_if_done<H>(
        &mut self,
        files: &mut [FileEntry<H>],
        file_id: usize,
        close: &mut dyn FnMut(&mut H),
    ) {
        let entry = &mut files[file_id];
        if entry.pending_uses.is_empty() {
            if let Some(mut h) = entry.handle.take() {
                close(&mut h);
            }
            self.remove_entry(file_id);
        }
    }

    /// Eviction keys of all tracked handles; exposed for invariant checks.
    pub fn tracked_uses(&self) -> Vec<(usize, NextUse)> {
        self.heap.iter().map(|e| (e.file_id, e.next)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> Vec<FileEntry<u32>> {
        (0..n).map(|i| FileEntry::new(format!("f{i}"))).collect()
    }

    fn noop_close(_: &mut u32) {}

    #[test]
    fn never_sorts_before_any_scheduled_use() {
        assert!(NextUse::Never > NextUse::At(u32::MAX, u32::MAX));
        assert!(NextUse::At(3, 0) > NextUse::At(2, 9));
        assert!(NextUse::At(2, 1) > NextUse::At(2, 0));
    }

    #[test]
    fn budget_is_enforced() {
        let mut files = table(4);
        for f in files.iter_mut() {
            f.pending_uses = VecDeque::from(vec![(0, 0), (5, 0)]);
            f.handle = Some(1);
        }
        let mut pool = HandlePool::with_budget(2);
        let mut closed = Vec::new();
        for id in 0..4 {
            files[id].handle = Some(id as u32);
            let mut close = |h: &mut u32| closed.push(*h);
            pool.manage(&mut files, id, false, &mut close);
        }
        let open = files.iter().filter(|f| f.handle.is_some()).count();
        assert!(open <= 3); // budget 2 plus the entry being registered
        assert!(!closed.is_empty());
        // eviction closed the OS handle only; pending uses are untouched
        for h in &closed {
            assert!(!files[*h as usize].pending_uses.is_empty());
        }
    }

    #[test]
    fn evicted_is_least_imminent() {
        let mut files = table(3);
        files[0].pending_uses = VecDeque::from(vec![(0, 0), (1, 0)]);
        files[1].pending_uses = VecDeque::from(vec![(0, 1), (9, 0)]);
        files[2].pending_uses = VecDeque::from(vec![(0, 2), (2, 0)]);
        let mut pool = HandlePool::with_budget(1);
        let mut closed = Vec::new();
        for id in 0..3 {
            files[id].handle = Some(id as u32);
            let mut close = |h: &mut u32| closed.push(*h);
            pool.manage(&mut files, id, false, &mut close);
        }
        // registering file 2 pushed the pool over budget; file 1 (next use
        // at step 9) was the least imminent of {0@1, 1@9}
        assert_eq!(closed, vec![1]);
        // invariant: every evicted entry had no sooner pending use than any
        // retained entry
        let retained_min = pool
            .tracked_uses()
            .into_iter()
            .map(|(_, n)| n)
            .min()
            .unwrap();
        assert!(NextUse::At(9, 0) >= retained_min);
    }

    #[test]
    fn no_future_use_is_evicted_first() {
        let mut files = table(2);
        files[0].pending_uses = VecDeque::from(vec![(0, 0)]); // exhausted after first use
        files[1].pending_uses = VecDeque::from(vec![(0, 1), (1, 0)]);
        let mut pool = HandlePool::with_budget(1);
        let mut closed = Vec::new();
        for id in 0..2 {
            files[id].handle = Some(id as u32);
            let mut close = |h: &mut u32| closed.push(*h);
            pool.manage(&mut files, id, false, &mut close);
        }
        // the pool only rebalances when a new registration pushes it over
        // budget; file 1's second use does that
        let mut close = |h: &mut u32| closed.push(*h);
        pool.manage(&mut files, 1, false, &mut close);
        // file 0 had no remaining use, so it is the victim even though file
        // 1's next use was more distant than any of file 0's
        assert_eq!(closed, vec![0]);
    }

    #[test]
    fn close_if_done_releases_only_exhausted() {
        let mut files = table(2);
        files[0].pending_uses = VecDeque::new();
        files[0].handle = Some(7);
        files[1].pending_uses = VecDeque::from(vec![(4, 0)]);
        files[1].handle = Some(8);
        let mut pool = HandlePool::with_budget(8);
        let mut closed = Vec::new();
        let mut close = |h: &mut u32| closed.push(*h);
        pool.close_if_done(&mut files, 0, &mut close);
        pool.close_if_done(&mut files, 1, &mut close);
        assert_eq!(closed, vec![7]);
        assert!(files[0].handle.is_none());
        assert!(files[1].handle.is_some());
    }
}
