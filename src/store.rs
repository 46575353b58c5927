// src/store.rs
//
//! Rank-local record store and the per-mini-batch exchange protocol.
//!
//! Each rank stages a disjoint subset of the epoch's compacted records
//! (preloaded up front, or captured on the fly during the first epoch). At
//! every mini-batch step the ranks consult the owner map, send each owned
//! record to the rank that will consume it this step, and rebuild their
//! working set from the matching receives. Sends are posted non-blocking and
//! tagged with the sample id, so arrival order never matters.
//!
//! The store also carries the operational machinery around that core path:
//! collective owner-map and size-map construction, spill-to-disk for
//! memory-constrained runs, a checkpoint of the staged records with CRC
//! verification, a node-local shared-memory preload cache, and a
//! `/proc/meminfo` capacity pre-check.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::comm::Comm;
use crate::config::StoreOptions;
use crate::constants::{MAX_FILES_PER_DIRECTORY, METADATA_PREFIX, RECORD_DIR_PREFIX, STATE_PREFIX};
use crate::error::{Result, StageError};
use crate::owner_map::OwnerMap;
use crate::record::{CompactedRecord, Record};

#[cfg(unix)]
use crate::bundle::BundleFormat;
#[cfg(unix)]
use crate::manifest::SampleName;
#[cfg(unix)]
use crate::sample_list::SampleList;
#[cfg(unix)]
use crate::shm::SharedSegment;

/// Per-record checkpoint metadata; the CRC is over the full wire blob.
#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    id: usize,
    bucket: usize,
    size: usize,
    checksum: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreState {
    epoch: usize,
    num_records: usize,
    size_varies: bool,
    wall_time: String,
}

/// Mutable maps shared with fetch workers.
#[derive(Default)]
struct StoreInner {
    /// Records this rank owns for the whole epoch.
    data: HashMap<usize, CompactedRecord>,
    /// Working set rebuilt by each exchange round.
    minibatch: HashMap<usize, CompactedRecord>,
    /// First compacted size seen; uniform unless `size_varies` is set.
    compacted_size: Option<usize>,
    size_varies: bool,
}

pub struct DataStore {
    comm: Arc<dyn Comm>,
    opts: StoreOptions,
    inner: Mutex<StoreInner>,
    owner_map: OwnerMap,
    /// id -> compacted size, replicated across ranks by the size exchange.
    sample_sizes: HashMap<usize, usize>,
    shuffled: Vec<usize>,
    send_buckets: Vec<BTreeSet<usize>>,
    recv_buckets: Vec<BTreeSet<usize>>,
    /// id -> spill bucket, for records evicted to disk.
    spilled: HashMap<usize, usize>,
    spill_bucket: usize,
    spill_count: usize,
    #[cfg(unix)]
    cache_segment: Option<Arc<SharedSegment>>,
    preloaded: bool,
    /// Flips only inside collective operations, so every rank agrees on it.
    have_sample_sizes: bool,
    epoch: usize,
    exchange_seconds: f64,
}

impl DataStore {
    pub fn new(comm: Arc<dyn Comm>, opts: StoreOptions) -> Self {
        let np = comm.world_size();
        Self {
            comm,
            opts,
            inner: Mutex::new(StoreInner::default()),
            owner_map: OwnerMap::new(),
            sample_sizes: HashMap::new(),
            shuffled: Vec::new(),
            send_buckets: vec![BTreeSet::new(); np],
            recv_buckets: vec![BTreeSet::new(); np],
            spilled: HashMap::new(),
            spill_bucket: 0,
            spill_count: 0,
            #[cfg(unix)]
            cache_segment: None,
            preloaded: false,
            have_sample_sizes: false,
            epoch: 0,
            exchange_seconds: 0.0,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    pub fn is_preloaded(&self) -> bool {
        self.preloaded
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Fix the epoch's traversal order. Must be identical on every rank.
    pub fn set_shuffled_indices(&mut self, shuffled: Vec<usize>) {
        self.shuffled = shuffled;
    }

    pub fn shuffled_indices(&self) -> &[usize] {
        &self.shuffled
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| StageError::Invariant("store lock poisoned".to_string()))
    }

    fn note_compacted_size(inner: &mut StoreInner, size: usize) {
        match inner.compacted_size {
            None => inner.compacted_size = Some(size),
            Some(s) if s != size && !inner.size_varies => {
                log::debug!("record sizes vary ({} vs {})", s, size);
                inner.size_varies = true;
            }
            _ => {}
        }
    }

    /// Stage one record under this rank's ownership. Compacts it, then
    /// either keeps it in memory or spills it if a spill directory is set.
    pub fn set_record(&mut self, id: usize, rec: &Record) -> Result<()> {
        let compacted = CompactedRecord::compact(rec)?;
        self.set_compacted_record(id, compacted)
    }

    /// Stage an already-compacted record (preload and checkpoint paths).
    pub fn set_compacted_record(&mut self, id: usize, rec: CompactedRecord) -> Result<()> {
        let size = rec.size();
        let spill_to = self.opts.spill_dir.clone();
        {
            let mut inner = self.lock()?;
            if inner.data.contains_key(&id) || self.spilled.contains_key(&id) {
                return Err(StageError::DuplicateId {
                    id,
                    context: "set_record".to_string(),
                });
            }
            Self::note_compacted_size(&mut inner, size);
            if spill_to.is_none() {
                inner.data.insert(id, rec.clone());
            }
        }
        self.sample_sizes.insert(id, size);
        if let Some(dir) = spill_to {
            self.spill_record(&dir, id, &rec.wire_bytes())?;
        }
        Ok(())
    }

    /// Fetch a record for consumption: the current mini-batch working set
    /// first, then this rank's own staged data.
    pub fn get_record(&self, id: usize) -> Result<CompactedRecord> {
        let inner = self.lock()?;
        if let Some(r) = inner.minibatch.get(&id) {
            return Ok(r.clone());
        }
        if let Some(r) = inner.data.get(&id) {
            return Ok(r.clone());
        }
        Err(StageError::NotFound {
            id,
            context: "get_record".to_string(),
        })
    }

    pub fn has_record(&self, id: usize) -> bool {
        self.lock()
            .map(|i| i.data.contains_key(&id))
            .unwrap_or(false)
            || self.spilled.contains_key(&id)
    }

    pub fn local_record_count(&self) -> usize {
        self.lock().map(|i| i.data.len()).unwrap_or(0) + self.spilled.len()
    }

    pub fn local_record_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .lock()
            .map(|i| i.data.keys().copied().collect())
            .unwrap_or_default();
        ids.extend(self.spilled.keys().copied());
        ids.sort_unstable();
        ids
    }

    /// Total records staged across all ranks.
    pub fn global_record_count(&self) -> Result<usize> {
        Ok(self.comm.all_reduce_sum(self.local_record_count() as u64)? as usize)
    }

    /// Materialize every staged record's contiguous wire blob so nothing is
    /// left to build on the exchange hot path.
    pub fn compact_records(&self) -> Result<()> {
        let inner = self.lock()?;
        for rec in inner.data.values() {
            let _ = rec.wire_bytes();
        }
        Ok(())
    }

    /// Move the records named by `move_list` (with their sizes and
    /// ownership entries) into a new store sharing this communicator, for a
    /// validation split. Ids not staged here are skipped; other ranks move
    /// their own share.
    pub fn carve(&mut self, move_list: &HashSet<usize>) -> Result<DataStore> {
        let mut carved = DataStore::new(Arc::clone(&self.comm), self.opts.clone());
        {
            let mut inner = self.lock()?;
            let mut dest = carved.lock()?;
            for &id in move_list {
                if let Some(rec) = inner.data.remove(&id) {
                    DataStore::note_compacted_size(&mut dest, rec.size());
                    dest.data.insert(id, rec);
                }
            }
        }
        for &id in move_list {
            if let Some(size) = self.sample_sizes.remove(&id) {
                carved.sample_sizes.insert(id, size);
            }
            if let Some(owner) = self.owner_map.remove(id) {
                carved.owner_map.insert(id, owner);
            }
        }
        log::info!(
            "carved {} records into a new store",
            carved.local_record_count()
        );
        Ok(carved)
    }

    /// Drop staged records whose ids are not in `keep` (after a validation
    /// split carved samples away from this store's role).
    pub fn purge_unused(&mut self, keep: &HashSet<usize>) -> Result<()> {
        let mut inner = self.lock()?;
        let before = inner.data.len();
        inner.data.retain(|id, _| keep.contains(id));
        let dropped = before - inner.data.len();
        drop(inner);
        self.sample_sizes.retain(|id, _| keep.contains(id));
        let stale: Vec<usize> = self
            .owner_map
            .iter()
            .map(|(i, _)| i)
            .filter(|i| !keep.contains(i))
            .collect();
        for i in stale {
            self.owner_map.remove(i);
        }
        if dropped > 0 {
            log::info!("purged {} unused records", dropped);
        }
        Ok(())
    }

    // ---- collective map construction ------------------------------------

    /// Rebuild the owner map from the per-rank staged counts, assuming each
    /// rank preloaded a contiguous run of the shuffled permutation.
    pub fn build_preloaded_owner_map(&mut self) -> Result<()> {
        let sizes = self
            .comm
            .all_gather_u64(self.local_record_count() as u64)?;
        self.owner_map.build_preloaded(&sizes, &self.shuffled)?;
        self.preloaded = true;
        Ok(())
    }

    /// Replicate every rank's owned-id set into each rank's owner map. Two
    /// ranks claiming one id is fatal.
    pub fn exchange_owner_maps(&mut self) -> Result<()> {
        let me = self.comm.rank();
        let mine: Vec<u64> = self.local_record_ids().iter().map(|&i| i as u64).collect();
        self.owner_map.clear();
        for root in 0..self.comm.world_size() {
            let mut buf = if root == me {
                serde_json::to_vec(&mine)?
            } else {
                Vec::new()
            };
            self.comm.broadcast_bytes(root, &mut buf)?;
            let ids: Vec<u64> = serde_json::from_slice(&buf)?;
            for id in ids {
                let id = id as usize;
                if self.owner_map.contains(id) {
                    return Err(StageError::DuplicateId {
                        id,
                        context: format!("owner-map exchange, claimed again by rank {}", root),
                    });
                }
                self.owner_map.insert(id, root);
            }
        }
        Ok(())
    }

    /// Replicate every rank's id -> compacted-size map, for receive-side
    /// buffer accounting. Duplicate ids across ranks are fatal here too.
    pub fn exchange_sample_sizes(&mut self) -> Result<()> {
        let me = self.comm.rank();
        let mine: Vec<(u64, u64)> = self
            .sample_sizes
            .iter()
            .map(|(&id, &s)| (id as u64, s as u64))
            .collect();
        for root in 0..self.comm.world_size() {
            let mut buf = if root == me {
                serde_json::to_vec(&mine)?
            } else {
                Vec::new()
            };
            self.comm.broadcast_bytes(root, &mut buf)?;
            let sizes: Vec<(u64, u64)> = serde_json::from_slice(&buf)?;
            for (id, size) in sizes {
                let id = id as usize;
                if root != me && self.sample_sizes.contains_key(&id) {
                    return Err(StageError::DuplicateId {
                        id,
                        context: format!("size exchange, announced again by rank {}", root),
                    });
                }
                self.sample_sizes.insert(id, size as usize);
            }
        }
        self.have_sample_sizes = true;
        log::debug!("size exchange complete: {} ids known", self.sample_sizes.len());
        Ok(())
    }

    pub fn owner_map(&self) -> &OwnerMap {
        &self.owner_map
    }

    pub fn insert_owner(&mut self, id: usize, rank: usize) {
        self.owner_map.insert(id, rank);
    }

    // ---- per-mini-batch exchange ----------------------------------------

    fn build_exchange_buckets(&mut self, start: usize, end: usize) -> Result<()> {
        let np = self.comm.world_size();
        let me = self.comm.rank();
        let mb = self.opts.mini_batch_size.max(1);
        self.send_buckets = vec![BTreeSet::new(); np];
        self.recv_buckets = vec![BTreeSet::new(); np];
        for i in start..end {
            let idx = self.shuffled[i];
            let owner = self.owner_map.owner_of(idx)?;
            let consumer = (i % mb) % np;
            if owner == me {
                if !self.has_record(idx) {
                    return Err(StageError::NotFound {
                        id: idx,
                        context: format!("owned sample missing at exchange position {}", i),
                    });
                }
                self.send_buckets[consumer].insert(idx);
            }
            if consumer == me {
                self.recv_buckets[owner].insert(idx);
            }
        }
        Ok(())
    }

    /// The wire blob for an owned record: from memory if staged there, else
    /// reloaded from its spill bucket.
    fn owned_wire(&self, id: usize) -> Result<Bytes> {
        if let Some(rec) = self.lock()?.data.get(&id) {
            return Ok(rec.wire_bytes());
        }
        if let Some(&bucket) = self.spilled.get(&id) {
            let dir = self.opts.spill_dir.as_ref().ok_or_else(|| {
                StageError::Invariant("spilled record without a spill directory".to_string())
            })?;
            let path = record_path(dir, self.comm.rank(), bucket, id);
            let blob = fs::read(&path)?;
            return Ok(Bytes::from(blob));
        }
        Err(StageError::NotFound {
            id,
            context: "owned_wire".to_string(),
        })
    }

    /// One round of the exchange protocol for mini-batch `step`.
    ///
    /// On return, the working set holds exactly the records this rank
    /// consumes at this step; the previous step's working set is gone. The
    /// first round also runs the size exchange if it has not happened yet.
    /// A step past the end of the epoch is not an error: it returns
    /// `Ok(false)` without exchanging, so drivers with a padded step count
    /// can tell exhaustion from a protocol failure.
    pub fn exchange_minibatch(&mut self, step: usize) -> Result<bool> {
        let t0 = Instant::now();
        let mb = self.opts.mini_batch_size.max(1);
        let start = step * mb;
        if start >= self.shuffled.len() {
            log::debug!(
                "mini-batch step {} past the epoch's {} samples; nothing to exchange",
                step,
                self.shuffled.len()
            );
            return Ok(false);
        }
        let end = (start + mb).min(self.shuffled.len());

        // the guard state only changes inside collectives, so every rank
        // takes this branch together or not at all
        if step == 0 && self.epoch == 0 && !self.have_sample_sizes {
            self.exchange_sample_sizes()?;
        }
        self.build_exchange_buckets(start, end)?;

        let send = std::mem::take(&mut self.send_buckets);
        for (dest, bucket) in send.iter().enumerate() {
            for &id in bucket {
                let wire = self.owned_wire(id)?;
                self.comm.post_send(dest, id as u64, wire)?;
            }
        }
        self.send_buckets = send;

        let recv = std::mem::take(&mut self.recv_buckets);
        {
            let mut inner = self.lock()?;
            inner.minibatch.clear();
        }
        for (src, bucket) in recv.iter().enumerate() {
            for &id in bucket {
                let wire = self.comm.wait_recv(src, id as u64)?;
                if let Some(&expected) = self.sample_sizes.get(&id) {
                    if expected != wire.len() {
                        return Err(StageError::CountMismatch {
                            context: format!("wire size of sample {}", id),
                            expected,
                            found: wire.len(),
                        });
                    }
                }
                let rec = CompactedRecord::from_wire(wire)?;
                let mut inner = self.lock()?;
                if inner.minibatch.insert(id, rec).is_some() {
                    return Err(StageError::DuplicateId {
                        id,
                        context: "mini-batch working set".to_string(),
                    });
                }
            }
        }
        self.recv_buckets = recv;

        // every position this rank consumes must now be resolvable
        let np = self.comm.world_size();
        let me = self.comm.rank();
        let inner = self.lock()?;
        for i in start..end {
            if (i % mb) % np != me {
                continue;
            }
            if !inner.minibatch.contains_key(&self.shuffled[i]) {
                return Err(StageError::StarvedMiniBatch { position: i });
            }
        }
        drop(inner);

        self.exchange_seconds += t0.elapsed().as_secs_f64();
        if self.opts.debug {
            log::debug!(
                "exchange step {}: sent {}, received {}",
                step,
                self.send_buckets.iter().map(|b| b.len()).sum::<usize>(),
                self.recv_buckets.iter().map(|b| b.len()).sum::<usize>()
            );
        }
        Ok(true)
    }

    /// Close out an epoch: log cumulative exchange time and reset the clock.
    pub fn finish_epoch(&mut self) {
        log::info!(
            "epoch {}: exchange took {:.3}s on rank {}",
            self.epoch,
            self.exchange_seconds,
            self.comm.rank()
        );
        self.epoch += 1;
        self.exchange_seconds = 0.0;
    }

    pub fn exchange_seconds(&self) -> f64 {
        self.exchange_seconds
    }

    // ---- capacity pre-check ---------------------------------------------

    /// Estimate whether `total_samples` staged records fit in available
    /// memory, reading `MemAvailable` from `meminfo` (normally
    /// `/proc/meminfo`). Needs at least one staged record to know a size;
    /// skips silently otherwise.
    pub fn check_mem_capacity(&self, meminfo: &Path, total_samples: usize) -> Result<()> {
        let per_record = match self.lock()?.compacted_size {
            Some(s) => s,
            None => {
                log::debug!("no staged record yet; skipping memory pre-check");
                return Ok(());
            }
        };
        let text = fs::read_to_string(meminfo)?;
        let available_kb = text
            .lines()
            .find_map(|l| {
                l.strip_prefix("MemAvailable:")
                    .and_then(|rest| rest.split_whitespace().next())
                    .and_then(|t| t.parse::<u64>().ok())
            })
            .ok_or_else(|| {
                StageError::Invariant(format!("no MemAvailable line in {}", meminfo.display()))
            })?;
        // every rank on a node stages its shard into the same physical memory
        let per_node = total_samples.div_ceil(
            (self.comm.world_size() / self.comm.ranks_per_node()).max(1),
        );
        let needed = per_record as u64 * per_node as u64;
        let available = available_kb * 1024;
        if needed > available {
            return Err(StageError::ResourceExhausted(format!(
                "staging needs ~{} bytes per node but only {} are available",
                needed, available
            )));
        }
        log::info!(
            "memory pre-check: ~{} bytes per node needed, {} available",
            needed,
            available
        );
        Ok(())
    }

    // ---- spill and checkpoint -------------------------------------------

    fn spill_record(&mut self, base: &Path, id: usize, wire: &Bytes) -> Result<()> {
        if self.spill_count >= MAX_FILES_PER_DIRECTORY {
            self.spill_bucket += 1;
            self.spill_count = 0;
        }
        let dir = bucket_dir(base, self.comm.rank(), self.spill_bucket);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(id.to_string()), wire)?;
        self.spilled.insert(id, self.spill_bucket);
        self.spill_count += 1;
        Ok(())
    }

    /// Write every staged record plus metadata and state under `dir`. Layout
    /// per rank: `records_<rank>/<bucket>/<id>` blobs, a `metadata_<rank>`
    /// manifest with per-record CRCs, and a `state_<rank>` snapshot.
    pub fn write_checkpoint(&self, dir: &Path) -> Result<()> {
        let rank = self.comm.rank();
        let inner = self.lock()?;
        let mut metas = Vec::with_capacity(inner.data.len());
        let mut bucket = 0usize;
        let mut in_bucket = 0usize;
        let mut ids: Vec<&usize> = inner.data.keys().collect();
        ids.sort_unstable();
        for &id in ids {
            if in_bucket >= MAX_FILES_PER_DIRECTORY {
                bucket += 1;
                in_bucket = 0;
            }
            let rec = &inner.data[&id];
            let wire = rec.wire_bytes();
            let bdir = bucket_dir(dir, rank, bucket);
            fs::create_dir_all(&bdir)?;
            fs::write(bdir.join(id.to_string()), &wire)?;
            metas.push(RecordMeta {
                id,
                bucket,
                size: wire.len(),
                checksum: crc32fast::hash(&wire),
            });
            in_bucket += 1;
        }
        let state = StoreState {
            epoch: self.epoch,
            num_records: metas.len(),
            size_varies: inner.size_varies,
            wall_time: chrono::Utc::now().to_rfc3339(),
        };
        drop(inner);
        fs::write(
            dir.join(format!("{}{}", METADATA_PREFIX, rank)),
            serde_json::to_vec(&metas)?,
        )?;
        fs::write(
            dir.join(format!("{}{}", STATE_PREFIX, rank)),
            serde_json::to_vec_pretty(&state)?,
        )?;
        log::info!("checkpointed {} records to {}", metas.len(), dir.display());
        Ok(())
    }

    /// Reload this rank's checkpoint from `dir`, verifying each record's
    /// CRC against the metadata manifest.
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let rank = self.comm.rank();
        let metas: Vec<RecordMeta> =
            serde_json::from_slice(&fs::read(dir.join(format!("{}{}", METADATA_PREFIX, rank)))?)?;
        let state: StoreState =
            serde_json::from_slice(&fs::read(dir.join(format!("{}{}", STATE_PREFIX, rank)))?)?;
        {
            let mut inner = self.lock()?;
            inner.data.clear();
            inner.compacted_size = None;
            inner.size_varies = false;
        }
        self.spilled.clear();
        self.sample_sizes.clear();
        for meta in &metas {
            let path = bucket_dir(dir, rank, meta.bucket).join(meta.id.to_string());
            let blob = fs::read(&path)?;
            let crc = crc32fast::hash(&blob);
            if crc != meta.checksum || blob.len() != meta.size {
                return Err(StageError::Invariant(format!(
                    "checkpoint record {} is corrupt ({} bytes, crc {:#010x})",
                    meta.id,
                    blob.len(),
                    crc
                )));
            }
            let rec = CompactedRecord::from_wire(Bytes::from(blob))?;
            let mut inner = self.lock()?;
            Self::note_compacted_size(&mut inner, rec.size());
            inner.data.insert(meta.id, rec);
            drop(inner);
            self.sample_sizes.insert(meta.id, meta.size);
        }
        self.epoch = state.epoch;
        log::info!(
            "restored {} records from {} (written {})",
            metas.len(),
            dir.display(),
            state.wall_time
        );
        Ok(())
    }

    /// Self-test the checkpoint path: write, clear, reload, and verify the
    /// restored records match what was staged.
    pub fn test_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let before: HashMap<usize, u32> = {
            let inner = self.lock()?;
            inner.data.iter().map(|(&id, r)| (id, r.checksum())).collect()
        };
        self.write_checkpoint(dir)?;
        self.lock()?.data.clear();
        self.load_checkpoint(dir)?;
        let inner = self.lock()?;
        if inner.data.len() != before.len() {
            return Err(StageError::CountMismatch {
                context: "checkpoint self-test record count".to_string(),
                expected: before.len(),
                found: inner.data.len(),
            });
        }
        for (id, crc) in &before {
            let restored = inner.data.get(id).ok_or(StageError::NotFound {
                id: *id,
                context: "checkpoint self-test".to_string(),
            })?;
            if restored.checksum() != *crc {
                return Err(StageError::Invariant(format!(
                    "checkpoint self-test: record {} came back different",
                    id
                )));
            }
        }
        log::info!("checkpoint self-test passed ({} records)", before.len());
        Ok(())
    }

    // ---- node-local shared-memory preload cache -------------------------

    /// Stage the entire list into one shared-memory segment per node. The
    /// node master reads and compacts every sample; the other local ranks
    /// attach read-only after the node barrier. Every rank then serves any
    /// id zero-copy from the mapping.
    #[cfg(unix)]
    pub fn preload_local_cache<B: BundleFormat, N: SampleName>(
        &mut self,
        list: &mut SampleList<B, N>,
        tag: &str,
    ) -> Result<()> {
        let node_id = self.comm.rank() / self.comm.ranks_per_node();
        let is_master = self.comm.node_rank() == 0;

        // (id, offset, len) table plus total length, built by the master
        let mut layout: Vec<(usize, usize, usize)> = Vec::new();
        let mut total = 0usize;

        let segment = if is_master {
            let mut blobs = Vec::with_capacity(list.size());
            for idx in 0..list.size() {
                list.open_sample_handle(idx, false)?;
                let rec = list.read_record(idx)?;
                let wire = CompactedRecord::compact(&rec)?.wire_bytes();
                layout.push((idx, total, wire.len()));
                total += wire.len();
                blobs.push(wire);
            }
            let mut seg = SharedSegment::create(tag, node_id, total.max(1))?;
            {
                let buf = seg.as_mut_slice()?;
                for ((_, offset, len), wire) in layout.iter().zip(&blobs) {
                    buf[*offset..*offset + *len].copy_from_slice(wire);
                }
            }
            Some(seg)
        } else {
            None
        };

        // every node master broadcasts its layout in node order; the whole
        // world participates in each broadcast, only the node keeps its own
        let rpn = self.comm.ranks_per_node();
        let num_nodes = self.comm.world_size().div_ceil(rpn);
        for node in 0..num_nodes {
            let root = node * rpn;
            let mut packed = if self.comm.rank() == root {
                serde_json::to_vec(&(total, &layout))?
            } else {
                Vec::new()
            };
            self.comm.broadcast_bytes(root, &mut packed)?;
            if node == node_id && !is_master {
                let unpacked: (usize, Vec<(usize, usize, usize)>) =
                    serde_json::from_slice(&packed)?;
                total = unpacked.0;
                layout = unpacked.1;
            }
        }

        // creation happens-before attachment
        self.comm.node_barrier()?;
        let segment = match segment {
            Some(seg) => Arc::new(seg),
            None => Arc::new(SharedSegment::attach(tag, node_id, total.max(1))?),
        };

        {
            let mut inner = self.lock()?;
            for &(id, offset, len) in &layout {
                let rec = CompactedRecord::from_wire(segment.slice(offset, len)?)?;
                Self::note_compacted_size(&mut inner, rec.size());
                inner.data.insert(id, rec);
            }
        }
        // any rank can serve any id from the mapping, but each id still
        // gets exactly one owner so the exchange sends each record once
        let np = self.comm.world_size();
        for &(id, _, len) in &layout {
            self.sample_sizes.insert(id, len);
            self.owner_map.insert(id, id % np);
        }
        self.cache_segment = Some(segment);
        self.preloaded = true;
        self.have_sample_sizes = true;
        log::info!(
            "preloaded {} records ({} bytes) into node {} cache",
            layout.len(),
            total,
            node_id
        );
        Ok(())
    }
}

fn bucket_dir(base: &Path, rank: usize, bucket: usize) -> PathBuf {
    base.join(format!("{}{}", RECORD_DIR_PREFIX, rank))
        .join(bucket.to_string())
}

fn record_path(base: &Path, rank: usize, bucket: usize, id: usize) -> PathBuf {
    bucket_dir(base, rank, bucket).join(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::record::Value;

    fn record(id: usize) -> Record {
        let mut r = Record::new();
        r.set(&format!("{}/x", id), Value::Int(id as i64));
        r.set(&format!("{}/w", id), Value::FloatArray(vec![id as f32; 4]));
        r
    }

    fn single_rank_store() -> DataStore {
        let comm: Arc<dyn Comm> = Arc::new(LocalComm::world(1, 1).remove(0));
        DataStore::new(comm, StoreOptions::default())
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut store = single_rank_store();
        store.set_record(3, &record(3)).unwrap();
        let got = store.get_record(3).unwrap();
        assert_eq!(got.field("3/x").unwrap().as_i64(), Some(3));
        assert!(store.has_record(3));
        assert!(matches!(
            store.get_record(4),
            Err(StageError::NotFound { id: 4, .. })
        ));
    }

    #[test]
    fn duplicate_set_is_fatal() {
        let mut store = single_rank_store();
        store.set_record(1, &record(1)).unwrap();
        assert!(matches!(
            store.set_record(1, &record(1)),
            Err(StageError::DuplicateId { id: 1, .. })
        ));
    }

    #[test]
    fn spilled_records_count_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let comm: Arc<dyn Comm> = Arc::new(LocalComm::world(1, 1).remove(0));
        let opts = StoreOptions::default().with_spill_dir(dir.path());
        let mut store = DataStore::new(comm, opts);
        for id in 0..5 {
            store.set_record(id, &record(id)).unwrap();
        }
        assert_eq!(store.local_record_count(), 5);
        assert!(store.has_record(2));
        // spilled records come back through the owned-record path
        let wire = store.owned_wire(2).unwrap();
        let rec = CompactedRecord::from_wire(wire).unwrap();
        assert_eq!(rec.field("2/x").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn checkpoint_self_test_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = single_rank_store();
        for id in 0..8 {
            store.set_record(id, &record(id)).unwrap();
        }
        store.test_checkpoint(dir.path()).unwrap();
        assert_eq!(store.local_record_count(), 8);
        assert_eq!(store.get_record(5).unwrap().field("5/x").unwrap().as_i64(), Some(5));
    }

    #[test]
    fn corrupt_checkpoint_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = single_rank_store();
        store.set_record(0, &record(0)).unwrap();
        store.write_checkpoint(dir.path()).unwrap();
        let victim = record_path(dir.path(), 0, 0, 0);
        let mut blob = fs::read(&victim).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        fs::write(&victim, blob).unwrap();
        assert!(store.load_checkpoint(dir.path()).is_err());
    }

    #[test]
    fn mem_capacity_check_reads_meminfo() {
        let dir = tempfile::tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        let mut store = single_rank_store();
        store.set_record(0, &record(0)).unwrap();

        fs::write(&meminfo, "MemTotal: 100 kB\nMemAvailable: 1000000 kB\n").unwrap();
        store.check_mem_capacity(&meminfo, 100).unwrap();

        fs::write(&meminfo, "MemAvailable: 0 kB\n").unwrap();
        assert!(matches!(
            store.check_mem_capacity(&meminfo, 100),
            Err(StageError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn single_rank_exchange_builds_working_set() {
        let comm: Arc<dyn Comm> = Arc::new(LocalComm::world(1, 1).remove(0));
        // mini-batch of 2: three steps cover the epoch
        let mut store = DataStore::new(comm, StoreOptions::default().with_mini_batch_size(2));
        let n = 6;
        for id in 0..n {
            store.set_record(id, &record(id)).unwrap();
        }
        store.set_shuffled_indices(vec![5, 3, 1, 0, 4, 2]);
        store.build_preloaded_owner_map().unwrap();

        for step in 0..3 {
            assert!(store.exchange_minibatch(step).unwrap());
            for i in (step * 2)..(step * 2 + 2) {
                let idx = store.shuffled_indices()[i];
                store.get_record(idx).unwrap();
            }
        }
        // past the last step is exhaustion, not a protocol failure
        assert!(!store.exchange_minibatch(3).unwrap());
        store.finish_epoch();
        assert_eq!(store.epoch(), 1);
    }

    #[test]
    fn carve_moves_records_and_ownership() {
        let mut store = single_rank_store();
        for id in 0..6 {
            store.set_record(id, &record(id)).unwrap();
            store.insert_owner(id, 0);
        }
        let move_list: HashSet<usize> = [4, 5].into_iter().collect();
        let val = store.carve(&move_list).unwrap();
        assert_eq!(val.local_record_ids(), vec![4, 5]);
        assert_eq!(store.local_record_ids(), vec![0, 1, 2, 3]);
        assert_eq!(val.owner_map().owner_of(5).unwrap(), 0);
        assert!(store.owner_map().owner_of(5).is_err());
        assert!(store.get_record(4).is_err());
        val.get_record(4).unwrap();
    }

    #[test]
    fn purge_drops_unlisted_records() {
        let mut store = single_rank_store();
        for id in 0..4 {
            store.set_record(id, &record(id)).unwrap();
        }
        let keep: HashSet<usize> = [0, 2].into_iter().collect();
        store.purge_unused(&keep).unwrap();
        assert_eq!(store.local_record_ids(), vec![0, 2]);
    }
}
