// src/sample_list.rs
//
//! The sharded sample list: which samples exist, which bundle file holds
//! each, and the machinery to open those files on demand under the handle
//! pool's budget.
//!
//! A list is loaded from a manifest (see [`crate::manifest`]), optionally
//! sharded by `(stride, offset)` so each rank keeps every stride-th body
//! line (and never opens the bundle files of the lines it skips).
//! Exclusion-form manifests are resolved against the actual bundle contents
//! at load time; in memory the list is always inclusion-form. Ranks can
//! merge their shards back into a replicated full list with
//! [`SampleList::all_gather_packed_lists`].

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bundle::{open_with_retry, BundleFormat};
use crate::comm::Comm;
use crate::constants::MAX_OPEN_RETRY;
use crate::error::{Result, StageError};
use crate::handle_pool::{FileEntry, HandlePool};
use crate::manifest::{
    parse_file_line, read_header, write_header, ManifestHeader, SampleName,
};
use crate::record::Record;

/// Identifies one sample: the index of its bundle file in the file table,
/// plus its name inside that bundle.
pub type SampleRef<N> = (usize, N);

/// Wire form of a sharded list, exchanged between ranks. Names travel as
/// their display strings and are re-parsed on the far side.
#[derive(Debug, Serialize, Deserialize)]
struct PackedList {
    root_dir: PathBuf,
    /// (filename, total samples in that file)
    files: Vec<(String, usize)>,
    /// (file index into `files`, sample name)
    samples: Vec<(usize, String)>,
}

pub struct SampleList<B: BundleFormat, N: SampleName> {
    bundle: B,
    header: ManifestHeader,
    samples: Vec<SampleRef<N>>,
    files: Vec<FileEntry<B::Handle>>,
    /// Total samples each file holds (included and excluded alike), from
    /// enumerating the file at load time.
    file_sizes: Vec<usize>,
    pool: HandlePool,
}

impl<B: BundleFormat, N: SampleName> SampleList<B, N> {
    pub fn new(bundle: B) -> Self {
        Self {
            bundle,
            header: ManifestHeader::default(),
            samples: Vec::new(),
            files: Vec::new(),
            file_sizes: Vec::new(),
            pool: HandlePool::default(),
        }
    }

    /// Parse only the three-line header of a manifest on disk.
    pub fn load_header(path: &Path) -> Result<ManifestHeader> {
        let f = File::open(path)?;
        let mut reader = BufReader::new(f);
        read_header(&mut reader, &path.display().to_string())
    }

    /// Load a manifest from disk, keeping every `stride`-th body line
    /// starting at `offset`. `stride == 1, offset == 0` loads the whole
    /// list; sharded loads never open the bundle files of skipped lines.
    pub fn load(&mut self, path: &Path, stride: usize, offset: usize) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.load_from_string(&text, &path.display().to_string(), stride, offset)
    }

    /// Load a manifest already in memory. `list_name` is used in error
    /// context only.
    pub fn load_from_string(
        &mut self,
        text: &str,
        list_name: &str,
        stride: usize,
        offset: usize,
    ) -> Result<()> {
        let stride = stride.max(1);
        let mut cursor = std::io::Cursor::new(text);
        let header = read_header(&mut cursor, list_name)?;
        self.clear();
        self.header = header;

        let body_start = cursor.position() as usize;
        let body = &text[body_start..];
        if self.header.is_exclusive() {
            self.assemble_exclusive(body, list_name, stride, offset)?;
        } else {
            self.assemble_inclusive(body, list_name, stride, offset)?;
        }

        // a sharded load only sees its own lines, so declared totals can
        // only be enforced on a whole-list load
        if stride == 1 {
            if self.files.len() != self.header.num_files() {
                return Err(StageError::CountMismatch {
                    context: format!("file count in {}", list_name),
                    expected: self.header.num_files(),
                    found: self.files.len(),
                });
            }
            if self.samples.len() != self.header.sample_count() {
                return Err(StageError::CountMismatch {
                    context: format!("sample count in {}", list_name),
                    expected: self.header.sample_count(),
                    found: self.samples.len(),
                });
            }
        }

        // resolved lists are always inclusion-form in memory
        self.header.set_exclusive(false);
        log::info!(
            "loaded {}: {} samples over {} files (stride {}, offset {})",
            list_name,
            self.samples.len(),
            self.files.len(),
            stride,
            offset
        );
        Ok(())
    }

    /// Register a file in the file table, enforcing that a filename listed
    /// twice reports the same total sample count each time.
    fn register_file(
        &mut self,
        file_map: &mut HashMap<String, usize>,
        filename: &str,
        total: usize,
        list_name: &str,
    ) -> Result<usize> {
        if let Some(&prior) = file_map.get(filename) {
            if prior != total {
                return Err(StageError::CountMismatch {
                    context: format!("file {} listed twice in {}", filename, list_name),
                    expected: prior,
                    found: total,
                });
            }
        } else {
            file_map.insert(filename.to_string(), total);
        }
        self.files.push(FileEntry::new(filename.to_string()));
        self.file_sizes.push(total);
        Ok(self.files.len() - 1)
    }

    fn assemble_exclusive(
        &mut self,
        body: &str,
        list_name: &str,
        stride: usize,
        offset: usize,
    ) -> Result<()> {
        let mut file_map = HashMap::new();
        let mut total_excluded = 0usize;

        for (line_idx, line) in body.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            // line-granular sharding: skip before opening the bundle
            if line_idx % stride != offset {
                continue;
            }
            let fl = parse_file_line(line, list_name)?;
            if fl.names.len() != fl.excluded {
                return Err(StageError::CountMismatch {
                    context: format!("excluded names for {} in {}", fl.filename, list_name),
                    expected: fl.excluded,
                    found: fl.names.len(),
                });
            }
            let path = self.header.root_dir().join(&fl.filename);
            let mut handle = match open_with_retry(&self.bundle, &path, MAX_OPEN_RETRY) {
                Ok(h) => h,
                Err(e) => {
                    // a later count check surfaces the shortfall
                    log::warn!("skipping unreadable bundle file {}: {}", path.display(), e);
                    continue;
                }
            };
            let names = self.bundle.list_sample_names(&handle)?;
            self.bundle.close(&mut handle);

            if names.len() != fl.included + fl.excluded {
                return Err(StageError::CountMismatch {
                    context: format!("samples in {} per {}", fl.filename, list_name),
                    expected: fl.included + fl.excluded,
                    found: names.len(),
                });
            }
            let excluded: HashSet<&str> = fl.names.iter().map(|s| s.as_str()).collect();
            let file_id =
                self.register_file(&mut file_map, &fl.filename, names.len(), list_name)?;
            total_excluded += fl.excluded;

            for name in &names {
                if excluded.contains(name.as_str()) {
                    continue;
                }
                self.samples.push((file_id, N::parse(name)?));
            }
        }

        if stride == 1 && total_excluded != self.header.excluded_count() {
            return Err(StageError::CountMismatch {
                context: format!("excluded sample total in {}", list_name),
                expected: self.header.excluded_count(),
                found: total_excluded,
            });
        }
        Ok(())
    }

    fn assemble_inclusive(
        &mut self,
        body: &str,
        list_name: &str,
        stride: usize,
        offset: usize,
    ) -> Result<()> {
        let mut file_map = HashMap::new();

        for (line_idx, line) in body.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            if line_idx % stride != offset {
                continue;
            }
            let fl = parse_file_line(line, list_name)?;
            if fl.names.len() != fl.included {
                return Err(StageError::CountMismatch {
                    context: format!("included names for {} in {}", fl.filename, list_name),
                    expected: fl.included,
                    found: fl.names.len(),
                });
            }
            let path = self.header.root_dir().join(&fl.filename);
            let mut handle = match open_with_retry(&self.bundle, &path, MAX_OPEN_RETRY) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("skipping unreadable bundle file {}: {}", path.display(), e);
                    continue;
                }
            };
            let names = self.bundle.list_sample_names(&handle)?;
            self.bundle.close(&mut handle);

            if names.len() != fl.included + fl.excluded {
                return Err(StageError::CountMismatch {
                    context: format!("samples in {} per {}", fl.filename, list_name),
                    expected: fl.included + fl.excluded,
                    found: names.len(),
                });
            }
            let present: HashSet<&str> = names.iter().map(|s| s.as_str()).collect();
            let file_id =
                self.register_file(&mut file_map, &fl.filename, names.len(), list_name)?;

            for name in &fl.names {
                if !present.contains(name.as_str()) {
                    return Err(StageError::UnknownSample {
                        name: name.clone(),
                        file: fl.filename.clone(),
                    });
                }
                self.samples.push((file_id, N::parse(name)?));
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<&SampleRef<N>> {
        self.samples.get(idx).ok_or(StageError::UnknownIndex {
            index: idx,
            map_len: self.samples.len(),
        })
    }

    pub fn sample_name(&self, idx: usize) -> Result<&N> {
        Ok(&self.get(idx)?.1)
    }

    pub fn file_name(&self, file_id: usize) -> Option<&str> {
        self.files.get(file_id).map(|f| f.filename.as_str())
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn header(&self) -> &ManifestHeader {
        &self.header
    }

    /// Drop all samples, files, and open handles.
    pub fn clear(&mut self) {
        self.close_all_handles();
        self.samples.clear();
        self.files.clear();
        self.file_sizes.clear();
        self.pool.clear();
    }

    fn close_all_handles(&mut self) {
        for f in self.files.iter_mut() {
            if let Some(mut h) = f.handle.take() {
                self.bundle.close(&mut h);
            }
        }
        self.pool.clear();
    }

    /// Render the list as an inclusion-form manifest. Per-file excluded
    /// counts are whatever this shard does not retain of each file.
    pub fn to_manifest_string(&self) -> String {
        let mut retained = vec![0usize; self.files.len()];
        for &(fid, _) in &self.samples {
            retained[fid] += 1;
        }
        let mut out = String::new();
        write_header(
            &mut out,
            self.samples.len(),
            self.files.len(),
            self.header.root_dir(),
        );
        for (fid, f) in self.files.iter().enumerate() {
            let excluded = self.file_sizes[fid].saturating_sub(retained[fid]);
            let _ = write!(out, "{} {} {}", f.filename, retained[fid], excluded);
            for &(sfid, ref name) in &self.samples {
                if sfid == fid {
                    let _ = write!(out, " {}", name);
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut f = File::create(path)?;
        f.write_all(self.to_manifest_string().as_bytes())?;
        Ok(())
    }

    fn pack(&self) -> Result<Vec<u8>> {
        let packed = PackedList {
            root_dir: self.header.root_dir().to_path_buf(),
            files: self
                .files
                .iter()
                .zip(&self.file_sizes)
                .map(|(f, &n)| (f.filename.clone(), n))
                .collect(),
            samples: self
                .samples
                .iter()
                .map(|(fid, n)| (*fid, n.to_string()))
                .collect(),
        };
        Ok(serde_json::to_vec(&packed)?)
    }

    /// Merge every rank's shard into a replicated full list, re-indexing
    /// files by name so a file referenced by several shards appears once.
    /// Samples land in rank order, each shard's samples in shard order. All
    /// handles are closed first; the merged list starts with a cold pool.
    pub fn all_gather_packed_lists(&mut self, comm: &Arc<dyn Comm>) -> Result<()> {
        self.close_all_handles();
        let packed = self.pack()?;
        let gathered = comm.all_gather_bytes(&packed)?;

        let mut files: Vec<FileEntry<B::Handle>> = Vec::new();
        let mut file_sizes = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut samples = Vec::new();

        for blob in gathered {
            let shard: PackedList = serde_json::from_slice(&blob)?;
            let remap: Vec<usize> = shard
                .files
                .iter()
                .map(|(name, total)| match by_name.get(name) {
                    Some(&id) => id,
                    None => {
                        let id = files.len();
                        by_name.insert(name.clone(), id);
                        files.push(FileEntry::new(name.clone()));
                        file_sizes.push(*total);
                        id
                    }
                })
                .collect();
            for (fid, name) in shard.samples {
                samples.push((remap[fid], N::parse(&name)?));
            }
        }

        self.samples = samples;
        self.files = files;
        self.file_sizes = file_sizes;
        self.pool = HandlePool::default();

        // the shards must tile the declared list exactly
        if self.samples.len() != self.header.sample_count() {
            return Err(StageError::CountMismatch {
                context: format!("merged sample total for {}", self.header.list_name()),
                expected: self.header.sample_count(),
                found: self.samples.len(),
            });
        }
        self.header.set_counts(self.samples.len(), self.files.len());
        log::debug!(
            "merged packed lists: {} samples over {} files",
            self.samples.len(),
            self.files.len()
        );
        Ok(())
    }

    /// Precompute every file's access points for the coming epoch and size
    /// the handle pool. Rank `rank` touches traversal position `i` when
    /// `(i % mb) % np == rank`; its step is `i / mb` and its substep
    /// `(i % mb) / np`.
    pub fn compute_epochs_file_usage(
        &mut self,
        shuffled: &[usize],
        mb_size: usize,
        rank: usize,
        np: usize,
        budget: Option<usize>,
    ) -> Result<()> {
        let mb = mb_size.max(1);
        let np = np.max(1);
        for f in self.files.iter_mut() {
            f.pending_uses.clear();
        }
        self.pool = match budget {
            Some(b) => HandlePool::with_budget(b),
            None => HandlePool::default(),
        };
        for (i, &idx) in shuffled.iter().enumerate() {
            if (i % mb) % np != rank {
                continue;
            }
            let fid = self.get(idx)?.0;
            let step = (i / mb) as u32;
            let substep = ((i % mb) / np) as u32;
            self.files[fid].pending_uses.push_back((step, substep));
        }
        Ok(())
    }

    /// Ensure the bundle file holding sample `idx` is open, opening (with
    /// bounded retry) and rebalancing the pool as needed. `predictive` marks
    /// a read-ahead open whose front pending use has not happened yet.
    pub fn open_sample_handle(&mut self, idx: usize, predictive: bool) -> Result<()> {
        let fid = self.get(idx)?.0;
        let needs_open = match &self.files[fid].handle {
            Some(h) => !self.bundle.is_valid(h),
            None => true,
        };
        if needs_open {
            let path = self.header.root_dir().join(&self.files[fid].filename);
            let handle = open_with_retry(&self.bundle, &path, MAX_OPEN_RETRY)?;
            self.files[fid].handle = Some(handle);
        }
        let bundle = &self.bundle;
        self.pool
            .manage(&mut self.files, fid, predictive, &mut |h| bundle.close(h));
        Ok(())
    }

    /// Read sample `idx` through its (already open) handle.
    pub fn read_record(&self, idx: usize) -> Result<Record> {
        let (fid, name) = self.get(idx)?;
        let entry = &self.files[*fid];
        let handle = entry.handle.as_ref().ok_or_else(|| {
            StageError::Invariant(format!(
                "sample {} read through a closed handle for {}",
                idx, entry.filename
            ))
        })?;
        self.bundle.read_sample(handle, &name.to_string())
    }

    /// Proactively close sample `idx`'s file if this epoch holds no further
    /// use for it.
    pub fn close_if_done(&mut self, idx: usize) -> Result<()> {
        let fid = self.get(idx)?.0;
        let bundle = &self.bundle;
        self.pool
            .close_if_done(&mut self.files, fid, &mut |h| bundle.close(h));
        Ok(())
    }

    /// Carve the last `count` samples off into a new list sharing the same
    /// file table, for a validation split. The donor keeps the rest.
    pub fn split_off_tail(&mut self, count: usize) -> Result<Self>
    where
        B: Clone,
    {
        if count > self.samples.len() {
            return Err(StageError::CountMismatch {
                context: "validation split size".to_string(),
                expected: self.samples.len(),
                found: count,
            });
        }
        let tail = self.samples.split_off(self.samples.len() - count);
        let mut carved = SampleList::new(self.bundle.clone());
        carved.header = self.header.clone();
        carved.samples = tail;
        carved.files = self
            .files
            .iter()
            .map(|f| FileEntry::new(f.filename.clone()))
            .collect();
        carved.file_sizes = self.file_sizes.clone();
        // both headers keep describing what their list holds
        carved.header.set_counts(count, carved.files.len());
        self.header.set_counts(self.samples.len(), self.files.len());
        Ok(carved)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &HandlePool {
        &self.pool
    }
}
