// src/config.rs
//
//! Configuration surface for the data-staging layer.
//!
//! These options are normally supplied by the embedding application's
//! configuration loader; `StoreOptions::from_env` exists so small tools and
//! tests can drive the layer from environment variables directly.
//!
//! Builder helpers are provided so callers can write a fluent style:
//!
//! let opts = StoreOptions::default()
//!     .with_mini_batch_size(128)
//!     .preload(true)
//!     .local_cache(true)
//!     .with_spill_dir("/l/ssd/spill");

use std::path::PathBuf;

use crate::constants::DEFAULT_MINI_BATCH_SIZE;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Emit per-sample debug logging (`log::debug!`) from the store.
    pub debug: bool,
    /// When set, newly inserted records are spilled to this directory instead
    /// of being held resident.
    pub spill_dir: Option<PathBuf>,
    /// Eagerly read and broadcast all raw data into a node-local shared
    /// memory segment before training begins.
    pub local_cache: bool,
    /// Populate the store up front (before the first epoch) rather than
    /// lazily during the first epoch.
    pub preload: bool,
    /// Samples per mini-batch step; also the ownership-map granularity.
    pub mini_batch_size: usize,
    /// Path to the sample-list manifest.
    pub sample_list_path: Option<PathBuf>,
    /// Parse only manifest body lines where `line_index % stride == offset`.
    pub stride: usize,
    pub offset: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            debug: false,
            spill_dir: None,
            local_cache: false,
            preload: false,
            mini_batch_size: DEFAULT_MINI_BATCH_SIZE,
            sample_list_path: None,
            stride: 1,
            offset: 0,
        }
    }
}

impl StoreOptions {
    pub fn with_debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn with_spill_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn local_cache(mut self, on: bool) -> Self {
        self.local_cache = on;
        self
    }

    pub fn preload(mut self, on: bool) -> Self {
        self.preload = on;
        self
    }

    pub fn with_mini_batch_size(mut self, n: usize) -> Self {
        self.mini_batch_size = n;
        self
    }

    pub fn with_sample_list<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sample_list_path = Some(path.into());
        self
    }

    /// Strided manifest loading: this rank parses body lines where
    /// `line % stride == offset`.
    pub fn with_stride(mut self, stride: usize, offset: usize) -> Self {
        self.stride = stride.max(1);
        self.offset = offset;
        self
    }

    /// Read options from `SHARDSTAGE_*` environment variables. Unset
    /// variables keep their defaults; malformed integers are ignored with a
    /// warning rather than failing the run.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(v) = std::env::var("SHARDSTAGE_DEBUG") {
            opts.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("SHARDSTAGE_SPILL_DIR") {
            if !v.is_empty() {
                opts.spill_dir = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("SHARDSTAGE_LOCAL_CACHE") {
            opts.local_cache = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("SHARDSTAGE_PRELOAD") {
            opts.preload = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("SHARDSTAGE_SAMPLE_LIST") {
            if !v.is_empty() {
                opts.sample_list_path = Some(PathBuf::from(v));
            }
        }
        for (var, slot) in [
            ("SHARDSTAGE_MINI_BATCH_SIZE", &mut opts.mini_batch_size),
            ("SHARDSTAGE_STRIDE", &mut opts.stride),
            ("SHARDSTAGE_OFFSET", &mut opts.offset),
        ] {
            if let Ok(v) = std::env::var(var) {
                match v.parse::<usize>() {
                    Ok(n) => *slot = n,
                    Err(_) => log::warn!("ignoring unparseable {}={}", var, v),
                }
            }
        }
        opts.stride = opts.stride.max(1);
        opts
    }
}
