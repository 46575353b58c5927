// src/lib.rs
//
// Crate root — public re-exports for the sharded data-staging layer.

// ===== Core Public API =====
// The types most embedders touch: options, the store, the sample list, and
// the communicator seam.

pub mod bundle;
pub mod comm;
pub mod config;
pub mod constants;
pub mod error;
pub mod fetch;
pub mod handle_pool;
pub mod manifest;
pub mod owner_map;
pub mod record;
pub mod sample_list;
pub mod shuffle;
pub mod store;

// Node-local shared-memory cache (POSIX shm)
#[cfg(unix)]
pub mod shm;

pub use bundle::{open_with_retry, BundleFormat, JsonBundle};
pub use comm::{Comm, LocalComm};
pub use config::StoreOptions;
pub use error::{Result, StageError};
pub use fetch::FetchPool;
pub use handle_pool::{default_open_budget, FileEntry, HandlePool, NextUse};
pub use manifest::{ManifestHeader, SampleName};
pub use owner_map::{streaming_owner, OwnerMap};
pub use record::{CompactedRecord, DType, FieldView, Record, RecordSchema, Value};
pub use sample_list::SampleList;
pub use shuffle::shuffled_indices;
pub use store::DataStore;

#[cfg(unix)]
pub use shm::SharedSegment;
