// src/constants.rs
//
// Centralized constants for shardstage to avoid hardcoded values throughout
// the codebase.

/// First whitespace-delimited token of a manifest's header line 1 that marks
/// the list as exclusion-encoded (matched case-insensitively, by substring).
pub const SAMPLE_EXCLUSION_LIST: &str = "BUNDLE_EXCLUSION";

/// Header keyword written for inclusion-encoded manifests.
pub const SAMPLE_INCLUSION_LIST: &str = "BUNDLE_INCLUSION";

/// Number of file descriptors held back from the process fd-table size when
/// deriving the open-handle budget (stdio, sockets, log files, ...).
pub const MAX_OPEN_FILE_MARGIN: usize = 128;

/// Fallback fd-table size when the platform cannot report one.
pub const DEFAULT_FD_TABLE_SIZE: usize = 1024;

/// Number of attempts at opening a bundle file before giving up. Transient
/// errors on parallel filesystems resolve quickly or not at all, so there is
/// no backoff between attempts.
pub const MAX_OPEN_RETRY: usize = 3;

/// Maximum number of record files placed in a single spill/checkpoint
/// subdirectory before rotating to the next bucket. Keeps directories small
/// enough that metadata operations on shared filesystems stay cheap.
pub const MAX_FILES_PER_DIRECTORY: usize = 1024;

/// Default mini-batch size used when the configuration surface supplies none.
pub const DEFAULT_MINI_BATCH_SIZE: usize = 64;

/// Basename prefix for per-rank record directories in a checkpoint.
pub const RECORD_DIR_PREFIX: &str = "records_";

/// Basename prefix for per-rank checkpoint metadata files.
pub const METADATA_PREFIX: &str = "metadata_";

/// Basename prefix for per-rank serialized scalar/map state.
pub const STATE_PREFIX: &str = "state_";
