// src/error.rs
//
//! Crate-wide error type.
//!
//! All fatal conditions in the staging layer propagate as a single uniform
//! [`StageError`] carrying a human-readable message with contextual values
//! interpolated. Nothing here is caught and converted into a degraded mode;
//! the surrounding training driver decides whether to abort the job.

use thiserror::Error;

/// Item-level error type for the staging layer.
#[derive(Error, Debug)]
pub enum StageError {
    /// The three-line manifest header could not be read or parsed.
    #[error("malformed header in sample list {list}: {detail}")]
    MalformedHeader { list: String, detail: String },

    /// Header line 3 named a root directory that is empty or does not exist.
    #[error("sample list {list}: data root directory '{dir}' does not exist")]
    MissingRootDir { list: String, dir: String },

    /// A declared count does not match what was actually parsed or loaded.
    #[error("count mismatch in {context}: expected {expected}, found {found}")]
    CountMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// An inclusive manifest named a sample the bundle file does not contain.
    #[error("unknown sample name '{name}' for bundle file '{file}'")]
    UnknownSample { name: String, file: String },

    /// A bundle file could not be opened after the retry budget was spent.
    #[error("failed to open bundle file '{path}' after {attempts} attempts: {detail}")]
    FileOpenError {
        path: String,
        attempts: usize,
        detail: String,
    },

    /// A sample id was inserted twice, or claimed by two ranks.
    #[error("duplicate sample id {id} ({context})")]
    DuplicateId { id: usize, context: String },

    /// A sample id was absent from both the store and the working set.
    #[error("sample id {id} not found ({context})")]
    NotFound { id: usize, context: String },

    /// An index has no entry in the ownership map.
    #[error("sample index {index} has no owner (owner map holds {map_len} entries)")]
    UnknownIndex { index: usize, map_len: usize },

    /// The working set came up empty mid-epoch.
    #[error("mini-batch working set is empty at position {position} and the epoch is not exhausted")]
    StarvedMiniBatch { position: usize },

    /// Estimated memory (or shared memory) does not fit; the message carries
    /// the diagnostic estimate so operators can resize the job.
    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),

    /// Transport-level failure in the communicator. Fatal for the run.
    #[error("communicator failure: {0}")]
    Comm(String),

    /// A logic invariant of partitioning/resharding was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StageError>;
