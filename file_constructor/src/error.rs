use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chunk_store::{StoreError, TrackerDesync};
use patch_types::ChunkId;
use thiserror::Error;

/// Errors surfaced by file construction.
///
/// The variants split into two behavioral classes: errors implying the bytes
/// already on disk cannot be trusted (partial output is deleted), and
/// conceptually resumable errors (partial output is preserved for a later
/// run). See [`ConstructionError::deletes_partial_output`].
#[derive(Clone, Debug, Error)]
pub enum ConstructionError {
    #[error("cannot create output file {path}: {source}")]
    CannotCreateFile {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("out of disk space: {required} bytes required, {available} available")]
    OutOfDiskSpace { required: u64, available: u64 },

    #[error("file {0} failed its initial size check on resume")]
    FailedInitialSizeCheck(String),

    #[error("chunk {0} could not be obtained from any source")]
    MissingChunk(ChunkId),

    #[error("failed to write output data: {0}")]
    Serialize(#[source] Arc<std::io::Error>),

    #[error("chunk reference tracking desync: {0}")]
    Tracking(#[from] TrackerDesync),

    #[error("file {0} failed final hash verification")]
    OutboundData(String),

    #[error("internal consistency failure: {0}")]
    InternalConsistency(String),

    #[error("missing or malformed manifest info for file {0}")]
    MissingFileInfo(String),

    #[error("failed to close output file {path}: {source}")]
    Close {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("construction aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, ConstructionError>;

impl ConstructionError {
    /// Whether this error class implies the partially written output is
    /// untrustworthy and must be removed.
    pub fn deletes_partial_output(&self) -> bool {
        match self {
            ConstructionError::CannotCreateFile { .. }
            | ConstructionError::Close { .. }
            | ConstructionError::Serialize(_)
            | ConstructionError::Tracking(_)
            | ConstructionError::OutboundData(_)
            | ConstructionError::InternalConsistency(_) => true,

            ConstructionError::OutOfDiskSpace { .. }
            | ConstructionError::FailedInitialSizeCheck(_)
            | ConstructionError::MissingChunk(_)
            | ConstructionError::MissingFileInfo(_)
            | ConstructionError::Aborted => false,
        }
    }
}

impl From<StoreError> for ConstructionError {
    fn from(err: StoreError) -> Self {
        ConstructionError::InternalConsistency(err.to_string())
    }
}

/// Set-once abort flag shared between the dispatch loop, the worker threads
/// and cloud fetch tasks. Once set, queued and in-flight jobs run in a
/// no-I/O mode while still driving their completion counters.
#[derive(Debug, Default)]
pub struct AbortFlag {
    aborted: AtomicBool,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag; returns true only for the first caller.
    pub fn set(&self) -> bool {
        !self.aborted.swap(true, Ordering::AcqRel)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}
