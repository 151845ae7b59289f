#![cfg_attr(feature = "strict", deny(warnings))]

mod chunkdb;
mod cloud;
mod install;

pub use chunkdb::{write_chunkdb, ChunkDbSource};
pub use cloud::{CloudProvider, CloudSource};
pub use install::InstallSource;

use bytes::Bytes;
use patch_types::ChunkId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk {0} failed hash verification")]
    HashMismatch(ChunkId),

    #[error("chunk {0} is not held by this source")]
    UnknownChunk(ChunkId),

    #[error("corrupt source data: {0}")]
    Corrupt(String),

    #[error("read cancelled by abort")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Which kind of source a read was dispatched to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Install,
    ChunkDb,
    Cloud,
}

/// A source of chunk data with blocking reads, driven from the single worker
/// thread bound to it.
///
/// Sources are opaque deliver-or-fail units: a read either produces the
/// chunk's full, verified data window or an error. Failures of non-cloud
/// sources are not surfaced upward; the caller re-routes the chunk to the
/// cloud exactly once.
pub trait ChunkSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Reads and verifies a chunk's full data window.
    fn read_chunk(&self, id: &ChunkId) -> Result<Bytes>;

    /// The global consumption position after which this source can no longer
    /// provide the chunk (e.g. its backing file is slated for deletion by a
    /// destructive upgrade), or `None` if it stays available all run.
    fn chunk_unavailable_at(&self, id: &ChunkId) -> Option<u64>;
}
