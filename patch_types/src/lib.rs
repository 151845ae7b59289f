#![cfg_attr(feature = "strict", deny(warnings))]

mod chunk_id;
mod manifest;
mod rolling;

pub use chunk_id::{ChunkId, FileHash, HashParseError};
pub use manifest::{
    BuildManifest, ChunkInfo, ChunkPart, ChunkPiece, FileManifestEntry, ManifestError,
};
pub use rolling::RollingHash;
