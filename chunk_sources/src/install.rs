use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use patch_types::{BuildManifest, ChunkId, ChunkPiece, RollingHash};
use tracing::{debug, warn};

use crate::{ChunkSource, Result, SourceError, SourceKind};

/// Reassembles chunks from pieces scattered across the files of a prior
/// local installation.
///
/// A chunk is producible only when the prior build's parts cover its full
/// data window; reassembled windows are verified against the manifest's
/// rolling hash and SHA digest before being trusted.
pub struct InstallSource {
    install_dir: PathBuf,
    manifest: Arc<BuildManifest>,
    placements: HashMap<ChunkId, Vec<ChunkPiece>>,
    producible: HashSet<ChunkId>,
    /// Global consumption position at which each prior file is slated for
    /// deletion (destructive mode only).
    deletion_schedule: HashMap<String, u64>,
}

impl InstallSource {
    pub fn new(
        install_dir: PathBuf,
        manifest: Arc<BuildManifest>,
        deletion_schedule: HashMap<String, u64>,
    ) -> Self {
        let placements = manifest.chunk_placements();
        let producible: HashSet<ChunkId> = manifest.producible_chunks().into_iter().collect();
        debug!(
            dir = %install_dir.display(),
            producible = producible.len(),
            "install source initialized"
        );
        Self { install_dir, manifest, placements, producible, deletion_schedule }
    }

    pub fn has_chunk(&self, id: &ChunkId) -> bool {
        self.producible.contains(id)
    }

    /// The pieces of one prior file that reproduce still-relevant chunk
    /// data; used by the harvesting path before that file is deleted.
    pub fn pieces_in_file<'a>(
        &'a self,
        filename: &'a str,
    ) -> impl Iterator<Item = (&'a ChunkId, &'a ChunkPiece)> {
        self.placements.iter().flat_map(move |(id, pieces)| {
            pieces.iter().filter(move |p| p.filename == filename).map(move |p| (id, p))
        })
    }

    fn reassemble(&self, id: &ChunkId) -> Result<Vec<u8>> {
        let pieces = self.placements.get(id).ok_or(SourceError::UnknownChunk(*id))?;
        let window = self
            .manifest
            .chunk_window(id)
            .map_err(|_| SourceError::UnknownChunk(*id))?;

        let mut buffer = vec![0u8; window as usize];
        let mut covered = 0u64;
        for piece in pieces {
            let path = self.install_dir.join(&piece.filename);
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(piece.file_offset))?;
            let dest = piece.chunk_offset as usize..(piece.chunk_offset + piece.length) as usize;
            file.read_exact(&mut buffer[dest])?;
            covered += piece.length as u64;
            if covered >= window as u64 {
                break;
            }
        }
        Ok(buffer)
    }
}

impl ChunkSource for InstallSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Install
    }

    fn read_chunk(&self, id: &ChunkId) -> Result<Bytes> {
        let buffer = self.reassemble(id)?;

        // Verification runs after the read, still on the bound worker
        // thread. The rolling hash is the cheap first gate.
        if let Some(info) = self.manifest.chunk_info.get(id) {
            if RollingHash::hash_window(&buffer) != info.rolling_hash {
                warn!(%id, "install source rolling hash mismatch");
                return Err(SourceError::HashMismatch(*id));
            }
            if ChunkId::from_data(&buffer) != info.sha_hash {
                warn!(%id, "install source SHA mismatch");
                return Err(SourceError::HashMismatch(*id));
            }
        }
        Ok(Bytes::from(buffer))
    }

    fn chunk_unavailable_at(&self, id: &ChunkId) -> Option<u64> {
        let pieces = self.placements.get(id)?;
        pieces
            .iter()
            .filter_map(|p| self.deletion_schedule.get(&p.filename))
            .min()
            .copied()
    }
}
