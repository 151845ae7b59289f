use std::collections::HashMap;

use thiserror::Error;

use crate::chunk_id::{ChunkId, FileHash};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest entry for file: {0}")]
    UnknownFile(String),

    #[error("no chunk info for id: {0}")]
    UnknownChunk(ChunkId),
}

/// A `(chunk id, offset, length)` reference inside one file's manifest entry.
///
/// `chunk_offset` is the offset *within the chunk* where this part's bytes
/// begin; the destination offset in the file is implied by the part's position
/// in the entry's ordered sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPart {
    pub id: ChunkId,
    pub chunk_offset: u32,
    pub length: u32,
}

/// Per-chunk verification data consumed from the manifest layer.
#[derive(Clone, Copy, Debug)]
pub struct ChunkInfo {
    /// The chunk's full data window size in bytes.
    pub window_size: u32,
    /// 64-bit rolling hash over the full window.
    pub rolling_hash: u64,
    /// SHA-256 of the full window.
    pub sha_hash: ChunkId,
}

/// One target file: an ordered chunk-part sequence plus the final content
/// hash. Immutable and externally owned.
#[derive(Clone, Debug)]
pub struct FileManifestEntry {
    pub filename: String,
    pub file_size: u64,
    pub file_hash: FileHash,
    pub parts: Vec<ChunkPart>,
    pub symlink_target: Option<String>,
}

impl FileManifestEntry {
    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }
}

/// Where a chunk's bytes can be reassembled from inside an existing build:
/// `length` bytes at `file_offset` of `filename` land at `chunk_offset` of
/// the chunk window.
#[derive(Clone, Debug)]
pub struct ChunkPiece {
    pub filename: String,
    pub file_offset: u64,
    pub chunk_offset: u32,
    pub length: u32,
}

/// The ordered file list and chunk metadata for one build version.
#[derive(Clone, Debug, Default)]
pub struct BuildManifest {
    pub files: Vec<FileManifestEntry>,
    pub chunk_info: HashMap<ChunkId, ChunkInfo>,
    /// Opaque identifiers for this install+version combination; matching ids
    /// across runs indicate compatible partial on-disk state.
    pub resume_ids: Vec<String>,
}

impl BuildManifest {
    pub fn total_build_size(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }

    pub fn file_entry(&self, filename: &str) -> Option<&FileManifestEntry> {
        self.files.iter().find(|f| f.filename == filename)
    }

    pub fn file_size(&self, filename: &str) -> Option<u64> {
        self.file_entry(filename).map(|f| f.file_size)
    }

    pub fn chunk_window(&self, id: &ChunkId) -> Result<u32, ManifestError> {
        self.chunk_info
            .get(id)
            .map(|info| info.window_size)
            .ok_or(ManifestError::UnknownChunk(*id))
    }

    /// The largest chunk window referenced by any file in this manifest.
    /// Batch sizing is raised to at least this to guarantee progress.
    pub fn largest_chunk_window(&self) -> u32 {
        self.files
            .iter()
            .flat_map(|f| f.parts.iter())
            .filter_map(|p| self.chunk_info.get(&p.id))
            .map(|info| info.window_size)
            .max()
            .unwrap_or(0)
    }

    /// Inverts the file/part mapping: for each chunk id, the pieces of
    /// existing files that reproduce (portions of) its data window.
    ///
    /// Pieces are collected in file order; overlapping coverage keeps the
    /// first piece seen for a given window region.
    pub fn chunk_placements(&self) -> HashMap<ChunkId, Vec<ChunkPiece>> {
        let mut placements: HashMap<ChunkId, Vec<ChunkPiece>> = HashMap::new();
        for file in &self.files {
            if file.is_symlink() {
                continue;
            }
            let mut file_offset = 0u64;
            for part in &file.parts {
                placements.entry(part.id).or_default().push(ChunkPiece {
                    filename: file.filename.clone(),
                    file_offset,
                    chunk_offset: part.chunk_offset,
                    length: part.length,
                });
                file_offset += part.length as u64;
            }
        }
        placements
    }

    /// Chunk ids whose full data window is reassemblable from this build's
    /// files. Only these are producible by an install source.
    pub fn producible_chunks(&self) -> Vec<ChunkId> {
        let placements = self.chunk_placements();
        let mut out = Vec::new();
        for (id, pieces) in &placements {
            let Some(info) = self.chunk_info.get(id) else {
                continue;
            };
            if window_covered(info.window_size, pieces) {
                out.push(*id);
            }
        }
        out.sort();
        out
    }
}

/// True when the pieces cover `[0, window_size)` of the chunk with no gaps.
fn window_covered(window_size: u32, pieces: &[ChunkPiece]) -> bool {
    let mut spans: Vec<(u32, u32)> =
        pieces.iter().map(|p| (p.chunk_offset, p.chunk_offset + p.length)).collect();
    spans.sort();
    let mut covered_to = 0u32;
    for (start, end) in spans {
        if start > covered_to {
            return false;
        }
        covered_to = covered_to.max(end);
    }
    covered_to >= window_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(id: ChunkId, chunk_offset: u32, length: u32) -> ChunkPart {
        ChunkPart { id, chunk_offset, length }
    }

    fn entry(name: &str, parts: Vec<ChunkPart>) -> FileManifestEntry {
        let file_size = parts.iter().map(|p| p.length as u64).sum();
        FileManifestEntry {
            filename: name.to_string(),
            file_size,
            file_hash: FileHash::default(),
            parts,
            symlink_target: None,
        }
    }

    #[test]
    fn placements_invert_parts() {
        let a = ChunkId::from_data(b"a");
        let b = ChunkId::from_data(b"b");
        let manifest = BuildManifest {
            files: vec![
                entry("one", vec![part(a, 0, 100), part(b, 0, 50)]),
                entry("two", vec![part(a, 100, 20)]),
            ],
            chunk_info: HashMap::from([
                (a, ChunkInfo { window_size: 120, rolling_hash: 0, sha_hash: a }),
                (b, ChunkInfo { window_size: 50, rolling_hash: 0, sha_hash: b }),
            ]),
            resume_ids: vec![],
        };

        let placements = manifest.chunk_placements();
        let a_pieces = &placements[&a];
        assert_eq!(a_pieces.len(), 2);
        assert_eq!(a_pieces[0].filename, "one");
        assert_eq!(a_pieces[0].file_offset, 0);
        assert_eq!(a_pieces[1].filename, "two");
        assert_eq!(a_pieces[1].chunk_offset, 100);

        // Both windows are fully covered.
        let producible = manifest.producible_chunks();
        assert!(producible.contains(&a));
        assert!(producible.contains(&b));
    }

    #[test]
    fn partial_window_is_not_producible() {
        let a = ChunkId::from_data(b"a");
        let manifest = BuildManifest {
            files: vec![entry("one", vec![part(a, 10, 40)])],
            chunk_info: HashMap::from([(a, ChunkInfo { window_size: 64, rolling_hash: 0, sha_hash: a })]),
            resume_ids: vec![],
        };
        assert!(manifest.producible_chunks().is_empty());
    }

    #[test]
    fn largest_window_spans_files() {
        let a = ChunkId::from_data(b"a");
        let b = ChunkId::from_data(b"b");
        let manifest = BuildManifest {
            files: vec![entry("one", vec![part(a, 0, 10)]), entry("two", vec![part(b, 0, 10)])],
            chunk_info: HashMap::from([
                (a, ChunkInfo { window_size: 512, rolling_hash: 0, sha_hash: a }),
                (b, ChunkInfo { window_size: 2048, rolling_hash: 0, sha_hash: b }),
            ]),
            resume_ids: vec![],
        };
        assert_eq!(manifest.largest_chunk_window(), 2048);
    }
}
