use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use patch_types::ChunkId;
use tracing::{debug, info, warn};

use crate::{ChunkSource, Result, SourceError, SourceKind};

const CHUNKDB_MAGIC: u64 = 0x0143_4855_4e4b_4442; // "CHUNKDB", version tag in low byte
const CHUNKDB_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8 + 4 + 4;
const INDEX_ENTRY_LEN: u64 = 32 + 8 + 4;

/// Writes a chunkdb archive: header, index, then chunk payloads. Returns the
/// archive's total size in bytes.
pub fn write_chunkdb(path: &Path, chunks: &[(ChunkId, Vec<u8>)]) -> std::io::Result<u64> {
    let mut file = File::create(path)?;

    file.write_all(&CHUNKDB_MAGIC.to_le_bytes())?;
    file.write_all(&CHUNKDB_VERSION.to_le_bytes())?;
    file.write_all(&(chunks.len() as u32).to_le_bytes())?;

    let mut offset = HEADER_LEN + INDEX_ENTRY_LEN * chunks.len() as u64;
    for (id, data) in chunks {
        file.write_all(id.as_bytes())?;
        file.write_all(&offset.to_le_bytes())?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        offset += data.len() as u64;
    }
    for (_, data) in chunks {
        file.write_all(data)?;
    }
    file.flush()?;
    Ok(offset)
}

struct DbFile {
    path: PathBuf,
    /// None once the file has been deleted after its chunks were consumed.
    file: Mutex<Option<File>>,
    size: u64,
    /// Chunks this archive holds that have not reached their final use yet.
    remaining: Mutex<usize>,
}

/// Serves chunks out of local chunkdb archive files.
///
/// Archives can optionally be deleted as their contents are consumed; the
/// space they free is reported so disk accounting can re-incorporate it as
/// the install proceeds.
pub struct ChunkDbSource {
    dbs: Vec<DbFile>,
    index: HashMap<ChunkId, (usize, u64, u32)>,
    delete_after_use: bool,
    freed_bytes: AtomicU64,
}

impl ChunkDbSource {
    /// Opens the given archives and loads their indexes.
    pub fn open(paths: &[PathBuf], delete_after_use: bool) -> Result<Self> {
        let mut dbs = Vec::with_capacity(paths.len());
        let mut index = HashMap::new();

        for (db_idx, path) in paths.iter().enumerate() {
            let mut file = File::open(path)?;
            let size = file.metadata()?.len();

            let mut header = [0u8; HEADER_LEN as usize];
            file.read_exact(&mut header)?;
            let magic = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let count = u32::from_le_bytes(header[12..16].try_into().unwrap());
            if magic != CHUNKDB_MAGIC {
                return Err(SourceError::Corrupt(format!(
                    "bad chunkdb magic in {}",
                    path.display()
                )));
            }
            if version != CHUNKDB_VERSION {
                return Err(SourceError::Corrupt(format!(
                    "unsupported chunkdb version {version} in {}",
                    path.display()
                )));
            }

            let mut entry = [0u8; INDEX_ENTRY_LEN as usize];
            let mut held = 0usize;
            for _ in 0..count {
                file.read_exact(&mut entry)?;
                let id = ChunkId::from_bytes(entry[0..32].try_into().unwrap());
                let offset = u64::from_le_bytes(entry[32..40].try_into().unwrap());
                let len = u32::from_le_bytes(entry[40..44].try_into().unwrap());
                if offset + len as u64 > size {
                    return Err(SourceError::Corrupt(format!(
                        "chunkdb index entry for {id} points past end of {}",
                        path.display()
                    )));
                }
                // First archive holding a chunk wins.
                if let Entry::Vacant(slot) = index.entry(id) {
                    slot.insert((db_idx, offset, len));
                    held += 1;
                }
            }

            debug!(path = %path.display(), chunks = held, size, "opened chunkdb");
            dbs.push(DbFile {
                path: path.clone(),
                file: Mutex::new(Some(file)),
                size,
                remaining: Mutex::new(held),
            });
        }

        Ok(Self { dbs, index, delete_after_use, freed_bytes: AtomicU64::new(0) })
    }

    pub fn has_chunk(&self, id: &ChunkId) -> bool {
        self.index.contains_key(id)
    }

    /// Bytes freed so far by deleting drained archives.
    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes.load(Ordering::Relaxed)
    }

    /// Notes that a chunk held here has reached its final use. When an
    /// archive's last chunk drains and deletion is enabled, the archive is
    /// removed and its size added to the freed-space counter.
    pub fn on_chunk_consumed(&self, id: &ChunkId) {
        let Some(&(db_idx, _, _)) = self.index.get(id) else {
            return;
        };
        let db = &self.dbs[db_idx];
        let drained = {
            let mut remaining = db.remaining.lock().expect("chunkdb lock poisoned");
            debug_assert!(*remaining > 0);
            *remaining = remaining.saturating_sub(1);
            *remaining == 0
        };
        if drained && self.delete_after_use {
            *db.file.lock().expect("chunkdb lock poisoned") = None;
            match std::fs::remove_file(&db.path) {
                Ok(()) => {
                    self.freed_bytes.fetch_add(db.size, Ordering::Relaxed);
                    info!(path = %db.path.display(), size = db.size, "deleted drained chunkdb");
                },
                Err(err) => warn!(path = %db.path.display(), %err, "failed to delete drained chunkdb"),
            }
        }
    }
}

impl ChunkSource for ChunkDbSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ChunkDb
    }

    fn read_chunk(&self, id: &ChunkId) -> Result<Bytes> {
        let &(db_idx, offset, len) = self.index.get(id).ok_or(SourceError::UnknownChunk(*id))?;
        let db = &self.dbs[db_idx];

        let mut data = vec![0u8; len as usize];
        {
            let mut guard = db.file.lock().expect("chunkdb lock poisoned");
            let file = guard.as_mut().ok_or(SourceError::UnknownChunk(*id))?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut data)?;
        }

        if ChunkId::from_data(&data) != *id {
            warn!(%id, db = %db.path.display(), "chunkdb payload hash mismatch");
            return Err(SourceError::HashMismatch(*id));
        }
        Ok(Bytes::from(data))
    }

    fn chunk_unavailable_at(&self, _id: &ChunkId) -> Option<u64> {
        // Archives are deleted only after their last chunk's final use, so
        // they never expire while still needed.
        None
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn chunk(n: u8, len: usize) -> (ChunkId, Vec<u8>) {
        let data = vec![n; len];
        (ChunkId::from_data(&data), data)
    }

    #[test]
    fn round_trips_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.chunkdb");
        let chunks = vec![chunk(1, 100), chunk(2, 4096), chunk(3, 17)];
        write_chunkdb(&path, &chunks).unwrap();

        let source = ChunkDbSource::open(&[path], false).unwrap();
        for (id, data) in &chunks {
            assert!(source.has_chunk(id));
            assert_eq!(source.read_chunk(id).unwrap(), Bytes::from(data.clone()));
        }
        assert!(!source.has_chunk(&ChunkId::from_data(b"absent")));
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.chunkdb");
        let (id, data) = chunk(7, 256);
        write_chunkdb(&path, &[(id, data)]).unwrap();

        // Flip a payload byte behind the index.
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let source = ChunkDbSource::open(&[path], false).unwrap();
        assert!(matches!(source.read_chunk(&id), Err(SourceError::HashMismatch(_))));
    }

    #[test]
    fn drained_archive_is_deleted_and_counted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.chunkdb");
        let chunks = vec![chunk(1, 64), chunk(2, 64)];
        let size = write_chunkdb(&path, &chunks).unwrap();

        let source = ChunkDbSource::open(&[path.clone()], true).unwrap();
        source.on_chunk_consumed(&chunks[0].0);
        assert!(path.exists());
        assert_eq!(source.freed_bytes(), 0);

        source.on_chunk_consumed(&chunks[1].0);
        assert!(!path.exists());
        assert_eq!(source.freed_bytes(), size);

        // Reads after deletion fail cleanly.
        assert!(source.read_chunk(&chunks[0].0).is_err());
    }
}
