//! Deterministic fixtures for construction tests: seeded random builds, an
//! in-memory cloud provider with fetch counters and failure injection, and
//! helpers to materialize prior installs and chunkdb archives on disk.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use chunk_sources::{write_chunkdb, CloudProvider, SourceError};
use patch_types::{
    BuildManifest, ChunkId, ChunkInfo, ChunkPart, FileHash, FileManifestEntry, RollingHash,
};
use rand::prelude::*;

/// Builds manifests and chunk payloads from seeded random data.
pub struct BuildFixture {
    rng: StdRng,
    chunks: HashMap<ChunkId, Vec<u8>>,
    files: Vec<FileManifestEntry>,
    file_data: HashMap<String, Vec<u8>>,
    resume_ids: Vec<String>,
}

impl BuildFixture {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            chunks: HashMap::new(),
            files: Vec::new(),
            file_data: HashMap::new(),
            resume_ids: vec![format!("fixture-build-{seed}")],
        }
    }

    /// Registers a chunk with explicit payload; identical payloads across
    /// fixtures share an id, which is how cross-build dedup is modeled.
    pub fn register_chunk(&mut self, data: Vec<u8>) -> ChunkId {
        let id = ChunkId::from_data(&data);
        self.chunks.insert(id, data);
        id
    }

    /// Registers a chunk of seeded random bytes.
    pub fn add_chunk(&mut self, len: usize) -> ChunkId {
        let mut data = vec![0u8; len];
        self.rng.fill(&mut data[..]);
        self.register_chunk(data)
    }

    /// Adds a file whose content is the given `(chunk, offset, length)`
    /// parts in order.
    pub fn add_file(&mut self, name: &str, parts: &[(ChunkId, u32, u32)]) {
        let mut data = Vec::new();
        let mut manifest_parts = Vec::with_capacity(parts.len());
        for &(id, chunk_offset, length) in parts {
            let chunk = self.chunks.get(&id).expect("unregistered chunk in fixture");
            let start = chunk_offset as usize;
            let end = start + length as usize;
            data.extend_from_slice(&chunk[start..end]);
            manifest_parts.push(ChunkPart { id, chunk_offset, length });
        }
        self.files.push(FileManifestEntry {
            filename: name.to_string(),
            file_size: data.len() as u64,
            file_hash: FileHash::from_data(&data),
            parts: manifest_parts,
            symlink_target: None,
        });
        self.file_data.insert(name.to_string(), data);
    }

    /// Adds a file that uses each given chunk once, in full, in order.
    pub fn add_file_of_chunks(&mut self, name: &str, ids: &[ChunkId]) {
        let parts: Vec<(ChunkId, u32, u32)> =
            ids.iter().map(|&id| (id, 0, self.chunks[&id].len() as u32)).collect();
        self.add_file(name, &parts);
    }

    pub fn add_symlink(&mut self, name: &str, target: &str) {
        self.files.push(FileManifestEntry {
            filename: name.to_string(),
            file_size: 0,
            file_hash: FileHash::default(),
            parts: vec![],
            symlink_target: Some(target.to_string()),
        });
    }

    pub fn manifest(&self) -> BuildManifest {
        let chunk_info = self
            .chunks
            .iter()
            .map(|(&id, data)| {
                (
                    id,
                    ChunkInfo {
                        window_size: data.len() as u32,
                        rolling_hash: RollingHash::hash_window(data),
                        sha_hash: ChunkId::from_data(data),
                    },
                )
            })
            .collect();
        BuildManifest {
            files: self.files.clone(),
            chunk_info,
            resume_ids: self.resume_ids.clone(),
        }
    }

    pub fn expected_data(&self, name: &str) -> &[u8] {
        &self.file_data[name]
    }

    pub fn chunk_data(&self, id: &ChunkId) -> &[u8] {
        &self.chunks[id]
    }

    /// Writes every file of this build into `dir` (a prior install, or a
    /// partially constructed output to resume from).
    pub fn materialize(&self, dir: &Path) {
        for (name, data) in &self.file_data {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, data).unwrap();
        }
    }

    /// Writes the given chunks into a chunkdb archive; returns its size.
    pub fn write_chunkdb(&self, path: &Path, ids: &[ChunkId]) -> u64 {
        let chunks: Vec<(ChunkId, Vec<u8>)> =
            ids.iter().map(|id| (*id, self.chunks[id].clone())).collect();
        write_chunkdb(path, &chunks).unwrap()
    }

    /// An in-memory cloud provider serving every registered chunk.
    pub fn cloud(&self) -> std::sync::Arc<CountingCloudProvider> {
        std::sync::Arc::new(CountingCloudProvider::new(
            self.chunks.iter().map(|(&id, data)| (id, Bytes::from(data.clone()))).collect(),
        ))
    }
}

/// Cloud provider over an in-memory chunk map, counting fetches and failing
/// on demand.
pub struct CountingCloudProvider {
    chunks: HashMap<ChunkId, Bytes>,
    fetches: Mutex<HashMap<ChunkId, usize>>,
    failing: Mutex<HashSet<ChunkId>>,
    delay: Option<std::time::Duration>,
}

impl CountingCloudProvider {
    pub fn new(chunks: HashMap<ChunkId, Bytes>) -> Self {
        Self {
            chunks,
            fetches: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            delay: None,
        }
    }

    /// Adds a fixed latency per fetch; used by abort/pause tests.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every fetch of this chunk fail.
    pub fn fail_chunk(&self, id: ChunkId) {
        self.failing.lock().unwrap().insert(id);
    }

    pub fn fetches_of(&self, id: &ChunkId) -> usize {
        self.fetches.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl CloudProvider for CountingCloudProvider {
    async fn fetch_chunk(&self, id: &ChunkId) -> Result<Bytes, SourceError> {
        *self.fetches.lock().unwrap().entry(*id).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(id) {
            return Err(SourceError::Corrupt("injected cloud failure".into()));
        }
        self.chunks
            .get(id)
            .cloned()
            .ok_or(SourceError::UnknownChunk(*id))
    }
}
