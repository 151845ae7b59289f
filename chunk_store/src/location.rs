use std::collections::HashMap;
use std::sync::RwLock;

use patch_types::ChunkId;

/// Where a chunk's bytes can currently be obtained from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkLocation {
    /// Reassemblable from files of a prior local installation.
    Install,
    /// Present in a local chunkdb archive.
    ChunkDb,
    /// Only obtainable from the remote store.
    Cloud,
    /// Resident in the backing store's memory map.
    Memory,
    /// Spilled to the backing store's disk file.
    DiskOverflow,
    /// Never needed again for the rest of the run. Terminal.
    Retired,
}

/// One authoritative location tag per chunk id, shared across threads.
///
/// Critical sections are a single map operation; callers must not hold the
/// lock across I/O.
#[derive(Debug, Default)]
pub struct ChunkLocationTable {
    inner: RwLock<HashMap<ChunkId, ChunkLocation>>,
}

impl ChunkLocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ChunkId) -> Option<ChunkLocation> {
        self.inner.read().expect("location table lock poisoned").get(id).copied()
    }

    /// Updates a chunk's location. `Retired` is terminal: attempts to move a
    /// retired chunk elsewhere are ignored.
    pub fn set(&self, id: ChunkId, location: ChunkLocation) {
        let mut map = self.inner.write().expect("location table lock poisoned");
        match map.get(&id) {
            Some(ChunkLocation::Retired) => {
                debug_assert!(
                    location == ChunkLocation::Retired,
                    "attempted to relocate retired chunk {id}"
                );
            },
            _ => {
                map.insert(id, location);
            },
        }
    }

    pub fn retire(&self, id: ChunkId) {
        self.set(id, ChunkLocation::Retired);
    }

    pub fn count_in(&self, location: ChunkLocation) -> usize {
        self.inner
            .read()
            .expect("location table lock poisoned")
            .values()
            .filter(|&&l| l == location)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("location table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_is_terminal() {
        let table = ChunkLocationTable::new();
        let id = ChunkId::from_data(b"x");

        table.set(id, ChunkLocation::Install);
        assert_eq!(table.get(&id), Some(ChunkLocation::Install));

        table.set(id, ChunkLocation::Memory);
        table.retire(id);
        assert_eq!(table.get(&id), Some(ChunkLocation::Retired));

        // Further moves are ignored (debug builds assert instead).
        #[cfg(not(debug_assertions))]
        {
            table.set(id, ChunkLocation::Cloud);
            assert_eq!(table.get(&id), Some(ChunkLocation::Retired));
        }
    }
}
