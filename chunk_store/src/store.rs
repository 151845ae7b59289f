use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use patch_types::ChunkId;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::location::{ChunkLocation, ChunkLocationTable};
use crate::reference::ChunkReferenceTracker;
use crate::spill::{SpillFile, SpillStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bookkeeping invariant was violated. Non-recoverable: the store's
    /// view of chunk state can no longer be trusted.
    #[error("backing store consistency failure: {0}")]
    Inconsistency(String),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BackingStoreStats {
    pub resident_bytes: u64,
    pub entry_count: usize,
    pub locked_entries: usize,
    pub spill: SpillStats,
}

struct StoredChunk {
    /// Resident payload; `None` while reserved-but-unfilled or spilled.
    data: Option<Bytes>,
    size: u32,
    /// > 0 while any in-flight read or splat references this entry. Never
    /// evicted or retired while held.
    lock_count: u32,
    committed: bool,
    spilled: bool,
    /// Final global consumption position that needs this chunk.
    last_needed: u64,
}

impl StoredChunk {
    fn is_resident(&self) -> bool {
        self.data.is_some()
    }
}

/// Hybrid memory+disk cache for chunks whose source cannot be re-queried
/// later.
///
/// The memory map is bounded by a byte budget with oracle-style eviction:
/// because the full future consumption order is known, the eviction candidate
/// is the unlocked chunk whose next needed position is farthest in the
/// future. Evicted chunks spill to a freelist-allocated disk file; when the
/// disk budget is also exhausted the chunk is dropped and must be refetched
/// from the network.
///
/// Touched only from the dispatch thread; no interior locking.
pub struct ChunkBackingStore {
    memory_budget: u64,
    resident_bytes: u64,
    entries: HashMap<ChunkId, StoredChunk>,
    spill: SpillFile,
    locations: Arc<ChunkLocationTable>,
    tracker: Arc<dyn ChunkReferenceTracker>,
}

impl ChunkBackingStore {
    pub fn new(
        spill_dir: &Path,
        memory_budget: u64,
        spill_budget: u64,
        locations: Arc<ChunkLocationTable>,
        tracker: Arc<dyn ChunkReferenceTracker>,
    ) -> std::io::Result<Self> {
        let spill = SpillFile::create(spill_dir, spill_budget)?;
        Ok(Self {
            memory_budget,
            resident_bytes: 0,
            entries: HashMap::new(),
            spill,
            locations,
            tracker,
        })
    }

    /// Reserves budgeted space for a chunk about to be read and takes the
    /// initial lock. Fails if the chunk is already present in any form.
    ///
    /// The memory budget is a soft ceiling: when nothing is evictable the
    /// reservation still proceeds, since a minimum resident working set is
    /// required for forward progress on delta-heavy installs.
    pub fn reserve_and_lock(
        &mut self,
        id: ChunkId,
        size: u32,
        last_needed: u64,
    ) -> Result<(), StoreError> {
        if self.entries.contains_key(&id) {
            return Err(StoreError::Inconsistency(format!(
                "reserve for chunk {id} which is already resident"
            )));
        }
        self.make_room(size as u64)?;
        self.resident_bytes += size as u64;
        self.entries.insert(
            id,
            StoredChunk {
                data: None,
                size,
                lock_count: 1,
                committed: false,
                spilled: false,
                last_needed,
            },
        );
        self.locations.set(id, ChunkLocation::Memory);
        trace!(%id, size, last_needed, "reserved backing store entry");
        Ok(())
    }

    /// Takes an additional lock on an existing entry.
    pub fn lock(&mut self, id: &ChunkId) -> Result<(), StoreError> {
        let entry = self.entry_mut(id)?;
        entry.lock_count += 1;
        Ok(())
    }

    /// Releases one lock.
    pub fn release(&mut self, id: &ChunkId) -> Result<(), StoreError> {
        let entry = self.entry_mut(id)?;
        if entry.lock_count == 0 {
            return Err(StoreError::Inconsistency(format!("release of unlocked chunk {id}")));
        }
        entry.lock_count -= 1;
        Ok(())
    }

    /// Fills a reservation with its payload, marks it committed and releases
    /// the reservation lock. The terminal call for a successful read.
    pub fn commit_and_release(&mut self, id: &ChunkId, data: Bytes) -> Result<(), StoreError> {
        let entry = self.entry_mut(id)?;
        if entry.committed {
            return Err(StoreError::Inconsistency(format!("double commit for chunk {id}")));
        }
        if entry.lock_count == 0 {
            return Err(StoreError::Inconsistency(format!("commit of unlocked chunk {id}")));
        }
        if data.len() != entry.size as usize {
            return Err(StoreError::Inconsistency(format!(
                "commit size mismatch for chunk {id}: reserved {}, got {}",
                entry.size,
                data.len()
            )));
        }
        entry.data = Some(data);
        entry.committed = true;
        entry.lock_count -= 1;
        Ok(())
    }

    /// Releases a lock on an entry whose payload will never arrive (failed
    /// or drained read). The last such release drops the reservation and
    /// flips the chunk back to the network.
    pub fn dereserve(&mut self, id: &ChunkId) -> Result<(), StoreError> {
        let entry = self.entry_mut(id)?;
        if entry.committed {
            return Err(StoreError::Inconsistency(format!("dereserve of committed chunk {id}")));
        }
        if entry.lock_count == 0 {
            return Err(StoreError::Inconsistency(format!("dereserve of unlocked chunk {id}")));
        }
        entry.lock_count -= 1;
        if entry.lock_count == 0 {
            self.drop_entry(id);
            self.locations.set(*id, ChunkLocation::Cloud);
        }
        Ok(())
    }

    /// Inserts an already-complete chunk extracted from a file about to be
    /// deleted. Unlocked and committed from the start.
    pub fn harvest(&mut self, id: ChunkId, data: Bytes, last_needed: u64) -> Result<(), StoreError> {
        if self.entries.contains_key(&id) {
            // Already preserved through the normal read path.
            return Ok(());
        }
        let size = data.len() as u32;
        self.make_room(size as u64)?;
        self.resident_bytes += size as u64;
        self.entries.insert(
            id,
            StoredChunk {
                data: Some(data),
                size,
                lock_count: 0,
                committed: true,
                spilled: false,
                last_needed,
            },
        );
        self.locations.set(id, ChunkLocation::Memory);
        debug!(%id, size, "harvested chunk into backing store");
        Ok(())
    }

    /// Returns a chunk's payload, reading it back from the spill file (and
    /// verifying the spill-time hash) if it was paged out.
    pub fn read_chunk(&mut self, id: &ChunkId) -> Result<Bytes, StoreError> {
        let entry = self.entry_mut(id)?;
        if !entry.committed {
            return Err(StoreError::Inconsistency(format!("read of uncommitted chunk {id}")));
        }
        if let Some(data) = &entry.data {
            return Ok(data.clone());
        }
        debug_assert!(entry.spilled);
        let data = self.spill.read_chunk(id)?;
        Ok(Bytes::from(data))
    }

    /// Spills a resident chunk to disk and frees its memory, or just drops
    /// the memory copy if the payload is already on disk. Returns `false`
    /// when the chunk had to be dropped entirely for lack of disk budget (its
    /// location flips to Cloud: must refetch from network).
    pub fn page_out(&mut self, id: &ChunkId) -> Result<bool, StoreError> {
        let entry = self.entry_mut(id)?;
        if entry.lock_count > 0 {
            return Err(StoreError::Inconsistency(format!("page-out of locked chunk {id}")));
        }
        if !entry.committed {
            return Err(StoreError::Inconsistency(format!("page-out of uncommitted chunk {id}")));
        }
        let size = entry.size as u64;

        if entry.spilled {
            if entry.data.take().is_some() {
                self.resident_bytes -= size;
            }
            return Ok(true);
        }

        let data = entry.data.take().ok_or_else(|| {
            StoreError::Inconsistency(format!("resident chunk {id} has no payload"))
        })?;

        if self.spill.write_chunk(*id, &data)? {
            let entry = self.entry_mut(id)?;
            entry.spilled = true;
            self.resident_bytes -= size;
            self.locations.set(*id, ChunkLocation::DiskOverflow);
            trace!(%id, size, "paged chunk out to disk");
            Ok(true)
        } else {
            // No disk budget left: drop the chunk and refetch later.
            warn!(%id, size, "no spill budget; dropping chunk for network refetch");
            self.drop_entry(id);
            self.locations.set(*id, ChunkLocation::Cloud);
            Ok(false)
        }
    }

    /// Removes entries whose last needed position is behind the current
    /// consumption position. Locked entries are never touched.
    pub fn check_retirements(&mut self, position: u64) {
        let retired: Vec<ChunkId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.lock_count == 0 && e.last_needed < position)
            .map(|(id, _)| *id)
            .collect();
        for id in retired {
            debug_assert!(self.tracker.next_usage_after(&id, position).is_none());
            self.drop_entry(&id);
            self.locations.retire(id);
            trace!(%id, position, "retired backing store entry");
        }
    }

    /// Lowers the spill file's growth budget as installation headroom
    /// shrinks.
    pub fn set_spill_budget(&mut self, budget: u64) {
        self.spill.set_budget(budget);
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_committed(&self, id: &ChunkId) -> bool {
        self.entries.get(id).map(|e| e.committed).unwrap_or(false)
    }

    pub fn stats(&self) -> BackingStoreStats {
        BackingStoreStats {
            resident_bytes: self.resident_bytes,
            entry_count: self.entries.len(),
            locked_entries: self.entries.values().filter(|e| e.lock_count > 0).count(),
            spill: self.spill.stats(),
        }
    }

    /// Deletes the spill file. Called once at run end.
    pub fn shutdown(self) -> std::io::Result<()> {
        self.spill.delete()
    }

    fn entry_mut(&mut self, id: &ChunkId) -> Result<&mut StoredChunk, StoreError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| StoreError::Inconsistency(format!("no backing store entry for chunk {id}")))
    }

    fn drop_entry(&mut self, id: &ChunkId) {
        if let Some(entry) = self.entries.remove(id) {
            if entry.is_resident() {
                self.resident_bytes -= entry.size as u64;
            } else if !entry.spilled {
                // Unfilled reservation still holds budget.
                self.resident_bytes -= entry.size as u64;
            }
            if entry.spilled {
                self.spill.release(id);
            }
        }
    }

    /// Pages out unlocked entries, farthest next use first, until `needed`
    /// more bytes fit under the memory budget or nothing evictable remains.
    fn make_room(&mut self, needed: u64) -> Result<(), StoreError> {
        while self.resident_bytes + needed > self.memory_budget {
            let position = self.tracker.current_position();
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| e.lock_count == 0 && e.committed && e.is_resident())
                .max_by_key(|(id, _)| {
                    // Never-needed-again sorts past every real position.
                    self.tracker.next_usage_after(id, position).unwrap_or(u64::MAX)
                })
                .map(|(id, _)| *id);

            let Some(victim) = victim else {
                warn!(
                    resident = self.resident_bytes,
                    needed,
                    budget = self.memory_budget,
                    "memory budget exceeded with no evictable chunk; proceeding over budget"
                );
                break;
            };
            self.page_out(&victim)?;
        }
        Ok(())
    }
}
