use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use patch_types::ChunkId;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::store::StoreError;

/// Spill allocation unit. Spans are always whole multiples of this.
pub const SPILL_UNIT: u64 = 128 * 1024;

pub(crate) const SPILL_FILE_NAME: &str = "chunk-overflow.spill";

fn align_up(len: u64) -> u64 {
    len.div_ceil(SPILL_UNIT) * SPILL_UNIT
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub file_len: u64,
    /// Sum of reserved span lengths (aligned).
    pub reserved_bytes: u64,
    /// Chunk payload bytes inside reserved spans.
    pub used_bytes: u64,
    /// Alignment slack inside reserved spans.
    pub wasted_bytes: u64,
    pub free_bytes: u64,
    pub entry_count: usize,
}

struct Reservation {
    offset: u64,
    span_len: u64,
    used_len: u64,
    /// xxh3 of the payload, captured at spill time.
    hash: u64,
}

/// Append-mostly, freelist-allocated disk spill file.
///
/// Free spans are kept sorted by offset and coalesced with both neighbors on
/// release; a freed region reaching the tail truncates the file. Growth is
/// subject to a byte budget that the installation's headroom accounting can
/// lower at any time.
pub struct SpillFile {
    file: File,
    path: PathBuf,
    file_len: u64,
    budget: u64,
    /// Sorted by offset, non-adjacent, non-overlapping.
    free: Vec<(u64, u64)>,
    reserved: HashMap<ChunkId, Reservation>,
}

impl SpillFile {
    /// Creates the spill file inside `dir`, replacing any stale one from a
    /// previous run.
    pub fn create(dir: &Path, budget: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SPILL_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), budget, "created chunk spill file");
        Ok(Self { file, path, file_len: 0, budget, free: Vec::new(), reserved: HashMap::new() })
    }

    /// Lowers (or raises) the growth budget. Existing spans are unaffected;
    /// only future growth is constrained.
    pub fn set_budget(&mut self, budget: u64) {
        if budget < self.budget {
            debug!(old = self.budget, new = budget, "shrinking spill budget");
        }
        self.budget = budget;
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.reserved.contains_key(id)
    }

    /// Writes a chunk's payload into a reserved span. Returns `false` when no
    /// span can be found or grown within budget; the caller decides what to
    /// do with the homeless chunk.
    pub fn write_chunk(&mut self, id: ChunkId, data: &[u8]) -> Result<bool, StoreError> {
        if self.reserved.contains_key(&id) {
            return Err(StoreError::Inconsistency(format!("chunk {id} already spilled")));
        }
        let span_len = align_up(data.len() as u64);
        let Some(offset) = self.allocate(span_len) else {
            return Ok(false);
        };

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;

        self.reserved.insert(
            id,
            Reservation { offset, span_len, used_len: data.len() as u64, hash: xxh3_64(data) },
        );
        Ok(true)
    }

    /// Reads a spilled chunk back, verifying the payload hash captured at
    /// spill time. A mismatch is a hard consistency failure, not a miss.
    pub fn read_chunk(&mut self, id: &ChunkId) -> Result<Vec<u8>, StoreError> {
        let reservation = self
            .reserved
            .get(id)
            .ok_or_else(|| StoreError::Inconsistency(format!("chunk {id} not in spill file")))?;

        let mut data = vec![0u8; reservation.used_len as usize];
        self.file.seek(SeekFrom::Start(reservation.offset))?;
        self.file.read_exact(&mut data)?;

        if xxh3_64(&data) != reservation.hash {
            return Err(StoreError::Inconsistency(format!(
                "spill payload hash mismatch for chunk {id}"
            )));
        }
        Ok(data)
    }

    /// Releases a chunk's span back to the free list.
    pub fn release(&mut self, id: &ChunkId) {
        let Some(reservation) = self.reserved.remove(id) else {
            return;
        };
        self.insert_free(reservation.offset, reservation.span_len);
        self.truncate_tail();
    }

    /// Removes the file from disk. Called once at run end.
    pub fn delete(self) -> std::io::Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)
    }

    pub fn stats(&self) -> SpillStats {
        let reserved_bytes: u64 = self.reserved.values().map(|r| r.span_len).sum();
        let used_bytes: u64 = self.reserved.values().map(|r| r.used_len).sum();
        SpillStats {
            file_len: self.file_len,
            reserved_bytes,
            used_bytes,
            wasted_bytes: reserved_bytes - used_bytes,
            free_bytes: self.free.iter().map(|&(_, len)| len).sum(),
            entry_count: self.reserved.len(),
        }
    }

    /// First-fit search of the sorted free-span list; on exhaustion, grows
    /// the file if the budget allows.
    fn allocate(&mut self, span_len: u64) -> Option<u64> {
        debug_assert_eq!(span_len % SPILL_UNIT, 0);

        if let Some(index) = self.free.iter().position(|&(_, len)| len >= span_len) {
            let (offset, len) = self.free[index];
            if len == span_len {
                self.free.remove(index);
            } else {
                self.free[index] = (offset + span_len, len - span_len);
            }
            return Some(offset);
        }

        if self.file_len + span_len > self.budget {
            warn!(
                file_len = self.file_len,
                span_len,
                budget = self.budget,
                "spill file growth would exceed budget"
            );
            return None;
        }
        let offset = self.file_len;
        self.file_len += span_len;
        if let Err(err) = self.file.set_len(self.file_len) {
            warn!(%err, "failed to extend spill file");
            self.file_len = offset;
            return None;
        }
        Some(offset)
    }

    fn insert_free(&mut self, offset: u64, len: u64) {
        let index = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(index, (offset, len));

        // Coalesce with the following neighbor first, then the preceding one,
        // so both sides collapse into a single span.
        if index + 1 < self.free.len() && self.free[index].0 + self.free[index].1 == self.free[index + 1].0
        {
            self.free[index].1 += self.free[index + 1].1;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].0 + self.free[index - 1].1 == self.free[index].0 {
            self.free[index - 1].1 += self.free[index].1;
            self.free.remove(index);
        }
    }

    fn truncate_tail(&mut self) {
        let Some(&(offset, len)) = self.free.last() else {
            return;
        };
        if offset + len == self.file_len {
            self.free.pop();
            self.file_len = offset;
            if let Err(err) = self.file.set_len(self.file_len) {
                warn!(%err, "failed to truncate spill file tail");
            }
        }
    }

    /// Structural invariants, checked by the stress tests after every
    /// operation.
    #[cfg(test)]
    pub(crate) fn verify_invariants(&self) {
        let stats = self.stats();
        assert_eq!(stats.reserved_bytes, stats.used_bytes + stats.wasted_bytes);
        assert_eq!(stats.file_len - stats.reserved_bytes, stats.free_bytes);

        // Free list sorted, aligned, non-adjacent.
        for window in self.free.windows(2) {
            let (a_off, a_len) = window[0];
            let (b_off, _) = window[1];
            assert!(a_off + a_len < b_off, "free spans adjacent or overlapping");
        }
        for &(offset, len) in &self.free {
            assert_eq!(offset % SPILL_UNIT, 0);
            assert_eq!(len % SPILL_UNIT, 0);
            assert!(offset + len <= self.file_len);
        }
        // No trailing free region may survive an operation.
        if let Some(&(offset, len)) = self.free.last() {
            assert!(offset + len < self.file_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn id(n: u64) -> ChunkId {
        ChunkId::from_data(&n.to_le_bytes())
    }

    #[test]
    fn spans_coalesce_and_tail_truncates() {
        let dir = TempDir::new().unwrap();
        let mut spill = SpillFile::create(dir.path(), 64 * SPILL_UNIT).unwrap();

        for n in 0..4u64 {
            assert!(spill.write_chunk(id(n), &vec![n as u8; SPILL_UNIT as usize]).unwrap());
        }
        assert_eq!(spill.stats().file_len, 4 * SPILL_UNIT);

        // Free the two middle spans: they must merge into one.
        spill.release(&id(1));
        spill.release(&id(2));
        assert_eq!(spill.free, vec![(SPILL_UNIT, 2 * SPILL_UNIT)]);

        // Freeing the tail chunk truncates through the merged free region.
        spill.release(&id(3));
        assert_eq!(spill.stats().file_len, SPILL_UNIT);
        assert!(spill.free.is_empty());
        spill.verify_invariants();
    }

    #[test]
    fn rejects_growth_past_budget_then_reuses_holes() {
        let dir = TempDir::new().unwrap();
        let mut spill = SpillFile::create(dir.path(), 2 * SPILL_UNIT).unwrap();

        assert!(spill.write_chunk(id(0), &[1u8; 100]).unwrap());
        assert!(spill.write_chunk(id(1), &[2u8; 100]).unwrap());
        // Budget exhausted.
        assert!(!spill.write_chunk(id(2), &[3u8; 100]).unwrap());

        // A released span is reusable even though growth is impossible.
        spill.release(&id(0));
        assert!(spill.write_chunk(id(2), &[3u8; 100]).unwrap());
        assert_eq!(spill.read_chunk(&id(2)).unwrap(), vec![3u8; 100]);
        spill.verify_invariants();
    }

    #[test]
    fn payload_round_trips_with_hash_check() {
        let dir = TempDir::new().unwrap();
        let mut spill = SpillFile::create(dir.path(), 1 << 30).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let mut payload = vec![0u8; 3 * SPILL_UNIT as usize + 977];
        rng.fill(&mut payload[..]);

        assert!(spill.write_chunk(id(9), &payload).unwrap());
        assert_eq!(spill.read_chunk(&id(9)).unwrap(), payload);
    }

    #[test]
    fn randomized_stress_holds_invariants() {
        let dir = TempDir::new().unwrap();
        let mut spill = SpillFile::create(dir.path(), 256 * SPILL_UNIT).unwrap();
        let mut rng = StdRng::seed_from_u64(0xfeed);
        let mut live: Vec<(ChunkId, Vec<u8>)> = Vec::new();
        let mut next = 0u64;

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let len = rng.gen_range(1..(4 * SPILL_UNIT as usize));
                let mut payload = vec![0u8; len];
                rng.fill(&mut payload[..]);
                let cid = id(next);
                next += 1;
                if spill.write_chunk(cid, &payload).unwrap() {
                    live.push((cid, payload));
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let (cid, payload) = live.swap_remove(index);
                if rng.gen_bool(0.5) {
                    assert_eq!(spill.read_chunk(&cid).unwrap(), payload);
                }
                spill.release(&cid);
            }
            spill.verify_invariants();
        }

        for (cid, payload) in live {
            assert_eq!(spill.read_chunk(&cid).unwrap(), payload);
            spill.release(&cid);
            spill.verify_invariants();
        }
        assert_eq!(spill.stats().file_len, 0);
    }
}
