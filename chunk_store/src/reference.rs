use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use patch_types::ChunkId;
use thiserror::Error;

/// The dispatch thread popped a chunk out of the expected global consumption
/// order. This is fatal: every downstream position-based decision (eviction,
/// retirement, source expiry) would be built on a lie.
#[derive(Clone, Debug, Error)]
#[error("reference tracker desync at position {position}: expected {expected:?}, popped {popped}")]
pub struct TrackerDesync {
    pub position: u64,
    pub expected: Option<ChunkId>,
    pub popped: ChunkId,
}

/// For any chunk id and the current global consumption position, reports the
/// next future position it is needed, or that it is never needed again.
pub trait ChunkReferenceTracker: Send + Sync {
    /// The next consumption position at or after `position` that needs this
    /// chunk, or `None` if it is never needed again.
    fn next_usage_after(&self, id: &ChunkId, position: u64) -> Option<u64>;

    /// The final consumption position that needs this chunk.
    fn last_usage(&self, id: &ChunkId) -> Option<u64>;

    /// Consumes the next reference in strict global order, returning its
    /// position. Popping any id other than the expected one is a desync.
    fn pop_next(&self, id: &ChunkId) -> Result<u64, TrackerDesync>;

    /// Number of references popped so far; also the position of the next
    /// reference to pop.
    fn current_position(&self) -> u64;

    fn remaining(&self) -> u64;
}

struct TrackerInner {
    order: Vec<ChunkId>,
    cursor: usize,
    usages: HashMap<ChunkId, VecDeque<u64>>,
}

/// Reference tracker built from the manifest's global chunk-part order for
/// the remaining job.
pub struct ManifestReferenceTracker {
    inner: Mutex<TrackerInner>,
}

impl ManifestReferenceTracker {
    /// `order[i]` is the chunk consumed at global position `i`.
    pub fn from_consumption_order(order: Vec<ChunkId>) -> Self {
        let mut usages: HashMap<ChunkId, VecDeque<u64>> = HashMap::new();
        for (position, id) in order.iter().enumerate() {
            usages.entry(*id).or_default().push_back(position as u64);
        }
        Self { inner: Mutex::new(TrackerInner { order, cursor: 0, usages }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("reference tracker lock poisoned")
    }
}

impl ChunkReferenceTracker for ManifestReferenceTracker {
    fn next_usage_after(&self, id: &ChunkId, position: u64) -> Option<u64> {
        let inner = self.lock();
        inner.usages.get(id)?.iter().find(|&&p| p >= position).copied()
    }

    fn last_usage(&self, id: &ChunkId) -> Option<u64> {
        let inner = self.lock();
        inner.usages.get(id)?.back().copied()
    }

    fn pop_next(&self, id: &ChunkId) -> Result<u64, TrackerDesync> {
        let mut inner = self.lock();
        let position = inner.cursor as u64;
        let expected = inner.order.get(inner.cursor).copied();
        if expected != Some(*id) {
            return Err(TrackerDesync { position, expected, popped: *id });
        }
        inner.cursor += 1;
        let front = inner
            .usages
            .get_mut(id)
            .and_then(|deque| deque.pop_front());
        debug_assert_eq!(front, Some(position));
        Ok(position)
    }

    fn current_position(&self) -> u64 {
        self.lock().cursor as u64
    }

    fn remaining(&self) -> u64 {
        let inner = self.lock();
        (inner.order.len() - inner.cursor) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<ChunkId> {
        (0..n).map(|i| ChunkId::from_data(&[i as u8])).collect()
    }

    #[test]
    fn pops_form_contiguous_sequence() {
        let c = ids(3);
        let order = vec![c[0], c[1], c[0], c[2], c[1]];
        let tracker = ManifestReferenceTracker::from_consumption_order(order.clone());

        for (i, id) in order.iter().enumerate() {
            assert_eq!(tracker.current_position(), i as u64);
            assert_eq!(tracker.pop_next(id).unwrap(), i as u64);
        }
        assert_eq!(tracker.remaining(), 0);
    }

    #[test]
    fn out_of_order_pop_is_desync() {
        let c = ids(2);
        let tracker = ManifestReferenceTracker::from_consumption_order(vec![c[0], c[1]]);
        let err = tracker.pop_next(&c[1]).unwrap_err();
        assert_eq!(err.position, 0);
        assert_eq!(err.expected, Some(c[0]));
        // The failed pop must not advance the cursor.
        assert_eq!(tracker.current_position(), 0);
    }

    #[test]
    fn usage_queries_track_consumption() {
        let c = ids(2);
        let tracker = ManifestReferenceTracker::from_consumption_order(vec![c[0], c[1], c[0]]);

        assert_eq!(tracker.next_usage_after(&c[0], 0), Some(0));
        assert_eq!(tracker.next_usage_after(&c[0], 1), Some(2));
        assert_eq!(tracker.last_usage(&c[0]), Some(2));

        tracker.pop_next(&c[0]).unwrap();
        tracker.pop_next(&c[1]).unwrap();
        tracker.pop_next(&c[0]).unwrap();
        assert_eq!(tracker.next_usage_after(&c[0], tracker.current_position()), None);
    }
}
