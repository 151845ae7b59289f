/// Virtual arena partitioning the shared I/O budget among in-flight batches.
///
/// The pool tracks spans of a `[0, capacity)` byte space with a coalescing
/// free-range list; each allocation is identified by an offset/length lease
/// rather than a pointer into shared storage. Batch payloads own their bytes
/// and travel through channels; the pool is what bounds how many of them can
/// exist at once and how large the next batch may be.
#[derive(Debug)]
pub(crate) struct BufferPool {
    capacity: usize,
    /// Sorted by offset, non-adjacent, non-overlapping.
    free: Vec<(usize, usize)>,
}

/// Handle to one allocated span. Must be returned via `BufferPool::release`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BufferLease {
    pub offset: usize,
    pub len: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, free: vec![(0, capacity)] }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the largest contiguous free region; the ceiling for the next
    /// batch.
    pub fn largest_free(&self) -> usize {
        self.free.iter().map(|&(_, len)| len).max().unwrap_or(0)
    }

    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    /// First-fit allocation. Returns `None` when no region is large enough.
    pub fn allocate(&mut self, len: usize) -> Option<BufferLease> {
        if len == 0 {
            return Some(BufferLease { offset: 0, len: 0 });
        }
        let index = self.free.iter().position(|&(_, free_len)| free_len >= len)?;
        let (offset, free_len) = self.free[index];
        if free_len == len {
            self.free.remove(index);
        } else {
            self.free[index] = (offset + len, free_len - len);
        }
        Some(BufferLease { offset, len })
    }

    /// Returns a span to the pool, coalescing with adjacent free neighbors.
    pub fn release(&mut self, lease: BufferLease) {
        if lease.len == 0 {
            return;
        }
        debug_assert!(lease.offset + lease.len <= self.capacity);

        let index = self.free.partition_point(|&(offset, _)| offset < lease.offset);
        debug_assert!(
            index == 0 || {
                let (prev_offset, prev_len) = self.free[index - 1];
                prev_offset + prev_len <= lease.offset
            },
            "double free in buffer pool"
        );
        self.free.insert(index, (lease.offset, lease.len));

        if index + 1 < self.free.len()
            && self.free[index].0 + self.free[index].1 == self.free[index + 1].0
        {
            self.free[index].1 += self.free[index + 1].1;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].0 + self.free[index - 1].1 == self.free[index].0 {
            self.free[index - 1].1 += self.free[index].1;
            self.free.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use super::*;

    #[test]
    fn allocates_first_fit_and_coalesces() {
        let mut pool = BufferPool::new(100);
        let a = pool.allocate(30).unwrap();
        let b = pool.allocate(30).unwrap();
        let c = pool.allocate(40).unwrap();
        assert_eq!((a.offset, b.offset, c.offset), (0, 30, 60));
        assert_eq!(pool.largest_free(), 0);
        assert!(pool.allocate(1).is_none());

        // Releasing b then a must merge into one leading span.
        pool.release(b);
        assert_eq!(pool.largest_free(), 30);
        pool.release(a);
        assert_eq!(pool.largest_free(), 60);
        assert_eq!(pool.free, vec![(0, 60)]);

        pool.release(c);
        assert_eq!(pool.free, vec![(0, 100)]);
    }

    #[test]
    fn zero_length_lease_is_a_noop() {
        let mut pool = BufferPool::new(10);
        let lease = pool.allocate(0).unwrap();
        pool.release(lease);
        assert_eq!(pool.free_bytes(), 10);
    }

    #[test]
    fn randomized_alloc_release_conserves_bytes() {
        let mut pool = BufferPool::new(1 << 16);
        let mut rng = StdRng::seed_from_u64(31);
        let mut live: Vec<BufferLease> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let len = rng.gen_range(1..4096);
                if let Some(lease) = pool.allocate(len) {
                    live.push(lease);
                }
            } else {
                let lease = live.swap_remove(rng.gen_range(0..live.len()));
                pool.release(lease);
            }
            let allocated: usize = live.iter().map(|l| l.len).sum();
            assert_eq!(pool.free_bytes() + allocated, pool.capacity());
        }

        for lease in live {
            pool.release(lease);
        }
        assert_eq!(pool.free, vec![(0, 1 << 16)]);
    }
}
