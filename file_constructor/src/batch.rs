use bytes::{Bytes, BytesMut};
use chunk_sources::SourceError;
use patch_types::ChunkId;

use crate::buffer::BufferLease;

/// One placement of a chunk's bytes into the batch buffer: `length` bytes
/// starting at `chunk_offset` of the chunk window land at `dest_offset` of
/// the batch region. A chunk reused within a batch splats more than once.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Splat {
    pub chunk_offset: u32,
    pub length: u32,
    pub dest_offset: usize,
}

/// How a chunk's data reaches its destinations in this batch.
#[derive(Debug)]
pub(crate) enum Routing {
    /// The read delivers the whole chunk straight into its single
    /// destination; the backing store is not involved.
    Direct { dest_offset: usize, length: u32 },
    /// The read (if any) lands in the backing store; destinations are filled
    /// by splats at retirement.
    Store { splats: Vec<Splat> },
}

/// Per-chunk-id read state within one batch.
#[derive(Debug)]
pub(crate) struct ChunkRequest {
    pub id: ChunkId,
    pub routing: Routing,
    /// False when the chunk was already resident in the backing store.
    pub needs_read: bool,
    /// We hold one backing-store lock (reservation or splat lock) that must
    /// be released by exactly one terminal call at retirement.
    pub store_locked: bool,
    /// We made the reservation and must commit the payload at retirement.
    pub reserved: bool,
    pub cloud_fallback_used: bool,
    pub result: Option<Result<Bytes, SourceError>>,
}

/// Batch lifecycle. `Dispatched` is implicit in construction; reads may
/// complete out of order but retirement is strictly in batch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BatchState {
    ReadsPending,
    WritePending,
}

/// A contiguous slice of one file's parts plus its region of the shared I/O
/// budget. Lives from read-issue to write-completion.
#[derive(Debug)]
pub(crate) struct Batch {
    pub seq: u64,
    pub file_index: usize,
    pub first_part: usize,
    pub part_count: usize,
    /// Offset in the output file of this batch's first byte.
    pub write_offset: u64,
    pub lease: BufferLease,
    pub buffer: BytesMut,
    pub requests: Vec<ChunkRequest>,
    pub pending_reads: usize,
    pub state: BatchState,
}

impl Batch {
    pub fn reads_finished(&self) -> bool {
        self.pending_reads == 0 && self.state == BatchState::ReadsPending
    }

    pub fn request_mut(&mut self, id: &ChunkId) -> Option<&mut ChunkRequest> {
        self.requests.iter_mut().find(|r| r.id == *id)
    }

    /// Whether any read in this batch ultimately failed.
    pub fn any_failed(&self) -> bool {
        self.requests.iter().any(|r| matches!(r.result, Some(Err(_))))
    }
}
