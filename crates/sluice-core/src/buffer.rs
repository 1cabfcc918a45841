//! Pooled, reference-counted datagram buffers.
//!
//! A receive claims one buffer and holds the implicit reference. Every send
//! that points into the same bytes holds one more. The buffer goes back to
//! the pool when the last reference is released, never earlier.
//!
//! References are [`BufferRef`] tokens. A token is not `Clone`; the only way
//! to get a second one is [`BufferPool::share`], which bumps the count, and
//! the only way to drop one is [`BufferPool::release`]. Balanced ref/unref is
//! therefore a property of ownership, not of caller discipline.

use crate::pool::{BlockAllocator, SlotId};

/// Largest UDP payload a single receive can deliver.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Upper bound on the bytes one pool block pre-allocates. Large batches get
/// fewer buffers per block.
pub const MAX_BLOCK_BYTES: usize = 16 * 1024 * 1024;

/// Payload storage plus its reference count.
pub struct TransferBuffer {
    data: Box<[u8]>,
    refcount: u32,
}

impl TransferBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            refcount: 0,
        }
    }

    fn reset(&mut self) {
        self.refcount = 0;
    }

    fn add_ref(&mut self) {
        self.refcount += 1;
    }

    /// Drop one reference. Returns true when the count reaches zero.
    fn unref(&mut self) -> bool {
        debug_assert!(self.refcount > 0, "unref on an unreferenced buffer");
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }
}

/// One reference to a pooled buffer.
#[derive(Debug)]
#[must_use = "buffer references must be handed back to BufferPool::release"]
pub struct BufferRef(SlotId);

impl BufferRef {
    /// Slot index of the underlying buffer. Two references to the same
    /// buffer report the same index.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// Lifetime counters, used by tests and the periodic stats log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    /// Buffers claimed for a receive (each starts with one reference).
    pub claims: u64,
    /// Extra references taken with `share`.
    pub shares: u64,
    /// References dropped with `release`.
    pub releases: u64,
    /// Buffers returned to the free list.
    pub frees: u64,
}

impl PoolCounters {
    /// References that are still outstanding.
    pub fn outstanding(&self) -> u64 {
        (self.claims + self.shares).saturating_sub(self.releases)
    }
}

/// Allocator of [`TransferBuffer`]s sized for `batch` datagrams each.
pub struct BufferPool {
    slots: BlockAllocator<TransferBuffer>,
    buffer_size: usize,
    counters: PoolCounters,
}

impl BufferPool {
    /// `block_size` buffers per block, trimmed so a block stays within
    /// [`MAX_BLOCK_BYTES`].
    pub fn new(block_size: usize, batch: usize) -> Self {
        let buffer_size = MAX_DATAGRAM_SIZE * batch.max(1);
        let block_size = block_size.min(MAX_BLOCK_BYTES / buffer_size).max(1);
        Self {
            slots: BlockAllocator::with_factory(block_size, move || TransferBuffer::new(buffer_size)),
            buffer_size,
            counters: PoolCounters::default(),
        }
    }

    /// Claim a buffer for a receive. The returned token is the implicit
    /// "data in flight" reference.
    pub fn claim(&mut self) -> BufferRef {
        let id = self.slots.claim();
        let buffer = self.slots.get_mut(&id);
        buffer.reset();
        buffer.add_ref();
        self.counters.claims += 1;
        BufferRef(id)
    }

    /// Take another reference to the same bytes.
    pub fn share(&mut self, buf: &BufferRef) -> BufferRef {
        self.slots.get_mut(&buf.0).add_ref();
        self.counters.shares += 1;
        BufferRef(buf.0.alias())
    }

    /// Drop a reference. Returns true if this was the last one and the
    /// buffer went back to the pool.
    pub fn release(&mut self, buf: BufferRef) -> bool {
        self.counters.releases += 1;
        if self.slots.get_mut(&buf.0).unref() {
            self.slots.release(buf.0);
            self.counters.frees += 1;
            true
        } else {
            false
        }
    }

    pub fn bytes(&self, buf: &BufferRef) -> &[u8] {
        &self.slots.get(&buf.0).data
    }

    pub fn bytes_mut(&mut self, buf: &BufferRef) -> &mut [u8] {
        &mut self.slots.get_mut(&buf.0).data
    }

    pub fn refcount(&self, buf: &BufferRef) -> u32 {
        self.slots.get(&buf.0).refcount
    }

    /// Bytes per buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.slots.in_use()
    }

    pub fn counters(&self) -> PoolCounters {
        self.counters
    }
}
