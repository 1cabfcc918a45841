//! Fixed-block free-list allocator.
//!
//! Slots live in blocks of `block_size` entries that are kept for the whole
//! lifetime of the allocator. Unused slots are threaded through an intrusive
//! singly linked list: `claim` pops the head, `release` pushes the tail. A new
//! block is allocated only when the list runs dry, so steady-state
//! claim/release cycles never touch the heap.
//!
//! Not thread-safe. Each proxy instance owns its allocators and only ever
//! touches them from its own reactor task.

/// Handle to a claimed slot.
///
/// Deliberately neither `Clone` nor `Copy`: a claim has exactly one holder,
/// and handing it back through [`BlockAllocator::release`] consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Second handle to the same slot. Only the buffer pool needs this, and it
    /// guards the aliasing with its own reference count.
    pub(crate) fn alias(&self) -> SlotId {
        SlotId(self.0)
    }

    /// Flat index of the slot across all blocks.
    pub fn index(&self) -> usize {
        self.0
    }
}

struct Slot<T> {
    value: T,
    next: Option<usize>,
    claimed: bool,
}

/// Free-list allocator handing out reusable `T` slots.
pub struct BlockAllocator<T> {
    block_size: usize,
    blocks: Vec<Box<[Slot<T>]>>,
    head: Option<usize>,
    tail: Option<usize>,
    available: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Default + 'static> BlockAllocator<T> {
    /// Allocator whose slots start out as `T::default()`.
    pub fn new(block_size: usize) -> Self {
        Self::with_factory(block_size, T::default)
    }
}

impl<T> BlockAllocator<T> {
    /// Allocator whose slots are built by `make` when a block is allocated.
    ///
    /// One block is allocated up front. A `block_size` of zero is treated as 1.
    pub fn with_factory(block_size: usize, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let mut allocator = Self {
            block_size: block_size.max(1),
            blocks: Vec::new(),
            head: None,
            tail: None,
            available: 0,
            make: Box::new(make),
        };
        allocator.grow();
        allocator
    }

    /// Take a free slot, growing by one block if none is left.
    ///
    /// The slot keeps whatever its previous holder left in it; owners reset
    /// their own state.
    pub fn claim(&mut self) -> SlotId {
        loop {
            if let Some(index) = self.pop_free() {
                self.slot_mut(index).claimed = true;
                return SlotId(index);
            }
            self.grow();
        }
    }

    /// Return a slot to the tail of the free list.
    pub fn release(&mut self, id: SlotId) {
        let slot = self.slot_mut(id.0);
        debug_assert!(slot.claimed, "slot {} released twice", id.0);
        slot.claimed = false;
        self.push_free(id.0);
    }

    pub fn get(&self, id: &SlotId) -> &T {
        &self.slot(id.0).value
    }

    pub fn get_mut(&mut self, id: &SlotId) -> &mut T {
        &mut self.slot_mut(id.0).value
    }

    /// Total number of slots across all blocks.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    /// Slots currently on the free list.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Slots currently held by someone.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.available
    }

    pub fn blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    // ── Free list ────────────────────────────────────────────────────────────

    fn grow(&mut self) {
        let base = self.capacity();
        let block: Box<[Slot<T>]> = (0..self.block_size)
            .map(|_| Slot {
                value: (self.make)(),
                next: None,
                claimed: false,
            })
            .collect();
        self.blocks.push(block);

        for offset in 0..self.block_size {
            self.push_free(base + offset);
        }
    }

    fn pop_free(&mut self) -> Option<usize> {
        let index = self.head?;
        let next = self.slot_mut(index).next.take();
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.available -= 1;
        Some(index)
    }

    fn push_free(&mut self, index: usize) {
        self.slot_mut(index).next = None;
        match self.tail {
            Some(tail) => self.slot_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.available += 1;
    }

    fn slot(&self, index: usize) -> &Slot<T> {
        &self.blocks[index / self.block_size][index % self.block_size]
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot<T> {
        &mut self.blocks[index / self.block_size][index % self.block_size]
    }
}
