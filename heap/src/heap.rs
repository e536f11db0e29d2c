use std::ptr::NonNull;

use object::align_word;

use crate::chunk::{Chunk, Executable, SpaceId, MAX_BLOCK_SIZE};
use crate::remembered::RememberedSet;

/// Calls `visitor` for every slot of `block` currently holding a block
/// pointer. The visitor may rewrite the slot in place.
///
/// # Safety
///
/// `block` must point to a valid, live heap block.
pub type TraceFn = unsafe fn(block: *mut u8, visitor: &mut dyn FnMut(&mut u64));

/// Returns the total byte size of the block, header included.
///
/// # Safety
///
/// `block` must point to a valid heap block.
pub type SizeFn = unsafe fn(block: *const u8) -> usize;

/// Consumers implement this to provide GC roots.
///
/// Called at safepoints to discover live roots from VM state (handle scopes,
/// globals, interpreter stacks). The visitor receives `&mut u64` so the
/// collector can update root slots in place when blocks relocate. Only slots
/// currently holding block pointers should be passed.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut u64));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// A single allocation larger than a chunk can hold.
    BlockTooLarge(usize),
    /// The heap could not be grown and collection freed too little.
    OutOfMemory,
}

impl std::fmt::Display for HeapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeapError::BlockTooLarge(size) => write!(f, "block of {size} bytes exceeds chunk capacity"),
            HeapError::OutOfMemory => write!(f, "heap exhausted"),
        }
    }
}

impl std::error::Error for HeapError {}

/// New-space chunk budget before a minor collection is preferred over
/// further expansion.
const NEW_SPACE_CHUNK_BUDGET: usize = 4;

/// Hard cap on mapped chunks across both spaces.
const MAX_CHUNKS: usize = 256;

pub(crate) struct Space {
    id: SpaceId,
    pub(crate) chunks: Vec<NonNull<Chunk>>,
    active: usize,
}

impl Space {
    fn new(id: SpaceId) -> Space {
        Space { id, chunks: Vec::new(), active: 0 }
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Option<usize> {
        while self.active < self.chunks.len() {
            // SAFETY: chunk pointers stay valid for the life of the space.
            let chunk = unsafe { self.chunks[self.active].as_mut() };
            let addr = chunk.range_mut().allocate(size);
            if addr != 0 {
                return Some(addr);
            }
            self.active += 1;
        }
        None
    }

    fn add_chunk(&mut self) -> bool {
        match Chunk::create(self.id, Executable::No) {
            Some(chunk) => {
                self.chunks.push(chunk);
                true
            }
            None => false,
        }
    }

    /// Make every chunk empty again (new space after a scavenge).
    pub(crate) fn reset(&mut self) {
        for chunk in &mut self.chunks {
            // SAFETY: chunk pointers stay valid for the life of the space.
            unsafe { chunk.as_mut().reset() };
        }
        self.active = 0;
    }

    pub(crate) fn rewind(&mut self) {
        self.active = 0;
    }
}

/// The managed heap: a new space and an old space, each a list of chunks.
///
/// Allocation bumps through the new space. When it fails, the heap requests
/// a new range, then collects, then expands; allocation sites therefore must
/// be restartable — after `allocate` returns, every block reference not
/// registered as a root (handle, stack slot covered by a pointer map, or
/// visited global) may have been relocated.
pub struct Heap {
    pub(crate) new_space: Space,
    pub(crate) old_space: Space,
    pub(crate) trace_fn: TraceFn,
    pub(crate) size_fn: SizeFn,
    pub(crate) remembered: RememberedSet,
    stamp_counter: u64,
    pub(crate) minor_collections: u64,
    pub(crate) full_collections: u64,
    /// Old-space chunk count right after the last full collection; growth
    /// past it schedules the next one.
    pub(crate) old_chunk_watermark: usize,
}

impl Heap {
    pub fn new(trace_fn: TraceFn, size_fn: SizeFn) -> Heap {
        let mut heap = Heap {
            new_space: Space::new(SpaceId::New),
            old_space: Space::new(SpaceId::Old),
            trace_fn,
            size_fn,
            remembered: RememberedSet::new(),
            stamp_counter: 0,
            minor_collections: 0,
            full_collections: 0,
            old_chunk_watermark: 1,
        };
        heap.new_space.add_chunk();
        heap.old_space.add_chunk();
        heap
    }

    /// Identity stamps are odd so the gc word always distinguishes a stamp
    /// (low bit 1) from a forwarding address (word-aligned, low bit 0).
    pub fn next_stamp(&mut self) -> u64 {
        self.stamp_counter += 1;
        (self.stamp_counter << 1) | 1
    }

    pub fn minor_collections(&self) -> u64 {
        self.minor_collections
    }

    pub fn full_collections(&self) -> u64 {
        self.full_collections
    }

    fn chunk_count(&self) -> usize {
        self.new_space.chunks.len() + self.old_space.chunks.len()
    }

    /// Allocate `size` bytes in the new space, zero-filled. Collects and
    /// expands as needed.
    pub fn allocate(
        &mut self,
        size: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<*mut u8, HeapError> {
        let size = align_word(size);
        if size > MAX_BLOCK_SIZE {
            return Err(HeapError::BlockTooLarge(size));
        }

        if let Some(addr) = self.new_space.allocate(size) {
            return Ok(zeroed(addr, size));
        }

        while self.new_space.chunks.len() < NEW_SPACE_CHUNK_BUDGET
            && self.chunk_count() < MAX_CHUNKS
        {
            if !self.new_space.add_chunk() {
                break;
            }
            if let Some(addr) = self.new_space.allocate(size) {
                return Ok(zeroed(addr, size));
            }
        }

        // Promotion grows the old space; once it has gained a few chunks
        // since the last compaction, collect fully instead of scavenging.
        if self.old_space.chunks.len() > self.old_chunk_watermark + 4 {
            self.collect_full(roots)?;
        } else {
            self.collect_minor(roots)?;
        }
        if let Some(addr) = self.new_space.allocate(size) {
            return Ok(zeroed(addr, size));
        }

        self.collect_full(roots)?;
        if let Some(addr) = self.new_space.allocate(size) {
            return Ok(zeroed(addr, size));
        }

        while self.chunk_count() < MAX_CHUNKS {
            if !self.new_space.add_chunk() {
                break;
            }
            if let Some(addr) = self.new_space.allocate(size) {
                return Ok(zeroed(addr, size));
            }
        }

        Err(HeapError::OutOfMemory)
    }

    /// Allocate without ever collecting. Used for exception blocks raised at
    /// program counters that have no pointer map, where the stack cannot be
    /// scanned.
    pub fn allocate_uncollected(&mut self, size: usize) -> Result<*mut u8, HeapError> {
        let size = align_word(size);
        if size > MAX_BLOCK_SIZE {
            return Err(HeapError::BlockTooLarge(size));
        }
        if let Some(addr) = self.new_space.allocate(size) {
            return Ok(zeroed(addr, size));
        }
        if self.chunk_count() < MAX_CHUNKS && self.new_space.add_chunk() {
            if let Some(addr) = self.new_space.allocate(size) {
                return Ok(zeroed(addr, size));
            }
        }
        Err(HeapError::OutOfMemory)
    }

    /// Allocation used by the collector itself when promoting survivors.
    pub(crate) fn promote_allocate(&mut self, size: usize) -> Option<usize> {
        if let Some(addr) = self.old_space.allocate(size) {
            return Some(addr);
        }
        if self.chunk_count() < MAX_CHUNKS && self.old_space.add_chunk() {
            return self.old_space.allocate(size);
        }
        None
    }

    // ── Space queries ──────────────────────────────────────────────

    /// True if `addr` is a block address inside the new space. Must only be
    /// called with addresses of live heap blocks.
    #[inline(always)]
    pub(crate) fn in_new_space(&self, addr: usize) -> bool {
        // SAFETY: block addresses always lie inside one of our chunks, and
        // chunks are aligned to their size.
        unsafe { (*Chunk::from_address(addr)).space() == SpaceId::New }
    }

    /// Write barrier: record `slot` when it lives in old space and now holds
    /// a new-space pointer.
    #[inline]
    pub fn record_write(&mut self, slot: *mut u64, value: u64) {
        let value = object::Tagged::from_raw(value);
        if !value.is_block() {
            return;
        }
        let slot_addr = slot as usize;
        // SAFETY: field slots live inside heap blocks, hence inside chunks.
        let slot_in_old = unsafe { (*Chunk::from_address(slot_addr)).space() == SpaceId::Old };
        if slot_in_old && self.in_new_space(value.raw() as usize) {
            self.remembered.add(slot_addr);
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        let chunk = Chunk::from_address(addr);
        self.new_space
            .chunks
            .iter()
            .chain(self.old_space.chunks.iter())
            .any(|c| c.as_ptr() == chunk)
    }
}

fn zeroed(addr: usize, size: usize) -> *mut u8 {
    let ptr = addr as *mut u8;
    // SAFETY: `addr` was just handed out by an allocation range.
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
    ptr
}

impl Drop for Heap {
    fn drop(&mut self) {
        for chunk in self.new_space.chunks.drain(..).chain(self.old_space.chunks.drain(..)) {
            // SAFETY: chunks are exclusively owned by the heap.
            unsafe { Chunk::destroy(chunk) };
        }
    }
}
