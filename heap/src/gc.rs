use std::cell::{Cell, RefCell};

use object::{align_word, BlockHeader, Tagged};

use crate::chunk::{AllocationRange, Chunk};
use crate::heap::{Heap, HeapError, RootProvider};

/// One planned block move of the compaction phase.
struct Relocation {
    src: usize,
    dst: usize,
    size: usize,
    stamp: u64,
}

impl Heap {
    /// Minor collection: scavenge the new space. Every live new-space block
    /// is promoted to the old space; forwarding addresses are written into
    /// the gc word of the abandoned copy (stamps are odd, forwarding
    /// addresses even, so the two states cannot be confused). Roots and
    /// remembered old-space slots are rewritten in place, then the promoted
    /// blocks are scanned transitively. Afterwards the new space is empty.
    pub fn collect_minor(&mut self, roots: &mut dyn RootProvider) -> Result<(), HeapError> {
        let span = tracing::trace_span!("minor_gc").entered();
        let heap: *mut Heap = self;
        let remembered = self.remembered.drain();

        let promoted: RefCell<Vec<*mut u8>> = RefCell::new(Vec::new());
        let promoted_bytes = Cell::new(0usize);
        let failed = Cell::new(false);

        let mut forward = |slot: &mut u64| {
            // SAFETY: slots hold block addresses; chunks are self-aligned.
            unsafe {
                let addr = *slot as usize;
                if !(*heap).in_new_space(addr) {
                    return;
                }
                let block = addr as *mut u8;
                let gc = BlockHeader::of(block).gc_word();
                if gc & 1 == 0 && gc != 0 {
                    // Already promoted; follow the forwarding address.
                    *slot = gc;
                    return;
                }
                let size = ((*heap).size_fn)(block);
                let aligned = align_word(size);
                let Some(dst) = (*heap).promote_allocate(aligned) else {
                    failed.set(true);
                    return;
                };
                core::ptr::copy_nonoverlapping(block, dst as *mut u8, size);
                BlockHeader::of_mut(block).set_gc_word(dst as u64);
                *slot = dst as u64;
                promoted_bytes.set(promoted_bytes.get() + aligned);
                promoted.borrow_mut().push(dst as *mut u8);
            }
        };

        roots.visit_roots(&mut forward);

        for slot in remembered {
            // The slot's containing block may have died or been overwritten
            // since the barrier fired; old-space memory is still mapped, so
            // re-checking the current value is always safe.
            let slot = slot as *mut u64;
            // SAFETY: recorded slots live in old-space chunk storage.
            unsafe {
                if Tagged::from_raw(*slot).is_block() {
                    forward(&mut *slot);
                }
            }
        }

        loop {
            let Some(block) = promoted.borrow_mut().pop() else {
                break;
            };
            // SAFETY: promoted copies are valid blocks in old space.
            unsafe { (self.trace_fn)(block, &mut forward) };
        }
        drop(forward);

        if failed.get() {
            return Err(HeapError::OutOfMemory);
        }

        self.new_space.reset();
        self.minor_collections += 1;
        drop(span);
        let promoted_bytes = promoted_bytes.get();
        tracing::debug!(promoted_bytes, "minor collection finished");
        Ok(())
    }

    /// Full collection: scavenge the new space, then mark-compact the old
    /// space. Compaction is the classic slide: mark from roots, assign each
    /// live block a forwarding address toward the base of its chunk, rewrite
    /// every reference, then move the blocks and restore their identity
    /// stamps.
    pub fn collect_full(&mut self, roots: &mut dyn RootProvider) -> Result<(), HeapError> {
        self.collect_minor(roots)?;
        let span = tracing::trace_span!("full_gc").entered();

        // ── Mark ───────────────────────────────────────────────────
        let worklist: RefCell<Vec<*mut u8>> = RefCell::new(Vec::new());
        let mut mark = |slot: &mut u64| {
            let value = Tagged::from_raw(*slot);
            if !value.is_block() {
                return;
            }
            let addr = value.raw() as usize;
            // SAFETY: live block addresses lie inside our chunks.
            unsafe {
                let chunk = &*Chunk::from_address(addr);
                if !chunk.is_marked(addr) {
                    chunk.mark(addr);
                    worklist.borrow_mut().push(addr as *mut u8);
                }
            }
        };
        roots.visit_roots(&mut mark);
        loop {
            let Some(block) = worklist.borrow_mut().pop() else {
                break;
            };
            // SAFETY: marked blocks are valid.
            unsafe { (self.trace_fn)(block, &mut mark) };
        }
        drop(mark);

        // ── Plan forwarding: slide each chunk's live blocks down ───
        let mut relocations: Vec<Relocation> = Vec::new();
        let mut live_bytes = 0usize;
        for chunk in &mut self.old_space.chunks {
            // SAFETY: chunks are exclusively owned by the heap.
            let chunk = unsafe { chunk.as_mut() };
            let mut cursor = chunk.storage_base();
            for src in chunk.marked_blocks() {
                // SAFETY: marked addresses are block starts.
                let size = unsafe { (self.size_fn)(src as *const u8) };
                let aligned = align_word(size);
                let header = unsafe { BlockHeader::of_mut(src as *mut u8) };
                relocations.push(Relocation {
                    src,
                    dst: cursor,
                    size,
                    stamp: header.gc_word(),
                });
                header.set_gc_word(cursor as u64);
                cursor += aligned;
                live_bytes += aligned;
            }
            chunk.set_range(AllocationRange::new(cursor, chunk.storage_limit()));
        }

        // ── Rewrite references through the forwarding words ────────
        let mut update = |slot: &mut u64| {
            if !Tagged::from_raw(*slot).is_block() {
                return;
            }
            // SAFETY: the slot points at a live (marked) block whose gc word
            // now holds its forwarding address.
            let fwd = unsafe { BlockHeader::of(*slot as *const u8).gc_word() };
            debug_assert!(fwd & 1 == 0, "forwarding word expected");
            *slot = fwd;
        };
        roots.visit_roots(&mut update);
        for relocation in &relocations {
            // SAFETY: blocks have not moved yet; their slots are at `src`.
            unsafe { (self.trace_fn)(relocation.src as *mut u8, &mut update) };
        }
        drop(update);

        // ── Move and restore identity stamps ───────────────────────
        for relocation in &relocations {
            // SAFETY: within a chunk dst <= src and moves run in address
            // order, so earlier moves never overwrite unmoved blocks;
            // `copy` tolerates the overlapping case.
            unsafe {
                if relocation.dst != relocation.src {
                    core::ptr::copy(
                        relocation.src as *const u8,
                        relocation.dst as *mut u8,
                        relocation.size,
                    );
                }
                BlockHeader::of_mut(relocation.dst as *mut u8).set_gc_word(relocation.stamp);
            }
        }

        for chunk in &mut self.old_space.chunks {
            // SAFETY: chunks are exclusively owned by the heap.
            unsafe { chunk.as_mut().clear_marks() };
        }
        self.old_space.rewind();
        self.remembered.clear();
        self.old_chunk_watermark = self.old_space.chunks.len();
        self.full_collections += 1;
        drop(span);
        tracing::debug!(live_bytes, moved = relocations.len(), "full collection finished");
        Ok(())
    }
}
