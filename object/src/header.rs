use crate::meta::Meta;

/// Size in bytes of a machine word.
pub const WORD_SIZE: usize = 8;

/// Size in bytes of the header at the start of every heap block.
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

/// The two-word header at the start of every heap block.
///
/// ```text
/// word 0: meta pointer — Metas live outside the collected heap and never
///         move, so this word is stable across collections.
/// word 1: gc word — identity stamp assigned at allocation. During a
///         collection the relocation phase temporarily overwrites it with
///         the block's forwarding address; the stamp is restored after the
///         move so block identity is address-independent.
/// ```
#[repr(C)]
pub struct BlockHeader {
    meta: *const Meta,
    gc: u64,
}

const _: () = assert!(size_of::<BlockHeader>() == HEADER_SIZE);

impl BlockHeader {
    /// View the header at the start of a block.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized heap block.
    #[inline(always)]
    pub unsafe fn of<'a>(block: *const u8) -> &'a BlockHeader {
        &*(block as *const BlockHeader)
    }

    /// # Safety
    ///
    /// As [`BlockHeader::of`], and no aliasing references may exist.
    #[inline(always)]
    pub unsafe fn of_mut<'a>(block: *mut u8) -> &'a mut BlockHeader {
        &mut *(block as *mut BlockHeader)
    }

    /// Write a fresh header.
    ///
    /// # Safety
    ///
    /// `block` must point to at least [`HEADER_SIZE`] writable bytes.
    #[inline(always)]
    pub unsafe fn init(block: *mut u8, meta: *const Meta, stamp: u64) {
        (*(block as *mut BlockHeader)).meta = meta;
        (*(block as *mut BlockHeader)).gc = stamp;
    }

    #[inline(always)]
    pub fn meta(&self) -> &Meta {
        // SAFETY: the meta pointer is written at block initialization and
        // points to a Meta owned by a Class or the VM roots, which outlive
        // every heap block.
        unsafe { &*self.meta }
    }

    #[inline(always)]
    pub fn meta_ptr(&self) -> *const Meta {
        self.meta
    }

    #[inline(always)]
    pub fn gc_word(&self) -> u64 {
        self.gc
    }

    #[inline(always)]
    pub fn set_gc_word(&mut self, word: u64) {
        self.gc = word;
    }
}

/// Read a typed value from a byte offset inside a block.
///
/// # Safety
///
/// `block + offset` must be a valid, initialized `T` within the block.
#[inline(always)]
pub unsafe fn load<T: Copy>(block: *const u8, offset: usize) -> T {
    (block.add(offset) as *const T).read()
}

/// Write a typed value at a byte offset inside a block.
///
/// # Safety
///
/// `block + offset` must be valid writable memory within the block.
#[inline(always)]
pub unsafe fn store<T: Copy>(block: *mut u8, offset: usize, value: T) {
    (block.add(offset) as *mut T).write(value)
}

#[inline(always)]
pub const fn align_word(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Total byte size of a block, including the header and any element area,
/// rounded up to word alignment.
///
/// # Safety
///
/// `block` must point to an initialized heap block.
pub unsafe fn block_size(block: *const u8) -> usize {
    let meta = BlockHeader::of(block).meta();
    let mut size = meta.instance_size() as usize;
    if meta.has_elements() {
        let length: i64 = load(block, meta.length_offset() as usize);
        debug_assert!(length >= 0, "negative block length");
        size = align_word(size) + length as usize * meta.element_size() as usize;
    }
    align_word(size)
}

/// Byte offset of the first element of an array-like block.
#[inline(always)]
pub fn elements_offset(meta: &Meta) -> usize {
    align_word(meta.instance_size() as usize)
}
