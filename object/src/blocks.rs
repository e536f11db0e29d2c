use crate::header::{self, BlockHeader, HEADER_SIZE};
use crate::meta::{BlockKind, Meta};
use crate::value::Tagged;

/// Builtin string block.
///
/// ```text
/// [header 16B] [length: i64 8B] [utf-8 bytes ...]
/// ```
#[repr(C)]
pub struct StrBlock {
    pub header: BlockHeader,
    pub length: i64,
}

pub const STR_INSTANCE_SIZE: u32 = size_of::<StrBlock>() as u32;
pub const STR_LENGTH_OFFSET: u32 = HEADER_SIZE as u32;

impl StrBlock {
    /// # Safety
    ///
    /// `block` must point to an initialized string block.
    #[inline(always)]
    pub unsafe fn bytes<'a>(block: *const u8) -> &'a [u8] {
        let s = &*(block as *const StrBlock);
        core::slice::from_raw_parts(block.add(size_of::<StrBlock>()), s.length as usize)
    }

    /// # Safety
    ///
    /// As [`StrBlock::bytes`]; the content must additionally be valid utf-8,
    /// which the loader guarantees for strings read from packages.
    #[inline(always)]
    pub unsafe fn str<'a>(block: *const u8) -> &'a str {
        core::str::from_utf8_unchecked(Self::bytes(block))
    }

    /// Write length and content into freshly allocated storage.
    ///
    /// # Safety
    ///
    /// `block` must have room for `size_of::<StrBlock>() + bytes.len()` and
    /// carry an initialized header.
    pub unsafe fn init(block: *mut u8, bytes: &[u8]) {
        (*(block as *mut StrBlock)).length = bytes.len() as i64;
        core::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            block.add(size_of::<StrBlock>()),
            bytes.len(),
        );
    }
}

/// Content hash used by table blocks. Deterministic and address-independent,
/// so table placement survives block relocation.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    // FNV-1a.
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Builtin open-addressed string-keyed map block.
///
/// ```text
/// [header 16B] [capacity: i64] [live: i64] [dead: i64]
/// [entry 0: key word, value word] [entry 1] ...
/// ```
///
/// Keys are raw string block pointers; `0` marks an empty slot and the
/// uninitialized sentinel marks a tombstone. Values are tagged words.
/// Probing is linear on the key string's content hash, so entries stay
/// findable after the collector moves key strings.
#[repr(C)]
pub struct TableBlock {
    pub header: BlockHeader,
    pub capacity: i64,
    pub live: i64,
    pub dead: i64,
}

pub const TABLE_INSTANCE_SIZE: u32 = size_of::<TableBlock>() as u32;
pub const TABLE_CAPACITY_OFFSET: u32 = HEADER_SIZE as u32;
pub const TABLE_ENTRY_SIZE: u32 = 16;

const EMPTY_KEY: u64 = 0;
const TOMBSTONE_KEY: u64 = Tagged::UNINITIALIZED.raw();

impl TableBlock {
    /// Address of the key word of entry `index`; the value word follows it.
    ///
    /// # Safety
    ///
    /// `block` must point to a table block with at least `index + 1`
    /// entries.
    #[inline(always)]
    pub unsafe fn entry_ptr(block: *const u8, index: usize) -> *mut u64 {
        block.add(size_of::<TableBlock>() + index * TABLE_ENTRY_SIZE as usize) as *mut u64
    }

    /// Find the entry index holding `key_bytes`, if present.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized table block whose keys are valid
    /// string blocks.
    pub unsafe fn find(block: *const u8, key_bytes: &[u8]) -> Option<usize> {
        let capacity = (*(block as *const TableBlock)).capacity as usize;
        if capacity == 0 {
            return None;
        }
        let mut index = hash_bytes(key_bytes) as usize % capacity;
        // The caller keeps the load factor below one, so probing terminates.
        for _ in 0..capacity {
            let key = *Self::entry_ptr(block, index);
            if key == EMPTY_KEY {
                return None;
            }
            if key != TOMBSTONE_KEY && StrBlock::bytes(key as *const u8) == key_bytes {
                return Some(index);
            }
            index = (index + 1) % capacity;
        }
        None
    }

    /// # Safety
    ///
    /// As [`TableBlock::find`].
    pub unsafe fn get(block: *const u8, key_bytes: &[u8]) -> Option<Tagged> {
        Self::find(block, key_bytes)
            .map(|index| Tagged::from_raw(*Self::entry_ptr(block, index).add(1)))
    }

    /// Insert or overwrite; returns whether a new key was added and the
    /// entry index written. The caller must have ensured a free slot exists
    /// (load factor below capacity).
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized table block, `key` to a string
    /// block.
    pub unsafe fn insert(block: *mut u8, key: *const u8, value: Tagged) -> (bool, usize) {
        let table = &mut *(block as *mut TableBlock);
        let capacity = table.capacity as usize;
        debug_assert!((table.live + table.dead) < table.capacity);
        let key_bytes = StrBlock::bytes(key);
        let mut index = hash_bytes(key_bytes) as usize % capacity;
        let mut first_tombstone = None;
        loop {
            let slot = Self::entry_ptr(block, index);
            let existing = *slot;
            if existing == EMPTY_KEY {
                let target = first_tombstone.unwrap_or(index);
                if first_tombstone.is_some() {
                    table.dead -= 1;
                }
                let slot = Self::entry_ptr(block, target);
                *slot = key as u64;
                *slot.add(1) = value.raw();
                table.live += 1;
                return (true, target);
            }
            if existing == TOMBSTONE_KEY {
                if first_tombstone.is_none() {
                    first_tombstone = Some(index);
                }
            } else if StrBlock::bytes(existing as *const u8) == key_bytes {
                *slot.add(1) = value.raw();
                return (false, index);
            }
            index = (index + 1) % capacity;
        }
    }

    /// Remove a key, leaving a tombstone. Returns the removed value.
    ///
    /// # Safety
    ///
    /// As [`TableBlock::find`].
    pub unsafe fn remove(block: *mut u8, key_bytes: &[u8]) -> Option<Tagged> {
        let index = Self::find(block, key_bytes)?;
        let table = &mut *(block as *mut TableBlock);
        let slot = Self::entry_ptr(block, index);
        let value = Tagged::from_raw(*slot.add(1));
        *slot = TOMBSTONE_KEY;
        *slot.add(1) = 0;
        table.live -= 1;
        table.dead += 1;
        Some(value)
    }

    /// Visit every live `(key, value)` pair, e.g. for rehashing into a
    /// larger table.
    ///
    /// # Safety
    ///
    /// As [`TableBlock::find`].
    pub unsafe fn for_each_live(block: *const u8, mut f: impl FnMut(*const u8, Tagged)) {
        let capacity = (*(block as *const TableBlock)).capacity as usize;
        for index in 0..capacity {
            let slot = Self::entry_ptr(block, index);
            let key = *slot;
            if key != EMPTY_KEY && key != TOMBSTONE_KEY {
                f(key as *const u8, Tagged::from_raw(*slot.add(1)));
            }
        }
    }
}

/// Call `visitor` for every slot of `block` that currently holds a block
/// pointer. The visitor may rewrite the slot in place, which is how the
/// collector redirects references to relocated blocks.
///
/// # Safety
///
/// `block` must point to an initialized, live heap block.
pub unsafe fn trace_block(block: *mut u8, visitor: &mut dyn FnMut(&mut u64)) {
    let meta = BlockHeader::of(block).meta();
    match meta.kind() {
        BlockKind::Object => {
            if meta.has_pointers() {
                for word in 0..meta.object_word_count() {
                    if meta.object_pointer_at(word) {
                        visit_slot(block.add(word * 8) as *mut u64, visitor);
                    }
                }
            }
            if meta.has_elements() && meta.has_element_pointers() {
                let length: i64 = header::load(block, meta.length_offset() as usize);
                let base = header::elements_offset(meta);
                let stride = meta.element_size() as usize;
                for i in 0..length as usize {
                    for word in 0..meta.element_word_count() {
                        if meta.element_pointer_at(word) {
                            let offset = base + i * stride + word * 8;
                            visit_slot(block.add(offset) as *mut u64, visitor);
                        }
                    }
                }
            }
        }
        BlockKind::Str => {}
        BlockKind::Table => {
            let capacity = (*(block as *const TableBlock)).capacity as usize;
            for index in 0..capacity {
                let slot = TableBlock::entry_ptr(block, index);
                // Key: raw string pointer, empty slot, or tombstone.
                visit_slot(slot, visitor);
                // Value: tagged word; block pointers carry a zero tag, so
                // they can be rewritten in place like raw pointers.
                visit_slot(slot.add(1), visitor);
            }
        }
    }
}

#[inline(always)]
unsafe fn visit_slot(slot: *mut u64, visitor: &mut dyn FnMut(&mut u64)) {
    if Tagged::from_raw(*slot).is_block() {
        visitor(&mut *slot);
    }
}

/// Standard Metas for the builtin block layouts. `class_key` is the packed
/// key the VM assigns to the corresponding builtin class.
pub fn str_meta(class_key: u64) -> Meta {
    Meta::new(BlockKind::Str, class_key, STR_INSTANCE_SIZE, 1, STR_LENGTH_OFFSET)
}

pub fn table_meta(class_key: u64) -> Meta {
    let mut meta = Meta::new(
        BlockKind::Table,
        class_key,
        TABLE_INSTANCE_SIZE,
        TABLE_ENTRY_SIZE,
        TABLE_CAPACITY_OFFSET,
    );
    // Both entry words can refer to blocks; the tracer handles tagging.
    meta.set_element_pointer(0);
    meta.set_element_pointer(1);
    meta
}
