//! Runtime operations on the builtin table: a string-keyed open-addressed
//! map. The Table object keeps a stable identity; its entries block is
//! replaced when the map grows. All operations that allocate pin their
//! arguments in a handle scope first, since any allocation may move every
//! block.

use object::{
    BlockHeader, StrBlock, TableBlock, Tagged, TABLE_ENTRY_SIZE, TABLE_INSTANCE_SIZE,
};

use crate::builtins;
use crate::error::VmError;
use crate::handles::HandleScope;
use crate::VM;

/// Byte offset of the wrapper's entries field.
const ENTRIES_OFFSET: usize = 16;

const INITIAL_CAPACITY: i64 = 16;

unsafe fn entries_of(table: u64) -> *mut u8 {
    object::load::<u64>(table as *const u8, ENTRIES_OFFSET) as *mut u8
}

fn allocate_entries(vm: &mut VM, capacity: i64) -> Result<*mut u8, VmError> {
    let size = TABLE_INSTANCE_SIZE as usize + capacity as usize * TABLE_ENTRY_SIZE as usize;
    let meta: *const object::Meta = vm.table_entries_meta();
    let block = vm.allocate_block(meta, size)?;
    // SAFETY: freshly allocated, zeroed storage: live/dead start at zero and
    // every entry is empty.
    unsafe { (*(block as *mut TableBlock)).capacity = capacity };
    Ok(block)
}

/// Allocate an empty table.
pub fn table_new(vm: &mut VM) -> Result<u64, VmError> {
    let scope = vm.handle_scope();
    let entries = allocate_entries(vm, INITIAL_CAPACITY)?;
    let entries = scope.pin(entries);

    let (meta, size) = {
        let table_class = vm.class(builtins::TABLE_CLASS);
        let meta: *const object::Meta = table_class.meta(builtins::TABLE_CLASS);
        (meta, table_class.instance_size() as usize)
    };
    let table = vm.allocate_block(meta, size)?;
    // SAFETY: the wrapper's single field is the entries pointer.
    unsafe { object::store::<u64>(table, ENTRIES_OFFSET, entries.word()) };
    Ok(table as u64)
}

/// Insert or overwrite `key → value`. Returns true when the key is new.
pub fn table_insert(vm: &mut VM, table: u64, key: u64, value: Tagged) -> Result<bool, VmError> {
    let scope = vm.handle_scope();
    let table = scope.pin_word::<u8>(table);
    let key = scope.pin_word::<u8>(key);
    let value_handle = value
        .is_block()
        .then(|| scope.pin_word::<u8>(value.raw()));

    // SAFETY: table wraps a valid entries block.
    unsafe {
        let entries = entries_of(table.word());
        let header = &*(entries as *const TableBlock);
        if (header.live + header.dead + 1) * 4 > header.capacity * 3 {
            grow(vm, &scope, table.word())?;
        }

        let value = value_handle
            .map(|handle| Tagged::from_raw(handle.word()))
            .unwrap_or(value);
        let entries = entries_of(table.word());
        let (added, index) = TableBlock::insert(entries, key.ptr(), value);
        // The entries block may be old while key or value are young.
        let slot = TableBlock::entry_ptr(entries, index);
        vm.heap.record_write(slot, *slot);
        vm.heap.record_write(slot.add(1), *slot.add(1));
        Ok(added)
    }
}

unsafe fn grow(vm: &mut VM, scope: &HandleScope, table: u64) -> Result<(), VmError> {
    let old_entries = scope.pin(entries_of(table));
    let table = scope.pin_word::<u8>(table);
    let new_capacity = (*(old_entries.ptr() as *const TableBlock)).capacity * 2;
    let new_entries = allocate_entries(vm, new_capacity)?;

    // No allocation below this point: raw pointers stay valid while the
    // entries are rehashed.
    let mut moved = 0;
    TableBlock::for_each_live(old_entries.ptr(), |key, value| {
        let (added, _) = TableBlock::insert(new_entries, key, value);
        debug_assert!(added);
        moved += 1;
    });
    tracing::trace!(moved, new_capacity, "table grown");

    object::store::<u64>(table.ptr(), ENTRIES_OFFSET, new_entries as u64);
    let slot = table.ptr().add(ENTRIES_OFFSET) as *mut u64;
    vm.heap.record_write(slot, new_entries as u64);
    Ok(())
}

/// True if `key` is present.
pub fn table_contains(table: u64, key_bytes: &[u8]) -> bool {
    // SAFETY: table wraps a valid entries block.
    unsafe { TableBlock::find(entries_of(table), key_bytes).is_some() }
}

pub fn table_get(table: u64, key_bytes: &[u8]) -> Option<Tagged> {
    // SAFETY: as `table_contains`.
    unsafe { TableBlock::get(entries_of(table), key_bytes) }
}

pub fn table_remove(table: u64, key_bytes: &[u8]) -> Option<Tagged> {
    // SAFETY: as `table_contains`.
    unsafe { TableBlock::remove(entries_of(table), key_bytes) }
}

pub fn table_len(table: u64) -> i64 {
    // SAFETY: as `table_contains`.
    unsafe { (*(entries_of(table) as *const TableBlock)).live }
}

/// Key bytes of a string block; a convenience for callers holding raw words.
///
/// # Safety
///
/// `string` must point to a live string block.
pub unsafe fn string_bytes<'a>(string: u64) -> &'a [u8] {
    debug_assert!({
        let header = BlockHeader::of(string as *const u8);
        header.meta().kind() == object::BlockKind::Str
    });
    StrBlock::bytes(string as *const u8)
}
