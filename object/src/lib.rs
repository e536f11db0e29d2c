mod bitmap;
mod blocks;
mod header;
mod meta;
mod value;

pub use bitmap::{Bitmap, BITS_PER_WORD};
pub use blocks::{
    hash_bytes, str_meta, table_meta, trace_block, StrBlock, TableBlock,
    STR_INSTANCE_SIZE, STR_LENGTH_OFFSET, TABLE_CAPACITY_OFFSET, TABLE_ENTRY_SIZE,
    TABLE_INSTANCE_SIZE,
};
pub use header::{
    align_word, block_size, elements_offset, load, store, BlockHeader, HEADER_SIZE,
    WORD_SIZE,
};
pub use meta::{BlockKind, Meta};
pub use value::Tagged;

#[cfg(test)]
mod tests {
    use super::*;

    // ── Tagged words ───────────────────────────────────────────────

    #[test]
    fn number_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, (i64::MAX >> 2), (i64::MIN >> 2)] {
            let t = Tagged::from_number(n);
            assert!(t.is_number());
            assert!(!t.is_pointer());
            assert_eq!(unsafe { t.number() }, n);
        }
    }

    #[test]
    fn pointer_round_trip() {
        let word: u64 = 0;
        let ptr = &word as *const u64;
        let t = Tagged::from_pointer(ptr);
        assert!(t.is_pointer());
        assert!(!t.is_number());
        assert!(t.is_block());
        assert_eq!(unsafe { t.pointer::<u64>() }, ptr as *mut u64);
    }

    #[test]
    fn exactly_one_tag_holds() {
        for raw in [0u64, 1, 2, 3, 8, 9, 16, 0xfff0, 0xfff1] {
            let t = Tagged::from_raw(raw);
            assert_ne!(t.is_number(), t.is_pointer(), "raw = {raw}");
        }
    }

    mod tagged_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn numbers_round_trip(n in -(1i64 << 62)..(1i64 << 62)) {
                let t = Tagged::from_number(n);
                prop_assert!(t.is_number());
                prop_assert_eq!(unsafe { t.number() }, n);
            }

            #[test]
            fn aligned_pointers_round_trip(addr in 1u64..=(u64::MAX >> 16)) {
                let addr = addr << 3;
                let t = Tagged::from_pointer(addr as *const u64);
                prop_assert!(t.is_pointer());
                prop_assert_eq!(unsafe { t.pointer::<u64>() } as u64, addr);
            }

            #[test]
            fn tags_are_mutually_exclusive(raw in any::<u64>()) {
                let t = Tagged::from_raw(raw);
                prop_assert_ne!(t.is_number(), t.is_pointer());
            }
        }
    }

    #[test]
    fn sentinels_are_not_blocks() {
        assert!(Tagged::NULL.is_pointer());
        assert!(!Tagged::NULL.is_block());
        assert!(Tagged::UNINITIALIZED.is_pointer());
        assert!(Tagged::UNINITIALIZED.is_uninitialized());
        assert!(!Tagged::UNINITIALIZED.is_block());
    }

    // ── Block layout ───────────────────────────────────────────────

    fn alloc_block(size: usize) -> Vec<u64> {
        vec![0u64; size.div_ceil(8)]
    }

    #[test]
    fn str_block_layout() {
        let meta = str_meta(0);
        let content = b"hello, world";
        let mut storage = alloc_block(STR_INSTANCE_SIZE as usize + content.len());
        let block = storage.as_mut_ptr() as *mut u8;
        unsafe {
            BlockHeader::init(block, &meta, 7);
            StrBlock::init(block, content);
            assert_eq!(StrBlock::bytes(block), content);
            assert_eq!(StrBlock::str(block), "hello, world");
            assert_eq!(block_size(block), align_word(24 + content.len()));
            assert_eq!(BlockHeader::of(block).gc_word(), 7);
        }
    }

    #[test]
    fn table_insert_find_remove() {
        let str_m = str_meta(0);
        let table_m = table_meta(0);

        let make_str = |content: &[u8]| -> Vec<u64> {
            let mut storage = alloc_block(STR_INSTANCE_SIZE as usize + content.len());
            let block = storage.as_mut_ptr() as *mut u8;
            unsafe {
                BlockHeader::init(block, &str_m, 0);
                StrBlock::init(block, content);
            }
            storage
        };

        let capacity = 8usize;
        let mut storage =
            alloc_block(TABLE_INSTANCE_SIZE as usize + capacity * TABLE_ENTRY_SIZE as usize);
        let table = storage.as_mut_ptr() as *mut u8;
        unsafe {
            BlockHeader::init(table, &table_m, 0);
            (*(table as *mut TableBlock)).capacity = capacity as i64;

            let alpha = make_str(b"alpha");
            let beta = make_str(b"beta");
            let alpha_ptr = alpha.as_ptr() as *const u8;
            let beta_ptr = beta.as_ptr() as *const u8;

            assert!(TableBlock::insert(table, alpha_ptr, Tagged::from_number(1)).0);
            assert!(TableBlock::insert(table, beta_ptr, Tagged::from_number(2)).0);
            assert!(!TableBlock::insert(table, alpha_ptr, Tagged::from_number(3)).0);
            assert_eq!((*(table as *const TableBlock)).live, 2);

            assert_eq!(TableBlock::get(table, b"alpha"), Some(Tagged::from_number(3)));
            assert_eq!(TableBlock::get(table, b"beta"), Some(Tagged::from_number(2)));
            assert_eq!(TableBlock::get(table, b"gamma"), None);

            assert_eq!(TableBlock::remove(table, b"alpha"), Some(Tagged::from_number(3)));
            assert_eq!(TableBlock::get(table, b"alpha"), None);
            assert_eq!((*(table as *const TableBlock)).live, 1);
            assert_eq!((*(table as *const TableBlock)).dead, 1);

            // Reinserting reuses the tombstone.
            assert!(TableBlock::insert(table, alpha_ptr, Tagged::from_number(9)).0);
            assert_eq!((*(table as *const TableBlock)).dead, 0);
        }
    }

    // ── Meta pointer maps ──────────────────────────────────────────

    #[test]
    fn meta_pointer_map_marks_words() {
        let mut meta = Meta::new(BlockKind::Object, 0, 40, 0, 0);
        assert!(!meta.has_pointers());
        meta.set_object_pointer(2);
        meta.set_object_pointer(4);
        assert!(meta.has_pointers());
        assert!(meta.object_pointer_at(2));
        assert!(!meta.object_pointer_at(3));
        assert!(meta.object_pointer_at(4));
    }

    #[test]
    fn trace_visits_marked_fields_only() {
        let mut meta = Meta::new(BlockKind::Object, 0, 40, 0, 0);
        meta.set_object_pointer(2);

        let target: u64 = 0;
        let target_addr = &target as *const u64 as u64;

        let mut storage = alloc_block(40);
        let block = storage.as_mut_ptr() as *mut u8;
        unsafe {
            BlockHeader::init(block, &meta, 0);
            store::<u64>(block, 16, target_addr);
            store::<u64>(block, 24, target_addr); // unmarked word, must be skipped
            store::<u64>(block, 32, Tagged::UNINITIALIZED.raw());

            let mut seen = Vec::new();
            trace_block(block, &mut |slot| seen.push(*slot));
            assert_eq!(seen, vec![target_addr]);
        }
    }
}
