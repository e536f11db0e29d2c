//! Collector integration: blocks referenced from tables, handles and
//! globals survive forced collections, and their content is intact after
//! relocation.

mod common;

use bytecode::Opcode;
use common::Assembler;
use vm::raw::RawType;
use vm::{Arguments, DefnFlags, VmFlags, VmOptions, VM};

#[test]
fn table_entries_survive_collection() {
    let mut vm = VM::new(VmOptions {
        flags: VmFlags::VERIFY_HEAP,
        ..Default::default()
    });
    let table = vm.new_table().expect("table");

    let mut keys = Vec::new();
    for i in 0..2000 {
        let key = vm.new_string(&format!("key-{i}")).expect("string");
        let added = vm.table_insert(&table, &key, i).expect("insert");
        assert!(added);
        keys.push(key);
    }
    assert_eq!(vm.table_len(&table), 2000);

    vm.collect_garbage().expect("gc");
    let (_, full) = vm.heap_stats();
    assert!(full >= 1);

    for i in 0..2000 {
        let key = format!("key-{i}");
        assert!(vm.table_contains(&table, &key), "{key} lost after gc");
        assert_eq!(vm.table_get(&table, &key), Some(i));
    }
    assert_eq!(vm.table_len(&table), 2000);
}

#[test]
fn unreferenced_strings_are_collected_but_rooted_ones_survive() {
    let mut vm = VM::new(VmOptions::default());

    let kept = vm.new_string("keep me").expect("string");
    for i in 0..10_000 {
        // Dropped immediately: garbage by the time the collector runs.
        let garbage = vm.new_string(&format!("garbage-{i}")).expect("string");
        drop(garbage);
    }
    vm.collect_garbage().expect("gc");
    assert_eq!(vm.string_content(&kept), "keep me");
}

#[test]
fn interpreter_roots_survive_collection_during_execution() {
    // A function that builds a table of `n` keys in bytecode, forcing
    // enough string allocation to trigger minor collections while object
    // references live on the interpreter stack.
    let mut a = Assembler::new("churn", [1, 0, 0]);
    let i64_ty = a.ty(RawType::I64);

    // Pool of distinct key strings referenced by STRING.
    let key_count = 512;
    let mut key_strings = Vec::new();
    for i in 0..key_count {
        key_strings.push(a.string(&format!("k{i}")));
    }

    // fill(n) — inserts keys k0..k<n> with values 0..n, returns table size.
    // local -1: table, local -2: i
    let table_new = vm::builtin_id(vm::builtin::TABLE_NEW_FN.index);
    let table_insert = vm::builtin_id(vm::builtin::TABLE_INSERT_FN.index);
    let table_len = vm::builtin_id(vm::builtin::TABLE_LEN_FN.index);

    a.add_function("fill", DefnFlags::PUBLIC, i64_ty, &[i64_ty], 16, |b| {
        b.start_block();
        let head = b.declare_block();
        let body_blocks: Vec<_> = (0..key_count).map(|_| b.declare_block()).collect();
        let step = b.declare_block();
        let exit = b.declare_block();

        b.emit_vbn(Opcode::CallG, table_new);
        b.emit_vbn(Opcode::StLocal, -1);
        b.emit_vbn(Opcode::I64, 0);
        b.emit_vbn(Opcode::StLocal, -2);
        b.branch(head);

        b.bind_block(head);
        b.emit_vbn(Opcode::LdLocal, -2);
        b.emit_vbn(Opcode::LdLocal, 0);
        b.emit(Opcode::LtI64);
        // Pick the key block by index: i as label into a fan-out.
        let fan = b.declare_block();
        b.branch_if(fan, exit);

        b.bind_block(fan);
        // table.insert(k[i % key_count], i)
        b.emit_vbn(Opcode::LdLocal, -1);
        b.emit_vbn(Opcode::LdLocal, -2);
        b.emit_vbn(Opcode::I64, key_count as i64);
        b.emit(Opcode::ModI64);
        // Dispatch through BranchL to one of the string blocks.
        b.emit_vbn(Opcode::I64, body_blocks[0].0 as i64);
        b.emit(Opcode::AddI64);
        b.emit(Opcode::BranchL);
        b.operand(key_count as i64);
        for block in &body_blocks {
            b.operand(block.0 as i64);
        }

        let concat = vm::builtin_id(vm::builtin::STRING_CONCAT_FN.index);
        for (i, block) in body_blocks.iter().enumerate() {
            b.bind_block(*block);
            b.emit_vbn(Opcode::String, key_strings[i] as i64);
            b.emit_vbn(Opcode::LdLocal, -2);
            b.emit_vbn(Opcode::CallG, table_insert);
            b.emit(Opcode::Drop);
            // Concatenation garbage: forces allocation every iteration so
            // collections hit while references live on this frame.
            b.emit_vbn(Opcode::String, key_strings[i] as i64);
            b.emit_vbn(Opcode::String, key_strings[(i + 1) % 512] as i64);
            b.emit_vbn(Opcode::CallG, concat);
            b.emit(Opcode::Drop);
            b.branch(step);
        }

        b.bind_block(step);
        b.emit_vbn(Opcode::LdLocal, -2);
        b.emit_vbn(Opcode::I64, 1);
        b.emit(Opcode::AddI64);
        b.emit_vbn(Opcode::StLocal, -2);
        b.branch(head);

        b.bind_block(exit);
        b.emit_vbn(Opcode::LdLocal, -1);
        b.emit_vbn(Opcode::CallG, table_len);
        b.emit(Opcode::Ret);
    });

    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&a.bytes()).expect("load");
    let fill = vm.find_function(package, "fill", false).unwrap();

    // Enough iterations that concat garbage exceeds the new space several
    // times over; keys repeat past 512, so the table stays at 512 entries.
    let result = vm
        .call_for_i64(fill, &Arguments::new().add_i64(50_000))
        .expect("fill");
    assert_eq!(result, key_count as i64);

    let (minor, _) = vm.heap_stats();
    assert!(minor >= 1, "the run must have collected at least once");
}
