//! Stack pointer map properties: every GC-safe pc of a built function has a
//! valid locals region, bitmap slices stay in bounds, and reference slots
//! are classified correctly.

mod common;

use bytecode::Opcode;
use common::Assembler;
use vm::raw::RawType;
use vm::{Arguments, DefnFlags, VmOptions, VM};

fn package_with_reference_traffic() -> Vec<u8> {
    let mut a = Assembler::new("maps", [1, 0, 0]);
    let i64_ty = a.ty(RawType::I64);
    let string_builtin = 2; // builtin class table index of String
    let string_ty = a.ty_builtin_class(string_builtin);
    let greeting = a.string("hello");
    let concat = vm::builtin_id(vm::builtin::STRING_CONCAT_FN.index);
    let length = vm::builtin_id(vm::builtin::STRING_LEN_FN.index);

    // weave(s) = len(s + "hello") computed with strings parked in locals
    // and on the operand stack across calls (each call is a safe point).
    a.add_function("weave", DefnFlags::PUBLIC, i64_ty, &[string_ty], 8, |b| {
        b.start_block();
        b.emit_vbn(Opcode::String, greeting as i64);
        b.emit_vbn(Opcode::StLocal, -1);
        b.emit_vbn(Opcode::LdLocal, 0);
        b.emit_vbn(Opcode::LdLocal, -1);
        b.emit_vbn(Opcode::CallG, concat);
        b.emit_vbn(Opcode::CallG, length);
        b.emit(Opcode::Ret);
    });

    a.bytes()
}

#[test]
fn every_safe_point_has_a_valid_region() {
    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&package_with_reference_traffic()).unwrap();
    let weave = vm.find_function(package, "weave", false).unwrap();

    let greeting = vm.new_string("world, ").unwrap();
    let result = vm
        .call_for_i64(weave, &Arguments::new().add_ref(&greeting))
        .unwrap();
    assert_eq!(result, "world, hello".len() as i64);

    // The map was built lazily on first entry.
    let map = vm.function(weave).stack_map().expect("map built");
    assert!(map.entry_count() >= 2, "two calls, two safe points");

    let (param_offset, param_count) = map.parameters_region();
    assert_eq!(param_offset, 0);
    assert_eq!(param_count, 1);
    assert!(map.bit(0), "the string parameter is a reference");

    // Probe every pc: recorded points return a region inside the bitmap,
    // everything else reports none.
    let instructions_len = vm.function(weave).instructions.len();
    let mut found = 0;
    for pc in 0..=instructions_len {
        if map.search_locals_region(pc).is_some() {
            let (offset, count) = map.locals_region(pc);
            assert!(offset + count <= map.bitmap_length());
            found += 1;
        }
    }
    assert_eq!(found, map.entry_count());
}

#[test]
fn reference_slots_are_marked_and_integers_are_not() {
    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&package_with_reference_traffic()).unwrap();
    let weave = vm.find_function(package, "weave", false).unwrap();

    let greeting = vm.new_string("x").unwrap();
    vm.call_for_i64(weave, &Arguments::new().add_ref(&greeting)).unwrap();
    let map = vm.function(weave).stack_map().unwrap();

    // At the concat call the frame holds: local -1 = String (reference),
    // plus two String operands. At the length call: local -1 = String and
    // one String operand. Every recorded slot in this function is a
    // reference except none — the integer result is produced after the
    // last safe point.
    for entry in 0..map.entry_count() {
        let pc = {
            // Reconstruct via search: entries are sorted by pc.
            let mut pcs = Vec::new();
            for probe in 0..=vm.function(weave).instructions.len() {
                if map.search_locals_region(probe) == Some(entry) {
                    pcs.push(probe);
                }
            }
            pcs[0]
        };
        let (offset, count) = map.locals_region(pc);
        for slot in 0..count {
            assert!(
                map.bit(offset + slot),
                "slot {slot} at pc {pc} should be a reference"
            );
        }
    }
}
