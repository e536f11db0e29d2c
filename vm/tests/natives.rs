//! The native bridge: host functions called from bytecode, argument and
//! return marshalling, and exceptions raised by the host landing in
//! bytecode handlers.

mod common;

use bytecode::Opcode;
use common::Assembler;
use vm::raw::RawType;
use vm::{builtin, Arguments, DefnFlags, VmError, VmOptions, VM};

extern "C" fn integer_params(_ctx: *mut VM, a: i64, b: i64) -> i64 {
    a + b
}

extern "C" fn float_params(_ctx: *mut VM, a: f64, b: f64) -> f64 {
    a * b
}

extern "C" fn boom(ctx: *mut VM) -> u64 {
    // SAFETY: ctx is the context pointer the bridge passed in.
    unsafe {
        let vm = &mut *ctx;
        let exception = vm
            .allocate_builtin_exception(builtin::EXCEPTION_CLASS)
            .expect("exception block");
        vm::native_throw(ctx, exception);
    }
    0
}

fn native_package() -> Vec<u8> {
    let mut a = Assembler::new("nat", [1, 0, 0]);
    let i64_ty = a.ty(RawType::I64);
    let f64_ty = a.ty(RawType::F64);
    let unit_ty = a.ty(RawType::Unit);
    let native = DefnFlags::PUBLIC | DefnFlags::STATIC | DefnFlags::NATIVE;

    // 0-2: the native declarations.
    a.add_bodyless_function("integerParams", native, i64_ty, &[i64_ty, i64_ty], vec![]);
    a.add_bodyless_function("floatParams", native, f64_ty, &[f64_ty, f64_ty], vec![]);
    a.add_bodyless_function("boom", native, unit_ty, &[], vec![]);

    // 3: calls integerParams(40, 2).
    a.add_function("call-integers", DefnFlags::PUBLIC, i64_ty, &[], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::I64, 40);
        b.emit_vbn(Opcode::I64, 2);
        b.emit_vbn(Opcode::CallG, 0);
        b.emit(Opcode::Ret);
    });

    // 4: calls floatParams(x, 3.0), truncating the result.
    a.add_function("call-floats", DefnFlags::PUBLIC, i64_ty, &[f64_ty], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::LdLocal, 0);
        b.f64_const(3.0);
        b.emit_vbn(Opcode::CallG, 1);
        b.emit(Opcode::FcvtI64);
        b.emit(Opcode::Ret);
    });

    // 5: catches the exception thrown through the bridge.
    a.add_function("catch-native", DefnFlags::PUBLIC, i64_ty, &[], 0, |b| {
        b.start_block();
        let try_block = b.declare_block();
        let catch_block = b.declare_block();
        let done = b.declare_block();
        b.push_try(try_block, catch_block);

        b.bind_block(try_block);
        b.emit_vbn(Opcode::CallG, 2);
        b.emit(Opcode::Drop);
        b.pop_try(done);

        b.bind_block(catch_block);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 7);
        b.emit(Opcode::Ret);

        b.bind_block(done);
        b.emit_vbn(Opcode::I64, 0);
        b.emit(Opcode::Ret);
    });

    // 6: lets the native exception escape uncaught.
    a.add_function("uncaught-native", DefnFlags::PUBLIC, i64_ty, &[], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::CallG, 2);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 0);
        b.emit(Opcode::Ret);
    });

    a.bytes()
}

fn vm_with_natives() -> (VM, u32) {
    let mut vm = VM::new(VmOptions::default());
    vm.register_native(
        "nat__integerParams",
        integer_params as extern "C" fn(*mut VM, i64, i64) -> i64 as usize,
    );
    vm.register_native(
        "nat__floatParams",
        float_params as extern "C" fn(*mut VM, f64, f64) -> f64 as usize,
    );
    vm.register_native("nat__boom", boom as extern "C" fn(*mut VM) -> u64 as usize);
    let package = vm.load_package_from_bytes(&native_package()).expect("load");
    (vm, package)
}

#[test]
fn integer_round_trip() {
    let (mut vm, package) = vm_with_natives();
    let f = vm.find_function(package, "call-integers", false).unwrap();
    assert_eq!(vm.call_for_i64(f, &Arguments::new()).unwrap(), 42);
}

#[test]
fn float_arguments_use_the_float_register_class() {
    let (mut vm, package) = vm_with_natives();
    let f = vm.find_function(package, "call-floats", false).unwrap();
    let result = vm.call_for_i64(f, &Arguments::new().add_f64(14.0)).unwrap();
    assert_eq!(result, 42);
}

#[test]
fn host_exception_lands_in_bytecode_handler() {
    let (mut vm, package) = vm_with_natives();
    let f = vm.find_function(package, "catch-native", false).unwrap();
    assert_eq!(vm.call_for_i64(f, &Arguments::new()).unwrap(), 7);
}

#[test]
fn host_exception_escapes_when_unhandled() {
    let (mut vm, package) = vm_with_natives();
    let f = vm.find_function(package, "uncaught-native", false).unwrap();
    match vm.call_for_i64(f, &Arguments::new()) {
        Err(VmError::UnhandledException { class_name, .. }) => {
            assert_eq!(class_name, "Exception");
        }
        other => panic!("expected unhandled exception, got {other:?}"),
    }
}

#[test]
fn unresolved_native_symbol_reports_a_link_error() {
    let mut vm = VM::new(VmOptions::default());
    // No registration for any symbol.
    let package = vm.load_package_from_bytes(&native_package()).expect("load");
    let f = vm.find_function(package, "call-integers", false).unwrap();
    match vm.call_for_i64(f, &Arguments::new()) {
        Err(VmError::NativeLink { symbol }) => assert_eq!(symbol, "nat__integerParams"),
        other => panic!("expected native link error, got {other:?}"),
    }
}
