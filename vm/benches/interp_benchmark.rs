use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytecode::{BytecodeBuilder, Opcode};
use vm::raw::{RawFunction, RawPackage, RawType};
use vm::{Arguments, DefnFlags, VmOptions, VM};

fn factorial_package() -> Vec<u8> {
    let mut builder = BytecodeBuilder::new();
    builder.start_block();
    let head = builder.declare_block();
    let body = builder.declare_block();
    let exit = builder.declare_block();

    builder.emit_vbn(Opcode::I64, 1);
    builder.emit_vbn(Opcode::StLocal, -1);
    builder.emit_vbn(Opcode::LdLocal, 0);
    builder.emit_vbn(Opcode::StLocal, -2);
    builder.branch(head);

    builder.bind_block(head);
    builder.emit_vbn(Opcode::LdLocal, -2);
    builder.emit_vbn(Opcode::I64, 0);
    builder.emit(Opcode::GtI64);
    builder.branch_if(body, exit);

    builder.bind_block(body);
    builder.emit_vbn(Opcode::LdLocal, -1);
    builder.emit_vbn(Opcode::LdLocal, -2);
    builder.emit(Opcode::MulI64);
    builder.emit_vbn(Opcode::StLocal, -1);
    builder.emit_vbn(Opcode::LdLocal, -2);
    builder.emit_vbn(Opcode::I64, 1);
    builder.emit(Opcode::SubI64);
    builder.emit_vbn(Opcode::StLocal, -2);
    builder.branch(head);

    builder.bind_block(exit);
    builder.emit_vbn(Opcode::LdLocal, -1);
    builder.emit(Opcode::Ret);
    let (instructions, block_offsets) = builder.finish();

    let raw = RawPackage {
        flags: 0,
        name: 0,
        version: [1, 0, 0],
        dependencies: vec![],
        strings: vec!["bench".into(), "factorial".into()],
        names: vec![vec![0], vec![1]],
        globals: vec![],
        functions: vec![RawFunction {
            flags: DefnFlags::PUBLIC.bits(),
            builtin_id: 0,
            name: 1,
            source_name: 1,
            type_params: vec![],
            types: vec![0, 0],
            locals_size: 16,
            instructions,
            block_offsets,
            overrides: vec![],
            inst_types: vec![],
        }],
        classes: vec![],
        type_params: vec![],
        types: vec![RawType::I64],
        entry_function: 0,
        init_function: -1,
        dependency_bodies: vec![],
    };
    vm::serialize_package(&raw)
}

fn bench_factorial(c: &mut Criterion) {
    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&factorial_package()).expect("load");
    let f = vm.find_function(package, "factorial", false).expect("find");

    c.bench_function("factorial_20", |b| {
        b.iter(|| {
            let result = vm
                .call_for_i64(f, &Arguments::new().add_i64(black_box(20)))
                .unwrap();
            black_box(result)
        })
    });
}

criterion_group!(benches, bench_factorial);
criterion_main!(benches);
