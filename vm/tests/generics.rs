//! Generics and runtime casts: type-argument plumbing through TYS/TYD,
//! instantiated allocation (local and cross-package), field types rewritten
//! by type-argument substitution, the CAST/CASTC/CASTCBR family, and
//! invariant type-argument subtyping.

mod common;

use bytecode::Opcode;
use common::{Assembler, PackageDir};
use vm::raw::{RawDefnRef, RawDependencyBody, RawType, RawTypeParameter, LOCAL_REF};
use vm::{is_subtype, substitute, Arguments, DefnFlags, DefnKey, Type, VmOptions, VM};

// Class table layout of the "boxes" package.
const ANIMAL: u32 = 0;
const DOG: u32 = 1;
const CAT: u32 = 2;
const BOX: u32 = 3;

/// A package with a small class hierarchy and a generic single-field
/// container `Box[T]`.
fn boxes_package() -> Vec<u8> {
    let mut a = Assembler::new("boxes", [1, 0, 0]);
    let i64_ty = a.ty(RawType::I64);
    let bool_ty = a.ty(RawType::Boolean);
    let object_ty = a.ty_builtin_class(0);
    let nothing_ty = a.ty_builtin_class(1);
    let animal_ty = a.ty_local_class(ANIMAL);
    let dog_ty = a.ty_local_class(DOG);
    let tvar_ty = a.ty(RawType::Variable {
        param: RawDefnRef { package: LOCAL_REF, index: 0 },
        nullable: false,
    });
    let box_dog_ty = a.ty(RawType::Class {
        class: RawDefnRef { package: LOCAL_REF, index: BOX as i64 },
        nullable: false,
        args: vec![dog_ty],
    });
    let value_name = a.name("value") as i64;

    let t_name = a.name("T");
    a.raw.type_params.push(RawTypeParameter {
        name: t_name,
        flags: DefnFlags::PUBLIC.bits(),
        upper_bound: object_ty,
        lower_bound: nothing_ty,
    });

    let public = DefnFlags::PUBLIC;

    // 0/1: animal factories.
    a.add_function("new-dog", public, animal_ty, &[], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::AllocObj, DOG as i64);
        b.emit(Opcode::Ret);
    });
    a.add_function("new-cat", public, animal_ty, &[], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::AllocObj, CAT as i64);
        b.emit(Opcode::Ret);
    });

    // 2: make-dog-box() = Box[Dog] with a fresh Dog stored in it.
    let make_dog_box = a.add_function("make-dog-box", public, box_dog_ty, &[], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::Tys, 0);
        b.emit_vbn(Opcode::AllocObj, BOX as i64);
        b.emit(Opcode::Dup);
        b.emit_vbn(Opcode::AllocObj, DOG as i64);
        b.emit(Opcode::Swap);
        b.emit_vbn2(Opcode::StF, BOX as i64, value_name);
        b.emit(Opcode::Ret);
    });

    // 3: boxed-is-set(b: Box[Dog]) = b.value != null. The loaded field's
    // type is Variable(T) rewritten to Dog by the receiver's bindings.
    a.add_function("boxed-is-set", public, bool_ty, &[box_dog_ty], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::LdLocal, 0);
        b.emit_vbn2(Opcode::LdF, BOX as i64, value_name);
        b.emit(Opcode::Nul);
        b.emit(Opcode::NeP);
        b.emit(Opcode::Ret);
    });

    // 4: try-cast-dog(x: Object) = 1 if the cast succeeds, 0 if it throws.
    let try_cast_dog = a.add_function("try-cast-dog", public, i64_ty, &[object_ty], 0, |b| {
        b.start_block();
        let try_block = b.declare_block();
        let catch_block = b.declare_block();
        let done = b.declare_block();
        b.push_try(try_block, catch_block);

        b.bind_block(try_block);
        b.emit_vbn(Opcode::LdLocal, 0);
        b.emit_vbn(Opcode::Tys, 0);
        b.emit(Opcode::Cast);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 1);
        b.pop_try(done);

        b.bind_block(catch_block);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 0);
        b.emit(Opcode::Ret);

        b.bind_block(done);
        b.emit(Opcode::Ret);
    });

    // 5: cast-null() — null fails a cast to a non-nullable target.
    let cast_null = a.add_function("cast-null", public, i64_ty, &[], 0, |b| {
        b.start_block();
        let try_block = b.declare_block();
        let catch_block = b.declare_block();
        let done = b.declare_block();
        b.push_try(try_block, catch_block);

        b.bind_block(try_block);
        b.emit(Opcode::Nul);
        b.emit_vbn(Opcode::Tys, 0);
        b.emit(Opcode::Cast);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 1);
        b.pop_try(done);

        b.bind_block(catch_block);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 0);
        b.emit(Opcode::Ret);

        b.bind_block(done);
        b.emit(Opcode::Ret);
    });

    // 6: match-dog(x: Object) — CASTCBR branches instead of throwing.
    let match_dog = a.add_function("match-dog", public, i64_ty, &[object_ty], 0, |b| {
        b.start_block();
        let yes = b.declare_block();
        let no = b.declare_block();
        b.emit_vbn(Opcode::LdLocal, 0);
        b.emit_vbn(Opcode::Tyd, 0);
        b.emit_vbn2(Opcode::CastCBr, yes.0 as i64, no.0 as i64);

        b.bind_block(yes);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 1);
        b.emit(Opcode::Ret);

        b.bind_block(no);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 0);
        b.emit(Opcode::Ret);
    });

    // 7: checked-cast-dog(x: Object) — CASTC consumes the Type value and
    // throws on mismatch.
    let checked_cast_dog =
        a.add_function("checked-cast-dog", public, i64_ty, &[object_ty], 0, |b| {
            b.start_block();
            let try_block = b.declare_block();
            let catch_block = b.declare_block();
            let done = b.declare_block();
            b.push_try(try_block, catch_block);

            b.bind_block(try_block);
            b.emit_vbn(Opcode::LdLocal, 0);
            b.emit_vbn(Opcode::Tyd, 0);
            b.emit(Opcode::CastC);
            b.emit(Opcode::Drop);
            b.emit_vbn(Opcode::I64, 1);
            b.pop_try(done);

            b.bind_block(catch_block);
            b.emit(Opcode::Drop);
            b.emit_vbn(Opcode::I64, 0);
            b.emit(Opcode::Ret);

            b.bind_block(done);
            b.emit(Opcode::Ret);
        });

    for index in [make_dog_box, try_cast_dog, cast_null, match_dog, checked_cast_dog] {
        a.raw.functions[index as usize].inst_types = vec![dog_ty];
    }

    // Classes: Animal / Dog / Cat plus the generic container.
    a.add_class("Animal", public, Some(object_ty), &[], vec![], vec![], None);
    a.add_class("Dog", public, Some(animal_ty), &[], vec![], vec![], None);
    a.add_class("Cat", public, Some(animal_ty), &[], vec![], vec![], None);
    let box_class = a.add_class(
        "Box",
        public,
        Some(object_ty),
        &[("value", public, tvar_ty)],
        vec![],
        vec![],
        None,
    );
    a.raw.classes[box_class as usize].type_params = vec![0];

    a.bytes()
}

#[test]
fn generic_allocation_substitutes_field_types() {
    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&boxes_package()).expect("load");

    let make = vm.find_function(package, "make-dog-box", false).unwrap();
    let is_set = vm.find_function(package, "boxed-is-set", false).unwrap();

    let dog_box = vm.call_for_ref(make, &Arguments::new()).expect("make box");
    let set = vm
        .call_for_boolean(is_set, &Arguments::new().add_ref(&dog_box))
        .expect("read box");
    assert!(set, "the box's value field must hold the stored Dog");
}

#[test]
fn casts_follow_the_runtime_class() {
    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&boxes_package()).expect("load");

    let new_dog = vm.find_function(package, "new-dog", false).unwrap();
    let new_cat = vm.find_function(package, "new-cat", false).unwrap();
    let dog = vm.call_for_ref(new_dog, &Arguments::new()).unwrap();
    let cat = vm.call_for_ref(new_cat, &Arguments::new()).unwrap();

    for name in ["try-cast-dog", "match-dog", "checked-cast-dog"] {
        let f = vm.find_function(package, name, false).unwrap();
        assert_eq!(
            vm.call_for_i64(f, &Arguments::new().add_ref(&dog)).unwrap(),
            1,
            "{name} must accept a Dog"
        );
        assert_eq!(
            vm.call_for_i64(f, &Arguments::new().add_ref(&cat)).unwrap(),
            0,
            "{name} must reject a Cat"
        );
    }

    let cast_null = vm.find_function(package, "cast-null", false).unwrap();
    assert_eq!(vm.call_for_i64(cast_null, &Arguments::new()).unwrap(), 0);
}

#[test]
fn type_argument_subtyping_is_invariant() {
    let mut vm = VM::new(VmOptions::default());
    let package = vm.load_package_from_bytes(&boxes_package()).expect("load");

    let animal = vm.find_class(package, "Animal", false).unwrap();
    let dog = vm.find_class(package, "Dog", false).unwrap();
    let cat = vm.find_class(package, "Cat", false).unwrap();
    let box_class = vm.find_class(package, "Box", false).unwrap();

    let animal_t = Type::object(animal, vec![]);
    let dog_t = Type::object(dog, vec![]);
    let cat_t = Type::object(cat, vec![]);
    let box_dog = Type::object(box_class, vec![dog_t.clone()]);
    let box_animal = Type::object(box_class, vec![animal_t.clone()]);
    let object_t = Type::object(vm::builtin::OBJECT_CLASS, vec![]);

    // Class subtyping follows the supertype chain.
    assert!(is_subtype(&vm, &dog_t, &animal_t));
    assert!(!is_subtype(&vm, &animal_t, &dog_t));
    assert!(!is_subtype(&vm, &cat_t, &dog_t));
    assert!(is_subtype(&vm, &box_dog, &object_t));

    // Type arguments compare invariantly: Box[Dog] and Box[Animal] are
    // unrelated even though Dog <: Animal.
    assert!(is_subtype(&vm, &box_dog, &box_dog));
    assert!(!is_subtype(&vm, &box_dog, &box_animal));
    assert!(!is_subtype(&vm, &box_animal, &box_dog));

    // Substitution rewrites parameter occurrences, including nested ones.
    let param = DefnKey::new(package, 0);
    let bindings = vec![(param, dog_t.clone())];
    assert_eq!(substitute(&Type::variable(param, false), &bindings), dog_t);
    let box_t = Type::object(box_class, vec![Type::variable(param, false)]);
    assert_eq!(substitute(&box_t, &bindings), box_dog);
}

#[test]
fn cross_package_generic_allocation() {
    // Package "user" imports the generic Box and Dog from "boxes" and
    // instantiates them through the *F opcode forms.
    let mut a = Assembler::new("user", [1, 0, 0]);
    let i64_ty = a.ty(RawType::I64);

    let box_extern = a.extern_class("Box");
    let dog_extern = a.extern_class("Dog");
    let dep = a.add_dependency(
        "boxes",
        RawDependencyBody {
            globals: vec![],
            functions: vec![],
            classes: vec![box_extern, dog_extern],
            type_params: vec![],
        },
    );
    let dog_ext_ty = a.ty(RawType::Class {
        class: RawDefnRef { package: dep as i64, index: 1 },
        nullable: false,
        args: vec![],
    });
    let value_name = a.name("value") as i64;

    // entry: box = Box[Dog](Dog()); box.value as Dog; 1
    let entry = a.add_function("make-and-check", DefnFlags::PUBLIC, i64_ty, &[], 0, |b| {
        b.start_block();
        b.emit_vbn(Opcode::Tys, 0);
        b.emit_vbn2(Opcode::AllocObjF, dep as i64, 0);
        b.emit(Opcode::Dup);
        b.emit_vbn2(Opcode::AllocObjF, dep as i64, 1);
        b.emit(Opcode::Swap);
        b.emit_vbn3(Opcode::StFF, dep as i64, 0, value_name);
        b.emit_vbn3(Opcode::LdFF, dep as i64, 0, value_name);
        b.emit_vbn(Opcode::Tys, 0);
        b.emit(Opcode::Cast);
        b.emit(Opcode::Drop);
        b.emit_vbn(Opcode::I64, 1);
        b.emit(Opcode::Ret);
    });
    a.raw.functions[entry as usize].inst_types = vec![dog_ext_ty];
    a.set_entry(entry);

    let dir = PackageDir::new("generics");
    dir.write("boxes", &boxes_package());
    dir.write("user", &a.bytes());

    let mut vm = VM::new(VmOptions { search_paths: vec![dir.path.clone()], ..Default::default() });
    let user = vm.load_package("user").expect("load user");
    assert!(vm.find_package_by_name("boxes").is_some());
    assert_eq!(vm.call_entry(user).unwrap(), 1);
}
