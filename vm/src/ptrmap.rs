//! Builds a function's [`StackPointerMap`] by abstract interpretation: the
//! bytecode is walked block by block, tracking the type of every live stack
//! slot, and the frame state is snapshotted at every GC-safe point (each
//! allocation and call). All paths into a block must agree on the frame
//! state, a property the compiler guarantees, so the first visit of a block
//! wins.

use std::collections::HashSet;

use bytecode::{read_vbn, Opcode};

use crate::builtins;
use crate::error::VmError;
use crate::function::{Function, PmapEntry, StackPointerMap};
use crate::id::{builtin_index, is_builtin_id, DefnKey};
use crate::package::Package;
use crate::ty::{self, Type};
use crate::VM;

#[derive(Clone)]
struct FrameState {
    /// Types of the locals region followed by the operand stack.
    type_map: Vec<Type>,
    /// Type arguments pushed by TYS/TYD awaiting the next generic
    /// call or allocation.
    type_args: Vec<Type>,
    pc_offset: usize,
}

impl FrameState {
    fn new(locals_slots: usize) -> FrameState {
        FrameState {
            type_map: vec![Type::Unit; locals_slots],
            type_args: Vec::new(),
            pc_offset: 0,
        }
    }

    fn push(&mut self, ty: Type) {
        self.type_map.push(ty);
    }

    fn pop(&mut self) -> Result<Type, VmError> {
        self.type_map.pop().ok_or(VmError::Assertion("pointer map stack underflow"))
    }

    fn top(&self) -> Result<Type, VmError> {
        self.type_map
            .last()
            .cloned()
            .ok_or(VmError::Assertion("pointer map stack underflow"))
    }

    fn pop_type_arg(&mut self) -> Result<Type, VmError> {
        self.type_args
            .pop()
            .ok_or(VmError::Assertion("missing type argument"))
    }

    fn pop_type_args(&mut self, count: usize) -> Result<Vec<Type>, VmError> {
        if self.type_args.len() < count {
            return Err(VmError::Assertion("missing type argument"));
        }
        Ok(self.type_args.split_off(self.type_args.len() - count))
    }

    fn substitute_return_type(&mut self, callee: &Function) -> Result<Type, VmError> {
        if self.type_args.len() != callee.type_params.len() {
            return Err(VmError::Assertion("type argument count mismatch"));
        }
        let bindings: ty::Bindings = callee
            .type_params
            .iter()
            .copied()
            .zip(self.type_args.iter().cloned())
            .collect();
        Ok(ty::substitute(&callee.return_type, &bindings))
    }
}

pub fn build(vm: &VM, key: DefnKey) -> Result<StackPointerMap, VmError> {
    let function = vm.function(key);
    debug_assert!(!function.instructions.is_empty());
    let package = vm.package(function.package);

    let parameters_map: Vec<Type> = function.param_types.to_vec();

    let mut maps: Vec<FrameState> = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    let mut blocks_to_visit: Vec<FrameState> = Vec::new();
    blocks_to_visit.push(FrameState::new(function.locals_size as usize / 8));

    let bytecode = &function.instructions;

    while let Some(mut state) = blocks_to_visit.pop() {
        if !visited.insert(state.pc_offset) {
            continue;
        }
        let mut pc = state.pc_offset;

        let mut block_done = false;
        while !block_done {
            let opc = Opcode::try_from(*bytecode.get(pc).ok_or(bad_pc())?)
                .map_err(|_| VmError::Assertion("invalid opcode"))?;
            pc += 1;
            match opc {
                Opcode::Nop => {}

                Opcode::Ret => {
                    state.pop()?;
                    block_done = true;
                }

                Opcode::Branch => {
                    let block = operand(bytecode, &mut pc)?;
                    state.pc_offset = block_offset(function, block)?;
                    blocks_to_visit.push(state.clone());
                    block_done = true;
                }

                Opcode::BranchIf => {
                    state.pop()?;
                    let true_block = operand(bytecode, &mut pc)?;
                    let false_block = operand(bytecode, &mut pc)?;
                    state.pc_offset = block_offset(function, true_block)?;
                    blocks_to_visit.push(state.clone());
                    state.pc_offset = block_offset(function, false_block)?;
                    blocks_to_visit.push(state.clone());
                    block_done = true;
                }

                Opcode::Label => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::I64);
                }

                Opcode::BranchL => {
                    state.pop()?;
                    let count = operand(bytecode, &mut pc)?;
                    for _ in 0..count {
                        let block = operand(bytecode, &mut pc)?;
                        state.pc_offset = block_offset(function, block)?;
                        blocks_to_visit.push(state.clone());
                    }
                    block_done = true;
                }

                Opcode::PushTry => {
                    let try_block = operand(bytecode, &mut pc)?;
                    let catch_block = operand(bytecode, &mut pc)?;
                    state.pc_offset = block_offset(function, try_block)?;
                    blocks_to_visit.push(state.clone());
                    state.pc_offset = block_offset(function, catch_block)?;
                    state.push(Type::object(builtins::EXCEPTION_CLASS, vec![]));
                    // Unwinding can land here with live references on the
                    // trimmed stack, so the catch entry is a safe point too.
                    maps.push(state.clone());
                    blocks_to_visit.push(state.clone());
                    block_done = true;
                }

                Opcode::PopTry => {
                    let done_block = operand(bytecode, &mut pc)?;
                    state.pc_offset = block_offset(function, done_block)?;
                    blocks_to_visit.push(state.clone());
                    block_done = true;
                }

                Opcode::Throw => {
                    state.pop()?;
                    block_done = true;
                }

                Opcode::Drop => {
                    state.pop()?;
                }

                Opcode::DropI => {
                    let count = operand(bytecode, &mut pc)?;
                    for _ in 0..count {
                        state.pop()?;
                    }
                }

                Opcode::Dup => {
                    let top = state.top()?;
                    state.push(top);
                }

                Opcode::DupI => {
                    let slot = operand(bytecode, &mut pc)?;
                    let index = state
                        .type_map
                        .len()
                        .checked_sub(slot as usize + 1)
                        .ok_or_else(bad_slot)?;
                    let ty = state.type_map[index].clone();
                    state.push(ty);
                }

                Opcode::Swap => {
                    let len = state.type_map.len();
                    if len < 2 {
                        return Err(bad_slot());
                    }
                    state.type_map.swap(len - 1, len - 2);
                }

                Opcode::Swap2 => {
                    let len = state.type_map.len();
                    if len < 3 {
                        return Err(bad_slot());
                    }
                    state.type_map.swap(len - 1, len - 3);
                }

                Opcode::Unit => state.push(Type::Unit),
                Opcode::True | Opcode::False => state.push(Type::Boolean),
                Opcode::Nul | Opcode::Uninitialized => state.push(Type::Null),

                Opcode::I8 => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::I8);
                }
                Opcode::I16 => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::I16);
                }
                Opcode::I32 => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::I32);
                }
                Opcode::I64 => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::I64);
                }
                Opcode::F32 => {
                    pc += 4;
                    state.push(Type::F32);
                }
                Opcode::F64 => {
                    pc += 8;
                    state.push(Type::F64);
                }
                Opcode::String => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::object(builtins::STRING_CLASS, vec![]));
                }

                Opcode::LdLocal => {
                    let slot = operand(bytecode, &mut pc)?;
                    let ty = if slot >= 0 {
                        parameters_map
                            .get(slot as usize)
                            .cloned()
                            .ok_or_else(bad_slot)?
                    } else {
                        state
                            .type_map
                            .get((-slot - 1) as usize)
                            .cloned()
                            .ok_or_else(bad_slot)?
                    };
                    state.push(ty);
                }

                Opcode::StLocal => {
                    let slot = operand(bytecode, &mut pc)?;
                    let ty = state.pop()?;
                    if slot < 0 {
                        let index = (-slot - 1) as usize;
                        *state.type_map.get_mut(index).ok_or_else(bad_slot)? = ty;
                    }
                }

                Opcode::LdG => {
                    let index = operand(bytecode, &mut pc)?;
                    let global = package
                        .globals
                        .get(index as usize)
                        .ok_or(VmError::Assertion("global out of range"))?;
                    state.push(global.ty.clone());
                }

                Opcode::LdGF => {
                    let dep = operand(bytecode, &mut pc)?;
                    let ext = operand(bytecode, &mut pc)?;
                    let key = linked(package, dep, ext, |d| &*d.linked_globals)?;
                    state.push(vm.global(key).ty.clone());
                }

                Opcode::StG => {
                    operand(bytecode, &mut pc)?;
                    state.pop()?;
                }

                Opcode::StGF => {
                    operand(bytecode, &mut pc)?;
                    operand(bytecode, &mut pc)?;
                    state.pop()?;
                }

                Opcode::LdF | Opcode::LdFF => {
                    let field_class_key = if opc == Opcode::LdF {
                        let class_id = operand(bytecode, &mut pc)?;
                        class_by_id(vm, package, class_id)?
                    } else {
                        let dep = operand(bytecode, &mut pc)?;
                        let ext = operand(bytecode, &mut pc)?;
                        linked(package, dep, ext, |d| &*d.linked_classes)?
                    };
                    let name_index = operand(bytecode, &mut pc)?;
                    let name = package
                        .names
                        .get(name_index as usize)
                        .ok_or(VmError::Assertion("name out of range"))?;
                    let field_class = vm.class(field_class_key);
                    let (_, field) = field_class
                        .find_field(name)
                        .ok_or(VmError::Assertion("unknown field"))?;
                    let mut field_type = field.ty.clone();
                    let receiver_type = state.pop()?;
                    let receiver_class = receiver_type.effective_class(vm);
                    if field_type.is_object() {
                        field_type = ty::substitute_for_inheritance(
                            vm,
                            &field_type,
                            receiver_class,
                            field_class_key,
                        );
                        field_type =
                            ty::substitute(&field_type, &receiver_type.argument_bindings(vm));
                    }
                    state.push(field_type);
                }

                Opcode::StF => {
                    operand(bytecode, &mut pc)?;
                    operand(bytecode, &mut pc)?;
                    state.pop()?;
                    state.pop()?;
                }

                Opcode::StFF => {
                    operand(bytecode, &mut pc)?;
                    operand(bytecode, &mut pc)?;
                    operand(bytecode, &mut pc)?;
                    state.pop()?;
                    state.pop()?;
                }

                Opcode::LdE => {
                    let receiver_type = state.pop()?;
                    state.pop()?; // index
                    let class = vm.class(receiver_type.effective_class(vm));
                    let element_type = class
                        .element_type
                        .clone()
                        .ok_or(VmError::Assertion("element access on non-array class"))?;
                    state.push(element_type);
                }

                Opcode::StE => {
                    state.pop()?;
                    state.pop()?;
                    state.pop()?;
                }

                Opcode::AllocArr | Opcode::AllocObj => {
                    if opc == Opcode::AllocArr {
                        state.pop()?; // length
                    }
                    let class_id = operand(bytecode, &mut pc)?;
                    state.pc_offset = pc;
                    maps.push(state.clone());
                    let ty = if is_builtin_id(class_id) {
                        Type::object(DefnKey::builtin(builtin_index(class_id)), vec![])
                    } else {
                        let class_key = class_by_id(vm, package, class_id)?;
                        let count = vm.class(class_key).type_params.len();
                        let args = state.pop_type_args(count)?;
                        Type::object(class_key, args)
                    };
                    state.push(ty);
                }

                Opcode::AllocArrF | Opcode::AllocObjF => {
                    if opc == Opcode::AllocArrF {
                        state.pop()?;
                    }
                    let dep = operand(bytecode, &mut pc)?;
                    let ext = operand(bytecode, &mut pc)?;
                    state.pc_offset = pc;
                    maps.push(state.clone());
                    let class_key = linked(package, dep, ext, |d| &*d.linked_classes)?;
                    let count = vm.class(class_key).type_params.len();
                    let args = state.pop_type_args(count)?;
                    state.push(Type::object(class_key, args));
                }

                Opcode::Tys => {
                    let index = operand(bytecode, &mut pc)?;
                    let ty = function
                        .inst_types
                        .get(index as usize)
                        .cloned()
                        .ok_or(VmError::Assertion("instantiation type out of range"))?;
                    state.type_args.push(ty);
                }

                Opcode::Tyd => {
                    let index = operand(bytecode, &mut pc)?;
                    let ty = function
                        .inst_types
                        .get(index as usize)
                        .cloned()
                        .ok_or(VmError::Assertion("instantiation type out of range"))?;
                    state.type_args.push(ty);
                    state.push(Type::object(builtins::TYPE_CLASS, vec![]));
                }

                Opcode::Cast => {
                    let ty = state.pop_type_arg()?;
                    state.pop()?;
                    state.push(ty);
                }

                Opcode::CastC => {
                    let ty = state.pop_type_arg()?;
                    state.pop()?;
                    state.pop()?;
                    state.push(ty);
                }

                Opcode::CastCBr => {
                    let true_block = operand(bytecode, &mut pc)?;
                    let false_block = operand(bytecode, &mut pc)?;
                    let ty = state.pop_type_arg()?;
                    state.pop()?;
                    state.pc_offset = block_offset(function, false_block)?;
                    blocks_to_visit.push(state.clone());
                    state.pc_offset = block_offset(function, true_block)?;
                    state.pop()?;
                    state.push(ty);
                    blocks_to_visit.push(state.clone());
                    block_done = true;
                }

                Opcode::CallG | Opcode::CallV => {
                    let function_id = operand(bytecode, &mut pc)?;
                    state.pc_offset = pc;
                    maps.push(state.clone());
                    let callee_key = if is_builtin_id(function_id) {
                        DefnKey::builtin(builtin_index(function_id))
                    } else {
                        function_by_id(package, function_id)?
                    };
                    let callee = vm.function(callee_key);
                    for _ in 0..callee.param_types.len() {
                        state.pop()?;
                    }
                    let return_type = state.substitute_return_type(callee)?;
                    state.type_args.clear();
                    state.push(return_type);
                }

                Opcode::CallGF | Opcode::CallVF => {
                    let dep = operand(bytecode, &mut pc)?;
                    let ext = operand(bytecode, &mut pc)?;
                    state.pc_offset = pc;
                    maps.push(state.clone());
                    let callee_key = linked(package, dep, ext, |d| &*d.linked_functions)?;
                    let callee = vm.function(callee_key);
                    for _ in 0..callee.param_types.len() {
                        state.pop()?;
                    }
                    let return_type = state.substitute_return_type(callee)?;
                    state.type_args.clear();
                    state.push(return_type);
                }

                Opcode::Pkg => {
                    operand(bytecode, &mut pc)?;
                    state.push(Type::object(builtins::PACKAGE_CLASS, vec![]));
                }

                // Binary integer arithmetic: pop two, push the result width.
                Opcode::AddI8 | Opcode::SubI8 | Opcode::MulI8 | Opcode::DivI8
                | Opcode::ModI8 | Opcode::LslI8 | Opcode::LsrI8 | Opcode::AsrI8
                | Opcode::AndI8 | Opcode::OrI8 | Opcode::XorI8 => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::I8);
                }
                Opcode::AddI16 | Opcode::SubI16 | Opcode::MulI16 | Opcode::DivI16
                | Opcode::ModI16 | Opcode::LslI16 | Opcode::LsrI16 | Opcode::AsrI16
                | Opcode::AndI16 | Opcode::OrI16 | Opcode::XorI16 => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::I16);
                }
                Opcode::AddI32 | Opcode::SubI32 | Opcode::MulI32 | Opcode::DivI32
                | Opcode::ModI32 | Opcode::LslI32 | Opcode::LsrI32 | Opcode::AsrI32
                | Opcode::AndI32 | Opcode::OrI32 | Opcode::XorI32 => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::I32);
                }
                Opcode::AddI64 | Opcode::SubI64 | Opcode::MulI64 | Opcode::DivI64
                | Opcode::ModI64 | Opcode::LslI64 | Opcode::LsrI64 | Opcode::AsrI64
                | Opcode::AndI64 | Opcode::OrI64 | Opcode::XorI64 => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::I64);
                }

                Opcode::AddF32 | Opcode::SubF32 | Opcode::MulF32 | Opcode::DivF32 => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::F32);
                }
                Opcode::AddF64 | Opcode::SubF64 | Opcode::MulF64 | Opcode::DivF64 => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::F64);
                }

                Opcode::EqI8 | Opcode::NeI8 | Opcode::LtI8 | Opcode::LeI8
                | Opcode::GtI8 | Opcode::GeI8 | Opcode::EqI16 | Opcode::NeI16
                | Opcode::LtI16 | Opcode::LeI16 | Opcode::GtI16 | Opcode::GeI16
                | Opcode::EqI32 | Opcode::NeI32 | Opcode::LtI32 | Opcode::LeI32
                | Opcode::GtI32 | Opcode::GeI32 | Opcode::EqI64 | Opcode::NeI64
                | Opcode::LtI64 | Opcode::LeI64 | Opcode::GtI64 | Opcode::GeI64
                | Opcode::EqF32 | Opcode::NeF32 | Opcode::LtF32 | Opcode::LeF32
                | Opcode::GtF32 | Opcode::GeF32 | Opcode::EqF64 | Opcode::NeF64
                | Opcode::LtF64 | Opcode::LeF64 | Opcode::GtF64 | Opcode::GeF64
                | Opcode::EqP | Opcode::NeP => {
                    state.pop()?;
                    state.pop()?;
                    state.push(Type::Boolean);
                }

                Opcode::NegI8 | Opcode::InvI8 => {
                    state.pop()?;
                    state.push(Type::I8);
                }
                Opcode::NegI16 | Opcode::InvI16 => {
                    state.pop()?;
                    state.push(Type::I16);
                }
                Opcode::NegI32 | Opcode::InvI32 => {
                    state.pop()?;
                    state.push(Type::I32);
                }
                Opcode::NegI64 | Opcode::InvI64 => {
                    state.pop()?;
                    state.push(Type::I64);
                }
                Opcode::NegF32 => {
                    state.pop()?;
                    state.push(Type::F32);
                }
                Opcode::NegF64 => {
                    state.pop()?;
                    state.push(Type::F64);
                }
                Opcode::NotB => {
                    state.pop()?;
                    state.push(Type::Boolean);
                }

                Opcode::TruncI8 => {
                    state.pop()?;
                    state.push(Type::I8);
                }
                Opcode::TruncI16 | Opcode::SextI16_8 | Opcode::ZextI16 => {
                    state.pop()?;
                    state.push(Type::I16);
                }
                Opcode::TruncI32 | Opcode::SextI32_8 | Opcode::SextI32_16
                | Opcode::ZextI32 | Opcode::FcvtI32 | Opcode::FtoI32 => {
                    state.pop()?;
                    state.push(Type::I32);
                }
                Opcode::SextI64_8 | Opcode::SextI64_16 | Opcode::SextI64_32
                | Opcode::ZextI64 | Opcode::FcvtI64 | Opcode::FtoI64 => {
                    state.pop()?;
                    state.push(Type::I64);
                }
                Opcode::TruncF32 | Opcode::IcvtF32 | Opcode::ItoF32 => {
                    state.pop()?;
                    state.push(Type::F32);
                }
                Opcode::ExtF64 | Opcode::IcvtF64 | Opcode::ItoF64 => {
                    state.pop()?;
                    state.push(Type::F64);
                }
            }
        }
    }

    // Sort the snapshots and pack them after the parameter region.
    maps.sort_by_key(|state| state.pc_offset);

    let mut bitmap_bits = parameters_map.len();
    for state in &maps {
        bitmap_bits += state.type_map.len();
    }

    let mut bitmap = vec![0u64; bitmap_bits.div_ceil(64)];
    let mut set_bit = |index: usize, value: bool| {
        if value {
            bitmap[index / 64] |= 1 << (index % 64);
        }
    };

    let mut entries = Vec::with_capacity(maps.len());
    let mut bit = 0;
    for ty in &parameters_map {
        set_bit(bit, ty.is_object());
        bit += 1;
    }
    for state in &maps {
        entries.push(PmapEntry {
            pc_offset: state.pc_offset as u32,
            map_offset: bit as u32,
            map_count: state.type_map.len() as u32,
        });
        for ty in &state.type_map {
            set_bit(bit, ty.is_object());
            bit += 1;
        }
    }

    Ok(StackPointerMap::new(
        bitmap.into_boxed_slice(),
        bitmap_bits as u32,
        parameters_map.len() as u32,
        entries.into_boxed_slice(),
    ))
}

fn operand(bytecode: &[u8], pc: &mut usize) -> Result<i64, VmError> {
    read_vbn(bytecode, pc).ok_or_else(bad_pc)
}

fn bad_pc() -> VmError {
    VmError::Assertion("bytecode ends inside an instruction")
}

fn bad_slot() -> VmError {
    VmError::Assertion("stack slot out of range")
}

fn block_offset(function: &Function, block: i64) -> Result<usize, VmError> {
    function
        .block_offsets
        .get(block as usize)
        .map(|&offset| offset as usize)
        .ok_or(VmError::Assertion("block index out of range"))
}

fn class_by_id(vm: &VM, package: &Package, id: i64) -> Result<DefnKey, VmError> {
    if is_builtin_id(id) {
        let index = builtin_index(id);
        if (index as usize) < vm.builtin_class_count() {
            return Ok(DefnKey::builtin(index));
        }
        return Err(VmError::Assertion("builtin class out of range"));
    }
    if (id as usize) < package.classes.len() {
        Ok(DefnKey::new(package.id, id as u32))
    } else {
        Err(VmError::Assertion("class out of range"))
    }
}

fn function_by_id(package: &Package, id: i64) -> Result<DefnKey, VmError> {
    if id >= 0 && (id as usize) < package.functions.len() {
        Ok(DefnKey::new(package.id, id as u32))
    } else {
        Err(VmError::Assertion("function out of range"))
    }
}

fn linked(
    package: &Package,
    dep: i64,
    ext: i64,
    table: impl Fn(&crate::package::PackageDependency) -> &[DefnKey],
) -> Result<DefnKey, VmError> {
    let dependency = package
        .dependencies
        .get(dep as usize)
        .ok_or(VmError::Assertion("dependency out of range"))?;
    table(dependency)
        .get(ext as usize)
        .copied()
        .ok_or(VmError::Assertion("extern reference out of range"))
}
