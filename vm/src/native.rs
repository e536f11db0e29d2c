//! The native call bridge. Host functions are resolved lazily by canonical
//! symbol name — the VM's registry first, then the process's global symbol
//! table — and invoked through libffi, which performs the platform ABI's
//! register classification (integer and float register classes, stack
//! spill). The VM context pointer is passed as a leading argument so hosts
//! can call back in or raise exceptions.

use std::ffi::CString;

use libffi::middle::{Arg, Cif, CodePtr, Type as FfiType};
use object::Tagged;

use crate::error::VmError;
use crate::function::Function;
use crate::id::DefnKey;
use crate::interp::Interpreter;
use crate::ty::Type;
use crate::VM;

#[cfg(target_family = "unix")]
extern "C" {
    fn dlsym(handle: *mut core::ffi::c_void, symbol: *const i8) -> *mut core::ffi::c_void;
}

/// Raise an exception from inside a host function. The bridge re-raises it
/// in the calling frame as soon as the native call returns; any value the
/// host returns afterwards is discarded.
///
/// # Safety
///
/// `ctx` must be the context pointer the bridge passed to the host
/// function, and `exception` a live exception block.
pub unsafe extern "C" fn native_throw(ctx: *mut VM, exception: u64) {
    (*ctx).pending_exception.set(exception);
}

/// Canonical host symbol for a native function: package components and
/// definition components joined by underscores, separated by a double
/// underscore.
pub fn symbol_name(vm: &VM, function: &Function) -> String {
    let package = vm.package(function.package);
    let mut symbol = String::new();
    for (i, component) in package.name.components().iter().enumerate() {
        if i > 0 {
            symbol.push('_');
        }
        symbol.push_str(component);
    }
    symbol.push_str("__");
    for (i, component) in function.source_name.components().iter().enumerate() {
        if i > 0 {
            symbol.push('_');
        }
        symbol.push_str(component);
    }
    symbol
}

fn resolve(vm: &VM, function: &Function) -> Result<usize, VmError> {
    let cached = function.native_code.get();
    if cached != 0 {
        return Ok(cached);
    }
    let symbol = symbol_name(vm, function);
    let address = match vm.natives.get(&symbol) {
        Some(&address) => address,
        None => lookup_process_symbol(&symbol).ok_or(VmError::NativeLink { symbol })?,
    };
    function.native_code.set(address);
    Ok(address)
}

#[cfg(target_family = "unix")]
fn lookup_process_symbol(symbol: &str) -> Option<usize> {
    let name = CString::new(symbol).ok()?;
    // SAFETY: dlsym with a null handle searches the global symbol table.
    let address = unsafe { dlsym(core::ptr::null_mut(), name.as_ptr()) };
    (!address.is_null()).then_some(address as usize)
}

#[cfg(not(target_family = "unix"))]
fn lookup_process_symbol(_symbol: &str) -> Option<usize> {
    None
}

fn ffi_type_for(ty: &Type) -> FfiType {
    match ty {
        Type::Unit => FfiType::u64(),
        Type::Boolean => FfiType::u8(),
        Type::I8 => FfiType::i8(),
        Type::I16 => FfiType::i16(),
        Type::I32 => FfiType::i32(),
        Type::I64 => FfiType::i64(),
        Type::F32 => FfiType::f32(),
        Type::F64 => FfiType::f64(),
        Type::Null | Type::Object(_) | Type::Variable(_) => FfiType::pointer(),
    }
}

/// One marshalled argument. Integer-class values and pointers go to the
/// integer registers, floats to the float registers; libffi spills the rest
/// to the stack in the ABI's order.
enum NativeArg {
    U8(u8),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ptr(usize),
}

impl NativeArg {
    fn from_slot(ty: &Type, word: u64) -> NativeArg {
        match ty {
            Type::Unit => NativeArg::I64(0),
            Type::Boolean => NativeArg::U8(word as u8),
            Type::I8 => NativeArg::I8(word as i8),
            Type::I16 => NativeArg::I16(word as i16),
            Type::I32 => NativeArg::I32(word as i32),
            Type::I64 => NativeArg::I64(word as i64),
            Type::F32 => NativeArg::F32(f32::from_bits(word as u32)),
            Type::F64 => NativeArg::F64(f64::from_bits(word)),
            Type::Null | Type::Object(_) | Type::Variable(_) => NativeArg::Ptr(word as usize),
        }
    }

    fn as_arg(&self) -> Arg {
        match self {
            NativeArg::U8(v) => Arg::new(v),
            NativeArg::I8(v) => Arg::new(v),
            NativeArg::I16(v) => Arg::new(v),
            NativeArg::I32(v) => Arg::new(v),
            NativeArg::I64(v) => Arg::new(v),
            NativeArg::F32(v) => Arg::new(v),
            NativeArg::F64(v) => Arg::new(v),
            NativeArg::Ptr(v) => Arg::new(v),
        }
    }
}

/// Call a native-flagged function from the interpreter. Arguments are
/// popped from the operand stack, reference arguments are pinned in a
/// handle scope for the duration of the call (the host may re-enter the VM
/// and trigger a collection), and a pending exception raised by the host is
/// re-thrown at the return pc.
pub(crate) fn call_native(interp: &mut Interpreter, key: DefnKey) -> Result<(), VmError> {
    let vm = interp.vm_mut();
    let code = {
        let function = vm.function(key);
        resolve(vm, function)?
    };

    let function = vm.function(key);
    let param_count = function.param_types.len();

    // The Cif is built once per function and cached.
    if function.native_cif.get().is_none() {
        let mut arg_types = Vec::with_capacity(param_count + 1);
        arg_types.push(FfiType::pointer()); // context
        for ty in function.param_types.iter() {
            arg_types.push(ffi_type_for(ty));
        }
        let cif = Cif::new(arg_types, ffi_type_for(&function.return_type));
        let _ = function.native_cif.set(cif);
    }

    // Pop arguments; the last parameter sits on top of the stack.
    let mut words = vec![0u64; param_count];
    for i in (0..param_count).rev() {
        words[i] = interp.stack_mut().pop();
    }

    let vm = interp.vm_mut();
    let scope = vm.handle_scope();
    for (word, ty) in words.iter().zip(vm.function(key).param_types.iter()) {
        if ty.is_object() && Tagged::from_raw(*word).is_block() {
            scope.pin_word::<u8>(*word);
        }
    }

    let ctx = interp.vm_ptr();
    let mut args: Vec<NativeArg> = vec![NativeArg::Ptr(ctx as usize)];
    for (word, ty) in words.iter().zip(vm.function(key).param_types.iter()) {
        args.push(NativeArg::from_slot(ty, *word));
    }
    let ffi_args: Vec<Arg> = args.iter().map(NativeArg::as_arg).collect();

    let function = vm.function(key);
    let cif = function.native_cif.get().expect("cif built above");
    let code = CodePtr(code as *mut core::ffi::c_void);
    let return_type = function.return_type.clone();

    tracing::trace!(function = %function.name, "native call");
    // SAFETY: the symbol was resolved for this function's signature; the
    // host honors the calling convention per the native contract.
    let result = unsafe {
        match &return_type {
            Type::Unit => {
                cif.call::<()>(code, &ffi_args);
                0u64
            }
            Type::Boolean => cif.call::<u8>(code, &ffi_args) as u64,
            Type::I8 => cif.call::<i8>(code, &ffi_args) as u8 as u64,
            Type::I16 => cif.call::<i16>(code, &ffi_args) as u16 as u64,
            Type::I32 => cif.call::<i32>(code, &ffi_args) as u32 as u64,
            Type::I64 => cif.call::<i64>(code, &ffi_args) as u64,
            Type::F32 => cif.call::<f32>(code, &ffi_args).to_bits() as u64,
            Type::F64 => cif.call::<f64>(code, &ffi_args).to_bits(),
            Type::Null | Type::Object(_) | Type::Variable(_) => {
                cif.call::<usize>(code, &ffi_args) as u64
            }
        }
    };
    drop(scope);

    let pending = vm.pending_exception.get();
    if pending != 0 {
        vm.pending_exception.set(0);
        return interp.raise_pending(pending);
    }

    interp.stack_mut().push(result);
    Ok(())
}
