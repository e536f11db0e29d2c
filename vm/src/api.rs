//! The host-facing API: package loading and lookup, function invocation,
//! global access and table helpers. Hosts hold references to heap values
//! through [`Persistent`] handles; raw block words handed across this
//! boundary are only valid until the next allocation.

use std::path::Path;

use object::{StrBlock, Tagged};

use crate::builtins;
use crate::error::VmError;
use crate::handles::Persistent;
use crate::id::{DefnFlags, DefnKey};
use crate::loader;
use crate::name::Name;
use crate::table;
use crate::ty::Type;
use crate::VM;

/// Arguments for a host-initiated call.
#[derive(Debug, Default)]
pub struct Arguments {
    values: Vec<ArgValue>,
}

#[derive(Debug, Clone, Copy)]
enum ArgValue {
    I64(i64),
    F64(f64),
    F32(f32),
    Boolean(bool),
    Unit,
    Ref(u64),
}

impl Arguments {
    pub fn new() -> Arguments {
        Arguments::default()
    }

    pub fn add_i64(mut self, value: i64) -> Arguments {
        self.values.push(ArgValue::I64(value));
        self
    }

    pub fn add_f64(mut self, value: f64) -> Arguments {
        self.values.push(ArgValue::F64(value));
        self
    }

    pub fn add_f32(mut self, value: f32) -> Arguments {
        self.values.push(ArgValue::F32(value));
        self
    }

    pub fn add_boolean(mut self, value: bool) -> Arguments {
        self.values.push(ArgValue::Boolean(value));
        self
    }

    pub fn add_unit(mut self) -> Arguments {
        self.values.push(ArgValue::Unit);
        self
    }

    pub fn add_ref(mut self, handle: &Persistent) -> Arguments {
        self.values.push(ArgValue::Ref(handle.word()));
        self
    }

    fn to_words(&self, param_types: &[Type]) -> Result<Vec<u64>, VmError> {
        if self.values.len() != param_types.len() {
            return Err(VmError::BadCall("argument count mismatch"));
        }
        let mut words = Vec::with_capacity(self.values.len());
        for (value, ty) in self.values.iter().zip(param_types) {
            let word = match (value, ty) {
                (ArgValue::I64(v), Type::I8 | Type::I16 | Type::I32 | Type::I64) => *v as u64,
                (ArgValue::F64(v), Type::F64) => v.to_bits(),
                (ArgValue::F32(v), Type::F32) => v.to_bits() as u64,
                (ArgValue::Boolean(v), Type::Boolean) => *v as u64,
                (ArgValue::Unit, Type::Unit) => 0,
                (ArgValue::Ref(v), ty) if ty.is_object() => *v,
                _ => return Err(VmError::BadCall("argument type mismatch")),
            };
            words.push(word);
        }
        Ok(words)
    }
}

impl VM {
    // ── Loading ────────────────────────────────────────────────────

    /// Load a package by dotted name, searching the configured paths.
    /// Dependencies are pulled in recursively.
    pub fn load_package(&mut self, name: &str) -> Result<u32, VmError> {
        let name = Name::from_source_string(name)
            .ok_or(VmError::BadCall("invalid package name"))?;
        loader::load_package_by_name(self, &name)
    }

    pub fn load_package_file(&mut self, path: &Path) -> Result<u32, VmError> {
        loader::load_package_file(self, path)
    }

    pub fn load_package_from_bytes(&mut self, bytes: &[u8]) -> Result<u32, VmError> {
        loader::load_package_bytes(self, bytes)
    }

    pub fn find_package_by_name(&self, name: &str) -> Option<u32> {
        let name = Name::from_source_string(name)?;
        self.find_package(&name)
    }

    // ── Symbol lookup ──────────────────────────────────────────────

    /// Find a function by source name (public symbols only) or defn name
    /// (all symbols).
    pub fn find_function(&self, package: u32, name: &str, defn_form: bool) -> Option<DefnKey> {
        let name = parse_name(name, defn_form)?;
        let index = self.package(package).find_function(&name, defn_form)?;
        Some(DefnKey::new(package, index))
    }

    pub fn find_global(&self, package: u32, name: &str, defn_form: bool) -> Option<DefnKey> {
        let name = parse_name(name, defn_form)?;
        let index = self.package(package).find_global(&name, defn_form)?;
        Some(DefnKey::new(package, index))
    }

    pub fn find_class(&self, package: u32, name: &str, defn_form: bool) -> Option<DefnKey> {
        let name = parse_name(name, defn_form)?;
        let index = self.package(package).find_class(&name, defn_form)?;
        Some(DefnKey::new(package, index))
    }

    pub fn entry_function(&self, package: u32) -> Option<DefnKey> {
        self.package(package)
            .entry_function
            .map(|index| DefnKey::new(package, index))
    }

    // ── Invocation ─────────────────────────────────────────────────

    pub fn call_for_i64(&mut self, function: DefnKey, args: &Arguments) -> Result<i64, VmError> {
        let (words, return_type) = self.check_call(function, args)?;
        if !matches!(return_type, Type::I8 | Type::I16 | Type::I32 | Type::I64) {
            return Err(VmError::BadCall("function does not return an integer"));
        }
        let raw = crate::interp::call_function(self, function, &words)?;
        Ok(match return_type {
            Type::I8 => raw as i8 as i64,
            Type::I16 => raw as i16 as i64,
            Type::I32 => raw as i32 as i64,
            _ => raw as i64,
        })
    }

    pub fn call_for_f64(&mut self, function: DefnKey, args: &Arguments) -> Result<f64, VmError> {
        let (words, return_type) = self.check_call(function, args)?;
        if return_type != Type::F64 {
            return Err(VmError::BadCall("function does not return f64"));
        }
        let raw = crate::interp::call_function(self, function, &words)?;
        Ok(f64::from_bits(raw))
    }

    pub fn call_for_boolean(
        &mut self,
        function: DefnKey,
        args: &Arguments,
    ) -> Result<bool, VmError> {
        let (words, return_type) = self.check_call(function, args)?;
        if return_type != Type::Boolean {
            return Err(VmError::BadCall("function does not return boolean"));
        }
        let raw = crate::interp::call_function(self, function, &words)?;
        Ok(raw != 0)
    }

    pub fn call_for_unit(&mut self, function: DefnKey, args: &Arguments) -> Result<(), VmError> {
        let (words, _) = self.check_call(function, args)?;
        crate::interp::call_function(self, function, &words)?;
        Ok(())
    }

    /// Invoke a reference-returning function; the result is rooted
    /// persistently before any further allocation can move it.
    pub fn call_for_ref(&mut self, function: DefnKey, args: &Arguments) -> Result<Persistent, VmError> {
        let (words, return_type) = self.check_call(function, args)?;
        if !return_type.is_object() {
            return Err(VmError::BadCall("function does not return a reference"));
        }
        let raw = crate::interp::call_function(self, function, &words)?;
        Ok(self.persistent(raw))
    }

    /// Invoke a package's entry function with no arguments.
    pub fn call_entry(&mut self, package: u32) -> Result<i64, VmError> {
        let entry = self
            .entry_function(package)
            .ok_or(VmError::BadCall("package has no entry function"))?;
        self.call_for_i64(entry, &Arguments::new())
    }

    fn check_call(
        &self,
        function: DefnKey,
        args: &Arguments,
    ) -> Result<(Vec<u64>, Type), VmError> {
        let callee = self.function(function);
        let words = args.to_words(&callee.param_types)?;
        Ok((words, callee.return_type.clone()))
    }

    // ── Globals ────────────────────────────────────────────────────

    /// Raw value of an integer-typed global.
    pub fn global_value(&self, key: DefnKey) -> Result<i64, VmError> {
        let global = self.global(key);
        if !global.is_initialized() {
            return Err(VmError::BadCall("global is uninitialized"));
        }
        Ok(match global.ty {
            Type::I8 => global.raw_value() as i8 as i64,
            Type::I16 => global.raw_value() as i16 as i64,
            Type::I32 => global.raw_value() as i32 as i64,
            Type::I64 | Type::Boolean => global.raw_value() as i64,
            _ => return Err(VmError::BadCall("global is not integer-typed")),
        })
    }

    pub fn set_global_value(&mut self, key: DefnKey, value: i64) -> Result<(), VmError> {
        let global = self.global(key);
        if !matches!(global.ty, Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Boolean) {
            return Err(VmError::BadCall("global is not integer-typed"));
        }
        if global.is_constant() {
            return Err(VmError::BadCall("global is constant"));
        }
        global.set_raw_value(value as u64);
        Ok(())
    }

    pub fn global_is_constant(&self, key: DefnKey) -> bool {
        self.global(key).flags.contains(DefnFlags::CONST)
    }

    // ── Heap values ────────────────────────────────────────────────

    /// Allocate a string and root it persistently.
    pub fn new_string(&mut self, text: &str) -> Result<Persistent, VmError> {
        let block = self.allocate_string(text.as_bytes())?;
        Ok(self.persistent(block))
    }

    /// Read a rooted string's content.
    pub fn string_content(&self, handle: &Persistent) -> String {
        // SAFETY: the handle roots a live string block.
        unsafe { StrBlock::str(handle.word() as *const u8).to_string() }
    }

    /// Allocate a table (string-keyed map) and root it persistently.
    pub fn new_table(&mut self) -> Result<Persistent, VmError> {
        let table = table::table_new(self)?;
        Ok(self.persistent(table))
    }

    pub fn table_insert(
        &mut self,
        table: &Persistent,
        key: &Persistent,
        value: i64,
    ) -> Result<bool, VmError> {
        table::table_insert(self, table.word(), key.word(), Tagged::from_number(value))
    }

    pub fn table_contains(&self, table: &Persistent, key: &str) -> bool {
        table::table_contains(table.word(), key.as_bytes())
    }

    pub fn table_get(&self, table: &Persistent, key: &str) -> Option<i64> {
        // SAFETY: table values stored through this API are numbers.
        table::table_get(table.word(), key.as_bytes()).map(|v| unsafe { v.number() })
    }

    pub fn table_remove(&mut self, table: &Persistent, key: &str) -> Option<i64> {
        // SAFETY: as `table_get`.
        table::table_remove(table.word(), key.as_bytes()).map(|v| unsafe { v.number() })
    }

    pub fn table_len(&self, table: &Persistent) -> i64 {
        table::table_len(table.word())
    }

    // ── Exceptions for native code ─────────────────────────────────

    /// Allocate an instance of a builtin exception class, e.g. for
    /// [`crate::native_throw`].
    pub fn allocate_builtin_exception(&mut self, class: DefnKey) -> Result<u64, VmError> {
        debug_assert!(self.is_subclass_of(class, builtins::EXCEPTION_CLASS));
        let (meta, size) = {
            let class_defn = self.class(class);
            (
                class_defn.meta(class) as *const object::Meta,
                class_defn.instance_size() as usize,
            )
        };
        let block = self.allocate_block_uncollected(meta, size)?;
        Ok(block as u64)
    }
}

fn parse_name(text: &str, defn_form: bool) -> Option<Name> {
    if defn_form {
        Name::from_defn_string(text)
    } else {
        Name::from_source_string(text)
    }
}
