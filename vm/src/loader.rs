//! Builds runtime definitions from the raw package form: resolves
//! dependencies over the search paths, links extern references against
//! dependency exports, rewrites file-form references into definition keys,
//! and registers the finished package.

use std::path::Path;

use crate::class::{Class, Field, TypeParameter};
use crate::error::{LoadError, VmError};
use crate::function::Function;
use crate::global::Global;
use crate::id::{DefnFlags, DefnKey};
use crate::name::Name;
use crate::package::{Export, Package, PackageDependency, PackageVersion};
use crate::raw::{self, RawDefnRef, RawPackage, RawType};
use crate::ty::Type;
use crate::VM;

pub const PACKAGE_EXTENSION: &str = "lpk";

/// Load a package by name: an already-loaded package wins, otherwise the
/// search paths are scanned in order for `<name>.lpk` and the first match is
/// loaded, dependencies first.
pub fn load_package_by_name(vm: &mut VM, name: &Name) -> Result<u32, VmError> {
    if let Some(id) = vm.find_package(name) {
        return Ok(id);
    }
    let file_name = format!("{name}.{PACKAGE_EXTENSION}");
    for dir in vm.search_paths().to_vec() {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            let id = load_package_file(vm, &candidate)?;
            let loaded = vm.package(id);
            if loaded.name != *name {
                return Err(LoadError::Malformed("package name does not match its file").into());
            }
            return Ok(id);
        }
    }
    Err(LoadError::MissingDependency(name.to_string()).into())
}

pub fn load_package_file(vm: &mut VM, path: &Path) -> Result<u32, VmError> {
    let span = tracing::debug_span!("load_package", path = %path.display()).entered();
    let bytes = std::fs::read(path).map_err(LoadError::Io)?;
    let id = load_package_bytes(vm, &bytes)?;
    drop(span);
    Ok(id)
}

pub fn load_package_bytes(vm: &mut VM, bytes: &[u8]) -> Result<u32, VmError> {
    let raw = raw::parse(bytes)?;
    let builder = PackageBuilder::begin(vm, &raw)?;
    let id = builder.finish(vm, &raw)?;

    vm.allocate_package_strings(id)?;
    tracing::debug!(package = %vm.package(id).name, id, "package loaded");

    if let Some(init) = vm.package(id).init_function {
        let key = DefnKey::new(id, init);
        crate::interp::call_function(vm, key, &[])?;
    }
    Ok(id)
}

/// Per-load state: the reserved package id plus the resolved dependency
/// links, which reference resolution needs while definitions are built.
struct PackageBuilder {
    id: u32,
    name: Name,
    version: PackageVersion,
    names: Vec<Name>,
    dependencies: Vec<PackageDependency>,
}

impl PackageBuilder {
    fn begin(vm: &mut VM, raw: &RawPackage) -> Result<PackageBuilder, VmError> {
        // Resolve the name pool first; everything else is named through it.
        let mut names = Vec::with_capacity(raw.names.len());
        for components in &raw.names {
            let mut parts = Vec::with_capacity(components.len());
            for &string_ref in components {
                let text = raw
                    .strings
                    .get(string_ref as usize)
                    .ok_or(LoadError::Malformed("name string out of range"))?;
                parts.push(std::sync::Arc::from(text.as_str()));
            }
            names.push(Name::new(parts));
        }

        let name = names
            .get(raw.name as usize)
            .cloned()
            .ok_or(LoadError::Malformed("package name out of range"))?;
        if vm.find_package(&name).is_some() {
            return Err(LoadError::DuplicatePackage(name.to_string()).into());
        }
        if vm.is_loading(&name) {
            return Err(LoadError::DependencyCycle(name.to_string()).into());
        }
        vm.push_loading(name.clone());

        let result = Self::load_dependencies(vm, raw, &names, &name);
        if result.is_err() {
            vm.pop_loading();
        }
        let dependencies = result?;

        Ok(PackageBuilder {
            id: vm.next_package_id(),
            name,
            version: PackageVersion(raw.version),
            names,
            dependencies,
        })
    }

    fn load_dependencies(
        vm: &mut VM,
        raw: &RawPackage,
        names: &[Name],
        package_name: &Name,
    ) -> Result<Vec<PackageDependency>, VmError> {
        let mut dependencies = Vec::with_capacity(raw.dependencies.len());
        for (dep_index, dep) in raw.dependencies.iter().enumerate() {
            let dep_name = names
                .get(dep.name as usize)
                .cloned()
                .ok_or(LoadError::Malformed("dependency name out of range"))?;
            if vm.is_loading(&dep_name) {
                return Err(LoadError::DependencyCycle(dep_name.to_string()).into());
            }
            let dep_id = load_package_by_name(vm, &dep_name)?;

            let min_version = dep.min_version.map(PackageVersion);
            let max_version = dep.max_version.map(PackageVersion);
            let dep_version = vm.package(dep_id).version;
            let in_range = min_version.is_none_or(|min| min <= dep_version)
                && max_version.is_none_or(|max| dep_version <= max);
            if !in_range {
                return Err(LoadError::VersionMismatch(format!(
                    "{package_name} requires {dep_name} in [{}, {}], found {dep_version}",
                    min_version.map(|v| v.to_string()).unwrap_or_else(|| "*".into()),
                    max_version.map(|v| v.to_string()).unwrap_or_else(|| "*".into()),
                ))
                .into());
            }

            let body = &raw.dependency_bodies[dep_index];
            let exports = vm.package(dep_id).exports();

            let mut linked_globals = Vec::with_capacity(body.globals.len());
            for extern_global in &body.globals {
                let source_name = names
                    .get(extern_global.source_name as usize)
                    .ok_or(LoadError::Malformed("extern name out of range"))?;
                match exports.get(source_name) {
                    Some(Export::Global(index)) => {
                        linked_globals.push(DefnKey::new(dep_id, *index))
                    }
                    _ => {
                        return Err(unresolved(&dep_name, source_name, "global"));
                    }
                }
            }

            let mut linked_functions = Vec::with_capacity(body.functions.len());
            for extern_function in &body.functions {
                let source_name = names
                    .get(extern_function.source_name as usize)
                    .ok_or(LoadError::Malformed("extern name out of range"))?;
                match exports.get(source_name) {
                    Some(Export::Function(index)) => {
                        linked_functions.push(DefnKey::new(dep_id, *index))
                    }
                    _ => {
                        return Err(unresolved(&dep_name, source_name, "function"));
                    }
                }
            }

            let mut linked_classes = Vec::with_capacity(body.classes.len());
            for extern_class in &body.classes {
                let source_name = names
                    .get(extern_class.source_name as usize)
                    .ok_or(LoadError::Malformed("extern name out of range"))?;
                match exports.get(source_name) {
                    Some(Export::Class(index)) => {
                        linked_classes.push(DefnKey::new(dep_id, *index))
                    }
                    _ => {
                        return Err(unresolved(&dep_name, source_name, "class"));
                    }
                }
            }

            let mut linked_type_params = Vec::with_capacity(body.type_params.len());
            for extern_param in &body.type_params {
                let param_name = names
                    .get(extern_param.name as usize)
                    .ok_or(LoadError::Malformed("extern name out of range"))?;
                match exports.get(param_name) {
                    Some(Export::TypeParameter(index)) => {
                        linked_type_params.push(DefnKey::new(dep_id, *index))
                    }
                    _ => {
                        return Err(unresolved(&dep_name, param_name, "type parameter"));
                    }
                }
            }

            dependencies.push(PackageDependency {
                name: dep_name,
                min_version,
                max_version,
                package: dep_id,
                linked_globals: linked_globals.into_boxed_slice(),
                linked_functions: linked_functions.into_boxed_slice(),
                linked_classes: linked_classes.into_boxed_slice(),
                linked_type_params: linked_type_params.into_boxed_slice(),
            });
        }
        Ok(dependencies)
    }

    fn finish(self, vm: &mut VM, raw: &RawPackage) -> Result<u32, VmError> {
        let result = self.build(vm, raw);
        vm.pop_loading();
        result
    }

    fn build(mut self, vm: &mut VM, raw: &RawPackage) -> Result<u32, VmError> {
        // Types resolve backwards through the pool, so one forward pass
        // suffices.
        let mut types: Vec<Type> = Vec::with_capacity(raw.types.len());
        for raw_type in &raw.types {
            let ty = self.build_type(vm, raw, raw_type, &types)?;
            types.push(ty);
        }

        let mut type_params = Vec::with_capacity(raw.type_params.len());
        for param in &raw.type_params {
            type_params.push(TypeParameter {
                name: self.name(param.name)?,
                flags: DefnFlags::from_bits_truncate(param.flags),
                upper_bound: self.type_at(&types, param.upper_bound)?,
                lower_bound: self.type_at(&types, param.lower_bound)?,
            });
        }

        let mut globals = Vec::with_capacity(raw.globals.len());
        for global in &raw.globals {
            globals.push(Global::new(
                self.name(global.name)?,
                self.name(global.source_name)?,
                DefnFlags::from_bits_truncate(global.flags),
                self.type_at(&types, global.ty)?,
            ));
        }

        let mut functions = Vec::with_capacity(raw.functions.len());
        for function in &raw.functions {
            functions.push(self.build_function(vm, raw, function, &types)?);
        }

        let mut classes = Vec::with_capacity(raw.classes.len());
        for class in &raw.classes {
            classes.push(self.build_class(vm, raw, class, &types)?);
        }

        let entry_function = index_option(raw.entry_function, functions.len())?;
        let init_function = index_option(raw.init_function, functions.len())?;

        let dependencies = std::mem::take(&mut self.dependencies).into_boxed_slice();
        let package = Package::new(
            self.id,
            self.name.clone(),
            self.version,
            raw.flags,
            dependencies,
            raw.strings
                .iter()
                .map(|s| s.clone().into_boxed_str())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            std::mem::take(&mut self.names).into_boxed_slice(),
            globals.into_boxed_slice(),
            functions.into_boxed_slice(),
            classes.into_boxed_slice(),
            type_params.into_boxed_slice(),
            entry_function,
            init_function,
        );
        let id = vm.register_package(package);
        debug_assert_eq!(id, self.id);

        self.validate_linked_signatures(vm, raw)?;
        Ok(id)
    }

    fn name(&self, index: u32) -> Result<Name, LoadError> {
        self.names
            .get(index as usize)
            .cloned()
            .ok_or(LoadError::Malformed("name reference out of range"))
    }

    fn type_at(&self, types: &[Type], index: u32) -> Result<Type, LoadError> {
        types
            .get(index as usize)
            .cloned()
            .ok_or(LoadError::Malformed("type reference out of range"))
    }

    fn build_type(
        &self,
        vm: &VM,
        raw: &RawPackage,
        raw_type: &RawType,
        types: &[Type],
    ) -> Result<Type, VmError> {
        Ok(match raw_type {
            RawType::Unit => Type::Unit,
            RawType::Boolean => Type::Boolean,
            RawType::I8 => Type::I8,
            RawType::I16 => Type::I16,
            RawType::I32 => Type::I32,
            RawType::I64 => Type::I64,
            RawType::F32 => Type::F32,
            RawType::F64 => Type::F64,
            RawType::Null => Type::Null,
            RawType::Class { class, nullable, args } => {
                let class = self.resolve_class_ref(vm, raw, *class)?;
                let mut built_args = Vec::with_capacity(args.len());
                for &arg in args {
                    built_args.push(self.type_at(types, arg)?);
                }
                if *nullable {
                    Type::nullable_object(class, built_args)
                } else {
                    Type::object(class, built_args)
                }
            }
            RawType::Variable { param, nullable } => {
                let param = self.resolve_type_param_ref(raw, *param)?;
                Type::variable(param, *nullable)
            }
        })
    }

    fn build_function(
        &self,
        vm: &VM,
        raw: &RawPackage,
        function: &raw::RawFunction,
        types: &[Type],
    ) -> Result<Function, VmError> {
        let mut type_params = Vec::with_capacity(function.type_params.len());
        for &param in &function.type_params {
            if param as usize >= raw.type_params.len() {
                return Err(LoadError::Malformed("type parameter out of range").into());
            }
            type_params.push(DefnKey::new(self.id, param));
        }

        let return_type = self.type_at(types, function.types[0])?;
        let mut param_types = Vec::with_capacity(function.types.len() - 1);
        for &ty in &function.types[1..] {
            param_types.push(self.type_at(types, ty)?);
        }

        let mut overrides = Vec::with_capacity(function.overrides.len());
        for &r in &function.overrides {
            overrides.push(self.resolve_function_ref(vm, raw, r)?);
        }

        let mut inst_types = Vec::with_capacity(function.inst_types.len());
        for &ty in &function.inst_types {
            inst_types.push(self.type_at(types, ty)?);
        }

        Ok(Function {
            name: self.name(function.name)?,
            source_name: self.name(function.source_name)?,
            flags: DefnFlags::from_bits_truncate(function.flags),
            builtin_id: function.builtin_id,
            type_params: type_params.into_boxed_slice(),
            return_type,
            param_types: param_types.into_boxed_slice(),
            package: self.id,
            locals_size: function.locals_size,
            instructions: function.instructions.clone().into_boxed_slice(),
            block_offsets: function.block_offsets.clone().into_boxed_slice(),
            overrides: overrides.into_boxed_slice(),
            inst_types: inst_types.into_boxed_slice(),
            stack_map: Default::default(),
            native_code: Default::default(),
            native_cif: Default::default(),
        })
    }

    fn build_class(
        &self,
        vm: &VM,
        raw: &RawPackage,
        class: &raw::RawClass,
        types: &[Type],
    ) -> Result<Class, VmError> {
        let mut type_params = Vec::with_capacity(class.type_params.len());
        for &param in &class.type_params {
            if param as usize >= raw.type_params.len() {
                return Err(LoadError::Malformed("type parameter out of range").into());
            }
            type_params.push(DefnKey::new(self.id, param));
        }

        let supertype = match class.supertype {
            Some(index) => Some(self.type_at(types, index)?),
            None => None,
        };

        let mut fields = Vec::with_capacity(class.fields.len());
        for field in &class.fields {
            fields.push(Field {
                name: self.name(field.name)?,
                flags: DefnFlags::from_bits_truncate(field.flags),
                ty: self.type_at(types, field.ty)?,
            });
        }

        let mut constructors = Vec::with_capacity(class.constructors.len());
        for &c in &class.constructors {
            constructors.push(self.resolve_function_ref(vm, raw, c)?);
        }
        let mut methods = Vec::with_capacity(class.methods.len());
        for &m in &class.methods {
            methods.push(self.resolve_function_ref(vm, raw, m)?);
        }

        let element_type = match class.element_type {
            Some(index) => Some(self.type_at(types, index)?),
            None => None,
        };
        let length_field_index = if element_type.is_some() {
            let index = fields
                .iter()
                .position(|f| f.flags.contains(DefnFlags::ARRAY_LENGTH))
                .ok_or(LoadError::Malformed("array class without length field"))?;
            Some(index as u32)
        } else {
            None
        };

        Ok(Class::new(
            self.name(class.name)?,
            self.name(class.source_name)?,
            DefnFlags::from_bits_truncate(class.flags),
            type_params.into_boxed_slice(),
            supertype,
            fields.into_boxed_slice(),
            constructors.into_boxed_slice(),
            methods.into_boxed_slice(),
            self.id,
            element_type,
            length_field_index,
        ))
    }

    fn resolve_class_ref(
        &self,
        vm: &VM,
        raw: &RawPackage,
        r: RawDefnRef,
    ) -> Result<DefnKey, LoadError> {
        if r.package == raw::LOCAL_REF && (r.index < 0 || r.index as usize >= raw.classes.len())
        {
            return Err(LoadError::Malformed("class reference out of range"));
        }
        self.resolve_ref(r, |dep, index| dep.linked_classes.get(index).copied(), |index| {
            (index < vm.builtin_class_count()).then(|| DefnKey::builtin(index as u32))
        })
    }

    fn resolve_type_param_ref(
        &self,
        raw: &RawPackage,
        r: RawDefnRef,
    ) -> Result<DefnKey, LoadError> {
        if r.package == raw::LOCAL_REF
            && (r.index < 0 || r.index as usize >= raw.type_params.len())
        {
            return Err(LoadError::Malformed("type parameter reference out of range"));
        }
        self.resolve_ref(
            r,
            |dep, index| dep.linked_type_params.get(index).copied(),
            |_| None,
        )
    }

    fn resolve_function_ref(
        &self,
        vm: &VM,
        raw: &RawPackage,
        r: RawDefnRef,
    ) -> Result<DefnKey, LoadError> {
        if r.package == raw::LOCAL_REF
            && (r.index < 0 || r.index as usize >= raw.functions.len())
        {
            return Err(LoadError::Malformed("function reference out of range"));
        }
        self.resolve_ref(r, |dep, index| dep.linked_functions.get(index).copied(), |index| {
            (index < vm.builtin_function_count()).then(|| DefnKey::builtin(index as u32))
        })
    }

    fn resolve_ref(
        &self,
        r: RawDefnRef,
        linked: impl Fn(&PackageDependency, usize) -> Option<DefnKey>,
        builtin: impl Fn(usize) -> Option<DefnKey>,
    ) -> Result<DefnKey, LoadError> {
        if r.index < 0 {
            return Err(LoadError::Malformed("negative definition index"));
        }
        let index = r.index as usize;
        match r.package {
            raw::LOCAL_REF => Ok(DefnKey::new(self.id, index as u32)),
            raw::BUILTIN_REF => {
                builtin(index).ok_or(LoadError::Malformed("builtin reference out of range"))
            }
            dep if dep >= 0 => {
                let dependency = self
                    .dependencies
                    .get(dep as usize)
                    .ok_or(LoadError::Malformed("dependency index out of range"))?;
                linked(dependency, index)
                    .ok_or(LoadError::Malformed("extern reference out of range"))
            }
            _ => Err(LoadError::Malformed("invalid package reference")),
        }
    }

    /// After registration, check that every linked function matches the
    /// extern declaration's arity. Catching drift here beats a corrupt stack
    /// at call time.
    fn validate_linked_signatures(&self, vm: &VM, raw: &RawPackage) -> Result<(), VmError> {
        for (dep_index, body) in raw.dependency_bodies.iter().enumerate() {
            let dependency = &vm.package(self.id).dependencies[dep_index];
            for (i, extern_function) in body.functions.iter().enumerate() {
                let linked = vm.function(dependency.linked_functions[i]);
                let declared_params = extern_function.types.len() - 1;
                if linked.param_types.len() != declared_params {
                    return Err(LoadError::UnresolvedSymbol(format!(
                        "{}: arity mismatch against {}",
                        linked.name, dependency.name
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

fn unresolved(dep: &Name, symbol: &Name, kind: &str) -> VmError {
    LoadError::UnresolvedSymbol(format!("{kind} {symbol} in {dep}")).into()
}

fn index_option(value: i64, len: usize) -> Result<Option<u32>, LoadError> {
    if value == -1 {
        return Ok(None);
    }
    if value < 0 || value as usize >= len {
        return Err(LoadError::Malformed("function index out of range"));
    }
    Ok(Some(value as u32))
}
