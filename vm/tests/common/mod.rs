//! Shared test scaffolding: a small package assembler over the raw file
//! form, so tests can produce loadable packages without a compiler.

#![allow(dead_code)]

use bytecode::BytecodeBuilder;
use vm::raw::{
    RawClass, RawDefnRef, RawDependency, RawDependencyBody, RawField, RawFunction,
    RawGlobal, RawPackage, RawType, BUILTIN_REF, LOCAL_REF,
};
use vm::DefnFlags;

pub struct Assembler {
    pub raw: RawPackage,
}

impl Assembler {
    pub fn new(name: &str, version: [u16; 3]) -> Assembler {
        let mut assembler = Assembler {
            raw: RawPackage {
                flags: 0,
                name: 0,
                version,
                dependencies: Vec::new(),
                strings: Vec::new(),
                names: Vec::new(),
                globals: Vec::new(),
                functions: Vec::new(),
                classes: Vec::new(),
                type_params: Vec::new(),
                types: Vec::new(),
                entry_function: -1,
                init_function: -1,
                dependency_bodies: Vec::new(),
            },
        };
        assembler.raw.name = assembler.name(name);
        assembler
    }

    pub fn string(&mut self, text: &str) -> u32 {
        if let Some(index) = self.raw.strings.iter().position(|s| s == text) {
            return index as u32;
        }
        self.raw.strings.push(text.to_string());
        self.raw.strings.len() as u32 - 1
    }

    /// Intern a dotted name into the name pool.
    pub fn name(&mut self, dotted: &str) -> u32 {
        let components: Vec<u32> = dotted.split('.').map(|c| self.string(c)).collect();
        if let Some(index) = self.raw.names.iter().position(|n| *n == components) {
            return index as u32;
        }
        self.raw.names.push(components);
        self.raw.names.len() as u32 - 1
    }

    pub fn ty(&mut self, ty: RawType) -> u32 {
        if let Some(index) = self.raw.types.iter().position(|t| *t == ty) {
            return index as u32;
        }
        self.raw.types.push(ty);
        self.raw.types.len() as u32 - 1
    }

    pub fn ty_local_class(&mut self, class_index: u32) -> u32 {
        self.ty(RawType::Class {
            class: RawDefnRef { package: LOCAL_REF, index: class_index as i64 },
            nullable: false,
            args: vec![],
        })
    }

    pub fn ty_builtin_class(&mut self, builtin_index: u32) -> u32 {
        self.ty(RawType::Class {
            class: RawDefnRef { package: BUILTIN_REF, index: builtin_index as i64 },
            nullable: false,
            args: vec![],
        })
    }

    pub fn add_global(&mut self, name: &str, flags: DefnFlags, ty: u32) -> u32 {
        let name = self.name(name);
        self.raw.globals.push(RawGlobal {
            name,
            source_name: name,
            flags: flags.bits(),
            ty,
        });
        self.raw.globals.len() as u32 - 1
    }

    /// Add a bytecode function. `build` receives a fresh builder; its blocks
    /// and code become the function body.
    pub fn add_function(
        &mut self,
        name: &str,
        flags: DefnFlags,
        return_ty: u32,
        param_tys: &[u32],
        locals_size: u32,
        build: impl FnOnce(&mut BytecodeBuilder),
    ) -> u32 {
        let mut builder = BytecodeBuilder::new();
        build(&mut builder);
        let (instructions, block_offsets) = builder.finish();
        self.add_function_raw(
            name,
            flags,
            return_ty,
            param_tys,
            locals_size,
            instructions,
            block_offsets,
            vec![],
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_function_raw(
        &mut self,
        name: &str,
        flags: DefnFlags,
        return_ty: u32,
        param_tys: &[u32],
        locals_size: u32,
        instructions: Vec<u8>,
        block_offsets: Vec<u32>,
        overrides: Vec<RawDefnRef>,
    ) -> u32 {
        let name = self.name(name);
        let mut types = vec![return_ty];
        types.extend_from_slice(param_tys);
        self.raw.functions.push(RawFunction {
            flags: flags.bits(),
            builtin_id: 0,
            name,
            source_name: name,
            type_params: vec![],
            types,
            locals_size,
            instructions,
            block_offsets,
            overrides,
            inst_types: vec![],
        });
        self.raw.functions.len() as u32 - 1
    }

    /// Add a code-less function (abstract or native).
    pub fn add_bodyless_function(
        &mut self,
        name: &str,
        flags: DefnFlags,
        return_ty: u32,
        param_tys: &[u32],
        overrides: Vec<RawDefnRef>,
    ) -> u32 {
        let name = self.name(name);
        let mut types = vec![return_ty];
        types.extend_from_slice(param_tys);
        self.raw.functions.push(RawFunction {
            flags: flags.bits(),
            builtin_id: 0,
            name,
            source_name: name,
            type_params: vec![],
            types,
            locals_size: 0,
            instructions: vec![],
            block_offsets: vec![],
            overrides,
            inst_types: vec![],
        });
        self.raw.functions.len() as u32 - 1
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_class(
        &mut self,
        name: &str,
        flags: DefnFlags,
        supertype: Option<u32>,
        fields: &[(&str, DefnFlags, u32)],
        constructors: Vec<RawDefnRef>,
        methods: Vec<RawDefnRef>,
        element_type: Option<u32>,
    ) -> u32 {
        let name = self.name(name);
        let fields = fields
            .iter()
            .map(|(field_name, field_flags, field_ty)| RawField {
                name: self.name(field_name),
                flags: field_flags.bits(),
                ty: *field_ty,
            })
            .collect();
        self.raw.classes.push(RawClass {
            name,
            source_name: name,
            flags: flags.bits(),
            type_params: vec![],
            supertype,
            fields,
            constructors,
            methods,
            element_type,
        });
        self.raw.classes.len() as u32 - 1
    }

    /// Declare a dependency plus its extern body. Returns the dependency
    /// index for `*F` opcodes.
    pub fn add_dependency(&mut self, name: &str, body: RawDependencyBody) -> u32 {
        let name = self.name(name);
        self.raw.dependencies.push(RawDependency {
            name,
            min_version: None,
            max_version: None,
            global_count: body.globals.len() as u32,
            function_count: body.functions.len() as u32,
            class_count: body.classes.len() as u32,
            type_param_count: body.type_params.len() as u32,
        });
        self.raw.dependency_bodies.push(body);
        self.raw.dependencies.len() as u32 - 1
    }

    /// Build an extern global entry for a dependency body.
    pub fn extern_global(&mut self, name: &str, ty: u32) -> RawGlobal {
        let name = self.name(name);
        RawGlobal {
            name,
            source_name: name,
            flags: (DefnFlags::PUBLIC | DefnFlags::EXTERN).bits(),
            ty,
        }
    }

    /// Build an extern class entry for a dependency body.
    pub fn extern_class(&mut self, name: &str) -> RawClass {
        let name = self.name(name);
        RawClass {
            name,
            source_name: name,
            flags: (DefnFlags::PUBLIC | DefnFlags::EXTERN).bits(),
            type_params: vec![],
            supertype: None,
            fields: vec![],
            constructors: vec![],
            methods: vec![],
            element_type: None,
        }
    }

    /// Build an extern function entry for a dependency body.
    pub fn extern_function(&mut self, name: &str, return_ty: u32, param_tys: &[u32]) -> RawFunction {
        let name = self.name(name);
        let mut types = vec![return_ty];
        types.extend_from_slice(param_tys);
        RawFunction {
            flags: (DefnFlags::PUBLIC | DefnFlags::EXTERN).bits(),
            builtin_id: 0,
            name,
            source_name: name,
            type_params: vec![],
            types,
            locals_size: 0,
            instructions: vec![],
            block_offsets: vec![],
            overrides: vec![],
            inst_types: vec![],
        }
    }

    pub fn set_entry(&mut self, function: u32) {
        self.raw.entry_function = function as i64;
    }

    pub fn set_init(&mut self, function: u32) {
        self.raw.init_function = function as i64;
    }

    pub fn bytes(&self) -> Vec<u8> {
        vm::serialize_package(&self.raw)
    }
}

pub fn local(index: u32) -> RawDefnRef {
    RawDefnRef { package: LOCAL_REF, index: index as i64 }
}

/// A scratch directory for package files, removed on drop.
pub struct PackageDir {
    pub path: std::path::PathBuf,
}

impl PackageDir {
    pub fn new(tag: &str) -> PackageDir {
        let path = std::env::temp_dir().join(format!(
            "lattice-test-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("create package dir");
        PackageDir { path }
    }

    pub fn write(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.path.join(format!("{name}.lpk")), bytes).expect("write package");
    }
}

impl Drop for PackageDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
