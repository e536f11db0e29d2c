//! Syntactic package representation: a faithful, loss-free mirror of the
//! binary file. Parsing and serialization are exact inverses for well-formed
//! files; the semantic loader builds real definitions from this form after
//! dependencies are resolved.

use bytecode::{read_vbn, write_vbn};

use crate::error::LoadError;

pub const MAGIC: [u8; 4] = *b"ltpk";
pub const FORMAT_MAJOR: u16 = 1;
pub const FORMAT_MINOR: u16 = 0;

/// Definition reference in file form: `package` is a dependency index, or
/// [`LOCAL_REF`] for this package, or [`BUILTIN_REF`] for builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDefnRef {
    pub package: i64,
    pub index: i64,
}

pub const LOCAL_REF: i64 = -1;
pub const BUILTIN_REF: i64 = -2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDependency {
    pub name: u32,
    pub min_version: Option<[u16; 3]>,
    pub max_version: Option<[u16; 3]>,
    pub global_count: u32,
    pub function_count: u32,
    pub class_count: u32,
    pub type_param_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGlobal {
    pub name: u32,
    pub source_name: u32,
    pub flags: u32,
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFunction {
    pub flags: u32,
    pub builtin_id: i64,
    pub name: u32,
    pub source_name: u32,
    pub type_params: Vec<u32>,
    /// Return type first, then parameter types.
    pub types: Vec<u32>,
    pub locals_size: u32,
    pub instructions: Vec<u8>,
    pub block_offsets: Vec<u32>,
    pub overrides: Vec<RawDefnRef>,
    pub inst_types: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub name: u32,
    pub flags: u32,
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawClass {
    pub name: u32,
    pub source_name: u32,
    pub flags: u32,
    pub type_params: Vec<u32>,
    pub supertype: Option<u32>,
    pub fields: Vec<RawField>,
    pub constructors: Vec<RawDefnRef>,
    pub methods: Vec<RawDefnRef>,
    pub element_type: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTypeParameter {
    pub name: u32,
    pub flags: u32,
    pub upper_bound: u32,
    pub lower_bound: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawType {
    Unit,
    Boolean,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Null,
    Class { class: RawDefnRef, nullable: bool, args: Vec<u32> },
    Variable { param: RawDefnRef, nullable: bool },
}

/// Extern definition tables of one dependency, read from the end of the
/// file. Extern functions carry no code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawDependencyBody {
    pub globals: Vec<RawGlobal>,
    pub functions: Vec<RawFunction>,
    pub classes: Vec<RawClass>,
    pub type_params: Vec<RawTypeParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPackage {
    pub flags: u32,
    pub name: u32,
    pub version: [u16; 3],
    pub dependencies: Vec<RawDependency>,
    pub strings: Vec<String>,
    /// Name pool: each entry is a list of string-pool indices.
    pub names: Vec<Vec<u32>>,
    pub globals: Vec<RawGlobal>,
    pub functions: Vec<RawFunction>,
    pub classes: Vec<RawClass>,
    pub type_params: Vec<RawTypeParameter>,
    pub types: Vec<RawType>,
    pub entry_function: i64,
    pub init_function: i64,
    pub dependency_bodies: Vec<RawDependencyBody>,
}

/// Abstract, extern and native functions carry no code section.
fn bodyless_flags() -> u32 {
    use crate::id::DefnFlags;
    (DefnFlags::ABSTRACT | DefnFlags::EXTERN | DefnFlags::NATIVE).bits()
}

// ── Reader ───────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], LoadError> {
        let end = self.offset.checked_add(count).ok_or(LoadError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(LoadError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn vbn(&mut self) -> Result<i64, LoadError> {
        read_vbn(self.bytes, &mut self.offset).ok_or(LoadError::UnexpectedEof)
    }

    /// Unsigned varint: rejects negatives and values above `u32::MAX`.
    fn length(&mut self) -> Result<u32, LoadError> {
        let n = self.vbn()?;
        u32::try_from(n).map_err(|_| LoadError::Malformed("length out of range"))
    }

    fn at_end(&self) -> bool {
        self.offset == self.bytes.len()
    }
}

// ── Parse ────────────────────────────────────────────────────────────

pub fn parse(bytes: &[u8]) -> Result<RawPackage, LoadError> {
    let mut r = Reader::new(bytes);

    if r.take(4)? != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let major = r.u16()?;
    let minor = r.u16()?;
    if major != FORMAT_MAJOR || minor > FORMAT_MINOR {
        return Err(LoadError::BadFormatVersion { major, minor });
    }

    let flags = r.u32()?;
    let name = r.length()?;
    let version = [r.u16()?, r.u16()?, r.u16()?];

    let dep_count = r.length()?;
    let mut dependencies = Vec::with_capacity(dep_count as usize);
    for _ in 0..dep_count {
        dependencies.push(parse_dependency(&mut r)?);
    }

    let string_count = r.length()?;
    let mut strings = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        let byte_length = r.length()? as usize;
        let content = r.take(byte_length)?;
        let text = std::str::from_utf8(content).map_err(|_| LoadError::BadUtf8)?;
        strings.push(text.to_string());
    }

    let name_count = r.length()?;
    let mut names = Vec::with_capacity(name_count as usize);
    for _ in 0..name_count {
        let component_count = r.length()?;
        let mut components = Vec::with_capacity(component_count as usize);
        for _ in 0..component_count {
            components.push(r.length()?);
        }
        names.push(components);
    }

    let global_count = r.length()?;
    let mut globals = Vec::with_capacity(global_count as usize);
    for _ in 0..global_count {
        globals.push(parse_global(&mut r)?);
    }

    let function_count = r.length()?;
    let mut functions = Vec::with_capacity(function_count as usize);
    for _ in 0..function_count {
        functions.push(parse_function(&mut r)?);
    }

    let class_count = r.length()?;
    let mut classes = Vec::with_capacity(class_count as usize);
    for _ in 0..class_count {
        classes.push(parse_class(&mut r)?);
    }

    let type_param_count = r.length()?;
    let mut type_params = Vec::with_capacity(type_param_count as usize);
    for _ in 0..type_param_count {
        type_params.push(parse_type_parameter(&mut r)?);
    }

    let type_count = r.length()?;
    let mut types = Vec::with_capacity(type_count as usize);
    for index in 0..type_count {
        types.push(parse_type(&mut r, index)?);
    }

    let entry_function = r.vbn()?;
    let init_function = r.vbn()?;

    let mut dependency_bodies = Vec::with_capacity(dep_count as usize);
    for dep in &dependencies {
        dependency_bodies.push(parse_dependency_body(&mut r, dep)?);
    }

    if !r.at_end() {
        return Err(LoadError::Malformed("garbage at end of package"));
    }

    Ok(RawPackage {
        flags,
        name,
        version,
        dependencies,
        strings,
        names,
        globals,
        functions,
        classes,
        type_params,
        types,
        entry_function,
        init_function,
        dependency_bodies,
    })
}

fn parse_dependency(r: &mut Reader) -> Result<RawDependency, LoadError> {
    let name = r.length()?;
    let min_version = parse_version_opt(r)?;
    let max_version = parse_version_opt(r)?;
    if let (Some(min), Some(max)) = (min_version, max_version) {
        if min > max {
            return Err(LoadError::Malformed("dependency version range is empty"));
        }
    }
    Ok(RawDependency {
        name,
        min_version,
        max_version,
        global_count: r.length()?,
        function_count: r.length()?,
        class_count: r.length()?,
        type_param_count: r.length()?,
    })
}

fn parse_version_opt(r: &mut Reader) -> Result<Option<[u16; 3]>, LoadError> {
    match r.u8()? {
        0 => Ok(None),
        1 => Ok(Some([r.u16()?, r.u16()?, r.u16()?])),
        _ => Err(LoadError::Malformed("invalid version option")),
    }
}

fn parse_global(r: &mut Reader) -> Result<RawGlobal, LoadError> {
    Ok(RawGlobal {
        name: r.length()?,
        source_name: r.length()?,
        flags: r.u32()?,
        ty: r.length()?,
    })
}

fn parse_function(r: &mut Reader) -> Result<RawFunction, LoadError> {
    let flags = r.u32()?;
    let builtin_id = r.vbn()?;
    let name = r.length()?;
    let source_name = r.length()?;

    let type_param_count = r.length()?;
    let mut type_params = Vec::with_capacity(type_param_count as usize);
    for _ in 0..type_param_count {
        type_params.push(r.length()?);
    }

    let type_count = r.length()?;
    if type_count == 0 {
        return Err(LoadError::Malformed("function without return type"));
    }
    let mut types = Vec::with_capacity(type_count as usize);
    for _ in 0..type_count {
        types.push(r.length()?);
    }

    let has_code = flags & bodyless_flags() == 0;
    let (locals_size, instructions, block_offsets) = if has_code {
        let locals_size = r.length()?;
        if locals_size % 8 != 0 {
            return Err(LoadError::Malformed("locals size not word-aligned"));
        }
        let instruction_count = r.length()? as usize;
        let instructions = r.take(instruction_count)?.to_vec();
        let block_offset_count = r.length()?;
        let mut block_offsets = Vec::with_capacity(block_offset_count as usize);
        for _ in 0..block_offset_count {
            let offset = r.length()?;
            if offset as usize > instructions.len() {
                return Err(LoadError::Malformed("block offset out of range"));
            }
            block_offsets.push(offset);
        }
        (locals_size, instructions, block_offsets)
    } else {
        (0, Vec::new(), Vec::new())
    };

    let override_count = r.length()?;
    let mut overrides = Vec::with_capacity(override_count as usize);
    for _ in 0..override_count {
        overrides.push(parse_defn_ref(r)?);
    }

    let inst_type_count = r.length()?;
    let mut inst_types = Vec::with_capacity(inst_type_count as usize);
    for _ in 0..inst_type_count {
        inst_types.push(r.length()?);
    }

    Ok(RawFunction {
        flags,
        builtin_id,
        name,
        source_name,
        type_params,
        types,
        locals_size,
        instructions,
        block_offsets,
        overrides,
        inst_types,
    })
}

fn parse_class(r: &mut Reader) -> Result<RawClass, LoadError> {
    let name = r.length()?;
    let source_name = r.length()?;
    let flags = r.u32()?;

    let type_param_count = r.length()?;
    let mut type_params = Vec::with_capacity(type_param_count as usize);
    for _ in 0..type_param_count {
        type_params.push(r.length()?);
    }

    let supertype = parse_type_ref_opt(r)?;

    let field_count = r.length()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(RawField { name: r.length()?, flags: r.u32()?, ty: r.length()? });
    }

    let constructor_count = r.length()?;
    let mut constructors = Vec::with_capacity(constructor_count as usize);
    for _ in 0..constructor_count {
        constructors.push(parse_defn_ref(r)?);
    }

    let method_count = r.length()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(parse_defn_ref(r)?);
    }

    let element_type = parse_type_ref_opt(r)?;

    Ok(RawClass {
        name,
        source_name,
        flags,
        type_params,
        supertype,
        fields,
        constructors,
        methods,
        element_type,
    })
}

fn parse_type_parameter(r: &mut Reader) -> Result<RawTypeParameter, LoadError> {
    Ok(RawTypeParameter {
        name: r.length()?,
        flags: r.u32()?,
        upper_bound: r.length()?,
        lower_bound: r.length()?,
    })
}

const TYPE_FORM_UNIT: u8 = 0;
const TYPE_FORM_BOOLEAN: u8 = 1;
const TYPE_FORM_I8: u8 = 2;
const TYPE_FORM_I16: u8 = 3;
const TYPE_FORM_I32: u8 = 4;
const TYPE_FORM_I64: u8 = 5;
const TYPE_FORM_F32: u8 = 6;
const TYPE_FORM_F64: u8 = 7;
const TYPE_FORM_NULL: u8 = 8;
const TYPE_FORM_CLASS: u8 = 9;
const TYPE_FORM_VARIABLE: u8 = 10;
const TYPE_FLAG_NULLABLE: u8 = 1 << 4;

fn parse_type(r: &mut Reader, index: u32) -> Result<RawType, LoadError> {
    let bits = r.u8()?;
    let form = bits & 0x0f;
    let flags = bits & 0xf0;
    let nullable = flags & TYPE_FLAG_NULLABLE != 0;
    if flags & !TYPE_FLAG_NULLABLE != 0 {
        return Err(LoadError::Malformed("invalid type flags"));
    }
    let ty = match form {
        TYPE_FORM_UNIT => RawType::Unit,
        TYPE_FORM_BOOLEAN => RawType::Boolean,
        TYPE_FORM_I8 => RawType::I8,
        TYPE_FORM_I16 => RawType::I16,
        TYPE_FORM_I32 => RawType::I32,
        TYPE_FORM_I64 => RawType::I64,
        TYPE_FORM_F32 => RawType::F32,
        TYPE_FORM_F64 => RawType::F64,
        TYPE_FORM_NULL => RawType::Null,
        TYPE_FORM_CLASS => {
            let class = parse_defn_ref(r)?;
            let arg_count = r.length()?;
            let mut args = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                let arg = r.length()?;
                // Type refs only point backwards, so trees stay finite.
                if arg >= index {
                    return Err(LoadError::Malformed("forward type reference"));
                }
                args.push(arg);
            }
            RawType::Class { class, nullable, args }
        }
        TYPE_FORM_VARIABLE => {
            let param = parse_defn_ref(r)?;
            RawType::Variable { param, nullable }
        }
        _ => return Err(LoadError::Malformed("invalid type form")),
    };
    if nullable && !matches!(ty, RawType::Class { .. } | RawType::Variable { .. }) {
        return Err(LoadError::Malformed("nullable primitive type"));
    }
    Ok(ty)
}

fn parse_type_ref_opt(r: &mut Reader) -> Result<Option<u32>, LoadError> {
    match r.u8()? {
        0 => Ok(None),
        1 => Ok(Some(r.length()?)),
        _ => Err(LoadError::Malformed("invalid option")),
    }
}

fn parse_defn_ref(r: &mut Reader) -> Result<RawDefnRef, LoadError> {
    Ok(RawDefnRef { package: r.vbn()?, index: r.vbn()? })
}

fn parse_dependency_body(
    r: &mut Reader,
    dep: &RawDependency,
) -> Result<RawDependencyBody, LoadError> {
    let mut body = RawDependencyBody::default();
    for _ in 0..dep.global_count {
        body.globals.push(parse_global(r)?);
    }
    for _ in 0..dep.function_count {
        let function = parse_function(r)?;
        if function.flags & crate::id::DefnFlags::EXTERN.bits() == 0 {
            return Err(LoadError::Malformed("dependency function is not extern"));
        }
        body.functions.push(function);
    }
    for _ in 0..dep.class_count {
        let class = parse_class(r)?;
        if class.flags & crate::id::DefnFlags::EXTERN.bits() == 0 {
            return Err(LoadError::Malformed("dependency class is not extern"));
        }
        body.classes.push(class);
    }
    for _ in 0..dep.type_param_count {
        body.type_params.push(parse_type_parameter(r)?);
    }
    Ok(body)
}

// ── Serialize ────────────────────────────────────────────────────────

pub fn serialize(package: &RawPackage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_MAJOR.to_le_bytes());
    out.extend_from_slice(&FORMAT_MINOR.to_le_bytes());

    out.extend_from_slice(&package.flags.to_le_bytes());
    write_vbn(&mut out, package.name as i64);
    for component in package.version {
        out.extend_from_slice(&component.to_le_bytes());
    }

    write_vbn(&mut out, package.dependencies.len() as i64);
    for dep in &package.dependencies {
        write_vbn(&mut out, dep.name as i64);
        write_version_opt(&mut out, dep.min_version);
        write_version_opt(&mut out, dep.max_version);
        write_vbn(&mut out, dep.global_count as i64);
        write_vbn(&mut out, dep.function_count as i64);
        write_vbn(&mut out, dep.class_count as i64);
        write_vbn(&mut out, dep.type_param_count as i64);
    }

    write_vbn(&mut out, package.strings.len() as i64);
    for text in &package.strings {
        write_vbn(&mut out, text.len() as i64);
        out.extend_from_slice(text.as_bytes());
    }

    write_vbn(&mut out, package.names.len() as i64);
    for components in &package.names {
        write_vbn(&mut out, components.len() as i64);
        for &component in components {
            write_vbn(&mut out, component as i64);
        }
    }

    write_vbn(&mut out, package.globals.len() as i64);
    for global in &package.globals {
        write_global(&mut out, global);
    }

    write_vbn(&mut out, package.functions.len() as i64);
    for function in &package.functions {
        write_function(&mut out, function);
    }

    write_vbn(&mut out, package.classes.len() as i64);
    for class in &package.classes {
        write_class(&mut out, class);
    }

    write_vbn(&mut out, package.type_params.len() as i64);
    for param in &package.type_params {
        write_type_parameter(&mut out, param);
    }

    write_vbn(&mut out, package.types.len() as i64);
    for ty in &package.types {
        write_type(&mut out, ty);
    }

    write_vbn(&mut out, package.entry_function);
    write_vbn(&mut out, package.init_function);

    for body in &package.dependency_bodies {
        for global in &body.globals {
            write_global(&mut out, global);
        }
        for function in &body.functions {
            write_function(&mut out, function);
        }
        for class in &body.classes {
            write_class(&mut out, class);
        }
        for param in &body.type_params {
            write_type_parameter(&mut out, param);
        }
    }

    out
}

fn write_version_opt(out: &mut Vec<u8>, version: Option<[u16; 3]>) {
    match version {
        None => out.push(0),
        Some(components) => {
            out.push(1);
            for component in components {
                out.extend_from_slice(&component.to_le_bytes());
            }
        }
    }
}

fn write_global(out: &mut Vec<u8>, global: &RawGlobal) {
    write_vbn(out, global.name as i64);
    write_vbn(out, global.source_name as i64);
    out.extend_from_slice(&global.flags.to_le_bytes());
    write_vbn(out, global.ty as i64);
}

fn write_function(out: &mut Vec<u8>, function: &RawFunction) {
    out.extend_from_slice(&function.flags.to_le_bytes());
    write_vbn(out, function.builtin_id);
    write_vbn(out, function.name as i64);
    write_vbn(out, function.source_name as i64);

    write_vbn(out, function.type_params.len() as i64);
    for &param in &function.type_params {
        write_vbn(out, param as i64);
    }

    write_vbn(out, function.types.len() as i64);
    for &ty in &function.types {
        write_vbn(out, ty as i64);
    }

    let has_code = function.flags & bodyless_flags() == 0;
    if has_code {
        write_vbn(out, function.locals_size as i64);
        write_vbn(out, function.instructions.len() as i64);
        out.extend_from_slice(&function.instructions);
        write_vbn(out, function.block_offsets.len() as i64);
        for &offset in &function.block_offsets {
            write_vbn(out, offset as i64);
        }
    }

    write_vbn(out, function.overrides.len() as i64);
    for r in &function.overrides {
        write_defn_ref(out, r);
    }

    write_vbn(out, function.inst_types.len() as i64);
    for &ty in &function.inst_types {
        write_vbn(out, ty as i64);
    }
}

fn write_class(out: &mut Vec<u8>, class: &RawClass) {
    write_vbn(out, class.name as i64);
    write_vbn(out, class.source_name as i64);
    out.extend_from_slice(&class.flags.to_le_bytes());

    write_vbn(out, class.type_params.len() as i64);
    for &param in &class.type_params {
        write_vbn(out, param as i64);
    }

    write_type_ref_opt(out, class.supertype);

    write_vbn(out, class.fields.len() as i64);
    for field in &class.fields {
        write_vbn(out, field.name as i64);
        out.extend_from_slice(&field.flags.to_le_bytes());
        write_vbn(out, field.ty as i64);
    }

    write_vbn(out, class.constructors.len() as i64);
    for c in &class.constructors {
        write_defn_ref(out, c);
    }

    write_vbn(out, class.methods.len() as i64);
    for m in &class.methods {
        write_defn_ref(out, m);
    }

    write_type_ref_opt(out, class.element_type);
}

fn write_type_parameter(out: &mut Vec<u8>, param: &RawTypeParameter) {
    write_vbn(out, param.name as i64);
    out.extend_from_slice(&param.flags.to_le_bytes());
    write_vbn(out, param.upper_bound as i64);
    write_vbn(out, param.lower_bound as i64);
}

fn write_type(out: &mut Vec<u8>, ty: &RawType) {
    match ty {
        RawType::Unit => out.push(TYPE_FORM_UNIT),
        RawType::Boolean => out.push(TYPE_FORM_BOOLEAN),
        RawType::I8 => out.push(TYPE_FORM_I8),
        RawType::I16 => out.push(TYPE_FORM_I16),
        RawType::I32 => out.push(TYPE_FORM_I32),
        RawType::I64 => out.push(TYPE_FORM_I64),
        RawType::F32 => out.push(TYPE_FORM_F32),
        RawType::F64 => out.push(TYPE_FORM_F64),
        RawType::Null => out.push(TYPE_FORM_NULL),
        RawType::Class { class, nullable, args } => {
            let mut bits = TYPE_FORM_CLASS;
            if *nullable {
                bits |= TYPE_FLAG_NULLABLE;
            }
            out.push(bits);
            write_defn_ref(out, class);
            write_vbn(out, args.len() as i64);
            for &arg in args {
                write_vbn(out, arg as i64);
            }
        }
        RawType::Variable { param, nullable } => {
            let mut bits = TYPE_FORM_VARIABLE;
            if *nullable {
                bits |= TYPE_FLAG_NULLABLE;
            }
            out.push(bits);
            write_defn_ref(out, param);
        }
    }
}

fn write_type_ref_opt(out: &mut Vec<u8>, ty: Option<u32>) {
    match ty {
        None => out.push(0),
        Some(index) => {
            out.push(1);
            write_vbn(out, index as i64);
        }
    }
}

fn write_defn_ref(out: &mut Vec<u8>, r: &RawDefnRef) {
    write_vbn(out, r.package);
    write_vbn(out, r.index);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package() -> RawPackage {
        RawPackage {
            flags: 0,
            name: 0,
            version: [1, 2, 3],
            dependencies: vec![RawDependency {
                name: 1,
                min_version: Some([1, 0, 0]),
                max_version: None,
                global_count: 1,
                function_count: 0,
                class_count: 0,
                type_param_count: 0,
            }],
            strings: vec!["pkg".into(), "dep".into(), "x".into(), "f".into()],
            names: vec![vec![0], vec![1], vec![2], vec![3]],
            globals: vec![RawGlobal { name: 2, source_name: 2, flags: 1, ty: 0 }],
            functions: vec![RawFunction {
                flags: 1,
                builtin_id: 0,
                name: 3,
                source_name: 3,
                type_params: vec![],
                types: vec![1],
                locals_size: 8,
                instructions: vec![0x01, 0x02, 0x03],
                block_offsets: vec![0],
                overrides: vec![],
                inst_types: vec![],
            }],
            classes: vec![],
            type_params: vec![],
            types: vec![RawType::I64, RawType::Unit],
            entry_function: 0,
            init_function: -1,
            dependency_bodies: vec![RawDependencyBody {
                globals: vec![RawGlobal { name: 1, source_name: 1, flags: 0x101, ty: 0 }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let package = sample_package();
        let bytes = serialize(&package);
        let parsed = parse(&bytes).expect("parse");
        assert_eq!(parsed, package);
        let bytes_again = serialize(&parsed);
        assert_eq!(bytes_again, bytes, "serialize(parse(bytes)) must equal bytes");
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = serialize(&sample_package());
        bytes[0] = b'X';
        assert!(matches!(parse(&bytes), Err(LoadError::BadMagic)));

        let mut bytes = serialize(&sample_package());
        bytes[4] = 0xff;
        assert!(matches!(parse(&bytes), Err(LoadError::BadFormatVersion { .. })));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = serialize(&sample_package());
        bytes.push(0);
        assert!(matches!(parse(&bytes), Err(LoadError::Malformed(_))));
    }

    #[test]
    fn rejects_truncation_everywhere() {
        let bytes = serialize(&sample_package());
        for len in 0..bytes.len() {
            assert!(
                parse(&bytes[..len]).is_err(),
                "truncation at {len} must not parse"
            );
        }
    }

    #[test]
    fn rejects_forward_type_references() {
        let mut package = sample_package();
        package.types = vec![RawType::Class {
            class: RawDefnRef { package: LOCAL_REF, index: 0 },
            nullable: false,
            args: vec![1],
        }];
        package.classes = vec![RawClass {
            name: 0,
            source_name: 0,
            flags: 0,
            type_params: vec![],
            supertype: None,
            fields: vec![],
            constructors: vec![],
            methods: vec![],
            element_type: None,
        }];
        let bytes = serialize(&package);
        assert!(matches!(parse(&bytes), Err(LoadError::Malformed(_))));
    }
}
