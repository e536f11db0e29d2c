use std::cell::{Cell, OnceCell};
use std::collections::HashMap;

use crate::class::{Class, TypeParameter};
use crate::function::Function;
use crate::global::Global;
use crate::id::{DefnFlags, DefnKey};
use crate::name::Name;

/// A package version: up to three numeric components, compared
/// lexicographically with missing components ranking lowest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageVersion(pub [u16; 3]);

impl PackageVersion {
    pub fn parse(text: &str) -> Option<PackageVersion> {
        let mut components = [0u16; 3];
        let mut count = 0;
        for part in text.split('.') {
            if count == 3 {
                return None;
            }
            components[count] = part.parse().ok()?;
            count += 1;
        }
        (count > 0).then_some(PackageVersion(components))
    }
}

impl std::fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

impl std::fmt::Debug for PackageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// One dependency edge of a package, with the per-dependency linked arrays
/// filled by symbol resolution at load time.
pub struct PackageDependency {
    pub name: Name,
    pub min_version: Option<PackageVersion>,
    pub max_version: Option<PackageVersion>,
    /// Resolved package id of the dependency.
    pub package: u32,
    pub linked_globals: Box<[DefnKey]>,
    pub linked_functions: Box<[DefnKey]>,
    pub linked_classes: Box<[DefnKey]>,
    pub linked_type_params: Box<[DefnKey]>,
}

impl PackageDependency {
    pub fn is_satisfied_by(&self, name: &Name, version: PackageVersion) -> bool {
        self.name == *name
            && self.min_version.is_none_or(|min| min <= version)
            && self.max_version.is_none_or(|max| version <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Export {
    Global(u32),
    Function(u32),
    Class(u32),
    TypeParameter(u32),
}

/// The unit of compiled distribution: definition tables plus dependency
/// links. The string table holds heap string blocks allocated at load time;
/// the slots are GC roots and are rewritten when the collector moves them.
pub struct Package {
    pub id: u32,
    pub name: Name,
    pub version: PackageVersion,
    pub flags: u32,
    pub dependencies: Box<[PackageDependency]>,
    /// Raw utf-8 of the string pool, kept for serialization and reloads.
    pub string_data: Box<[Box<str>]>,
    /// Heap string blocks for the pool, one per entry.
    pub strings: Box<[Cell<u64>]>,
    pub names: Box<[Name]>,
    pub globals: Box<[Global]>,
    pub functions: Box<[Function]>,
    pub classes: Box<[Class]>,
    pub type_params: Box<[TypeParameter]>,
    pub entry_function: Option<u32>,
    pub init_function: Option<u32>,

    exports: OnceCell<HashMap<Name, Export>>,
    defn_table: OnceCell<HashMap<Name, Export>>,
}

impl Package {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        name: Name,
        version: PackageVersion,
        flags: u32,
        dependencies: Box<[PackageDependency]>,
        string_data: Box<[Box<str>]>,
        names: Box<[Name]>,
        globals: Box<[Global]>,
        functions: Box<[Function]>,
        classes: Box<[Class]>,
        type_params: Box<[TypeParameter]>,
        entry_function: Option<u32>,
        init_function: Option<u32>,
    ) -> Package {
        let strings = string_data
            .iter()
            .map(|_| Cell::new(0u64))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Package {
            id,
            name,
            version,
            flags,
            dependencies,
            string_data,
            strings,
            names,
            globals,
            functions,
            classes,
            type_params,
            entry_function,
            init_function,
            exports: OnceCell::new(),
            defn_table: OnceCell::new(),
        }
    }

    pub fn global(&self, index: u32) -> &Global {
        &self.globals[index as usize]
    }

    pub fn function(&self, index: u32) -> &Function {
        &self.functions[index as usize]
    }

    pub fn class(&self, index: u32) -> &Class {
        &self.classes[index as usize]
    }

    pub fn type_parameter(&self, index: u32) -> &TypeParameter {
        &self.type_params[index as usize]
    }

    pub fn name_at(&self, index: u32) -> &Name {
        &self.names[index as usize]
    }

    /// Public symbols keyed by source name. Used for cross-package linking
    /// and host lookups in source form.
    pub fn exports(&self) -> &HashMap<Name, Export> {
        self.exports.get_or_init(|| {
            let mut map = HashMap::new();
            for (i, global) in self.globals.iter().enumerate() {
                if global.flags.contains(DefnFlags::PUBLIC) {
                    map.insert(global.source_name.clone(), Export::Global(i as u32));
                }
            }
            for (i, function) in self.functions.iter().enumerate() {
                let flags = function.flags;
                let exported = flags.contains(DefnFlags::PUBLIC)
                    && (!flags.contains(DefnFlags::METHOD)
                        || flags.contains(DefnFlags::STATIC));
                if exported {
                    map.insert(function.source_name.clone(), Export::Function(i as u32));
                }
            }
            for (i, class) in self.classes.iter().enumerate() {
                if class.flags.contains(DefnFlags::PUBLIC) {
                    map.insert(class.source_name.clone(), Export::Class(i as u32));
                }
            }
            for (i, param) in self.type_params.iter().enumerate() {
                if param.flags.contains(DefnFlags::PUBLIC) {
                    map.insert(param.name.clone(), Export::TypeParameter(i as u32));
                }
            }
            map
        })
    }

    /// Every symbol keyed by defn name, private definitions included.
    pub fn defn_table(&self) -> &HashMap<Name, Export> {
        self.defn_table.get_or_init(|| {
            let mut map = HashMap::new();
            for (i, global) in self.globals.iter().enumerate() {
                map.insert(global.name.clone(), Export::Global(i as u32));
            }
            for (i, function) in self.functions.iter().enumerate() {
                map.insert(function.name.clone(), Export::Function(i as u32));
            }
            for (i, class) in self.classes.iter().enumerate() {
                map.insert(class.name.clone(), Export::Class(i as u32));
            }
            for (i, param) in self.type_params.iter().enumerate() {
                map.insert(param.name.clone(), Export::TypeParameter(i as u32));
            }
            map
        })
    }

    /// Look up a symbol: source form searches public exports only, defn form
    /// searches everything.
    pub fn find_symbol(&self, name: &Name, defn_form: bool) -> Option<Export> {
        if defn_form {
            self.defn_table().get(name).copied()
        } else {
            self.exports().get(name).copied()
        }
    }

    pub fn find_global(&self, name: &Name, defn_form: bool) -> Option<u32> {
        match self.find_symbol(name, defn_form) {
            Some(Export::Global(i)) => Some(i),
            _ => None,
        }
    }

    pub fn find_function(&self, name: &Name, defn_form: bool) -> Option<u32> {
        match self.find_symbol(name, defn_form) {
            Some(Export::Function(i)) => Some(i),
            _ => None,
        }
    }

    pub fn find_class(&self, name: &Name, defn_form: bool) -> Option<u32> {
        match self.find_symbol(name, defn_form) {
            Some(Export::Class(i)) => Some(i),
            _ => None,
        }
    }

    /// Visit the GC roots owned by this package: string blocks and
    /// object-typed globals.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut u64)) {
        for slot in self.strings.iter() {
            let mut word = slot.get();
            if object::Tagged::from_raw(word).is_block() {
                visitor(&mut word);
                slot.set(word);
            }
        }
        for global in self.globals.iter() {
            global.visit_root(visitor);
        }
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("globals", &self.globals.len())
            .field("functions", &self.functions.len())
            .field("classes", &self.classes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_and_order() {
        let v1 = PackageVersion::parse("1.2.3").unwrap();
        assert_eq!(v1, PackageVersion([1, 2, 3]));
        assert_eq!(PackageVersion::parse("2").unwrap(), PackageVersion([2, 0, 0]));
        assert!(PackageVersion::parse("").is_none());
        assert!(PackageVersion::parse("1.2.3.4").is_none());
        assert!(PackageVersion::parse("x").is_none());
        assert!(PackageVersion([1, 0, 0]) < PackageVersion([1, 0, 1]));
        assert!(PackageVersion([0, 9, 9]) < PackageVersion([1, 0, 0]));
    }

    #[test]
    fn dependency_satisfaction_window() {
        let name = Name::from_source_string("dep").unwrap();
        let dep = PackageDependency {
            name: name.clone(),
            min_version: Some(PackageVersion([1, 0, 0])),
            max_version: Some(PackageVersion([2, 0, 0])),
            package: 0,
            linked_globals: Box::new([]),
            linked_functions: Box::new([]),
            linked_classes: Box::new([]),
            linked_type_params: Box::new([]),
        };
        assert!(dep.is_satisfied_by(&name, PackageVersion([1, 5, 0])));
        assert!(dep.is_satisfied_by(&name, PackageVersion([1, 0, 0])));
        assert!(!dep.is_satisfied_by(&name, PackageVersion([2, 0, 1])));
        let other = Name::from_source_string("other").unwrap();
        assert!(!dep.is_satisfied_by(&other, PackageVersion([1, 5, 0])));
    }
}
