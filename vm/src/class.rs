use std::cell::OnceCell;
use std::collections::HashMap;

use object::{align_word, BlockKind, Meta, HEADER_SIZE};

use crate::id::{DefnFlags, DefnKey};
use crate::name::Name;
use crate::ty::Type;
use crate::VM;

#[derive(Debug)]
pub struct Field {
    pub name: Name,
    pub flags: DefnFlags,
    pub ty: Type,
}

#[derive(Debug)]
pub struct TypeParameter {
    pub name: Name,
    pub flags: DefnFlags,
    pub upper_bound: Type,
    pub lower_bound: Type,
}

/// One class definition. Created during package load, immutable afterwards
/// except for the lazily built instance Meta and vtable.
///
/// Field lists are flattened: the compiler emits inherited fields ahead of a
/// class's own, so offsets can be computed from this list alone.
pub struct Class {
    pub name: Name,
    pub source_name: Name,
    pub flags: DefnFlags,
    pub type_params: Box<[DefnKey]>,
    pub supertype: Option<Type>,
    pub fields: Box<[Field]>,
    pub constructors: Box<[DefnKey]>,
    pub methods: Box<[DefnKey]>,
    pub package: u32,
    pub element_type: Option<Type>,
    pub length_field_index: Option<u32>,
    field_offsets: Box<[u32]>,
    instance_size: u32,
    meta: OnceCell<Box<Meta>>,
    vtable: OnceCell<HashMap<u64, DefnKey>>,
}

impl Class {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Name,
        source_name: Name,
        flags: DefnFlags,
        type_params: Box<[DefnKey]>,
        supertype: Option<Type>,
        fields: Box<[Field]>,
        constructors: Box<[DefnKey]>,
        methods: Box<[DefnKey]>,
        package: u32,
        element_type: Option<Type>,
        length_field_index: Option<u32>,
    ) -> Class {
        let (field_offsets, instance_size) = layout_fields(&fields);
        Class {
            name,
            source_name,
            flags,
            type_params,
            supertype,
            fields,
            constructors,
            methods,
            package,
            element_type,
            length_field_index,
            field_offsets,
            instance_size,
            meta: OnceCell::new(),
            vtable: OnceCell::new(),
        }
    }

    /// For builtin classes whose Meta has a fixed, hand-built layout.
    pub fn with_fixed_meta(self, meta: Meta) -> Class {
        let _ = self.meta.set(Box::new(meta));
        self
    }

    pub fn instance_size(&self) -> u32 {
        self.instance_size
    }

    pub fn field_offset(&self, index: usize) -> u32 {
        self.field_offsets[index]
    }

    pub fn find_field(&self, name: &Name) -> Option<(usize, &Field)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == *name)
    }

    /// The instance Meta, built on first use once fields and supertype are
    /// known.
    pub fn meta(&self, self_key: DefnKey) -> &Meta {
        self.meta.get_or_init(|| Box::new(self.build_meta(self_key)))
    }

    fn build_meta(&self, self_key: DefnKey) -> Meta {
        let element_size = self
            .element_type
            .as_ref()
            .map(|ty| ty.type_size() as u32)
            .unwrap_or(0);
        let length_offset = self
            .length_field_index
            .map(|index| self.field_offsets[index as usize])
            .unwrap_or(0);
        let mut meta = Meta::new(
            BlockKind::Object,
            self_key.pack(),
            self.instance_size,
            element_size,
            length_offset,
        );
        for (index, field) in self.fields.iter().enumerate() {
            if field.ty.is_object() {
                let offset = self.field_offsets[index];
                debug_assert!(offset as usize % 8 == 0);
                meta.set_object_pointer(offset as usize / 8);
            }
        }
        if let Some(element_type) = &self.element_type {
            if element_type.is_object() {
                meta.set_element_pointer(0);
            }
        }
        meta
    }

    /// The vtable maps the packed key of a method's *root override* — the
    /// topmost ancestor method it overrides — to the implementation this
    /// class provides. Built by overlaying this class's methods onto the
    /// supertype's table.
    pub fn vtable(&self, vm: &VM) -> &HashMap<u64, DefnKey> {
        self.vtable.get_or_init(|| {
            let mut table = match &self.supertype {
                Some(supertype) => {
                    let parent_key = supertype.as_class();
                    vm.class(parent_key).vtable(vm).clone()
                }
                None => HashMap::new(),
            };
            for &method in self.methods.iter() {
                let root = vm.root_override(method);
                table.insert(root.pack(), method);
            }
            table
        })
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .field("methods", &self.methods.len())
            .field("instance_size", &self.instance_size)
            .finish()
    }
}

/// Field offsets follow declared order with natural alignment; the first
/// field sits right after the block header.
fn layout_fields(fields: &[Field]) -> (Box<[u32]>, u32) {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = HEADER_SIZE;
    for field in fields {
        let alignment = field.ty.alignment();
        offset = (offset + alignment - 1) & !(alignment - 1);
        offsets.push(offset as u32);
        offset += field.ty.type_size();
    }
    (offsets.into_boxed_slice(), align_word(offset) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: Type) -> Field {
        Field {
            name: Name::from_components([name]),
            flags: DefnFlags::PUBLIC,
            ty,
        }
    }

    #[test]
    fn layout_respects_natural_alignment() {
        let fields = [
            field("a", Type::I8),
            field("b", Type::I32),
            field("c", Type::I8),
            field("d", Type::I64),
        ];
        let (offsets, size) = layout_fields(&fields);
        assert_eq!(&offsets[..], &[16, 20, 24, 32]);
        assert_eq!(size, 40);
    }

    #[test]
    fn empty_class_is_header_sized() {
        let (offsets, size) = layout_fields(&[]);
        assert!(offsets.is_empty());
        assert_eq!(size, HEADER_SIZE as u32);
    }
}
