use std::cell::Cell;

use object::Tagged;

use crate::id::DefnFlags;
use crate::name::Name;
use crate::ty::Type;

/// A module-level named slot. The slot starts in the *uninitialized* state —
/// distinct from holding null — and every load checks for the sentinel.
pub struct Global {
    pub name: Name,
    pub source_name: Name,
    pub flags: DefnFlags,
    pub ty: Type,
    value: Cell<u64>,
}

impl Global {
    pub fn new(name: Name, source_name: Name, flags: DefnFlags, ty: Type) -> Global {
        Global {
            name,
            source_name,
            flags,
            ty,
            value: Cell::new(Tagged::UNINITIALIZED.raw()),
        }
    }

    #[inline(always)]
    pub fn raw_value(&self) -> u64 {
        self.value.get()
    }

    #[inline(always)]
    pub fn set_raw_value(&self, value: u64) {
        self.value.set(value);
    }

    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.value.get() != Tagged::UNINITIALIZED.raw()
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(DefnFlags::CONST)
    }

    /// Root visitation for the collector: object-typed globals holding a
    /// block pointer are live slots.
    pub fn visit_root(&self, visitor: &mut dyn FnMut(&mut u64)) {
        if !self.ty.is_object() {
            return;
        }
        let mut word = self.value.get();
        if Tagged::from_raw(word).is_block() {
            visitor(&mut word);
            self.value.set(word);
        }
    }
}

impl std::fmt::Debug for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Global")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
