use bitflags::bitflags;

/// Package index of builtin definitions.
pub const BUILTIN_PACKAGE: u32 = u32::MAX;

/// Sentinel for "no definition" in packed form.
pub const NO_DEFN: u64 = u64::MAX;

/// Identifies one definition: a (package, table index) pair. Classes,
/// functions, globals and type parameters each have their own table, so a
/// key is only meaningful together with the definition kind.
///
/// Keys break the Class ↔ Type recursion: a type can name a class whose slot
/// has not been filled yet, which is how the loader reserves shells before
/// reading class bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefnKey {
    pub package: u32,
    pub index: u32,
}

impl DefnKey {
    pub const fn new(package: u32, index: u32) -> DefnKey {
        DefnKey { package, index }
    }

    pub const fn builtin(index: u32) -> DefnKey {
        DefnKey { package: BUILTIN_PACKAGE, index }
    }

    pub const fn is_builtin(&self) -> bool {
        self.package == BUILTIN_PACKAGE
    }

    /// Pack into one word, e.g. for a Meta's class link or a stack frame.
    pub const fn pack(&self) -> u64 {
        ((self.package as u64) << 32) | self.index as u64
    }

    pub const fn unpack(word: u64) -> DefnKey {
        DefnKey { package: (word >> 32) as u32, index: word as u32 }
    }
}

/// Negative definition ids in package files and bytecode denote builtins:
/// builtin `n` is encoded as `-(n + 1)`.
pub fn is_builtin_id(id: i64) -> bool {
    id < 0
}

pub fn builtin_index(id: i64) -> u32 {
    debug_assert!(is_builtin_id(id));
    (-id - 1) as u32
}

pub fn builtin_id(index: u32) -> i64 {
    -(index as i64) - 1
}

bitflags! {
    /// Flags carried by globals, functions, classes and fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DefnFlags: u32 {
        const PUBLIC      = 1 << 0;
        const PROTECTED   = 1 << 1;
        const PRIVATE     = 1 << 2;
        const METHOD      = 1 << 3;
        const STATIC      = 1 << 4;
        const CONSTRUCTOR = 1 << 5;
        const ABSTRACT    = 1 << 6;
        const FINAL       = 1 << 7;
        const EXTERN      = 1 << 8;
        const NATIVE      = 1 << 9;
        /// Marks the length field of an array-like class.
        const ARRAY_LENGTH = 1 << 10;
        /// Marks a constant (non-assignable) global or field.
        const CONST       = 1 << 11;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let key = DefnKey::new(3, 17);
        assert_eq!(DefnKey::unpack(key.pack()), key);
        let builtin = DefnKey::builtin(5);
        assert!(builtin.is_builtin());
        assert_eq!(DefnKey::unpack(builtin.pack()), builtin);
    }

    #[test]
    fn builtin_id_mapping() {
        assert!(is_builtin_id(-1));
        assert!(!is_builtin_id(0));
        assert_eq!(builtin_index(-1), 0);
        assert_eq!(builtin_index(-13), 12);
        assert_eq!(builtin_id(builtin_index(-7)), -7);
    }
}
