//! The virtual machine: loads compiled packages, manages a precise moving
//! heap, interprets typed stack bytecode, resolves cross-package references
//! and bridges calls to and from native host functions.

pub mod api;
mod builtins;
mod class;
mod error;
mod function;
mod global;
mod handles;
mod id;
mod interp;
mod loader;
mod name;
mod native;
mod package;
mod ptrmap;
pub mod raw;
mod stack;
mod table;
mod ty;

use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;

use heap::{Heap, RootProvider};
use object::{table_meta, BlockHeader, Meta, StrBlock, Tagged};

pub use builtins::Builtins;
pub use class::{Class, Field, TypeParameter};
pub use error::{LoadError, VmError};
pub use function::{Function, StackPointerMap};
pub use global::Global;
pub use handles::{Handle, HandleScope, Persistent};
pub use id::{builtin_id, builtin_index, is_builtin_id, DefnFlags, DefnKey, BUILTIN_PACKAGE};
pub use api::Arguments;
pub use interp::call_function;
pub use name::Name;
pub use native::{native_throw, symbol_name};
pub use package::{Export, Package, PackageDependency, PackageVersion};
pub use raw::{parse as parse_package, serialize as serialize_package, RawPackage};
pub use ty::{is_subtype, substitute, Bindings, Type};

pub mod builtin {
    //! Builtin definition keys, re-exported for hosts and tests.
    pub use crate::builtins::*;
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u32 {
        /// Verify after every host-triggered collection that each root
        /// points into heap storage.
        const VERIFY_HEAP = 1 << 0;
    }
}

#[derive(Debug, Default, Clone)]
pub struct VmOptions {
    /// Ordered directories searched for `<name>.lpk` files; first match
    /// wins.
    pub search_paths: Vec<PathBuf>,
    pub flags: VmFlags,
}

/// One isolated virtual machine: heap, loaded packages, handle pools and
/// native bindings. Instances share nothing; execution is single-threaded
/// and strictly sequential.
pub struct VM {
    pub(crate) heap: Heap,
    packages: Vec<Box<Package>>,
    builtins: Builtins,
    table_entries_meta: Box<Meta>,
    options: VmOptions,
    pub(crate) natives: HashMap<String, usize>,
    handle_anchor: Box<handles::HandleAnchor>,
    persistent_pool: Box<handles::PersistentPool>,
    pub(crate) pending_exception: Cell<u64>,
    loading: Vec<Name>,
    /// Interpreters currently on the Rust call stack, outermost first.
    /// Their frames are GC roots.
    pub(crate) active_interpreters: Vec<*mut interp::Interpreter>,
}

impl VM {
    pub fn new(options: VmOptions) -> VM {
        VM {
            heap: Heap::new(object::trace_block, object::block_size),
            packages: Vec::new(),
            builtins: Builtins::new(),
            table_entries_meta: Box::new(table_meta(builtins::TABLE_CLASS.pack())),
            options,
            natives: HashMap::new(),
            handle_anchor: handles::HandleAnchor::new(),
            persistent_pool: handles::PersistentPool::new(),
            pending_exception: Cell::new(0),
            loading: Vec::new(),
            active_interpreters: Vec::new(),
        }
    }

    // ── Definition lookup ──────────────────────────────────────────

    pub fn package(&self, id: u32) -> &Package {
        &self.packages[id as usize]
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter().map(|p| p.as_ref())
    }

    pub fn find_package(&self, name: &Name) -> Option<u32> {
        self.packages.iter().find(|p| p.name == *name).map(|p| p.id)
    }

    pub fn class(&self, key: DefnKey) -> &Class {
        if key.is_builtin() {
            &self.builtins.classes[key.index as usize]
        } else {
            self.package(key.package).class(key.index)
        }
    }

    pub fn function(&self, key: DefnKey) -> &Function {
        if key.is_builtin() {
            &self.builtins.functions[key.index as usize]
        } else {
            self.package(key.package).function(key.index)
        }
    }

    pub fn global(&self, key: DefnKey) -> &Global {
        debug_assert!(!key.is_builtin());
        self.package(key.package).global(key.index)
    }

    pub fn type_parameter(&self, key: DefnKey) -> &TypeParameter {
        debug_assert!(!key.is_builtin());
        self.package(key.package).type_parameter(key.index)
    }

    pub fn builtin_class_count(&self) -> usize {
        self.builtins.classes.len()
    }

    pub fn builtin_function_count(&self) -> usize {
        self.builtins.functions.len()
    }

    pub(crate) fn table_entries_meta(&self) -> &Meta {
        &self.table_entries_meta
    }

    /// Supertype-chain walk.
    pub fn is_subclass_of(&self, class: DefnKey, base: DefnKey) -> bool {
        let mut current = class;
        loop {
            if current == base {
                return true;
            }
            match &self.class(current).supertype {
                Some(supertype) => current = supertype.as_class(),
                None => return false,
            }
        }
    }

    /// The topmost ancestor method `key` overrides: the vtable key for
    /// dynamic dispatch.
    pub fn root_override(&self, key: DefnKey) -> DefnKey {
        let mut current = key;
        loop {
            match self.function(current).overrides.first() {
                Some(&parent) => current = parent,
                None => return current,
            }
        }
    }

    // ── Handles ────────────────────────────────────────────────────

    /// Open a handle scope. Scopes must drop in LIFO order.
    pub fn handle_scope(&self) -> HandleScope {
        let anchor =
            &*self.handle_anchor as *const handles::HandleAnchor as *mut handles::HandleAnchor;
        // SAFETY: the anchor box lives as long as the VM, which outlives any
        // correctly used scope; LIFO order is the documented contract.
        unsafe { HandleScope::new(anchor) }
    }

    /// Root a block in the persistent pool; it survives until the handle is
    /// dropped.
    pub fn persistent(&mut self, word: u64) -> Persistent {
        let pool: *mut handles::PersistentPool = &mut *self.persistent_pool;
        // SAFETY: the pool box lives as long as the VM.
        unsafe { Persistent::new(pool, word) }
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Allocate and header-initialize a block. Every unrooted reference is
    /// invalid after this call: the collector may have run and moved blocks.
    pub(crate) fn allocate_block(
        &mut self,
        meta: *const Meta,
        size: usize,
    ) -> Result<*mut u8, VmError> {
        let vm: *mut VM = self;
        let mut roots = VmRoots { vm };
        let block = self.heap.allocate(size, &mut roots)?;
        let stamp = self.heap.next_stamp();
        // SAFETY: freshly allocated block storage.
        unsafe { BlockHeader::init(block, meta, stamp) };
        Ok(block)
    }

    /// Allocation that never collects, for exception blocks raised at
    /// program counters without a pointer map.
    pub(crate) fn allocate_block_uncollected(
        &mut self,
        meta: *const Meta,
        size: usize,
    ) -> Result<*mut u8, VmError> {
        let block = self.heap.allocate_uncollected(size)?;
        let stamp = self.heap.next_stamp();
        // SAFETY: freshly allocated block storage.
        unsafe { BlockHeader::init(block, meta, stamp) };
        Ok(block)
    }

    /// Allocate an instance of `class_key` with reference fields set to the
    /// uninitialized sentinel.
    pub(crate) fn allocate_instance(&mut self, class_key: DefnKey) -> Result<*mut u8, VmError> {
        let (meta_ptr, size) = {
            let class = self.class(class_key);
            let meta = class.meta(class_key);
            (meta as *const Meta, class.instance_size() as usize)
        };
        let block = self.allocate_block(meta_ptr, size)?;
        // SAFETY: block was just allocated with this meta.
        unsafe { fill_reference_fields(block, &*meta_ptr) };
        Ok(block)
    }

    /// Allocate an array-like instance: the length field is written by the
    /// VM since it determines the block size.
    pub(crate) fn allocate_array(
        &mut self,
        class_key: DefnKey,
        length: i64,
    ) -> Result<*mut u8, VmError> {
        let (meta_ptr, instance_size) = {
            let class = self.class(class_key);
            let meta = class.meta(class_key);
            (meta as *const Meta, class.instance_size() as usize)
        };
        // SAFETY: metas are stable boxes.
        let meta = unsafe { &*meta_ptr };
        debug_assert!(meta.has_elements());
        let size = object::align_word(instance_size) + length as usize * meta.element_size() as usize;
        let block = self.allocate_block(meta_ptr, size)?;
        // SAFETY: block was just allocated with this meta and size.
        unsafe {
            object::store::<i64>(block, meta.length_offset() as usize, length);
            fill_reference_fields(block, meta);
            if meta.has_element_pointers() {
                let base = object::elements_offset(meta);
                let stride = meta.element_size() as usize;
                for i in 0..length as usize {
                    for word in 0..meta.element_word_count() {
                        if meta.element_pointer_at(word) {
                            object::store::<u64>(
                                block,
                                base + i * stride + word * 8,
                                Tagged::UNINITIALIZED.raw(),
                            );
                        }
                    }
                }
            }
        }
        Ok(block)
    }

    /// Allocate a string block with the given content.
    pub(crate) fn allocate_string(&mut self, bytes: &[u8]) -> Result<u64, VmError> {
        let meta: *const Meta = {
            let class = self.class(builtins::STRING_CLASS);
            class.meta(builtins::STRING_CLASS)
        };
        let size = object::STR_INSTANCE_SIZE as usize + bytes.len();
        let block = self.allocate_block(meta, size)?;
        // SAFETY: block was just allocated with room for the content.
        unsafe { StrBlock::init(block, bytes) };
        Ok(block as u64)
    }

    /// Materialize the heap strings of a registered package's string pool.
    pub(crate) fn allocate_package_strings(&mut self, id: u32) -> Result<(), VmError> {
        for index in 0..self.package(id).string_data.len() {
            let bytes: Vec<u8> = self.package(id).string_data[index].bytes().collect();
            let block = self.allocate_string(&bytes)?;
            self.package(id).strings[index].set(block);
        }
        Ok(())
    }

    /// Host-triggered full collection.
    pub fn collect_garbage(&mut self) -> Result<(), VmError> {
        let vm: *mut VM = self;
        let mut roots = VmRoots { vm };
        self.heap.collect_full(&mut roots)?;
        if self.options.flags.contains(VmFlags::VERIFY_HEAP) {
            self.verify_heap();
        }
        Ok(())
    }

    /// Walk every root and check it points into heap storage.
    pub fn verify_heap(&mut self) {
        let heap: *const Heap = &self.heap;
        self.visit_roots(&mut |slot| {
            let addr = *slot as usize;
            // SAFETY: the heap is not mutated while roots are walked.
            assert!(
                unsafe { (*heap).contains(addr) },
                "root 0x{addr:x} points outside the heap"
            );
        });
    }

    pub fn heap_stats(&self) -> (u64, u64) {
        (self.heap.minor_collections(), self.heap.full_collections())
    }

    // ── Natives ────────────────────────────────────────────────────

    /// Register a host function under its canonical symbol name. Takes
    /// precedence over process-global symbol lookup.
    pub fn register_native(&mut self, symbol: &str, address: usize) {
        self.natives.insert(symbol.to_string(), address);
    }

    // ── Loading bookkeeping ────────────────────────────────────────

    pub(crate) fn search_paths(&self) -> &[PathBuf] {
        &self.options.search_paths
    }

    pub(crate) fn next_package_id(&self) -> u32 {
        self.packages.len() as u32
    }

    pub(crate) fn register_package(&mut self, package: Package) -> u32 {
        let id = package.id;
        debug_assert_eq!(id as usize, self.packages.len());
        self.packages.push(Box::new(package));
        id
    }

    pub(crate) fn is_loading(&self, name: &Name) -> bool {
        self.loading.contains(name)
    }

    pub(crate) fn push_loading(&mut self, name: Name) {
        self.loading.push(name);
    }

    pub(crate) fn pop_loading(&mut self) {
        self.loading.pop();
    }

    // ── Roots ──────────────────────────────────────────────────────

    pub(crate) fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut u64)) {
        for package in &self.packages {
            package.visit_roots(visitor);
        }
        self.handle_anchor.visit_roots(visitor);
        self.persistent_pool.visit_roots(visitor);

        let mut pending = self.pending_exception.get();
        if Tagged::from_raw(pending).is_block() {
            visitor(&mut pending);
            self.pending_exception.set(pending);
        }

        for &interp in &self.active_interpreters {
            // SAFETY: active interpreters live on the Rust call stack below
            // us and deregister before returning.
            unsafe { (*interp).visit_frames(self, visitor) };
        }
    }
}

/// Fill the words marked in the instance pointer map with the uninitialized
/// sentinel, so loads of never-assigned reference fields can be detected.
///
/// # Safety
///
/// `block` must be a freshly allocated block of `meta`'s layout.
unsafe fn fill_reference_fields(block: *mut u8, meta: &Meta) {
    if !meta.has_pointers() {
        return;
    }
    for word in 0..meta.object_word_count() {
        if meta.object_pointer_at(word) {
            object::store::<u64>(block, word * 8, Tagged::UNINITIALIZED.raw());
        }
    }
}

/// Root provider handed to the heap. Holds the VM as a raw pointer because
/// the heap it collects is a field of the same VM; the visitation path never
/// touches heap internals.
pub(crate) struct VmRoots {
    vm: *mut VM,
}

impl RootProvider for VmRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut u64)) {
        // SAFETY: constructed from a live &mut VM at each collection site.
        unsafe { (*self.vm).visit_roots(visitor) };
    }
}
