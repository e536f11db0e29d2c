use crate::bitmap::{Bitmap, BITS_PER_WORD};
use crate::header::WORD_SIZE;

/// Discriminates the fixed block layouts the collector must know about.
///
/// `Object` covers every class instance, including array-likes: the Meta
/// fully describes the layout. `Str` and `Table` are builtin blocks with
/// layouts the tracer special-cases (a table's value slots hold tagged words
/// rather than raw pointers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Object = 0,
    Str,
    Table,
}

/// Descriptor of one concrete class's instance layout.
///
/// A Meta is built once per class, after the class's fields and supertype are
/// known, and owned by the class (or by the VM roots for builtins). Metas are
/// ordinary Rust allocations: they are never moved by the collector, so the
/// meta pointer in every block header stays valid across collections.
pub struct Meta {
    kind: BlockKind,
    /// Packed key of the defining class; resolved through the VM.
    class_key: u64,
    /// Byte size of the fixed part of an instance, header included.
    instance_size: u32,
    /// Byte size of one element, 0 for non-array classes.
    element_size: u32,
    /// Byte offset of the i64 length field for array-like classes.
    length_offset: u32,
    has_pointers: bool,
    has_element_pointers: bool,
    /// One bit per word of the fixed instance area, header words included.
    object_ptr_words: Box<[u64]>,
    object_ptr_bits: u32,
    /// One bit per word of a single element.
    element_ptr_words: Box<[u64]>,
    element_ptr_bits: u32,
}

impl Meta {
    pub fn new(
        kind: BlockKind,
        class_key: u64,
        instance_size: u32,
        element_size: u32,
        length_offset: u32,
    ) -> Meta {
        debug_assert!(instance_size as usize % WORD_SIZE == 0 || element_size == 1);
        let object_bits = (instance_size as usize).div_ceil(WORD_SIZE);
        let element_bits = (element_size as usize).div_ceil(WORD_SIZE);
        Meta {
            kind,
            class_key,
            instance_size,
            element_size,
            length_offset,
            has_pointers: false,
            has_element_pointers: false,
            object_ptr_words: vec![0u64; Bitmap::words_for_bits(object_bits)]
                .into_boxed_slice(),
            object_ptr_bits: object_bits as u32,
            element_ptr_words: vec![0u64; Bitmap::words_for_bits(element_bits)]
                .into_boxed_slice(),
            element_ptr_bits: element_bits as u32,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    #[inline(always)]
    pub fn class_key(&self) -> u64 {
        self.class_key
    }

    #[inline(always)]
    pub fn instance_size(&self) -> u32 {
        self.instance_size
    }

    #[inline(always)]
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    #[inline(always)]
    pub fn has_elements(&self) -> bool {
        self.element_size > 0
    }

    #[inline(always)]
    pub fn length_offset(&self) -> u32 {
        debug_assert!(self.has_elements());
        self.length_offset
    }

    #[inline(always)]
    pub fn has_pointers(&self) -> bool {
        self.has_pointers
    }

    #[inline(always)]
    pub fn has_element_pointers(&self) -> bool {
        self.has_element_pointers
    }

    /// Mark the instance word at `word_index` as holding a reference.
    pub fn set_object_pointer(&mut self, word_index: usize) {
        let mut bm = Bitmap::new(&mut self.object_ptr_words, self.object_ptr_bits as usize);
        bm.set(word_index, true);
        self.has_pointers = true;
    }

    /// Mark the word at `word_index` within each element as a reference.
    pub fn set_element_pointer(&mut self, word_index: usize) {
        let mut bm =
            Bitmap::new(&mut self.element_ptr_words, self.element_ptr_bits as usize);
        bm.set(word_index, true);
        self.has_element_pointers = true;
    }

    #[inline(always)]
    pub fn object_pointer_at(&self, word_index: usize) -> bool {
        debug_assert!(word_index < self.object_ptr_bits as usize);
        self.object_ptr_words[word_index / BITS_PER_WORD]
            >> (word_index % BITS_PER_WORD)
            & 1
            != 0
    }

    #[inline(always)]
    pub fn element_pointer_at(&self, word_index: usize) -> bool {
        debug_assert!(word_index < self.element_ptr_bits as usize);
        self.element_ptr_words[word_index / BITS_PER_WORD]
            >> (word_index % BITS_PER_WORD)
            & 1
            != 0
    }

    #[inline(always)]
    pub fn object_word_count(&self) -> usize {
        self.object_ptr_bits as usize
    }

    /// Words per element (elements smaller than a word carry no pointers).
    #[inline(always)]
    pub fn element_word_count(&self) -> usize {
        if self.element_size as usize >= WORD_SIZE {
            self.element_ptr_bits as usize
        } else {
            0
        }
    }
}

impl core::fmt::Debug for Meta {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Meta")
            .field("kind", &self.kind)
            .field("instance_size", &self.instance_size)
            .field("element_size", &self.element_size)
            .field("has_pointers", &self.has_pointers)
            .finish()
    }
}
