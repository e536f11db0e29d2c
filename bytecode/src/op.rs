/// Bytecode opcodes, one byte each.
///
/// Operands are signed variable-length integers ([`read_vbn`](crate::read_vbn))
/// unless noted. `F32`/`F64` carry raw little-endian immediates. Branch
/// operands are *block indices* into the function's block-offset table, not
/// byte offsets.
///
/// The `*F` forms (`LdGF`, `CallGF`, ...) address definitions of a package
/// dependency: their first operand is the dependency index, the second the
/// extern definition index within that dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,

    /// Pop the return value and leave the current frame.
    Ret,
    /// Unconditional jump. Operands: `block:vbn`
    Branch,
    /// Pop a boolean guard. Operands: `true_block:vbn`, `false_block:vbn`
    BranchIf,
    /// Pop a label and jump to it. Operands: `count:vbn`, then `count` block
    /// indices naming the possible successors.
    BranchL,
    /// Push a label value. Operands: `block:vbn`
    Label,
    /// Install an exception handler. Operands: `try_block:vbn`, `catch_block:vbn`
    PushTry,
    /// Remove the innermost handler. Operands: `done_block:vbn`
    PopTry,
    /// Pop an exception and unwind to the innermost handler.
    Throw,

    Drop,
    /// Pop `count` slots. Operands: `count:vbn`
    DropI,
    Dup,
    /// Push a copy of the slot `index` below the top. Operands: `index:vbn`
    DupI,
    /// Swap the top two slots.
    Swap,
    /// Swap the top slot with the slot two below it.
    Swap2,

    Unit,
    True,
    False,
    Nul,
    Uninitialized,
    /// Operands: `value:vbn`
    I8,
    I16,
    I32,
    I64,
    /// Operand: 4 raw little-endian bytes.
    F32,
    /// Operand: 8 raw little-endian bytes.
    F64,
    /// Push a string from the package string table. Operands: `index:vbn`
    String,

    /// Operands: `slot:vbn` — parameters at 0.., locals at -1 and down.
    LdLocal,
    StLocal,

    /// Operands: `global:vbn`
    LdG,
    /// Operands: `dep:vbn`, `extern:vbn`
    LdGF,
    StG,
    StGF,

    /// Pop a receiver, push a field. Operands: `class:vbn`, `name:vbn`
    LdF,
    /// Operands: `dep:vbn`, `extern:vbn`, `name:vbn`
    LdFF,
    /// Pop receiver and value. Operands: `class:vbn`, `name:vbn`
    StF,
    StFF,

    /// Pop receiver and index, push an element.
    LdE,
    /// Pop receiver, index and value.
    StE,

    /// Operands: `class:vbn` — GC-safe point.
    AllocObj,
    AllocObjF,
    /// Pop a length. Operands: `class:vbn` — GC-safe point.
    AllocArr,
    AllocArrF,

    /// Push a static type argument. Operands: `inst_type:vbn`
    Tys,
    /// Push a type argument and a Type value. Operands: `inst_type:vbn`
    Tyd,
    /// Consume one type argument, cast the top of stack.
    Cast,
    /// Consume one type argument, pop a Type value, cast the top of stack.
    CastC,
    /// As CastC, but branch on success instead of throwing.
    /// Operands: `true_block:vbn`, `false_block:vbn`
    CastCBr,

    /// Operands: `function:vbn` — GC-safe point.
    CallG,
    /// Virtual call through the receiver's vtable. Operands: `function:vbn`
    CallV,
    /// Operands: `dep:vbn`, `extern:vbn`
    CallGF,
    CallVF,
    /// Push a package value. Operands: `dep:vbn`
    Pkg,

    AddI8,
    SubI8,
    MulI8,
    DivI8,
    ModI8,
    LslI8,
    LsrI8,
    AsrI8,
    AndI8,
    OrI8,
    XorI8,

    AddI16,
    SubI16,
    MulI16,
    DivI16,
    ModI16,
    LslI16,
    LsrI16,
    AsrI16,
    AndI16,
    OrI16,
    XorI16,

    AddI32,
    SubI32,
    MulI32,
    DivI32,
    ModI32,
    LslI32,
    LsrI32,
    AsrI32,
    AndI32,
    OrI32,
    XorI32,

    AddI64,
    SubI64,
    MulI64,
    DivI64,
    ModI64,
    LslI64,
    LsrI64,
    AsrI64,
    AndI64,
    OrI64,
    XorI64,

    AddF32,
    SubF32,
    MulF32,
    DivF32,
    AddF64,
    SubF64,
    MulF64,
    DivF64,

    EqI8,
    NeI8,
    LtI8,
    LeI8,
    GtI8,
    GeI8,
    EqI16,
    NeI16,
    LtI16,
    LeI16,
    GtI16,
    GeI16,
    EqI32,
    NeI32,
    LtI32,
    LeI32,
    GtI32,
    GeI32,
    EqI64,
    NeI64,
    LtI64,
    LeI64,
    GtI64,
    GeI64,
    EqF32,
    NeF32,
    LtF32,
    LeF32,
    GtF32,
    GeF32,
    EqF64,
    NeF64,
    LtF64,
    LeF64,
    GtF64,
    GeF64,
    /// Pointer equality.
    EqP,
    NeP,

    NegI8,
    NegI16,
    NegI32,
    NegI64,
    NegF32,
    NegF64,
    InvI8,
    InvI16,
    InvI32,
    InvI64,
    NotB,

    TruncI8,
    TruncI16,
    TruncI32,
    /// f64 → f32.
    TruncF32,
    SextI16_8,
    SextI32_8,
    SextI32_16,
    SextI64_8,
    SextI64_16,
    SextI64_32,
    ZextI16,
    ZextI32,
    ZextI64,
    /// f32 → f64.
    ExtF64,
    /// f32 → i32 numeric conversion.
    FcvtI32,
    /// f64 → i64 numeric conversion.
    FcvtI64,
    /// i32 → f32 numeric conversion.
    IcvtF32,
    /// i64 → f64 numeric conversion.
    IcvtF64,
    /// Bit reinterpretation; no stack effect beyond the type.
    FtoI32,
    FtoI64,
    ItoF32,
    ItoF64,
}

impl Opcode {
    pub const COUNT: usize = Opcode::ItoF64 as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Opcode::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!((byte as usize) < Self::COUNT, "invalid opcode: 0x{byte:02x}");
        core::mem::transmute::<u8, Opcode>(byte)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: Opcode is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, Opcode>(byte) })
        } else {
            Err(byte)
        }
    }
}
