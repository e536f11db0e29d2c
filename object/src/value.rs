/// Tag constants.
const TAG_MASK: u64 = 0b1;
const NUMBER_TAG: u64 = 0b1;

/// A tagged 64-bit word.
///
/// Encoding:
/// - **Number**:  `...XXXX1` — 63-bit signed integer, value shifted left one.
/// - **Pointer**: `...XXX00` — block pointer (word-aligned, low bit 0).
///
/// The all-zero word is the null pointer. The *uninitialized* sentinel —
/// stored in globals, reference fields and locals that have never been
/// assigned — is a poison pattern that is pointer-tagged but not
/// word-aligned, so it can never name a real block, and load checks compare
/// whole slot words against it without colliding with small integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Tagged(u64);

impl Tagged {
    pub const NULL: Tagged = Tagged(0);
    pub const UNINITIALIZED: Tagged = Tagged(0xdead_beef_dead_bef2);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Numbers ────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_number(self) -> bool {
        self.0 & TAG_MASK == NUMBER_TAG
    }

    #[inline(always)]
    pub fn from_number(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "tagged number overflow: {n}"
        );
        Self(((n << 1) as u64) | NUMBER_TAG)
    }

    /// Extract the number payload.
    ///
    /// # Safety
    ///
    /// The word must be a number.
    #[inline(always)]
    pub unsafe fn number(self) -> i64 {
        debug_assert!(self.is_number());
        (self.0 as i64) >> 1
    }

    // ── Pointers ───────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_pointer(self) -> bool {
        self.0 & TAG_MASK == 0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_uninitialized(self) -> bool {
        self.0 == Self::UNINITIALIZED.0
    }

    /// True for pointers that actually name a block: non-null, non-sentinel.
    #[inline(always)]
    pub const fn is_block(self) -> bool {
        self.is_pointer() && self.0 != 0 && self.0 != Self::UNINITIALIZED.0
    }

    #[inline(always)]
    pub fn from_pointer<T>(ptr: *const T) -> Self {
        let addr = ptr as u64;
        debug_assert!(addr & 0b111 == 0, "pointer not word-aligned");
        Self(addr)
    }

    /// Extract the pointer payload.
    ///
    /// # Safety
    ///
    /// The word must be a pointer.
    #[inline(always)]
    pub unsafe fn pointer<T>(self) -> *mut T {
        debug_assert!(self.is_pointer());
        self.0 as *mut T
    }
}

impl core::fmt::Debug for Tagged {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_number() {
            write!(f, "Number({})", unsafe { self.number() })
        } else if self.is_null() {
            write!(f, "Null")
        } else if self.is_uninitialized() {
            write!(f, "Uninitialized")
        } else {
            write!(f, "Pointer(0x{:x})", self.0)
        }
    }
}
