//! Object handles
//!
//! Every "address" in the runtime is an `Obj`: an offset into a synthetic
//! 64-bit address space owned by the `Runtime`. Handles are resolved through
//! the address index on every access, so a stale handle can never reach
//! freed memory.

/// Size of one page in the synthetic address space.
pub const PAGE_SIZE: usize = 4096;

/// Number of page-relative address bits.
pub const PAGE_BITS: u32 = 12;

/// Size of a machine word inside page memory. All words are little-endian.
pub const WORD: usize = 8;

/// Usable bits of the synthetic address space.
pub const ADDR_BITS: u32 = 47;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(1usize << PAGE_BITS == PAGE_SIZE);

/// A handle to a byte of paged memory.
///
/// `Obj` is plain data: copying it never copies or aliases the underlying
/// storage. The null handle marks free reference cells and empty pointer
/// fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Obj(pub u64);

impl Obj {
    /// The null handle.
    pub const NULL: Obj = Obj(0);

    /// Reference-cell sentinel: alive only through weak referencers.
    pub const REF_MARK: Obj = Obj(1);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Advance the handle by `n` bytes.
    #[inline]
    pub fn add(self, n: usize) -> Obj {
        Obj(self.0 + n as u64)
    }

    /// Byte distance from `base` (which must not exceed `self`).
    #[inline]
    pub fn offset_from(self, base: Obj) -> usize {
        debug_assert!(self.0 >= base.0);
        (self.0 - base.0) as usize
    }

    /// The page-aligned base of the page containing this handle.
    #[inline]
    pub fn page_base(self) -> u64 {
        self.0 & !(PAGE_SIZE as u64 - 1)
    }
}

impl core::fmt::Debug for Obj {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Obj({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obj_arithmetic() {
        let a = Obj(0x7f00_1000);
        assert_eq!(a.add(0x123).offset_from(a), 0x123);
        assert_eq!(a.add(5).page_base(), 0x7f00_1000);
        assert!(Obj::NULL.is_null());
        assert!(!Obj::REF_MARK.is_null());
    }
}
