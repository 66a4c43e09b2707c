//! Handle: pointer-sized object token handed to native code
//!
//! # Encoding
//!
//! ```text
//! false:   0b000
//! true:    0b010
//! nil:     0b100
//! undef:   0b110
//! fixnum:  (n << 1) | 1                          (63-bit signed payload)
//! object:  ((generation << 32) | (index + 1)) << 3   (multiple of 8, >= 8)
//! ```
//!
//! Object handles carry a dense slot index so the bridge resolves them with
//! an array lookup, and a slot generation so a handle kept past its lifetime
//! never silently resolves to whatever object reused the slot.

use std::fmt;

const _: () = assert!(usize::BITS == 64, "handle encoding requires 64-bit pointers");

const FALSE_BITS: usize = 0x0;
const TRUE_BITS: usize = 0x2;
const NIL_BITS: usize = 0x4;
const UNDEF_BITS: usize = 0x6;

const FIXNUM_FLAG: usize = 0x1;
const OBJECT_SHIFT: u32 = 3;
const INDEX_MASK: usize = 0xFFFF_FFFF;
const GENERATION_SHIFT: u32 = 32;
const GENERATION_MASK: u32 = (1 << 29) - 1;

/// Largest integer representable as an immediate fixnum handle
pub const FIXNUM_MAX: i64 = i64::MAX >> 1;

/// Smallest integer representable as an immediate fixnum handle
pub const FIXNUM_MIN: i64 = i64::MIN >> 1;

/// Largest slot index an object handle can encode
pub const MAX_SLOT_INDEX: u32 = u32::MAX - 1;

/// Opaque object token passed across the native boundary.
///
/// Immediates (`false`, `true`, `nil`, fixnums) are self-describing and never
/// touch the handle table. Object handles are only meaningful to the runtime
/// that issued them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(usize);

impl Handle {
    /// The `false` singleton
    pub const FALSE: Handle = Handle(FALSE_BITS);
    /// The `true` singleton
    pub const TRUE: Handle = Handle(TRUE_BITS);
    /// The `nil` singleton
    pub const NIL: Handle = Handle(NIL_BITS);
    /// Marker for "no value" (never visible to managed code)
    pub const UNDEF: Handle = Handle(UNDEF_BITS);

    /// Reinterpret raw bits as a handle
    #[inline(always)]
    pub const fn from_bits(bits: usize) -> Self {
        Handle(bits)
    }

    /// Raw bits of this handle
    #[inline(always)]
    pub const fn to_bits(self) -> usize {
        self.0
    }

    /// Boolean singleton for `b`
    #[inline]
    pub const fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// Fixnum handle for `n`, or `None` if `n` needs a boxed integer
    #[inline]
    pub const fn fixnum(n: i64) -> Option<Self> {
        if n < FIXNUM_MIN || n > FIXNUM_MAX {
            return None;
        }
        Some(Handle(((n << 1) as usize) | FIXNUM_FLAG))
    }

    /// Decode a fixnum handle
    #[inline]
    pub const fn as_fixnum(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// Build an object handle from a slot index and generation.
    ///
    /// Generations wrap at 29 bits.
    #[inline]
    pub const fn object(index: u32, generation: u32) -> Self {
        assert!(index <= MAX_SLOT_INDEX, "slot index out of range");
        let raw = (((generation & GENERATION_MASK) as usize) << GENERATION_SHIFT)
            | (index as usize + 1);
        Handle(raw << OBJECT_SHIFT)
    }

    /// Slot index of an object handle
    #[inline]
    pub const fn slot_index(self) -> Option<u32> {
        if !self.is_object() {
            return None;
        }
        Some((((self.0 >> OBJECT_SHIFT) & INDEX_MASK) - 1) as u32)
    }

    /// Slot generation of an object handle
    #[inline]
    pub const fn generation(self) -> Option<u32> {
        if !self.is_object() {
            return None;
        }
        Some(((self.0 >> OBJECT_SHIFT) >> GENERATION_SHIFT) as u32 & GENERATION_MASK)
    }

    /// Next generation after `generation`, wrapping at the encodable width
    #[inline]
    pub const fn next_generation(generation: u32) -> u32 {
        (generation + 1) & GENERATION_MASK
    }

    /// Check whether this is a fixnum
    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_FLAG != 0
    }

    /// Check whether this handle refers to a table slot
    #[inline(always)]
    pub const fn is_object(self) -> bool {
        self.0 & 0x7 == 0 && self.0 >= (1 << OBJECT_SHIFT) && self.0 & (INDEX_MASK << OBJECT_SHIFT) != 0
    }

    /// Check whether this handle is self-describing
    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        !self.is_object()
    }

    /// Check for `nil`
    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.0 == NIL_BITS
    }

    /// Ruby-style truthiness: everything except `false` and `nil`
    #[inline(always)]
    pub const fn is_truthy(self) -> bool {
        self.0 != FALSE_BITS && self.0 != NIL_BITS
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FALSE_BITS => write!(f, "Handle::FALSE"),
            TRUE_BITS => write!(f, "Handle::TRUE"),
            NIL_BITS => write!(f, "Handle::NIL"),
            UNDEF_BITS => write!(f, "Handle::UNDEF"),
            _ if self.is_fixnum() => write!(f, "Handle::Fixnum({})", (self.0 as i64) >> 1),
            _ => match (self.slot_index(), self.generation()) {
                (Some(index), Some(generation)) => {
                    write!(f, "Handle::Object(#{}@{})", index, generation)
                }
                _ => write!(f, "Handle::Invalid({:#x})", self.0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_distinct_immediates() {
        let all = [Handle::FALSE, Handle::TRUE, Handle::NIL, Handle::UNDEF];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_immediate());
            assert!(!a.is_fixnum());
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(!Handle::NIL.is_truthy());
        assert!(!Handle::FALSE.is_truthy());
        assert!(Handle::TRUE.is_truthy());
    }

    #[test]
    fn test_fixnum_limits() {
        assert_eq!(Handle::fixnum(0).unwrap().as_fixnum(), Some(0));
        assert_eq!(Handle::fixnum(-1).unwrap().as_fixnum(), Some(-1));
        assert_eq!(Handle::fixnum(FIXNUM_MAX).unwrap().as_fixnum(), Some(FIXNUM_MAX));
        assert_eq!(Handle::fixnum(FIXNUM_MIN).unwrap().as_fixnum(), Some(FIXNUM_MIN));
        assert!(Handle::fixnum(FIXNUM_MAX + 1).is_none());
        assert!(Handle::fixnum(i64::MIN).is_none());
        assert!(Handle::fixnum(7).unwrap().is_truthy());
    }

    #[test]
    fn test_object_handles_decode() {
        let h = Handle::object(0, 0);
        assert!(h.is_object());
        assert_eq!(h.to_bits() % 8, 0);
        assert_eq!(h.slot_index(), Some(0));
        assert_eq!(h.generation(), Some(0));

        let h = Handle::object(41, 7);
        assert_eq!(h.slot_index(), Some(41));
        assert_eq!(h.generation(), Some(7));
        assert_ne!(h, Handle::object(41, 8));
    }

    #[test]
    fn test_generation_wraps() {
        let last = GENERATION_MASK;
        assert_eq!(Handle::next_generation(last), 0);
        let h = Handle::object(3, last);
        assert_eq!(h.generation(), Some(last));
        assert_eq!(h.slot_index(), Some(3));
    }

    #[test]
    fn test_non_object_bits_do_not_decode() {
        assert_eq!(Handle::NIL.slot_index(), None);
        assert_eq!(Handle::fixnum(5).unwrap().slot_index(), None);
        // generation bits without an index are not a valid object handle
        assert!(!Handle::from_bits(1 << 40).is_object());
    }
}
