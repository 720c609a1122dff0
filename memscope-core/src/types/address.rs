/*!
Guest address value type.
*/

use std::fmt;
use std::ops;

/// A physical or virtual address in the inspected system.
///
/// Addresses are always carried as 64-bit values; 32-bit guests simply
/// never populate the upper half. Arithmetic wraps silently because the
/// walkers routinely compute `CONTAINING_RECORD`-style record bases
/// from untrusted link pointers and validate the result afterwards —
/// an overflow must surface as a rejected address, not a panic.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub struct Address(u64);

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(u64::from(value))
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl Address {
    /// The zero address. Guest structures use 0 as their universal
    /// "no pointer" marker, so this doubles as the absent value.
    pub const NULL: Address = Address(0);

    pub const fn null() -> Self {
        Address::NULL
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Rounds down to the start of the containing page.
    ///
    /// ```
    /// use memscope_core::types::{size, Address};
    ///
    /// let va = Address::from(0xffff_8000_0012_3456u64);
    /// assert_eq!(va.as_page_aligned(size::kb(4)).as_u64(), 0xffff_8000_0012_3000);
    /// ```
    pub const fn as_page_aligned(self, page_size: usize) -> Address {
        Address(self.0 - self.0 % (page_size as u64))
    }

    /// Byte offset into the containing 4k page.
    pub const fn page_offset(self) -> usize {
        (self.0 & 0xfff) as usize
    }
}

impl ops::Add<usize> for Address {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0.wrapping_add(other as u64))
    }
}

impl ops::AddAssign<usize> for Address {
    fn add_assign(&mut self, other: usize) {
        *self = Self(self.0.wrapping_add(other as u64))
    }
}

/// Distance between two addresses in bytes.
impl ops::Sub for Address {
    type Output = usize;

    fn sub(self, other: Self) -> usize {
        self.0.wrapping_sub(other.0) as usize
    }
}

impl ops::Sub<usize> for Address {
    type Output = Address;

    fn sub(self, other: usize) -> Address {
        Self(self.0.wrapping_sub(other as u64))
    }
}

impl ops::SubAssign<usize> for Address {
    fn sub_assign(&mut self, other: usize) {
        *self = Self(self.0.wrapping_sub(other as u64))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::UpperHex for Address {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}
impl fmt::LowerHex for Address {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::size;
    use super::*;

    #[test]
    fn test_null_and_default() {
        assert!(Address::NULL.is_null());
        assert!(Address::default().is_null());
        assert!(!Address::from(0xffff_8000_0000_1000u64).is_null());
    }

    #[test]
    fn test_conversions() {
        let va = Address::from(0x8042_1000u32);
        assert_eq!(va.as_u64(), 0x8042_1000);
        assert_eq!(va.as_usize(), 0x8042_1000);
        assert_eq!(Address::from(0xffff_8000_0000_0000u64).as_u32(), 0);
    }

    #[test]
    fn test_page_math() {
        let va = Address::from(0xffff_8000_0012_3456u64);
        assert_eq!(
            va.as_page_aligned(size::kb(4)),
            Address::from(0xffff_8000_0012_3000u64)
        );
        assert_eq!(va.page_offset(), 0x456);
        assert_eq!(va.as_page_aligned(0x10000).page_offset(), 0);
    }

    #[test]
    fn test_arithmetic_wraps() {
        let link = Address::from(0x1000u64);
        assert_eq!(link + 0x18, Address::from(0x1018u64));
        assert_eq!(link - Address::from(0x0f00u64), 0x100);
        // a bogus back-link below the record offset must wrap, not panic
        let rec = Address::from(8u64) - 0x10;
        assert_eq!(rec.as_u64(), 0xffff_ffff_ffff_fff8);
    }
}
