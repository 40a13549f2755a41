//! Address types for translation tables.
//!
//! Both address kinds are stored as `u64` regardless of the host pointer width:
//! translation tables describe the device's or CPU's view of memory, not the
//! view of the code that edits them.

use core::fmt;
use core::ops::{Add, Sub};

/// Maximum physical address width any supported descriptor format can encode.
pub const MAX_PHYSICAL_BITS: u32 = 52;

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The zero address.
            pub const fn zero() -> Self {
                Self(0)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: u64) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: u64) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: u64) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self::new((self.0 + align - 1) & !(align - 1))
            }

            /// Adds `offset`, returning `None` on overflow or if the result is not a valid address.
            #[inline]
            pub fn checked_add(self, offset: u64) -> Option<Self> {
                self.0.checked_add(offset).and_then(Self::try_new)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(addr: $name) -> u64 {
                addr.0
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<u64> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u64) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are limited to the 52 bits a page-table descriptor can hold."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the maximum physical address width.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        assert!(
            addr >> MAX_PHYSICAL_BITS == 0,
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Creates a new physical address, returning `None` if it is too wide.
    #[inline]
    pub const fn try_new(addr: u64) -> Option<Self> {
        if addr >> MAX_PHYSICAL_BITS == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }
}

impl_address_common!(
    VirtualAddress,
    "An input address of a translation table.\n\n\
     For CPU tables this is a virtual address, for IOMMU tables it is the DMA address \
     a device puts on the bus. No canonical-form check is applied; each table format \
     rejects addresses outside its own input range."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Always succeeds; present so both address kinds share one interface.
    #[inline]
    pub const fn try_new(addr: u64) -> Option<Self> {
        Some(Self(addr))
    }

    /// Returns the index into a table whose entries each span `1 << page_size_log2`
    /// bytes and that holds `entries` entries.
    #[inline]
    pub const fn table_index(self, page_size_log2: u32, entries: usize) -> usize {
        ((self.0 >> page_size_log2) as usize) & (entries - 1)
    }
}
