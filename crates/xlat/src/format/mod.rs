//! Descriptor formats.
//!
//! A [`TableFormat`] describes the shape of a table hierarchy (its levels, from the
//! root downwards) and how a 64-bit descriptor encodes table links and pages. The
//! generic engine in [`crate::TranslationTable`] never looks at descriptor bits itself.

mod cpu;
mod second_level;

pub use cpu::CpuPaging;
pub use second_level::SecondLevel;

use crate::{PageFlags, PhysicalAddress};

/// What a table level may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    /// Only links to lower-level tables.
    Directory,
    /// Links to lower-level tables or large pages.
    LargePages,
    /// Only pages; the last level of the hierarchy.
    Leaf,
}

/// Shape of one level of a table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    /// Number of descriptors in a table of this level.
    pub entries: usize,
    /// Log2 of the bytes covered by one descriptor of this level.
    pub page_size_log2: u32,
    pub kind: LevelKind,
}

impl Level {
    /// A level of 512 descriptors.
    pub const fn new(page_size_log2: u32, kind: LevelKind) -> Self {
        Self {
            entries: crate::TABLE_ENTRIES,
            page_size_log2,
            kind,
        }
    }

    /// Bytes covered by one descriptor.
    #[inline]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_size_log2
    }

    /// Bytes covered by a whole table of this level.
    #[inline]
    pub const fn span(&self) -> u64 {
        self.page_size() * self.entries as u64
    }

    /// Returns whether a descriptor of this level may map a page.
    #[inline]
    pub const fn maps_pages(&self) -> bool {
        !matches!(self.kind, LevelKind::Directory)
    }
}

/// Descriptor encoding of a table hierarchy.
pub trait TableFormat {
    /// Human-readable name used in diagnostics.
    const NAME: &'static str;

    /// Levels from the root downwards. The last level is a [`LevelKind::Leaf`].
    const LEVELS: &'static [Level];

    /// Returns whether the descriptor is valid.
    fn is_present(descriptor: u64) -> bool;

    /// Returns whether a present descriptor at `level` maps a page rather than a table.
    fn is_page(descriptor: u64, level: &Level) -> bool;

    /// Encodes a page descriptor of `level`.
    fn page_descriptor(address: PhysicalAddress, flags: PageFlags, level: &Level) -> u64;

    /// Encodes a link to a lower-level table.
    fn table_descriptor(table: PhysicalAddress) -> u64;

    /// Extracts the address a descriptor of `level` points at.
    fn address(descriptor: u64, level: &Level) -> PhysicalAddress;

    /// Decodes the attributes of a page descriptor.
    fn page_flags(descriptor: u64) -> PageFlags;

    /// Clears the bits hardware updates on its own (accessed, dirty).
    fn strip_hardware_bits(descriptor: u64) -> u64;

    /// Number of physical address bits a descriptor can hold.
    fn output_address_bits() -> u32;

    /// Log2 of the smallest page.
    fn min_page_size_log2() -> u32 {
        Self::LEVELS[Self::LEVELS.len() - 1].page_size_log2
    }

    /// Log2 of the size of the input address space.
    fn input_address_bits() -> u32 {
        let root = &Self::LEVELS[0];
        root.page_size_log2 + root.entries.trailing_zeros()
    }
}

/// The standard four x86-64 levels: PML4, PDPT, PD, PT.
pub(crate) const FOUR_LEVELS: &[Level] = &[
    Level::new(39, LevelKind::Directory),
    Level::new(30, LevelKind::LargePages),
    Level::new(21, LevelKind::LargePages),
    Level::new(12, LevelKind::Leaf),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_level_geometry() {
        assert_eq!(FOUR_LEVELS[0].span(), 1 << 48);
        assert_eq!(FOUR_LEVELS[1].page_size(), 1 << 30);
        assert_eq!(FOUR_LEVELS[2].span(), 1 << 30);
        assert!(!FOUR_LEVELS[0].maps_pages());
        assert!(FOUR_LEVELS[3].maps_pages());
    }

    #[test]
    fn derived_sizes() {
        assert_eq!(SecondLevel::min_page_size_log2(), 12);
        assert_eq!(SecondLevel::input_address_bits(), 48);
        assert_eq!(CpuPaging::input_address_bits(), 48);
        assert_eq!(SecondLevel::output_address_bits(), 48);
        assert_eq!(CpuPaging::output_address_bits(), 52);
    }
}
