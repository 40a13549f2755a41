//! Intel VT-d legacy second-level (stage-2) table format.

use super::{FOUR_LEVELS, Level, LevelKind, TableFormat};
use crate::{PageFlags, PhysicalAddress};

/// Second-level translation tables walked by the IOMMU on behalf of a device.
///
/// A descriptor is present when it grants read or write access. Table links always
/// grant both so access is decided at the page.
#[derive(Debug, Clone, Copy)]
pub enum SecondLevel {}

impl SecondLevel {
    /// Read permission (bit 0).
    pub const READ: u64 = 1 << 0;

    /// Write permission (bit 1).
    pub const WRITE: u64 = 1 << 1;

    /// Page-size bit (bit 7); set on large pages.
    pub const PAGE_SIZE: u64 = 1 << 7;

    /// Accessed bit (bit 8), maintained by hardware.
    pub const ACCESSED: u64 = 1 << 8;

    /// Dirty bit (bit 9), maintained by hardware.
    pub const DIRTY: u64 = 1 << 9;

    /// Address bits 12..48.
    const ADDRESS_MASK: u64 = ((1 << 48) - 1) & !((1 << 12) - 1);
}

impl TableFormat for SecondLevel {
    const NAME: &'static str = "VT-d second-level";

    const LEVELS: &'static [Level] = FOUR_LEVELS;

    fn output_address_bits() -> u32 {
        48
    }

    fn is_present(descriptor: u64) -> bool {
        descriptor & (Self::READ | Self::WRITE) != 0
    }

    fn is_page(descriptor: u64, level: &Level) -> bool {
        match level.kind {
            LevelKind::Directory => false,
            LevelKind::LargePages => descriptor & Self::PAGE_SIZE != 0,
            LevelKind::Leaf => true,
        }
    }

    fn page_descriptor(address: PhysicalAddress, flags: PageFlags, level: &Level) -> u64 {
        let mut descriptor = Self::READ;
        if flags.is_writable() {
            descriptor |= Self::WRITE;
        }
        if level.kind == LevelKind::LargePages {
            descriptor |= Self::PAGE_SIZE;
        }
        let mask = Self::ADDRESS_MASK & !(level.page_size() - 1);
        descriptor | (address.as_u64() & mask)
    }

    fn table_descriptor(table: PhysicalAddress) -> u64 {
        Self::READ | Self::WRITE | (table.as_u64() & Self::ADDRESS_MASK)
    }

    fn address(descriptor: u64, level: &Level) -> PhysicalAddress {
        let mask = if Self::is_page(descriptor, level) {
            Self::ADDRESS_MASK & !(level.page_size() - 1)
        } else {
            Self::ADDRESS_MASK
        };
        PhysicalAddress::new(descriptor & mask)
    }

    fn page_flags(descriptor: u64) -> PageFlags {
        // Legacy second-level tables cannot express privilege or execute rights.
        PageFlags::dma_buffer().writable(descriptor & Self::WRITE != 0)
    }

    fn strip_hardware_bits(descriptor: u64) -> u64 {
        descriptor & !(Self::ACCESSED | Self::DIRTY)
    }
}
