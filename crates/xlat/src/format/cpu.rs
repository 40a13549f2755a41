//! x86-64 four-level CPU paging format.

use x86_64::structures::paging::PageTableFlags;

use super::{FOUR_LEVELS, Level, LevelKind, TableFormat};
use crate::{PageFlags, PhysicalAddress};

/// x86-64 PML4-rooted page tables.
#[derive(Debug, Clone, Copy)]
pub enum CpuPaging {}

impl CpuPaging {
    /// Physical address bits 12-51.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Attributes given to every link so permissions are decided at the page.
    const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
        .union(PageTableFlags::WRITABLE)
        .union(PageTableFlags::USER_ACCESSIBLE);

    fn flags(descriptor: u64) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(descriptor)
    }
}

impl TableFormat for CpuPaging {
    const NAME: &'static str = "x86-64 paging";

    const LEVELS: &'static [Level] = FOUR_LEVELS;

    fn output_address_bits() -> u32 {
        52
    }

    fn is_present(descriptor: u64) -> bool {
        Self::flags(descriptor).contains(PageTableFlags::PRESENT)
    }

    fn is_page(descriptor: u64, level: &Level) -> bool {
        match level.kind {
            LevelKind::Directory => false,
            LevelKind::LargePages => Self::flags(descriptor).contains(PageTableFlags::HUGE_PAGE),
            LevelKind::Leaf => true,
        }
    }

    fn page_descriptor(address: PhysicalAddress, flags: PageFlags, level: &Level) -> u64 {
        let mut bits = PageTableFlags::PRESENT;
        bits.set(PageTableFlags::WRITABLE, flags.is_writable());
        bits.set(PageTableFlags::USER_ACCESSIBLE, flags.is_user());
        bits.set(PageTableFlags::NO_EXECUTE, flags.is_no_execute());
        bits.set(PageTableFlags::GLOBAL, flags.is_global());
        bits.set(
            PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH,
            flags.is_uncached(),
        );
        bits.set(
            PageTableFlags::HUGE_PAGE,
            level.kind == LevelKind::LargePages,
        );

        let mask = Self::ADDRESS_MASK & !(level.page_size() - 1);
        bits.bits() | (address.as_u64() & mask)
    }

    fn table_descriptor(table: PhysicalAddress) -> u64 {
        Self::TABLE_FLAGS.bits() | (table.as_u64() & Self::ADDRESS_MASK)
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
        let bits = Self::flags(descriptor);
        let mut flags = PageFlags::empty();
        flags.set_writable(bits.contains(PageTableFlags::WRITABLE));
        flags.set_user(bits.contains(PageTableFlags::USER_ACCESSIBLE));
        flags.set_no_execute(bits.contains(PageTableFlags::NO_EXECUTE));
        flags.set_global(bits.contains(PageTableFlags::GLOBAL));
        flags.set_uncached(bits.contains(PageTableFlags::NO_CACHE));
        flags
    }

    fn strip_hardware_bits(descriptor: u64) -> u64 {
        descriptor & !(PageTableFlags::ACCESSED | PageTableFlags::DIRTY).bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDPT: Level = FOUR_LEVELS[1];
    const PT: Level = FOUR_LEVELS[3];

    #[test]
    fn small_page_round_trips_flags() {
        let mut flags = PageFlags::dma_buffer();
        flags.set_global(true);
        let desc = CpuPaging::page_descriptor(PhysicalAddress::new(0x7000), flags, &PT);

        assert!(CpuPaging::is_present(desc));
        assert!(CpuPaging::is_page(desc, &PT));
        assert_eq!(desc & PageTableFlags::HUGE_PAGE.bits(), 0);
        assert_eq!(CpuPaging::page_flags(desc), flags);
        assert_eq!(CpuPaging::address(desc, &PT), PhysicalAddress::new(0x7000));
    }

    #[test]
    fn huge_page_at_pdpt() {
        let desc = CpuPaging::page_descriptor(
            PhysicalAddress::new(0x4000_0000),
            PageFlags::empty(),
            &PDPT,
        );
        assert!(CpuPaging::is_page(desc, &PDPT));
        assert_eq!(CpuPaging::address(desc, &PDPT), PhysicalAddress::new(0x4000_0000));
    }

    #[test]
    fn links_are_not_pages() {
        let desc = CpuPaging::table_descriptor(PhysicalAddress::new(0x3000));
        assert!(CpuPaging::is_present(desc));
        assert!(!CpuPaging::is_page(desc, &PDPT));
        assert_eq!(CpuPaging::address(desc, &PDPT), PhysicalAddress::new(0x3000));
    }

    #[test]
    fn accessed_and_dirty_are_stripped() {
        let desc = CpuPaging::page_descriptor(PhysicalAddress::new(0x7000), PageFlags::dma_buffer(), &PT);
        let touched = desc
            | PageTableFlags::ACCESSED.bits()
            | PageTableFlags::DIRTY.bits();
        assert_ne!(touched, desc);
        assert_eq!(CpuPaging::strip_hardware_bits(touched), desc);
    }

    #[test]
    fn uncached_sets_cache_disable() {
        let mut flags = PageFlags::empty();
        flags.set_uncached(true);
        let desc = CpuPaging::page_descriptor(PhysicalAddress::new(0x7000), flags, &PT);
        assert_ne!(desc & PageTableFlags::NO_CACHE.bits(), 0);
        assert_ne!(desc & PageTableFlags::WRITE_THROUGH.bits(), 0);
    }
}
