//! DMA isolation domains.
//!
//! A [`Domain`] owns one second-level translation table and the pool its nodes come
//! from. Devices bound to the domain can only reach memory mapped into that table.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use xlat::{
    PageFlags, PhysicalAddress, SecondLevel, TableAllocator, Translation, TranslationTable,
    VirtualAddress, WalkEntry,
};

use crate::registers::RegisterAccess;
use crate::root_table::{ContextChange, ContextRemoval};
use crate::{Bdf, IoMmu, IommuError};

/// Hardware tag of a domain in context entries and invalidation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(u16);

impl DomainId {
    /// Reserved id that never names a domain.
    pub const INVALID: Self = Self(0);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool of domain ids `1..max_domains`.
#[derive(Debug)]
pub struct DomainAllocator {
    used: Vec<u64>,
    count: usize,
    free: usize,
}

impl DomainAllocator {
    /// Creates a pool for a unit supporting `max_domains` ids, including the reserved id 0.
    pub fn new(max_domains: usize) -> Self {
        let count = max_domains.saturating_sub(1).min(u16::MAX as usize);
        Self {
            used: vec![0; count.div_ceil(64)],
            count,
            free: count,
        }
    }

    /// Number of ids that can still be allocated.
    pub fn available(&self) -> usize {
        self.free
    }

    pub fn alloc(&mut self) -> Result<DomainId, IommuError> {
        let slot = self
            .used
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(word, bits)| word * 64 + bits.trailing_ones() as usize)
            .filter(|slot| *slot < self.count)
            .ok_or(IommuError::DomainIdsExhausted)?;

        self.used[slot / 64] |= 1 << (slot % 64);
        self.free -= 1;
        Ok(DomainId::new(slot as u16 + 1))
    }

    pub fn free(&mut self, id: DomainId) {
        let slot = (id.as_u16() as usize).wrapping_sub(1);
        if slot >= self.count || self.used[slot / 64] & (1 << (slot % 64)) == 0 {
            log::error!("attempt to free unallocated domain id {}", id);
            return;
        }
        self.used[slot / 64] &= !(1 << (slot % 64));
        self.free += 1;
    }
}

/// A range of DMA addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRange {
    pub start: VirtualAddress,
    pub size: u64,
}

impl IoRange {
    pub const fn new(start: VirtualAddress, size: u64) -> Self {
        Self { start, size }
    }
}

impl fmt::Display for IoRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {:#x})", self.start, self.start.as_u64().wrapping_add(self.size))
    }
}

/// A DMA buffer that every domain must be able to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub dma_addr: VirtualAddress,
    pub phys_addr: PhysicalAddress,
    pub size: u64,
}

impl DmaBuffer {
    pub const fn range(&self) -> IoRange {
        IoRange::new(self.dma_addr, self.size)
    }
}

/// An isolation domain of one remapping unit.
///
/// Domains are created by [`IoMmu::create_domain`] and must be handed back to
/// [`IoMmu::destroy_domain`]. A domain dropped any other way may still be referenced
/// by context entries, so its table memory is leaked rather than freed.
pub struct Domain {
    id: DomainId,
    table: TranslationTable<SecondLevel>,
    tables: TableAllocator,
    devices: BTreeSet<Bdf>,
    released: bool,
}

impl Domain {
    pub(crate) fn new(id: DomainId, table: TranslationTable<SecondLevel>, tables: TableAllocator) -> Self {
        Self {
            id,
            table,
            tables,
            devices: BTreeSet::new(),
            released: false,
        }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Physical address of the domain's second-level table.
    pub fn table_root(&self) -> PhysicalAddress {
        self.table.root()
    }

    /// The pool holding the domain's table nodes.
    pub fn tables(&self) -> &TableAllocator {
        &self.tables
    }

    /// Devices currently bound to the domain.
    pub fn devices(&self) -> impl Iterator<Item = Bdf> + '_ {
        self.devices.iter().copied()
    }

    /// Translates a DMA address the way the hardware would.
    pub fn translate(&self, addr: VirtualAddress) -> Option<Translation> {
        self.table.lookup(addr, &self.tables)
    }

    /// Returns whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty(&self.tables)
    }

    /// Visits every present descriptor of the domain's table.
    pub fn walk(&self, visit: impl FnMut(&WalkEntry)) {
        self.table.walk(&self.tables, visit);
    }

    /// Maps `range` to `paddr` for DMA.
    ///
    /// Units in caching mode may have cached the previously absent translation, so
    /// their IOTLB is invalidated for the domain afterwards, even if the mapping
    /// failed partway.
    pub fn add_range<R: RegisterAccess>(
        &mut self,
        iommu: &IoMmu<R>,
        range: IoRange,
        paddr: PhysicalAddress,
    ) -> Result<(), IommuError> {
        let result = self.table.insert_translation(
            range.start,
            paddr,
            range.size,
            PageFlags::dma_buffer(),
            &mut self.tables,
        );

        // A failed insert may still have mapped a prefix of the range.
        if iommu.caching_mode() {
            iommu.invalidate_iotlb(Some(self.id), range.start, range.size);
        }
        result?;

        log::trace!("domain {}: mapped {} to {}", self.id, range, paddr);
        Ok(())
    }

    /// Unmaps `range` and invalidates the domain's IOTLB entries.
    pub fn remove_range<R: RegisterAccess>(
        &mut self,
        iommu: &IoMmu<R>,
        range: IoRange,
    ) -> Result<(), IommuError> {
        self.table
            .remove_translation(range.start, range.size, &mut self.tables)?;
        log::trace!("domain {}: unmapped {}", self.id, range);

        iommu.invalidate_iotlb(Some(self.id), range.start, range.size);
        Ok(())
    }

    /// Binds `bdf` to this domain.
    ///
    /// A binding to another domain is overwritten; the previous domain's cached
    /// context is invalidated along with it.
    pub fn enable_pci_device<R: RegisterAccess>(
        &mut self,
        iommu: &mut IoMmu<R>,
        bdf: Bdf,
    ) -> Result<ContextChange, IommuError> {
        let change = iommu
            .root_table_mut()
            .insert_context(bdf, self.table.root(), self.id)?;
        self.devices.insert(bdf);

        if let ContextChange::Replaced { previous } = change {
            iommu.invalidate_all(Some(previous.domain()), Some(bdf.routing_id()));
        }
        // Without caching mode the unit never caches the absent entry replaced here.
        if iommu.caching_mode() && change != ContextChange::Unchanged {
            iommu.invalidate_all(Some(self.id), Some(bdf.routing_id()));
        }
        Ok(change)
    }

    /// Unbinds `bdf` from this domain and invalidates the domain's cached translations.
    pub fn disable_pci_device<R: RegisterAccess>(
        &mut self,
        iommu: &mut IoMmu<R>,
        bdf: Bdf,
    ) -> ContextRemoval {
        let removal = iommu
            .root_table_mut()
            .remove_context(bdf, self.table.root());
        self.devices.remove(&bdf);

        iommu.invalidate_all(Some(self.id), None);
        removal
    }

    /// Frees the domain's tables and returns the now empty pool.
    pub(crate) fn release(&mut self) -> TableAllocator {
        let mut tables = core::mem::take(&mut self.tables);
        self.table.clear(&mut tables);
        tables.destruct(self.table.root());
        self.devices.clear();
        self.released = true;
        tables
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        if !self.released {
            log::error!(
                "domain {} dropped without being destroyed, leaking its tables",
                self.id
            );
            core::mem::forget(core::mem::take(&mut self.tables));
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("devices", &self.devices)
            .finish()
    }
}
