//! Generic multi-level translation tables.
//!
//! A [`TranslationTable`] owns the root node of a radix tree whose nodes all live in
//! one [`TableAllocator`]. Inserting a range picks the largest page each level allows
//! for the alignment of the range, allocating intermediate tables on demand. Removing
//! a range frees every intermediate table it leaves empty.

use core::marker::PhantomData;

use crate::format::{Level, LevelKind, TableFormat};
use crate::{Coherency, PageFlags, PhysicalAddress, TableAllocator, TableError, TableNode, VirtualAddress, flush_line};

/// The result of translating a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address the input address maps to.
    pub address: PhysicalAddress,
    /// Size of the page containing the input address.
    pub page_size: u64,
    pub flags: PageFlags,
}

/// A translation table in format `F`.
///
/// The table only records its root. Every operation takes the allocator its nodes
/// were constructed from; passing a different allocator makes links unresolvable,
/// which is reported as [`TableError::UnknownTable`].
pub struct TranslationTable<F: TableFormat> {
    root: PhysicalAddress,
    coherency: Coherency,
    _format: PhantomData<F>,
}

impl<F: TableFormat> TranslationTable<F> {
    /// Allocates an empty root table.
    pub fn new(alloc: &mut TableAllocator, coherency: Coherency) -> Result<Self, TableError> {
        let root = alloc.construct()?;
        if coherency.needs_flush() {
            alloc.inspect_table(root, flush_table, || ());
        }
        log::debug!("created {} table at {}", F::NAME, root);
        Ok(Self {
            root,
            coherency,
            _format: PhantomData,
        })
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn coherency(&self) -> Coherency {
        self.coherency
    }

    /// Maps `size` bytes at `vo` to `pa`.
    ///
    /// Fails without modifying anything if the request is not page-aligned, leaves
    /// the input address space or maps beyond what a descriptor can address. Re-inserting an identical mapping succeeds. A
    /// conflicting mapping, or running out of table nodes, aborts the request after
    /// the chunks before it were already inserted.
    pub fn insert_translation(
        &mut self,
        vo: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: PageFlags,
        alloc: &mut TableAllocator,
    ) -> Result<(), TableError> {
        self.check_range(vo, size)?;
        let min_page = 1u64 << F::min_page_size_log2();
        let limit = 1u64 << F::output_address_bits();
        let end = pa.as_u64().checked_add(size);
        if !pa.is_aligned(min_page) || end.is_none_or(|end| end > limit) {
            log::debug!("rejecting {} output range {}+{:#x}", F::NAME, pa, size);
            return Err(TableError::InvalidRange { start: vo, size });
        }
        if size == 0 {
            return Ok(());
        }

        self.insert_at(alloc, 0, self.root, 0, vo.as_u64(), pa.as_u64(), size, flags)
    }

    /// Unmaps `size` bytes at `vo`, freeing intermediate tables that become empty.
    ///
    /// Unmapped parts of the range are skipped. A large page is removed as a whole
    /// as soon as the range touches it.
    pub fn remove_translation(
        &mut self,
        vo: VirtualAddress,
        size: u64,
        alloc: &mut TableAllocator,
    ) -> Result<(), TableError> {
        self.check_range(vo, size)?;
        if size == 0 {
            return Ok(());
        }

        self.remove_at(alloc, 0, self.root, vo.as_u64(), size)
    }

    /// Returns whether the root table holds no present descriptor.
    pub fn is_empty(&self, alloc: &TableAllocator) -> bool {
        alloc.inspect_table(self.root, |t: &TableNode| Self::node_empty(t), || true)
    }

    /// Translates a single address.
    pub fn lookup(&self, va: VirtualAddress, alloc: &TableAllocator) -> Option<Translation> {
        if va.as_u64() >> F::input_address_bits() != 0 {
            return None;
        }

        let mut table = self.root;
        for level in F::LEVELS {
            let index = va.table_index(level.page_size_log2, level.entries);
            let descriptor = alloc.inspect_table(table, |t: &TableNode| Some(t.entry(index)), || None)?;
            if !F::is_present(descriptor) {
                return None;
            }

            let address = F::address(descriptor, level);
            if F::is_page(descriptor, level) {
                let offset = va.as_u64() & (level.page_size() - 1);
                return Some(Translation {
                    address: address + offset,
                    page_size: level.page_size(),
                    flags: F::page_flags(descriptor),
                });
            }
            table = address;
        }

        None
    }

    /// Drops every mapping and frees every node below the root.
    ///
    /// Unlike [`remove_translation`](Self::remove_translation) this does not flush
    /// or revisit individual descriptors; hardware must no longer walk the table.
    pub fn clear(&mut self, alloc: &mut TableAllocator) {
        Self::release_children(alloc, 0, self.root);
        alloc.with_table(self.root, |t: &mut TableNode| *t = TableNode::zeroed(), || ());
    }

    /// Frees every node of the table, including the root.
    ///
    /// Hardware must no longer reference the table.
    pub fn destroy(mut self, alloc: &mut TableAllocator) {
        self.clear(alloc);
        alloc.destruct(self.root);
        log::debug!("destroyed {} table at {}", F::NAME, self.root);
    }

    fn release_children(alloc: &mut TableAllocator, depth: usize, table: PhysicalAddress) {
        let level = &F::LEVELS[depth];
        if level.kind == LevelKind::Leaf {
            return;
        }

        for index in 0..level.entries {
            let Some(descriptor) = alloc.inspect_table(table, |t: &TableNode| Some(t.entry(index)), || None) else {
                return;
            };
            if F::is_present(descriptor) && !F::is_page(descriptor, level) {
                let child = F::address(descriptor, level);
                Self::release_children(alloc, depth + 1, child);
                alloc.destruct(child);
            }
        }
    }

    fn check_range(&self, vo: VirtualAddress, size: u64) -> Result<(), TableError> {
        let min_page = 1u64 << F::min_page_size_log2();
        let limit = 1u64 << F::input_address_bits();
        let end = vo.as_u64().checked_add(size);

        if !vo.is_aligned(min_page) || size % min_page != 0 || end.is_none_or(|end| end > limit) {
            log::debug!("rejecting {} range {}+{:#x}", F::NAME, vo, size);
            return Err(TableError::InvalidRange { start: vo, size });
        }
        Ok(())
    }

    fn node_empty(table: &TableNode) -> bool {
        !table.entries().iter().any(|&descriptor| F::is_present(descriptor))
    }

    fn load(alloc: &TableAllocator, table: PhysicalAddress, index: usize) -> Result<u64, TableError> {
        alloc.inspect_table(
            table,
            |t: &TableNode| Ok(t.entry(index)),
            || Err(Self::dangling(table)),
        )
    }

    fn store(
        &self,
        alloc: &mut TableAllocator,
        table: PhysicalAddress,
        index: usize,
        descriptor: u64,
    ) -> Result<(), TableError> {
        let flush = self.coherency.needs_flush();
        alloc.with_table(
            table,
            |t: &mut TableNode| {
                t.set_entry(index, descriptor);
                if flush {
                    flush_line(t.entry_ref(index));
                }
                Ok(())
            },
            || Err(Self::dangling(table)),
        )
    }

    fn dangling(table: PhysicalAddress) -> TableError {
        log::error!("{} table {} is not part of the table pool", F::NAME, table);
        TableError::UnknownTable { address: table }
    }

    /// Returns the table linked from `index`, allocating it if the slot is empty.
    fn next_table(
        &self,
        alloc: &mut TableAllocator,
        level: &Level,
        table: PhysicalAddress,
        index: usize,
        descriptor: u64,
        va: u64,
    ) -> Result<PhysicalAddress, TableError> {
        if !F::is_present(descriptor) {
            let child = alloc.construct()?;
            if self.coherency.needs_flush() {
                alloc.inspect_table(child, flush_table, || ());
            }
            self.store(alloc, table, index, F::table_descriptor(child))?;
            return Ok(child);
        }

        if F::is_page(descriptor, level) {
            return Err(TableError::DoubleInsertion {
                address: VirtualAddress::new(va),
            });
        }

        Ok(F::address(descriptor, level))
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_at(
        &self,
        alloc: &mut TableAllocator,
        depth: usize,
        table: PhysicalAddress,
        base: u64,
        mut vo: u64,
        mut pa: u64,
        mut size: u64,
        flags: PageFlags,
    ) -> Result<(), TableError> {
        let level = &F::LEVELS[depth];
        let page_size = level.page_size();
        let offset_mask = page_size - 1;

        while size > 0 {
            let index = ((vo >> level.page_size_log2) as usize) & (level.entries - 1);
            let end = (vo + page_size) & !offset_mask;
            let chunk = size.min(end - vo);
            let va = base + vo;
            let descriptor = Self::load(alloc, table, index)?;

            let fits_page = level.maps_pages()
                && vo & offset_mask == 0
                && pa & offset_mask == 0
                && chunk >= page_size;

            if fits_page {
                let page = F::page_descriptor(PhysicalAddress::new(pa), flags, level);
                if !F::is_present(descriptor) {
                    self.store(alloc, table, index, page)?;
                } else if F::strip_hardware_bits(descriptor) != page {
                    log::debug!(
                        "{} conflict at {:#x}: have {:#x}, want {:#x}",
                        F::NAME,
                        va,
                        descriptor,
                        page
                    );
                    return Err(TableError::DoubleInsertion {
                        address: VirtualAddress::new(va),
                    });
                }
            } else {
                let child = self.next_table(alloc, level, table, index, descriptor, va)?;
                let child_base = va & !offset_mask;
                self.insert_at(alloc, depth + 1, child, child_base, vo & offset_mask, pa, chunk, flags)?;
            }

            size -= chunk;
            vo += chunk;
            pa += chunk;
            // A sub-table never receives more than its own span.
            debug_assert!(
                size == 0 || vo >> level.page_size_log2 < level.entries as u64,
                "range overran a table at level {depth}"
            );
        }

        Ok(())
    }

    fn remove_at(
        &self,
        alloc: &mut TableAllocator,
        depth: usize,
        table: PhysicalAddress,
        mut vo: u64,
        mut size: u64,
    ) -> Result<(), TableError> {
        let level = &F::LEVELS[depth];
        let page_size = level.page_size();
        let offset_mask = page_size - 1;

        while size > 0 {
            let index = ((vo >> level.page_size_log2) as usize) & (level.entries - 1);
            let end = (vo + page_size) & !offset_mask;
            let chunk = size.min(end - vo);
            let descriptor = Self::load(alloc, table, index)?;

            if F::is_present(descriptor) {
                if F::is_page(descriptor, level) {
                    self.store(alloc, table, index, 0)?;
                } else {
                    let child = F::address(descriptor, level);
                    self.remove_at(alloc, depth + 1, child, vo & offset_mask, chunk)?;

                    let emptied = alloc.inspect_table(child, |t: &TableNode| Self::node_empty(t), || false);
                    if emptied {
                        self.store(alloc, table, index, 0)?;
                        alloc.destruct(child);
                    }
                }
            }

            size -= chunk;
            vo += chunk;
        }

        Ok(())
    }
}

fn flush_table(table: &TableNode) {
    for line in table.entries().chunks(8) {
        flush_line(&line[0]);
    }
}

impl<F: TableFormat> core::fmt::Debug for TranslationTable<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TranslationTable")
            .field("format", &F::NAME)
            .field("root", &self.root)
            .field("coherency", &self.coherency)
            .finish()
    }
}
