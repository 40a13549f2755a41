//! Read-only traversal of translation tables, for diagnostics.

use crate::{PageFlags, PhysicalAddress, TableAllocator, TableFormat, TableNode, TranslationTable, VirtualAddress};

/// What a visited descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// A link to the lower-level table at `next`.
    Table { next: PhysicalAddress },
    /// A page of `size` bytes.
    Page {
        address: PhysicalAddress,
        size: u64,
        flags: PageFlags,
    },
}

/// A present descriptor found during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkEntry {
    /// Level of the descriptor; 0 is the root.
    pub depth: usize,
    /// Table holding the descriptor.
    pub table: PhysicalAddress,
    pub index: usize,
    /// First input address the descriptor covers.
    pub virtual_address: VirtualAddress,
    /// Raw descriptor value.
    pub descriptor: u64,
    pub mapping: Mapping,
}

impl<F: TableFormat> TranslationTable<F> {
    /// Calls `visit` for every present descriptor, parents before children, in
    /// ascending address order.
    ///
    /// Links that cannot be resolved through `alloc` are reported to `visit` but
    /// not followed.
    pub fn walk(&self, alloc: &TableAllocator, mut visit: impl FnMut(&WalkEntry)) {
        walk_table::<F>(alloc, 0, self.root(), 0, &mut visit);
    }
}

fn walk_table<F: TableFormat>(
    alloc: &TableAllocator,
    depth: usize,
    table: PhysicalAddress,
    base: u64,
    visit: &mut dyn FnMut(&WalkEntry),
) {
    let level = &F::LEVELS[depth];
    let Some(entries) = alloc.inspect_table(table, |t: &TableNode| Some(*t.entries()), || None) else {
        log::warn!("skipping unresolvable {} table {}", F::NAME, table);
        return;
    };

    for (index, &descriptor) in entries.iter().enumerate() {
        if !F::is_present(descriptor) {
            continue;
        }

        let address = F::address(descriptor, level);
        let mapping = if F::is_page(descriptor, level) {
            Mapping::Page {
                address,
                size: level.page_size(),
                flags: F::page_flags(descriptor),
            }
        } else {
            Mapping::Table { next: address }
        };

        let virtual_address = base + ((index as u64) << level.page_size_log2);
        visit(&WalkEntry {
            depth,
            table,
            index,
            virtual_address: VirtualAddress::new(virtual_address),
            descriptor,
            mapping,
        });

        if let Mapping::Table { next } = mapping {
            walk_table::<F>(alloc, depth + 1, next, virtual_address, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::{Coherency, SecondLevel};

    #[test]
    fn visits_parents_before_children_in_address_order() {
        let mut alloc = TableAllocator::new(PhysicalAddress::new(0x40_0000), 16).unwrap();
        let mut table = TranslationTable::<SecondLevel>::new(&mut alloc, Coherency::Coherent).unwrap();
        let flags = PageFlags::dma_buffer();
        table
            .insert_translation(VirtualAddress::new(0x60_0000), PhysicalAddress::new(0x60_0000), 0x20_0000, flags, &mut alloc)
            .unwrap();
        table
            .insert_translation(VirtualAddress::new(0x3000), PhysicalAddress::new(0x9000), 0x1000, flags, &mut alloc)
            .unwrap();

        let mut seen = Vec::new();
        table.walk(&alloc, |entry| seen.push((entry.depth, entry.virtual_address.as_u64(), entry.mapping)));

        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[1].0, 1);
        assert_eq!((seen[2].0, seen[2].1), (2, 0));
        assert_eq!(
            seen[3],
            (
                3,
                0x3000,
                Mapping::Page {
                    address: PhysicalAddress::new(0x9000),
                    size: 0x1000,
                    flags
                }
            )
        );
        assert_eq!(
            seen[4],
            (
                2,
                0x60_0000,
                Mapping::Page {
                    address: PhysicalAddress::new(0x60_0000),
                    size: 0x20_0000,
                    flags
                }
            )
        );
    }

    #[test]
    fn empty_table_visits_nothing() {
        let mut alloc = TableAllocator::new(PhysicalAddress::new(0x40_0000), 1).unwrap();
        let table = TranslationTable::<SecondLevel>::new(&mut alloc, Coherency::Coherent).unwrap();
        let mut count = 0;
        table.walk(&alloc, |_| count += 1);
        assert_eq!(count, 0);
    }
}
