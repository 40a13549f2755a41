//! The root table of a remapping unit together with its lazily created context tables.

use xlat::{Coherency, PhysicalAddress, TableAllocator, TableError};

use crate::context_table::{ContextEntry, ContextTable, RootTable};
use crate::{Bdf, DomainId};

/// Outcome of [`ManagedRootTable::insert_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextChange {
    /// The device had no context entry.
    Installed,
    /// The device already translated through the same table as the same domain.
    Unchanged,
    /// A different binding was overwritten.
    Replaced { previous: ContextEntry },
}

/// Outcome of [`ManagedRootTable::remove_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRemoval {
    /// The entry referenced the expected table and was removed.
    Removed,
    /// The device had no context entry.
    Absent,
    /// The entry referenced a different table; it was removed anyway.
    Foreign { found: PhysicalAddress },
}

/// Owns the root table and every context table linked from it.
pub struct ManagedRootTable {
    tables: TableAllocator,
    root: PhysicalAddress,
    coherency: Coherency,
}

impl ManagedRootTable {
    /// Allocates an empty root table from `tables`.
    pub fn new(mut tables: TableAllocator, coherency: Coherency) -> Result<Self, TableError> {
        let root = tables.construct()?;
        if coherency.needs_flush() {
            tables.inspect_table(root, |t: &ContextTable| t.flush_all(), || ());
        }
        Ok(Self {
            tables,
            root,
            coherency,
        })
    }

    /// Physical address of the root table.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.root
    }

    /// The pool holding the root and context tables.
    pub fn tables(&self) -> &TableAllocator {
        &self.tables
    }

    fn flush(&self) -> bool {
        self.coherency.needs_flush()
    }

    fn context_table_of(&self, bus: u8) -> Option<PhysicalAddress> {
        self.tables
            .inspect_table(self.root, |root: &RootTable| root.context_table(bus), || None)
    }

    /// Returns the context table of `bus`, creating and linking it if necessary.
    fn ensure_context_table(&mut self, bus: u8) -> Result<PhysicalAddress, TableError> {
        if let Some(table) = self.context_table_of(bus) {
            return Ok(table);
        }

        let table = self.tables.construct()?;
        let flush = self.flush();
        if flush {
            self.tables.inspect_table(table, |t: &ContextTable| t.flush_all(), || ());
        }

        let root = self.root;
        self.tables.with_table(
            root,
            |r: &mut RootTable| {
                r.set_context_table(bus, table, flush);
                Ok(())
            },
            || Err(TableError::UnknownTable { address: root }),
        )?;
        log::debug!("created context table {} for bus {:#04x}", table, bus);
        Ok(table)
    }

    /// Calls `f` with the context table of `bus`, if it exists.
    pub fn with_context_table<R>(&self, bus: u8, f: impl FnOnce(&ContextTable) -> R) -> Option<R> {
        let table = self.context_table_of(bus)?;
        self.tables.inspect_table(table, |t: &ContextTable| Some(f(t)), || None)
    }

    /// Returns the context entry of `bdf`, present or not.
    pub fn context(&self, bdf: Bdf) -> ContextEntry {
        self.with_context_table(bdf.bus(), |t| t.entry(bdf.devfn()))
            .unwrap_or_default()
    }

    /// Binds `bdf` to the second-level table `table` as `domain`.
    ///
    /// An existing binding to a different table or domain is logged and overwritten.
    pub fn insert_context(
        &mut self,
        bdf: Bdf,
        table: PhysicalAddress,
        domain: DomainId,
    ) -> Result<ContextChange, TableError> {
        let context = self.ensure_context_table(bdf.bus())?;
        let flush = self.flush();
        let entry = ContextEntry::new(table, domain);

        self.tables.with_table(
            context,
            |t: &mut ContextTable| {
                let previous = t.entry(bdf.devfn());
                if previous.present() {
                    if previous == entry {
                        return Ok(ContextChange::Unchanged);
                    }
                    log::error!(
                        "context entry for {} already present (domain {}, table {}), overwriting",
                        bdf,
                        previous.domain(),
                        previous.stage2_pointer()
                    );
                    t.insert(bdf.devfn(), entry, flush);
                    return Ok(ContextChange::Replaced { previous });
                }

                t.insert(bdf.devfn(), entry, flush);
                Ok(ContextChange::Installed)
            },
            || Err(TableError::UnknownTable { address: context }),
        )
    }

    /// Removes the context entry of `bdf`, which is expected to reference `table`.
    ///
    /// An entry referencing another table is logged as foreign and removed all the same.
    pub fn remove_context(&mut self, bdf: Bdf, table: PhysicalAddress) -> ContextRemoval {
        let Some(context) = self.context_table_of(bdf.bus()) else {
            return ContextRemoval::Absent;
        };
        let flush = self.flush();

        self.tables.with_table(
            context,
            |t: &mut ContextTable| {
                let entry = t.entry(bdf.devfn());
                if !entry.present() {
                    return ContextRemoval::Absent;
                }

                t.remove(bdf.devfn(), flush);
                if entry.stage2_pointer() != table {
                    log::error!(
                        "removing foreign context entry for {}: expected table {}, found {}",
                        bdf,
                        table,
                        entry.stage2_pointer()
                    );
                    return ContextRemoval::Foreign {
                        found: entry.stage2_pointer(),
                    };
                }
                ContextRemoval::Removed
            },
            || ContextRemoval::Absent,
        )
    }

    /// Removes every context entry that references `table` and returns how many there were.
    pub fn remove_all_contexts(&mut self, table: PhysicalAddress) -> usize {
        let flush = self.flush();
        let mut removed = 0;

        for bus in 0..=u8::MAX {
            let Some(context) = self.context_table_of(bus) else {
                continue;
            };

            self.tables.with_table(
                context,
                |t: &mut ContextTable| {
                    for devfn in 0..=u8::MAX {
                        let entry = t.entry(devfn);
                        if entry.present() && entry.stage2_pointer() == table {
                            t.remove(devfn, flush);
                            removed += 1;
                        }
                    }
                },
                || (),
            );
        }

        removed
    }

    /// Calls `visit` for every present context entry, in routing-id order.
    pub fn for_each_context(&self, mut visit: impl FnMut(Bdf, &ContextEntry)) {
        for bus in 0..=u8::MAX {
            self.with_context_table(bus, |t| {
                for devfn in 0..=u8::MAX {
                    let entry = t.entry(devfn);
                    if entry.present() {
                        visit(Bdf::from(crate::RoutingId(((bus as u16) << 8) | devfn as u16)), &entry);
                    }
                }
            });
        }
    }
}
