//! Root and context tables in legacy translation mode.
//!
//! Both tables are one page of 128-bit entries stored as pairs of 64-bit words, low
//! word first. The root table is indexed by bus, a context table by device/function.

use core::fmt;

use tock_registers::{LocalRegisterCopy, register_bitfields};
use xlat::{PhysicalAddress, TableNode, TableView, flush_line};

use crate::DomainId;

register_bitfields![u64,
    ROOT_LO [
        Present OFFSET(0) NUMBITS(1),
        ContextTable OFFSET(12) NUMBITS(52),
    ],

    CONTEXT_LO [
        Present OFFSET(0) NUMBITS(1),
        FaultProcessingDisable OFFSET(1) NUMBITS(1),
        TranslationType OFFSET(2) NUMBITS(2),
        SecondLevelTable OFFSET(12) NUMBITS(52),
    ],

    CONTEXT_HI [
        AddressWidth OFFSET(0) NUMBITS(3),
        Domain OFFSET(8) NUMBITS(16),
    ],
];

const fn lo_index(index: u8) -> usize {
    2 * index as usize
}

const fn hi_index(index: u8) -> usize {
    2 * index as usize + 1
}

/// The root table: one entry per PCI bus pointing to that bus' context table.
#[repr(transparent)]
pub struct RootTable(TableNode);

// SAFETY: repr(transparent) over TableNode.
unsafe impl TableView for RootTable {}

impl RootTable {
    /// Returns the context table of `bus`, if one is linked.
    pub fn context_table(&self, bus: u8) -> Option<PhysicalAddress> {
        let lo = LocalRegisterCopy::<u64, ROOT_LO::Register>::new(self.0.entry(lo_index(bus)));
        lo.is_set(ROOT_LO::Present)
            .then(|| PhysicalAddress::new(lo.read(ROOT_LO::ContextTable) << 12))
    }

    /// Links `table` as the context table of `bus`.
    pub fn set_context_table(&mut self, bus: u8, table: PhysicalAddress, flush: bool) {
        let mut lo = LocalRegisterCopy::<u64, ROOT_LO::Register>::new(0);
        lo.modify(ROOT_LO::ContextTable.val(table.as_u64() >> 12));
        lo.modify(ROOT_LO::Present.val(1));
        self.0.set_entry(hi_index(bus), 0);
        self.0.set_entry(lo_index(bus), lo.get());
        if flush {
            flush_line(self.0.entry_ref(lo_index(bus)));
        }
    }
}

/// A decoded context entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextEntry {
    lo: u64,
    hi: u64,
}

impl ContextEntry {
    /// Address-width encoding of 48-bit, 4-level second-level tables.
    pub const ADDRESS_WIDTH_4_LEVEL: u8 = 2;

    /// Translation type that translates untranslated requests only.
    pub const TRANSLATION_UNTRANSLATED_ONLY: u8 = 0;

    /// A present entry translating through the 4-level `table` as `domain`.
    pub fn new(table: PhysicalAddress, domain: DomainId) -> Self {
        let mut lo = LocalRegisterCopy::<u64, CONTEXT_LO::Register>::new(0);
        lo.modify(CONTEXT_LO::Present.val(1));
        lo.modify(CONTEXT_LO::TranslationType.val(Self::TRANSLATION_UNTRANSLATED_ONLY as u64));
        lo.modify(CONTEXT_LO::SecondLevelTable.val(table.as_u64() >> 12));

        let mut hi = LocalRegisterCopy::<u64, CONTEXT_HI::Register>::new(0);
        hi.modify(CONTEXT_HI::AddressWidth.val(Self::ADDRESS_WIDTH_4_LEVEL as u64));
        hi.modify(CONTEXT_HI::Domain.val(domain.as_u16() as u64));

        Self {
            lo: lo.get(),
            hi: hi.get(),
        }
    }

    fn lo_fields(&self) -> LocalRegisterCopy<u64, CONTEXT_LO::Register> {
        LocalRegisterCopy::new(self.lo)
    }

    fn hi_fields(&self) -> LocalRegisterCopy<u64, CONTEXT_HI::Register> {
        LocalRegisterCopy::new(self.hi)
    }

    pub const fn from_raw(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub const fn lo(&self) -> u64 {
        self.lo
    }

    pub const fn hi(&self) -> u64 {
        self.hi
    }

    pub fn present(&self) -> bool {
        self.lo_fields().is_set(CONTEXT_LO::Present)
    }

    /// Faults of requests through this entry are not recorded.
    pub fn fault_processing_disabled(&self) -> bool {
        self.lo_fields().is_set(CONTEXT_LO::FaultProcessingDisable)
    }

    pub fn translation_type(&self) -> u8 {
        self.lo_fields().read(CONTEXT_LO::TranslationType) as u8
    }

    /// Physical address of the second-level table.
    pub fn stage2_pointer(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.lo_fields().read(CONTEXT_LO::SecondLevelTable) << 12)
    }

    pub fn address_width(&self) -> u8 {
        self.hi_fields().read(CONTEXT_HI::AddressWidth) as u8
    }

    pub fn domain(&self) -> DomainId {
        DomainId::new(self.hi_fields().read(CONTEXT_HI::Domain) as u16)
    }

    /// The entry with its present bit cleared.
    pub fn cleared(&self) -> Self {
        let mut lo = self.lo_fields();
        lo.modify(CONTEXT_LO::Present.val(0));
        Self { lo: lo.get(), hi: self.hi }
    }
}

impl fmt::Debug for ContextEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEntry")
            .field("present", &self.present())
            .field("domain", &self.domain())
            .field("stage2_pointer", &self.stage2_pointer())
            .field("address_width", &self.address_width())
            .field("translation_type", &self.translation_type())
            .field("fault_processing_disabled", &self.fault_processing_disabled())
            .finish()
    }
}

/// A context table: one entry per device/function of a bus.
#[repr(transparent)]
pub struct ContextTable(TableNode);

// SAFETY: repr(transparent) over TableNode.
unsafe impl TableView for ContextTable {}

impl ContextTable {
    pub fn entry(&self, devfn: u8) -> ContextEntry {
        ContextEntry::from_raw(self.0.entry(lo_index(devfn)), self.0.entry(hi_index(devfn)))
    }

    pub fn present(&self, devfn: u8) -> bool {
        self.entry(devfn).present()
    }

    /// Writes `entry`, high word first so the entry only becomes present once complete.
    pub fn insert(&mut self, devfn: u8, entry: ContextEntry, flush: bool) {
        self.0.set_entry(hi_index(devfn), entry.hi());
        self.0.set_entry(lo_index(devfn), entry.lo());
        if flush {
            flush_line(self.0.entry_ref(lo_index(devfn)));
        }
    }

    /// Clears the present bit of an entry.
    pub fn remove(&mut self, devfn: u8, flush: bool) {
        let entry = self.entry(devfn).cleared();
        self.0.set_entry(lo_index(devfn), entry.lo());
        if flush {
            flush_line(self.0.entry_ref(lo_index(devfn)));
        }
    }

    /// Returns whether no entry is present.
    pub fn is_empty(&self) -> bool {
        (0..=u8::MAX).all(|devfn| !self.present(devfn))
    }

    /// Writes the whole table back to memory.
    pub fn flush_all(&self) {
        for line in self.0.entries().chunks(8) {
            flush_line(&line[0]);
        }
    }
}
