//! The remapping-unit controller.
//!
//! [`IoMmu`] owns one unit's register page and root table. It sequences the
//! register-based invalidation protocol, drains fault records, and creates and
//! destroys [`Domain`]s.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;

use xlat::{Coherency, TableAllocator, TranslationTable, VirtualAddress};

use crate::domain::{DmaBuffer, Domain, DomainAllocator, DomainId};
use crate::fault::{FaultRecord, FaultReport};
use crate::registers::{
    Capability, ContextCommand, ExtendedCapability, FaultEventControl, FaultStatus, GlobalCommand,
    GlobalStatus, Granularity, IotlbCommand, RegisterAccess, RootTableAddress, Version, offset,
};
use crate::root_table::ManagedRootTable;
use crate::{Config, IommuError, PollPolicy, RoutingId};

/// Highest architecture major version that still supports register-based invalidation.
const MAX_REGISTER_INVALIDATION_MAJOR: u8 = 5;

/// Address and payload of a message-signalled interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    pub address: u32,
    pub data: u32,
}

/// The interrupt a unit signals fault events on.
pub trait FaultInterrupt {
    /// Acknowledges the interrupt so the next fault event is delivered.
    fn ack(&mut self);

    /// The MSI the unit must send, or `None` if the interrupt is not an MSI.
    fn msi(&self) -> Option<MsiMessage>;
}

/// Outcome of a cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// The hardware performed the requested granularity or a finer one.
    Performed(Granularity),
    /// The hardware invalidated more than requested.
    Coarser {
        requested: Granularity,
        performed: Granularity,
    },
    /// The hardware reported that nothing was invalidated.
    Failed { requested: Granularity },
    /// The unit does not support register-based invalidation.
    Unsupported,
}

impl Invalidation {
    /// Returns whether stale entries are guaranteed to be gone.
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Performed(_) | Self::Coarser { .. })
    }
}

/// Driver of one VT-d remapping unit.
pub struct IoMmu<R: RegisterAccess> {
    name: String,
    regs: R,
    config: Config,
    capability: Capability,
    extended: ExtendedCapability,
    root_table: ManagedRootTable,
    domain_ids: DomainAllocator,
    fault_irq: Option<Box<dyn FaultInterrupt>>,
}

impl<R: RegisterAccess> IoMmu<R> {
    /// Takes over the unit behind `regs`.
    ///
    /// The root and context tables are built in `context_tables`. The unit's caches
    /// are invalidated if it does not do so itself when the root table is set, fault
    /// events are routed to `fault_irq`, and the root table pointer is latched.
    /// Translation stays disabled until [`enable`](Self::enable).
    pub fn new(
        name: impl Into<String>,
        regs: R,
        context_tables: TableAllocator,
        fault_irq: Option<Box<dyn FaultInterrupt>>,
        config: Config,
    ) -> Result<Self, IommuError> {
        let name = name.into();
        let capability = Capability(regs.read64(offset::CAPABILITY));
        let extended = ExtendedCapability(regs.read64(offset::EXTENDED_CAPABILITY));

        // TODO: 3- and 5-level second-level tables.
        if !capability.supports_4_level() {
            log::error!("IOMMU {} does not support 4-level page tables", name);
            return Err(IommuError::UnsupportedTableDepth);
        }

        let coherency = if extended.page_walk_coherency() {
            Coherency::Coherent
        } else {
            Coherency::NonCoherent
        };
        let root_table = ManagedRootTable::new(context_tables, coherency)?;

        let mut iommu = Self {
            name,
            regs,
            config,
            capability,
            extended,
            root_table,
            domain_ids: DomainAllocator::new(capability.max_domains()),
            fault_irq,
        };

        if !capability.esrtps() {
            iommu.invalidate_all(None, None);
        } else if iommu.global_status().enabled() {
            log::error!("IOMMU {} already enabled", iommu.name);
            return Err(IommuError::AlreadyEnabled);
        }

        if capability.rwbf() && !capability.caching_mode() {
            log::warn!(
                "IOMMU {} requires explicit write-buffer flushing (not implemented)",
                iommu.name
            );
        }

        iommu.setup_fault_interrupt();

        iommu.regs.write64(
            offset::ROOT_TABLE_ADDRESS,
            RootTableAddress::legacy(iommu.root_table.phys_addr().as_u64()),
        );
        iommu.global_command(GlobalCommand::SRTP, true);

        log::debug!(
            "IOMMU {}: version {}, {:?}, {:?}, root table at {}",
            iommu.name,
            iommu.version(),
            capability,
            extended,
            iommu.root_table.phys_addr()
        );
        Ok(iommu)
    }

    fn setup_fault_interrupt(&mut self) {
        let Some(irq) = self.fault_irq.as_mut() else {
            return;
        };
        irq.ack();

        let Some(msi) = irq.msi() else {
            log::error!("unable to enable fault event interrupts for {}", self.name);
            return;
        };
        self.regs.write32(offset::FAULT_EVENT_ADDRESS, msi.address);
        self.regs.write32(offset::FAULT_EVENT_DATA, msi.data);
        let control =
            FaultEventControl::from_bits_retain(self.regs.read32(offset::FAULT_EVENT_CONTROL));
        self.regs.write32(
            offset::FAULT_EVENT_CONTROL,
            control.difference(FaultEventControl::MASK).bits(),
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The register page of the unit.
    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn version(&self) -> Version {
        Version(self.regs.read32(offset::VERSION))
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn extended_capability(&self) -> ExtendedCapability {
        self.extended
    }

    /// Whether the unit may cache not-present translations.
    pub fn caching_mode(&self) -> bool {
        self.capability.caching_mode()
    }

    /// Whether the unit's table walker snoops the CPU cache.
    pub fn coherent_page_walk(&self) -> bool {
        self.extended.page_walk_coherency()
    }

    /// How tables walked by this unit must be written.
    pub fn coherency(&self) -> Coherency {
        if self.coherent_page_walk() {
            Coherency::Coherent
        } else {
            Coherency::NonCoherent
        }
    }

    pub fn global_status(&self) -> GlobalStatus {
        GlobalStatus::from_bits_retain(self.regs.read32(offset::GLOBAL_STATUS))
    }

    pub fn fault_status(&self) -> FaultStatus {
        FaultStatus(self.regs.read32(offset::FAULT_STATUS))
    }

    pub fn root_table(&self) -> &ManagedRootTable {
        &self.root_table
    }

    pub fn root_table_mut(&mut self) -> &mut ManagedRootTable {
        &mut self.root_table
    }

    /// Domain ids still available for new domains.
    pub fn available_domains(&self) -> usize {
        self.domain_ids.available()
    }

    /// Turns on DMA remapping.
    pub fn enable(&mut self) {
        self.global_command(GlobalCommand::ENABLE, true);
        if self.config.verbose {
            log::info!("enabled IOMMU {}", self.name);
        }
    }

    /// Turns off DMA remapping.
    pub fn disable(&mut self) {
        self.global_command(GlobalCommand::ENABLE, false);
        if self.config.verbose {
            log::info!("disabled IOMMU {}", self.name);
        }
    }

    /// Sets or clears `bit` through the global command register and waits until the
    /// status register reflects it.
    fn global_command(&self, bit: GlobalCommand, set: bool) {
        let mut status = self.regs.read32(offset::GLOBAL_STATUS);
        let mut command =
            GlobalCommand::from_bits_retain(status).difference(GlobalCommand::ONE_SHOT);

        command.set(bit, set);
        if set {
            status |= bit.bits();
        } else {
            status &= !bit.bits();
        }

        self.regs.write32(offset::GLOBAL_COMMAND, command.bits());
        self.poll("global command", || {
            self.regs.read32(offset::GLOBAL_STATUS) == status
        });
    }

    /// Spins until `done` holds, honouring the configured poll policy.
    fn poll(&self, what: &str, mut done: impl FnMut() -> bool) {
        let mut spins: u64 = 0;
        while !done() {
            spins += 1;
            if let PollPolicy::Fatal { max_spins } = self.config.poll {
                if spins >= max_spins {
                    panic!("IOMMU {}: {} did not complete after {} polls", self.name, what, spins);
                }
            }
            core::hint::spin_loop();
        }
    }

    fn check_granularity(
        &self,
        cache: &str,
        requested: Granularity,
        actual: Option<Granularity>,
    ) -> Invalidation {
        match actual {
            None => {
                log::error!(
                    "IOMMU {}: {} invalidation failed (scope={})",
                    self.name,
                    cache,
                    requested
                );
                Invalidation::Failed { requested }
            }
            Some(performed) if performed.is_coarser_than(requested) => {
                if self.config.verbose {
                    log::warn!(
                        "IOMMU {}: performed {} invalidation with different granularity (requested={}, actual={})",
                        self.name,
                        cache,
                        requested,
                        performed
                    );
                }
                Invalidation::Coarser {
                    requested,
                    performed,
                }
            }
            Some(performed) => Invalidation::Performed(performed),
        }
    }

    fn read_iotlb(&self) -> IotlbCommand {
        IotlbCommand(self.regs.read64(self.extended.iotlb_offset()))
    }

    /// Invalidates the IOTLB, globally or for `domain`.
    ///
    /// The range of `addr` and `size` is not used to narrow the invalidation; the
    /// whole domain is always invalidated.
    pub fn invalidate_iotlb(
        &self,
        domain: Option<DomainId>,
        addr: VirtualAddress,
        size: u64,
    ) -> Invalidation {
        let domain = domain.filter(|id| id.is_valid());
        let requested = match domain {
            Some(_) => Granularity::Domain,
            None => Granularity::Global,
        };
        log::trace!(
            "IOMMU {}: IOTLB invalidation ({}) for {} bytes at {}",
            self.name,
            requested,
            size,
            addr
        );

        self.poll("IOTLB invalidation", || !self.read_iotlb().in_progress());
        let command = IotlbCommand::invalidate(requested, domain.map_or(0, DomainId::as_u16));
        self.regs.write64(self.extended.iotlb_offset(), command.0);
        self.poll("IOTLB invalidation", || !self.read_iotlb().in_progress());

        self.check_granularity("IOTLB", requested, self.read_iotlb().actual())
    }

    fn read_context_command(&self) -> ContextCommand {
        ContextCommand(self.regs.read64(offset::CONTEXT_COMMAND))
    }

    /// Invalidates the context cache and then the IOTLB.
    ///
    /// The context cache is invalidated for the device `rid` if given, otherwise for
    /// `domain` if given, otherwise globally. The returned outcome is that of the
    /// context-cache invalidation.
    pub fn invalidate_all(&self, domain: Option<DomainId>, rid: Option<RoutingId>) -> Invalidation {
        if self.version().major() > MAX_REGISTER_INVALIDATION_MAJOR {
            log::error!(
                "IOMMU {}: unable to invalidate caches, register-based invalidation only supported up to architecture version {}",
                self.name,
                MAX_REGISTER_INVALIDATION_MAJOR
            );
            return Invalidation::Unsupported;
        }

        let domain = domain.filter(|id| id.is_valid());
        let requested = match (domain, rid) {
            (_, Some(_)) => Granularity::Device,
            (Some(_), None) => Granularity::Domain,
            (None, None) => Granularity::Global,
        };

        self.poll("context-cache invalidation", || {
            !self.read_context_command().in_progress()
        });
        let command = ContextCommand::invalidate(
            requested,
            rid.map_or(0, RoutingId::as_u16),
            domain.map_or(0, DomainId::as_u16),
        );
        self.regs.write64(offset::CONTEXT_COMMAND, command.0);
        self.poll("context-cache invalidation", || {
            !self.read_context_command().in_progress()
        });

        let outcome =
            self.check_granularity("context-cache", requested, self.read_context_command().actual());

        self.invalidate_iotlb(domain, VirtualAddress::zero(), 0);
        outcome
    }

    fn fault_record_offset(&self, index: usize) -> usize {
        self.capability.fault_record_offset() + index * 16
    }

    /// Services a fault event.
    ///
    /// Acknowledges the interrupt and the fault status, then drains the fault-record
    /// ring from the first pending record up to the first empty one. At most one pass
    /// over the ring is made, so records the hardware keeps reporting cannot stall
    /// the caller.
    pub fn handle_faults(&mut self) -> FaultReport {
        if let Some(irq) = self.fault_irq.as_mut() {
            irq.ack();
        }

        let mut report = FaultReport::default();
        let status = self.fault_status();
        if !status.pending() {
            return report;
        }

        if status.overflow() {
            log::error!("IOMMU {}: fault recording overflow", self.name);
            report.overflow = true;
        }
        if status.queue_error() {
            log::error!("IOMMU {}: invalidation queue error", self.name);
            report.queue_error = true;
        }
        self.regs.write32(offset::FAULT_STATUS, FaultStatus::CLEAR_ALL);

        log::error!("fault records for {}", self.name);
        let count = self.capability.fault_records();
        let mut index = status.first_record_index() % count;
        for _ in 0..count {
            let record_offset = self.fault_record_offset(index);
            let hi = self.regs.read64(record_offset + 8);
            let lo = self.regs.read64(record_offset);
            let Some(record) = FaultRecord::decode(index, lo, hi) else {
                break;
            };

            log::error!("{}", record);
            self.regs.write64(record_offset + 8, FaultRecord::clear_fault());
            report.records.push(record);
            index = (index + 1) % count;
        }

        report
    }

    /// Creates a domain whose tables live in `tables`.
    ///
    /// Every buffer of `buffers` is mapped into the new domain.
    pub fn create_domain(
        &mut self,
        mut tables: TableAllocator,
        buffers: &[DmaBuffer],
    ) -> Result<Domain, IommuError> {
        let id = self.domain_ids.alloc()?;
        let table = match TranslationTable::new(&mut tables, self.coherency()) {
            Ok(table) => table,
            Err(error) => {
                self.domain_ids.free(id);
                return Err(error.into());
            }
        };

        let mut domain = Domain::new(id, table, tables);
        for buffer in buffers {
            if let Err(error) = domain.add_range(&*self, buffer.range(), buffer.phys_addr) {
                log::error!(
                    "IOMMU {}: unable to map DMA buffer {} into domain {}: {}",
                    self.name,
                    buffer.range(),
                    id,
                    error
                );
                self.destroy_domain(domain);
                return Err(error);
            }
        }

        log::debug!("IOMMU {}: created domain {}", self.name, id);
        Ok(domain)
    }

    /// Tears down `domain` and returns its table pool with every node free.
    ///
    /// Every context entry referencing the domain's table is removed, the domain's
    /// cached translations are invalidated and its id is returned to the pool
    /// before the tables are freed.
    pub fn destroy_domain(&mut self, mut domain: Domain) -> TableAllocator {
        let removed = self.root_table.remove_all_contexts(domain.table_root());
        self.invalidate_all(Some(domain.id()), None);
        self.domain_ids.free(domain.id());

        log::debug!(
            "IOMMU {}: destroyed domain {} ({} context entries removed)",
            self.name,
            domain.id(),
            removed
        );
        domain.release()
    }

    /// Logs the unit's registers and every present context entry.
    pub fn dump_state(&self) {
        log::debug!("IOMMU {} (version {})", self.name, self.version());
        log::debug!("  {:?}", self.capability);
        log::debug!("  {:?}", self.extended);
        log::debug!("  {:?}", self.global_status());
        log::debug!("  {:?}", self.fault_status());
        let control =
            FaultEventControl::from_bits_retain(self.regs.read32(offset::FAULT_EVENT_CONTROL));
        log::debug!("  {:?}", control);

        if !self.global_status().root_table_pointer_set() {
            return;
        }

        let root = self.regs.read64(offset::ROOT_TABLE_ADDRESS);
        log::debug!("  root table at {:#x}", RootTableAddress::address(root));
        if RootTableAddress::mode(root) != RootTableAddress::LEGACY {
            log::error!("IOMMU {}: only legacy translation mode is supported", self.name);
            return;
        }

        self.root_table.for_each_context(|bdf, entry| {
            log::debug!("    {}: {:?}", bdf, entry);
        });
    }
}

impl<R: RegisterAccess> fmt::Debug for IoMmu<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoMmu")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("extended", &self.extended)
            .field("root_table", &self.root_table.phys_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::Cell;

    use xlat::{PhysicalAddress, TableError};

    use crate::domain::IoRange;
    use crate::fault::{FaultReason, RequestType};
    use crate::root_table::{ContextChange, ContextRemoval};
    use crate::{Bdf, EmulatedConfig, EmulatedUnit};

    const CONTEXT_BASE: PhysicalAddress = PhysicalAddress::new(0x10_0000);
    const DOMAIN_A_BASE: PhysicalAddress = PhysicalAddress::new(0x100_0000);
    const DOMAIN_B_BASE: PhysicalAddress = PhysicalAddress::new(0x200_0000);

    fn context_tables() -> TableAllocator {
        TableAllocator::new(CONTEXT_BASE, 8).unwrap()
    }

    fn domain_tables(base: PhysicalAddress) -> TableAllocator {
        TableAllocator::new(base, 16).unwrap()
    }

    fn iommu(unit: &EmulatedUnit) -> IoMmu<&EmulatedUnit> {
        IoMmu::new("drhd0", unit, context_tables(), None, Config::default()).unwrap()
    }

    struct CountingIrq {
        acks: Rc<Cell<usize>>,
        msi: Option<MsiMessage>,
    }

    impl FaultInterrupt for CountingIrq {
        fn ack(&mut self) {
            self.acks.set(self.acks.get() + 1);
        }

        fn msi(&self) -> Option<MsiMessage> {
            self.msi
        }
    }

    fn sample_fault(source: Bdf) -> FaultRecord {
        FaultRecord {
            index: 0,
            reason: FaultReason::ContextEntryNotPresent,
            request: RequestType::Read,
            address_type: 0,
            execute: false,
            privileged: false,
            pasid: None,
            source: source.routing_id(),
            address: 0x7000,
        }
    }

    mod construction {
        use super::*;

        #[test]
        fn latches_root_table() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let iommu = iommu(&unit);

            assert_eq!(unit.root_table_address(), iommu.root_table().phys_addr().as_u64());
            assert!(iommu.global_status().root_table_pointer_set());
            assert!(!iommu.global_status().enabled());
            // ESRTPS is set, so no invalidation is needed.
            assert!(unit.context_commands().is_empty());
        }

        #[test]
        fn invalidates_without_esrtps() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                esrtps: false,
                ..EmulatedConfig::default()
            });
            iommu(&unit);

            let commands = unit.context_commands();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].requested(), Some(Granularity::Global));
            assert_eq!(unit.iotlb_commands().len(), 1);
        }

        #[test]
        fn rejects_missing_4_level_support() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                sagaw_4_level: false,
                ..EmulatedConfig::default()
            });
            let result = IoMmu::new("drhd0", &unit, context_tables(), None, Config::default());
            assert_eq!(result.err(), Some(IommuError::UnsupportedTableDepth));
        }

        #[test]
        fn rejects_enabled_unit() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                already_enabled: true,
                ..EmulatedConfig::default()
            });
            let result = IoMmu::new("drhd0", &unit, context_tables(), None, Config::default());
            assert_eq!(result.err(), Some(IommuError::AlreadyEnabled));
        }

        #[test]
        fn programs_fault_interrupt() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let acks = Rc::new(Cell::new(0));
            let irq = CountingIrq {
                acks: acks.clone(),
                msi: Some(MsiMessage {
                    address: 0xfee0_0000,
                    data: 0x41,
                }),
            };

            IoMmu::new("drhd0", &unit, context_tables(), Some(Box::new(irq)), Config::default())
                .unwrap();
            assert_eq!(acks.get(), 1);
            assert_eq!(unit.fault_event_address(), 0xfee0_0000);
            assert_eq!(unit.fault_event_data(), 0x41);
            assert!(!unit.fault_event_control().contains(FaultEventControl::MASK));
        }

        #[test]
        fn leaves_interrupt_masked_without_msi() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let irq = CountingIrq {
                acks: Rc::new(Cell::new(0)),
                msi: None,
            };

            IoMmu::new("drhd0", &unit, context_tables(), Some(Box::new(irq)), Config::default())
                .unwrap();
            assert!(unit.fault_event_control().contains(FaultEventControl::MASK));
        }

        #[test]
        fn enable_and_disable() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);

            iommu.enable();
            assert!(unit.global_status().enabled());
            assert!(unit.global_status().root_table_pointer_set());

            iommu.disable();
            assert!(!unit.global_status().enabled());
        }
    }

    mod invalidation {
        use super::*;

        #[test]
        fn granularity_follows_arguments() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let iommu = iommu(&unit);
            let rid = Bdf::new(0, 2, 0).routing_id();

            assert_eq!(
                iommu.invalidate_all(Some(DomainId::new(3)), Some(rid)),
                Invalidation::Performed(Granularity::Device)
            );
            assert_eq!(
                iommu.invalidate_all(Some(DomainId::new(3)), None),
                Invalidation::Performed(Granularity::Domain)
            );
            assert_eq!(
                iommu.invalidate_all(None, None),
                Invalidation::Performed(Granularity::Global)
            );

            let context = unit.context_commands();
            assert_eq!(context[0].source_id(), rid.as_u16());
            assert_eq!(context[0].domain_id(), 3);

            // Every context-cache invalidation is followed by an IOTLB invalidation.
            let iotlb = unit.iotlb_commands();
            assert_eq!(iotlb.len(), 3);
            assert_eq!(iotlb[0].requested(), Some(Granularity::Domain));
            assert_eq!(iotlb[0].domain_id(), 3);
            assert_eq!(iotlb[2].requested(), Some(Granularity::Global));
        }

        #[test]
        fn invalid_domain_means_global() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let iommu = iommu(&unit);
            let outcome = iommu.invalidate_iotlb(Some(DomainId::INVALID), VirtualAddress::zero(), 0);
            assert_eq!(outcome, Invalidation::Performed(Granularity::Global));
        }

        #[test]
        fn coarser_granularity_is_reported() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                iotlb_granularity: Some(Granularity::Global as u64),
                ..EmulatedConfig::default()
            });
            let iommu = iommu(&unit);

            let outcome = iommu.invalidate_iotlb(Some(DomainId::new(1)), VirtualAddress::zero(), 0);
            assert_eq!(
                outcome,
                Invalidation::Coarser {
                    requested: Granularity::Domain,
                    performed: Granularity::Global
                }
            );
            assert!(outcome.succeeded());
        }

        #[test]
        fn zero_granularity_is_a_failure() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                context_granularity: Some(0),
                ..EmulatedConfig::default()
            });
            let iommu = iommu(&unit);

            let outcome = iommu.invalidate_all(Some(DomainId::new(1)), None);
            assert_eq!(outcome, Invalidation::Failed { requested: Granularity::Domain });
            assert!(!outcome.succeeded());
            // The IOTLB is still invalidated, without retrying the context cache.
            assert_eq!(unit.context_commands().len(), 1);
            assert_eq!(unit.iotlb_commands().len(), 1);
        }

        #[test]
        fn busy_unit_is_polled() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                busy_polls: 3,
                ..EmulatedConfig::default()
            });
            let iommu = iommu(&unit);
            assert!(iommu.invalidate_all(None, None).succeeded());
        }

        #[test]
        #[should_panic(expected = "did not complete after 5 polls")]
        fn stalled_unit_is_fatal_when_bounded() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let iommu =
                IoMmu::new("drhd0", &unit, context_tables(), None, Config::strict(5)).unwrap();
            unit.set_busy_polls(u32::MAX);
            iommu.invalidate_iotlb(None, VirtualAddress::zero(), 0);
        }

        #[test]
        fn newer_units_are_refused() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                version: 0x60,
                ..EmulatedConfig::default()
            });
            let iommu = iommu(&unit);

            assert_eq!(iommu.invalidate_all(None, None), Invalidation::Unsupported);
            assert!(unit.context_commands().is_empty());
            assert!(unit.iotlb_commands().is_empty());
        }
    }

    mod faults {
        use super::*;

        #[test]
        fn nothing_pending() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            assert_eq!(iommu.handle_faults(), FaultReport::default());
        }

        #[test]
        fn drains_and_clears_records() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            unit.raise_fault(0, sample_fault(Bdf::new(0, 2, 0)));
            unit.raise_fault(1, sample_fault(Bdf::new(0, 3, 0)));

            let report = iommu.handle_faults();
            assert_eq!(report.records.len(), 2);
            assert_eq!(report.records[0].source, Bdf::new(0, 2, 0).routing_id());
            assert_eq!(report.records[1].index, 1);
            assert_eq!(report.records[1].address, 0x7000);
            assert!(!report.overflow);

            assert!(!iommu.fault_status().pending());
            assert!(iommu.handle_faults().records.is_empty());
        }

        #[test]
        fn ring_wraps_from_first_record_index() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            unit.raise_fault(3, sample_fault(Bdf::new(1, 0, 0)));
            unit.raise_fault(0, sample_fault(Bdf::new(2, 0, 0)));

            let report = iommu.handle_faults();
            let indices: Vec<_> = report.records.iter().map(|r| r.index).collect();
            assert_eq!(indices, vec![3, 0]);
        }

        #[test]
        fn ring_is_bounded_by_record_count() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                sticky_faults: true,
                ..EmulatedConfig::default()
            });
            let mut iommu = iommu(&unit);
            for index in 0..4 {
                unit.raise_fault(index, sample_fault(Bdf::new(0, index as u8, 0)));
            }

            assert_eq!(iommu.handle_faults().records.len(), 4);
            assert_eq!(iommu.handle_faults().records.len(), 4);
        }

        #[test]
        fn reports_overflow_and_acknowledges_interrupt() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let acks = Rc::new(Cell::new(0));
            let irq = CountingIrq {
                acks: acks.clone(),
                msi: None,
            };
            let mut iommu =
                IoMmu::new("drhd0", &unit, context_tables(), Some(Box::new(irq)), Config::default())
                    .unwrap();

            unit.raise_fault(0, sample_fault(Bdf::new(0, 2, 0)));
            unit.set_fault_overflow();

            let report = iommu.handle_faults();
            assert!(report.overflow);
            assert_eq!(acks.get(), 2);
            assert!(!iommu.fault_status().overflow());
        }
    }

    mod domains {
        use super::*;

        #[test]
        fn overlapping_windows_stay_isolated() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let mut a = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            let mut b = iommu.create_domain(domain_tables(DOMAIN_B_BASE), &[]).unwrap();
            let window = IoRange::new(VirtualAddress::new(0x10_0000), 0x4000);

            a.add_range(&iommu, window, PhysicalAddress::new(0x4000_0000)).unwrap();
            b.add_range(&iommu, window, PhysicalAddress::new(0x8000_0000)).unwrap();

            let va = VirtualAddress::new(0x10_1000);
            assert_eq!(a.translate(va).unwrap().address, PhysicalAddress::new(0x4000_1000));
            assert_eq!(b.translate(va).unwrap().address, PhysicalAddress::new(0x8000_1000));

            iommu.destroy_domain(a);
            iommu.destroy_domain(b);
        }

        #[test]
        fn enable_overwrites_and_is_idempotent() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let mut a = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            let mut b = iommu.create_domain(domain_tables(DOMAIN_B_BASE), &[]).unwrap();
            let bdf = Bdf::new(0, 2, 0);

            assert_eq!(a.enable_pci_device(&mut iommu, bdf), Ok(ContextChange::Installed));
            assert_eq!(a.enable_pci_device(&mut iommu, bdf), Ok(ContextChange::Unchanged));
            // Not in caching mode, so nothing was invalidated yet.
            assert!(unit.context_commands().is_empty());

            let change = b.enable_pci_device(&mut iommu, bdf).unwrap();
            assert!(matches!(change, ContextChange::Replaced { previous } if previous.domain() == a.id()));
            let entry = iommu.root_table().context(bdf);
            assert_eq!(entry.domain(), b.id());
            assert_eq!(entry.stage2_pointer(), b.table_root());

            // The displaced binding is invalidated for the device.
            let commands = unit.context_commands();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].domain_id(), a.id().as_u16());
            assert_eq!(commands[0].source_id(), bdf.routing_id().as_u16());

            // A now holds a foreign entry's device; removal still clears it.
            assert_eq!(
                a.disable_pci_device(&mut iommu, bdf),
                ContextRemoval::Foreign { found: b.table_root() }
            );
            assert!(!iommu.root_table().context(bdf).present());

            iommu.destroy_domain(a);
            iommu.destroy_domain(b);
        }

        #[test]
        fn caching_mode_invalidates_after_every_change() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                caching_mode: true,
                ..EmulatedConfig::default()
            });
            let mut iommu = iommu(&unit);
            let mut domain = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            let range = IoRange::new(VirtualAddress::new(0x1000), 0x1000);

            domain.add_range(&iommu, range, PhysicalAddress::new(0x20_0000)).unwrap();
            assert_eq!(unit.iotlb_commands().len(), 1);

            domain.enable_pci_device(&mut iommu, Bdf::new(0, 2, 0)).unwrap();
            let commands = unit.context_commands();
            assert_eq!(commands.len(), 1);
            assert_eq!(commands[0].requested(), Some(Granularity::Device));
            assert_eq!(unit.iotlb_commands().len(), 2);

            domain.remove_range(&iommu, range).unwrap();
            assert_eq!(unit.iotlb_commands().len(), 3);

            iommu.destroy_domain(domain);
        }

        #[test]
        fn caching_mode_invalidates_after_partial_mapping() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                caching_mode: true,
                ..EmulatedConfig::default()
            });
            let mut iommu = iommu(&unit);
            let mut domain = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            let taken = IoRange::new(VirtualAddress::new(0x2000), 0x1000);
            domain.add_range(&iommu, taken, PhysicalAddress::new(0x30_0000)).unwrap();
            assert_eq!(unit.iotlb_commands().len(), 1);

            let range = IoRange::new(VirtualAddress::new(0x1000), 0x2000);
            let result = domain.add_range(&iommu, range, PhysicalAddress::new(0x40_0000));
            assert!(matches!(result, Err(IommuError::Table(TableError::DoubleInsertion { .. }))));
            assert!(domain.translate(VirtualAddress::new(0x1000)).is_some());

            let commands = unit.iotlb_commands();
            assert_eq!(commands.len(), 2);
            assert_eq!(commands[1].requested(), Some(Granularity::Domain));
            assert_eq!(commands[1].domain_id(), domain.id().as_u16());

            iommu.destroy_domain(domain);
        }

        #[test]
        fn removal_always_invalidates() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let mut domain = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            let range = IoRange::new(VirtualAddress::new(0x1000), 0x1000);
            let bdf = Bdf::new(0, 2, 0);

            domain.add_range(&iommu, range, PhysicalAddress::new(0x20_0000)).unwrap();
            domain.enable_pci_device(&mut iommu, bdf).unwrap();
            assert!(unit.iotlb_commands().is_empty());

            domain.remove_range(&iommu, range).unwrap();
            let iotlb = unit.iotlb_commands();
            assert_eq!(iotlb.len(), 1);
            assert_eq!(iotlb[0].domain_id(), domain.id().as_u16());

            assert_eq!(domain.disable_pci_device(&mut iommu, bdf), ContextRemoval::Removed);
            assert_eq!(unit.context_commands()[0].requested(), Some(Granularity::Domain));
            assert_eq!(domain.devices().count(), 0);

            iommu.destroy_domain(domain);
        }

        #[test]
        fn destroy_tears_everything_down() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let available = iommu.available_domains();
            let mut domain = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            let id = domain.id();

            domain
                .add_range(&iommu, IoRange::new(VirtualAddress::new(0x1000), 0x1000), PhysicalAddress::new(0x20_0000))
                .unwrap();
            domain.enable_pci_device(&mut iommu, Bdf::new(0, 2, 0)).unwrap();
            domain.enable_pci_device(&mut iommu, Bdf::new(3, 0, 1)).unwrap();
            assert_eq!(domain.tables().used_count(), 4);
            assert_eq!(iommu.available_domains(), available - 1);

            let tables = iommu.destroy_domain(domain);
            assert_eq!(tables.used_count(), 0);
            assert_eq!(iommu.available_domains(), available);
            assert!(!iommu.root_table().context(Bdf::new(0, 2, 0)).present());
            assert!(!iommu.root_table().context(Bdf::new(3, 0, 1)).present());

            let commands = unit.context_commands();
            let last = commands.last().unwrap();
            assert_eq!(last.requested(), Some(Granularity::Domain));
            assert_eq!(last.domain_id(), id.as_u16());
        }

        #[test]
        fn create_maps_registered_buffers() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let buffers = [
                DmaBuffer {
                    dma_addr: VirtualAddress::new(0x1000),
                    phys_addr: PhysicalAddress::new(0x30_0000),
                    size: 0x2000,
                },
                DmaBuffer {
                    dma_addr: VirtualAddress::new(0x20_0000),
                    phys_addr: PhysicalAddress::new(0x40_0000),
                    size: 0x20_0000,
                },
            ];

            let domain = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &buffers).unwrap();
            let small = domain.translate(VirtualAddress::new(0x2000)).unwrap();
            assert_eq!(small.address, PhysicalAddress::new(0x30_1000));
            let large = domain.translate(VirtualAddress::new(0x20_0000)).unwrap();
            assert_eq!(large.page_size, 0x20_0000);
            assert!(large.flags.is_writable());

            iommu.destroy_domain(domain);
        }

        #[test]
        fn failed_buffer_replay_releases_the_domain() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let available = iommu.available_domains();
            let buffers = [DmaBuffer {
                dma_addr: VirtualAddress::new(0x1001),
                phys_addr: PhysicalAddress::new(0x30_0000),
                size: 0x1000,
            }];

            let result = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &buffers);
            assert!(matches!(result, Err(IommuError::Table(TableError::InvalidRange { .. }))));
            assert_eq!(iommu.available_domains(), available);
        }

        #[test]
        fn domain_ids_run_out() {
            let unit = EmulatedUnit::new(EmulatedConfig {
                domains: 0,
                ..EmulatedConfig::default()
            });
            let mut iommu = iommu(&unit);
            let mut domains = Vec::new();
            for index in 0..15u64 {
                let base = PhysicalAddress::new(0x100_0000 + index * 0x1_0000);
                domains.push(iommu.create_domain(TableAllocator::new(base, 1).unwrap(), &[]).unwrap());
            }

            let result = iommu.create_domain(domain_tables(DOMAIN_B_BASE), &[]);
            assert_eq!(result.err(), Some(IommuError::DomainIdsExhausted));

            for domain in domains {
                iommu.destroy_domain(domain);
            }
            assert_eq!(iommu.available_domains(), 15);
        }

        #[test]
        fn dump_state_walks_contexts() {
            let unit = EmulatedUnit::new(EmulatedConfig::default());
            let mut iommu = iommu(&unit);
            let mut domain = iommu.create_domain(domain_tables(DOMAIN_A_BASE), &[]).unwrap();
            domain.enable_pci_device(&mut iommu, Bdf::new(0, 2, 0)).unwrap();

            iommu.dump_state();

            iommu.destroy_domain(domain);
        }
    }
}
