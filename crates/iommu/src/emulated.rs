//! A software model of a VT-d register page.
//!
//! [`EmulatedUnit`] answers register accesses the way a remapping unit does for
//! everything the driver touches: global command/status handshakes, register-based
//! invalidation with configurable completion latency and reported granularity, the
//! fault status register and a ring of fault-recording registers. It performs no
//! translation.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::fault::FaultRecord;
use tock_registers::LocalRegisterCopy;

use crate::registers::{
    CAP, Capability, ContextCommand, ECAP, ExtendedCapability, FaultEventControl, FaultStatus,
    GlobalCommand, GlobalStatus, IotlbCommand, RegisterAccess, offset,
};

/// Hardware properties of an emulated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedConfig {
    /// Encoded domain count (`Capability.Domains`).
    pub domains: u8,
    pub caching_mode: bool,
    /// Page-walk coherency.
    pub coherent: bool,
    pub esrtps: bool,
    pub rwbf: bool,
    pub sagaw_4_level: bool,
    /// Number of fault-recording registers.
    pub fault_records: usize,
    /// IOTLB register block offset in 16-byte units.
    pub iotlb_register_offset: u16,
    /// Fault-recording register offset in 16-byte units.
    pub fault_record_offset: u16,
    /// Raw version register.
    pub version: u32,
    /// Reported context-cache granularity; by default the requested one.
    pub context_granularity: Option<u64>,
    /// Reported IOTLB granularity; by default the requested one.
    pub iotlb_granularity: Option<u64>,
    /// Reads of an invalidation register before a command completes.
    pub busy_polls: u32,
    /// Fault records ignore software clearing their fault bit.
    pub sticky_faults: bool,
    /// Translation is enabled on reset.
    pub already_enabled: bool,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            domains: 2,
            caching_mode: false,
            coherent: true,
            esrtps: true,
            rwbf: false,
            sagaw_4_level: true,
            fault_records: 4,
            iotlb_register_offset: 0x10,
            fault_record_offset: 0x20,
            version: 0x10,
            context_granularity: None,
            iotlb_granularity: None,
            busy_polls: 0,
            sticky_faults: false,
            already_enabled: false,
        }
    }
}

impl EmulatedConfig {
    fn capability(&self) -> Capability {
        let mut cap = LocalRegisterCopy::<u64, CAP::Register>::new(0);
        cap.modify(CAP::Domains.val(self.domains as u64));
        cap.modify(CAP::Rwbf.val(self.rwbf as u64));
        cap.modify(CAP::CachingMode.val(self.caching_mode as u64));
        cap.modify(CAP::Sagaw4Level.val(self.sagaw_4_level as u64));
        cap.modify(CAP::RecordOffset.val(self.fault_record_offset as u64));
        cap.modify(CAP::Records.val(self.fault_records.saturating_sub(1) as u64));
        cap.modify(CAP::Esrtps.val(self.esrtps as u64));
        Capability(cap.get())
    }

    fn extended_capability(&self) -> ExtendedCapability {
        let mut ecap = LocalRegisterCopy::<u64, ECAP::Register>::new(0);
        ecap.modify(ECAP::Coherency.val(self.coherent as u64));
        ecap.modify(ECAP::IotlbOffset.val(self.iotlb_register_offset as u64));
        ExtendedCapability(ecap.get())
    }
}

/// An invalidation register: the last command and how many reads until it completes.
#[derive(Default)]
struct InvalidationRegister {
    value: u64,
    busy: u32,
}

impl InvalidationRegister {
    fn submit(&mut self, command: u64, busy: u32, complete: impl FnOnce(u64) -> u64) {
        self.value = command;
        self.busy = busy;
        if busy == 0 {
            self.value = complete(command);
        }
    }

    fn read(&mut self, complete: impl FnOnce(u64) -> u64) -> u64 {
        if self.busy > 0 {
            self.busy -= 1;
            if self.busy == 0 {
                self.value = complete(self.value);
            }
        }
        self.value
    }
}

struct State {
    busy_polls: u32,
    enabled: bool,
    latched: GlobalStatus,
    root_table_address: u64,
    context: InvalidationRegister,
    iotlb: InvalidationRegister,
    context_log: Vec<ContextCommand>,
    iotlb_log: Vec<IotlbCommand>,
    overflow: bool,
    first_record: usize,
    records: Vec<(u64, u64)>,
    fault_event_control: FaultEventControl,
    fault_event_data: u32,
    fault_event_address: u32,
}

impl State {
    fn fault_pending(&self) -> bool {
        self.records
            .iter()
            .any(|(_, hi)| FaultRecord::is_fault(*hi))
    }
}

/// An emulated remapping unit.
pub struct EmulatedUnit {
    config: EmulatedConfig,
    state: Mutex<State>,
}

impl EmulatedUnit {
    pub fn new(config: EmulatedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                busy_polls: config.busy_polls,
                enabled: config.already_enabled,
                latched: GlobalStatus::empty(),
                root_table_address: 0,
                context: InvalidationRegister::default(),
                iotlb: InvalidationRegister::default(),
                context_log: Vec::new(),
                iotlb_log: Vec::new(),
                overflow: false,
                first_record: 0,
                records: vec![(0, 0); config.fault_records],
                fault_event_control: FaultEventControl::MASK,
                fault_event_data: 0,
                fault_event_address: 0,
            }),
        }
    }

    pub fn config(&self) -> &EmulatedConfig {
        &self.config
    }

    fn iotlb_offset(&self) -> usize {
        self.config.extended_capability().iotlb_offset()
    }

    /// Maps a byte offset to a fault-recording register and whether it is the high half.
    fn fault_record(&self, offset: usize) -> Option<(usize, bool)> {
        let base = self.config.capability().fault_record_offset();
        let index = offset.checked_sub(base)? / 16;
        (index < self.config.fault_records).then_some((index, offset % 16 == 8))
    }

    fn complete_context(&self, command: u64) -> u64 {
        let command = ContextCommand(command);
        let actual = self
            .config
            .context_granularity
            .unwrap_or(command.request_bits());
        command.complete(actual).0
    }

    fn complete_iotlb(&self, command: u64) -> u64 {
        let command = IotlbCommand(command);
        let actual = self
            .config
            .iotlb_granularity
            .unwrap_or(command.request_bits());
        command.complete(actual).0
    }

    /// Changes how many reads an invalidation takes to complete from now on.
    pub fn set_busy_polls(&self, polls: u32) {
        self.state.lock().busy_polls = polls;
    }

    /// Reports `record` in fault-recording register `index`.
    pub fn raise_fault(&self, index: usize, record: FaultRecord) {
        let mut state = self.state.lock();
        if !state.fault_pending() {
            state.first_record = index;
        }
        state.records[index] = record.encode();
    }

    /// Signals that fault records were lost.
    pub fn set_fault_overflow(&self) {
        self.state.lock().overflow = true;
    }

    /// Context-cache invalidations submitted so far, as written.
    pub fn context_commands(&self) -> Vec<ContextCommand> {
        self.state.lock().context_log.clone()
    }

    /// IOTLB invalidations submitted so far, as written.
    pub fn iotlb_commands(&self) -> Vec<IotlbCommand> {
        self.state.lock().iotlb_log.clone()
    }

    pub fn global_status(&self) -> GlobalStatus {
        let state = self.state.lock();
        let mut status = state.latched;
        status.set(GlobalStatus::ENABLED, state.enabled);
        status
    }

    pub fn root_table_address(&self) -> u64 {
        self.state.lock().root_table_address
    }

    pub fn fault_event_control(&self) -> FaultEventControl {
        self.state.lock().fault_event_control
    }

    pub fn fault_event_data(&self) -> u32 {
        self.state.lock().fault_event_data
    }

    pub fn fault_event_address(&self) -> u32 {
        self.state.lock().fault_event_address
    }
}

impl RegisterAccess for EmulatedUnit {
    fn read32(&self, at: usize) -> u32 {
        match at {
            offset::VERSION => self.config.version,
            offset::GLOBAL_STATUS => self.global_status().bits(),
            offset::FAULT_STATUS => {
                let state = self.state.lock();
                FaultStatus::new(state.overflow, state.fault_pending(), state.first_record).0
            }
            offset::FAULT_EVENT_CONTROL => self.fault_event_control().bits(),
            offset::FAULT_EVENT_DATA => self.fault_event_data(),
            offset::FAULT_EVENT_ADDRESS => self.fault_event_address(),
            _ => {
                log::trace!("emulated read32 of unknown register {:#x}", at);
                0
            }
        }
    }

    fn read64(&self, at: usize) -> u64 {
        match at {
            offset::CAPABILITY => self.config.capability().0,
            offset::EXTENDED_CAPABILITY => self.config.extended_capability().0,
            offset::ROOT_TABLE_ADDRESS => self.root_table_address(),
            offset::CONTEXT_COMMAND => {
                let mut state = self.state.lock();
                state.context.read(|c| self.complete_context(c))
            }
            _ if at == self.iotlb_offset() => {
                let mut state = self.state.lock();
                state.iotlb.read(|c| self.complete_iotlb(c))
            }
            _ => match self.fault_record(at) {
                Some((index, true)) => self.state.lock().records[index].1,
                Some((index, false)) => self.state.lock().records[index].0,
                None => {
                    log::trace!("emulated read64 of unknown register {:#x}", at);
                    0
                }
            },
        }
    }

    fn write32(&self, at: usize, value: u32) {
        let mut state = self.state.lock();
        match at {
            offset::GLOBAL_COMMAND => {
                let command = GlobalCommand::from_bits_retain(value);
                state.enabled = command.contains(GlobalCommand::ENABLE);
                if command.contains(GlobalCommand::SRTP) {
                    state.latched |= GlobalStatus::RTPS;
                }
                if command.contains(GlobalCommand::SIRTP) {
                    state.latched |= GlobalStatus::IRTPS;
                }
            }
            offset::FAULT_STATUS => {
                if FaultStatus(value).overflow() {
                    state.overflow = false;
                }
            }
            offset::FAULT_EVENT_CONTROL => {
                state.fault_event_control = FaultEventControl::from_bits_retain(value)
            }
            offset::FAULT_EVENT_DATA => state.fault_event_data = value,
            offset::FAULT_EVENT_ADDRESS => state.fault_event_address = value,
            _ => log::trace!("emulated write32 of unknown register {:#x}", at),
        }
    }

    fn write64(&self, at: usize, value: u64) {
        let mut state = self.state.lock();
        let busy = state.busy_polls;
        match at {
            offset::ROOT_TABLE_ADDRESS => state.root_table_address = value,
            offset::CONTEXT_COMMAND => {
                state.context_log.push(ContextCommand(value));
                state.context.submit(value, busy, |c| self.complete_context(c));
            }
            _ if at == self.iotlb_offset() => {
                state.iotlb_log.push(IotlbCommand(value));
                state.iotlb.submit(value, busy, |c| self.complete_iotlb(c));
            }
            _ => match self.fault_record(at) {
                Some((index, true)) => {
                    if FaultRecord::is_fault(value) && !self.config.sticky_faults {
                        state.records[index] = (0, 0);
                    }
                }
                _ => log::trace!("emulated write64 of unknown register {:#x}", at),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Granularity;

    #[test]
    fn capability_reflects_config() {
        let unit = EmulatedUnit::new(EmulatedConfig::default());
        let cap = Capability(unit.read64(offset::CAPABILITY));
        assert_eq!(cap.max_domains(), 256);
        assert_eq!(cap.fault_records(), 4);
        assert_eq!(cap.fault_record_offset(), 0x200);
        assert!(cap.supports_4_level());
        assert!(cap.esrtps());

        let ecap = ExtendedCapability(unit.read64(offset::EXTENDED_CAPABILITY));
        assert_eq!(ecap.iotlb_offset(), 0x108);
    }

    #[test]
    fn invalidation_completes_after_busy_reads() {
        let unit = EmulatedUnit::new(EmulatedConfig {
            busy_polls: 2,
            ..EmulatedConfig::default()
        });
        unit.write64(offset::CONTEXT_COMMAND, ContextCommand::invalidate(Granularity::Domain, 0, 1).0);

        assert!(ContextCommand(unit.read64(offset::CONTEXT_COMMAND)).in_progress());
        let done = ContextCommand(unit.read64(offset::CONTEXT_COMMAND));
        assert!(!done.in_progress());
        assert_eq!(done.actual(), Some(Granularity::Domain));
    }

    #[test]
    fn fault_status_is_write_one_to_clear() {
        let unit = EmulatedUnit::new(EmulatedConfig::default());
        unit.set_fault_overflow();
        assert!(FaultStatus(unit.read32(offset::FAULT_STATUS)).overflow());

        unit.write32(offset::FAULT_STATUS, 0);
        assert!(FaultStatus(unit.read32(offset::FAULT_STATUS)).overflow());
        unit.write32(offset::FAULT_STATUS, FaultStatus::CLEAR_ALL);
        assert!(!FaultStatus(unit.read32(offset::FAULT_STATUS)).overflow());
    }

    #[test]
    fn global_command_latches_root_pointer() {
        let unit = EmulatedUnit::new(EmulatedConfig::default());
        unit.write32(offset::GLOBAL_COMMAND, GlobalCommand::SRTP.bits());
        assert!(unit.global_status().root_table_pointer_set());

        unit.write32(offset::GLOBAL_COMMAND, GlobalCommand::ENABLE.bits());
        let status = unit.global_status();
        assert!(status.enabled());
        assert!(status.root_table_pointer_set());
    }
}
