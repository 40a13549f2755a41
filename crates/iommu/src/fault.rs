//! Decoding of primary fault records.
//!
//! Each record is a 128-bit register pair; the high word carries the fault bit and
//! the request attributes, the low word the faulting page address.

use alloc::vec::Vec;
use core::fmt;

use tock_registers::LocalRegisterCopy;

use crate::registers::{FRCD_HI, FRCD_LO};
use crate::{Bdf, RoutingId};

/// Why a request faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    Reserved,
    RootEntryNotPresent,
    ContextEntryNotPresent,
    ContextEntryInvalid,
    /// Address beyond the guest address width of the domain.
    AddressBeyondMgaw,
    WriteToReadOnly,
    ReadNotPermitted,
    PageEntryInvalid,
    RootEntryReserved,
    ContextEntryReserved,
    PageEntryReserved,
    InvalidTranslationType,
    Unknown(u8),
}

impl FaultReason {
    /// Decodes the hardware fault reason code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x0 => Self::Reserved,
            0x1 => Self::RootEntryNotPresent,
            0x2 => Self::ContextEntryNotPresent,
            0x3 => Self::ContextEntryInvalid,
            0x4 => Self::AddressBeyondMgaw,
            0x5 => Self::WriteToReadOnly,
            0x6 => Self::ReadNotPermitted,
            0x7 => Self::PageEntryInvalid,
            0x8 => Self::RootEntryReserved,
            0x9 => Self::ContextEntryReserved,
            0xa => Self::PageEntryReserved,
            0xb => Self::InvalidTranslationType,
            other => Self::Unknown(other),
        }
    }

    /// The hardware fault reason code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Reserved => 0x0,
            Self::RootEntryNotPresent => 0x1,
            Self::ContextEntryNotPresent => 0x2,
            Self::ContextEntryInvalid => 0x3,
            Self::AddressBeyondMgaw => 0x4,
            Self::WriteToReadOnly => 0x5,
            Self::ReadNotPermitted => 0x6,
            Self::PageEntryInvalid => 0x7,
            Self::RootEntryReserved => 0x8,
            Self::ContextEntryReserved => 0x9,
            Self::PageEntryReserved => 0xa,
            Self::InvalidTranslationType => 0xb,
            Self::Unknown(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::RootEntryNotPresent => "root entry not present",
            Self::ContextEntryNotPresent => "context entry not present",
            Self::ContextEntryInvalid => "invalid context entry",
            Self::AddressBeyondMgaw => "address beyond guest address width",
            Self::WriteToReadOnly => "write to read-only page",
            Self::ReadNotPermitted => "read from non-readable page",
            Self::PageEntryInvalid => "invalid page-table entry",
            Self::RootEntryReserved => "reserved bit set in root entry",
            Self::ContextEntryReserved => "reserved bit set in context entry",
            Self::PageEntryReserved => "reserved bit set in page-table entry",
            Self::InvalidTranslationType => "invalid translation type",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Kind of the faulting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Write,
    Read,
    Page,
    Atomic,
}

impl RequestType {
    /// Decodes the two type bits: `low` from bit 62 and `high` from bit 28.
    const fn from_bits(low: bool, high: bool) -> Self {
        match (high, low) {
            (false, false) => Self::Write,
            (false, true) => Self::Read,
            (true, false) => Self::Page,
            (true, true) => Self::Atomic,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
            Self::Page => write!(f, "page"),
            Self::Atomic => write!(f, "atomic"),
        }
    }
}

/// A decoded fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Index of the fault-recording register the record was read from.
    pub index: usize,
    pub reason: FaultReason,
    pub request: RequestType,
    pub address_type: u8,
    pub execute: bool,
    pub privileged: bool,
    pub pasid: Option<u16>,
    /// Requester that issued the faulting request.
    pub source: RoutingId,
    /// Page address of the faulting request.
    pub address: u64,
}

impl FaultRecord {
    /// Returns whether the high word of a fault-recording register holds a fault.
    pub fn is_fault(hi: u64) -> bool {
        LocalRegisterCopy::<u64, FRCD_HI::Register>::new(hi).is_set(FRCD_HI::Fault)
    }

    /// The high-word value that clears a fault-recording register.
    pub fn clear_fault() -> u64 {
        let mut hi = LocalRegisterCopy::<u64, FRCD_HI::Register>::new(0);
        hi.modify(FRCD_HI::Fault.val(1));
        hi.get()
    }

    /// Decodes a record, or returns `None` if its fault bit is clear.
    pub fn decode(index: usize, lo: u64, hi: u64) -> Option<Self> {
        let lo = LocalRegisterCopy::<u64, FRCD_LO::Register>::new(lo);
        let hi = LocalRegisterCopy::<u64, FRCD_HI::Register>::new(hi);
        if !hi.is_set(FRCD_HI::Fault) {
            return None;
        }

        Some(Self {
            index,
            reason: FaultReason::from_code(hi.read(FRCD_HI::Reason) as u8),
            request: RequestType::from_bits(
                hi.is_set(FRCD_HI::TypeLow),
                hi.is_set(FRCD_HI::TypeHigh),
            ),
            address_type: hi.read(FRCD_HI::AddressType) as u8,
            execute: hi.is_set(FRCD_HI::Execute),
            privileged: hi.is_set(FRCD_HI::Privileged),
            pasid: hi
                .is_set(FRCD_HI::PasidPresent)
                .then(|| hi.read(FRCD_HI::Pasid) as u16),
            source: RoutingId(hi.read(FRCD_HI::Source) as u16),
            address: lo.read(FRCD_LO::Info) << 12,
        })
    }

    /// Encodes the record as the hardware would report it.
    pub fn encode(&self) -> (u64, u64) {
        let (low, high) = match self.request {
            RequestType::Write => (0, 0),
            RequestType::Read => (1, 0),
            RequestType::Page => (0, 1),
            RequestType::Atomic => (1, 1),
        };
        let mut hi = LocalRegisterCopy::<u64, FRCD_HI::Register>::new(0);
        hi.modify(FRCD_HI::Fault.val(1));
        hi.modify(FRCD_HI::TypeLow.val(low));
        hi.modify(FRCD_HI::AddressType.val(self.address_type as u64));
        hi.modify(FRCD_HI::Pasid.val(self.pasid.unwrap_or(0) as u64));
        hi.modify(FRCD_HI::Reason.val(self.reason.code() as u64));
        hi.modify(FRCD_HI::PasidPresent.val(self.pasid.is_some() as u64));
        hi.modify(FRCD_HI::Execute.val(self.execute as u64));
        hi.modify(FRCD_HI::Privileged.val(self.privileged as u64));
        hi.modify(FRCD_HI::TypeHigh.val(high));
        hi.modify(FRCD_HI::Source.val(self.source.as_u16() as u64));

        let mut lo = LocalRegisterCopy::<u64, FRCD_LO::Register>::new(0);
        lo.modify(FRCD_LO::Info.val(self.address >> 12));
        (lo.get(), hi.get())
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault record {}: reason {:#x} ({}), {} request at {:#x} from {}, AT={} EXE={} PRIV={}",
            self.index,
            self.reason.code(),
            self.reason.description(),
            self.request,
            self.address,
            Bdf::from(self.source),
            self.address_type,
            self.execute as u8,
            self.privileged as u8,
        )?;
        if let Some(pasid) = self.pasid {
            write!(f, " PASID={pasid:#x}")?;
        }
        Ok(())
    }
}

/// What a call to [`IoMmu::handle_faults`](crate::IoMmu::handle_faults) found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultReport {
    /// Fault records were lost because all recording registers were full.
    pub overflow: bool,
    /// The invalidation queue reported an error.
    pub queue_error: bool,
    /// Records drained by this call, in ring order.
    pub records: Vec<FaultRecord>,
}
