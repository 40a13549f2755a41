//! VT-d remapping-unit registers.
//!
//! Register layouts are declared with `register_bitfields!` and decoded from raw
//! values through `LocalRegisterCopy`; single-bit registers are `bitflags`. All
//! hardware access goes through [`RegisterAccess`], so the controller can drive
//! either real MMIO or the software model.

use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;
use tock_registers::{LocalRegisterCopy, register_bitfields};

/// Byte offsets of the fixed-position registers.
pub mod offset {
    /// Version (32-bit, RO).
    pub const VERSION: usize = 0x00;
    /// Capability (64-bit, RO).
    pub const CAPABILITY: usize = 0x08;
    /// Extended capability (64-bit, RO).
    pub const EXTENDED_CAPABILITY: usize = 0x10;
    /// Global command (32-bit, WO).
    pub const GLOBAL_COMMAND: usize = 0x18;
    /// Global status (32-bit, RO).
    pub const GLOBAL_STATUS: usize = 0x1c;
    /// Root table address (64-bit, RW).
    pub const ROOT_TABLE_ADDRESS: usize = 0x20;
    /// Context command (64-bit, RW).
    pub const CONTEXT_COMMAND: usize = 0x28;
    /// Fault status (32-bit, RW1C).
    pub const FAULT_STATUS: usize = 0x34;
    /// Fault event control (32-bit, RW).
    pub const FAULT_EVENT_CONTROL: usize = 0x38;
    /// Fault event data (32-bit, RW).
    pub const FAULT_EVENT_DATA: usize = 0x3c;
    /// Fault event address (32-bit, RW).
    pub const FAULT_EVENT_ADDRESS: usize = 0x40;
}

/// Width of a remapping unit's register page.
pub const REGISTER_PAGE_SIZE: usize = 0x1000;

/// Access to a remapping unit's register page.
///
/// Offsets are byte offsets from the start of the page. Implementations perform
/// exactly one access per call; register side effects rely on it.
pub trait RegisterAccess {
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;
    fn write32(&self, offset: usize, value: u32);
    fn write64(&self, offset: usize, value: u64);
}

impl<R: RegisterAccess + ?Sized> RegisterAccess for &R {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn read64(&self, offset: usize) -> u64 {
        (**self).read64(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }

    fn write64(&self, offset: usize, value: u64) {
        (**self).write64(offset, value)
    }
}

/// A memory-mapped register page.
pub struct Mmio {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is device memory owned by this handle; accesses are volatile.
unsafe impl Send for Mmio {}

impl Mmio {
    /// Wraps a mapped register page.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` bytes of uncached device memory that stay mapped
    /// for the lifetime of the handle and are not accessed through any other handle.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    fn register<T>(&self, offset: usize) -> *mut T {
        assert!(
            offset % size_of::<T>() == 0 && offset + size_of::<T>() <= self.size,
            "register offset {offset:#x} outside of mapping"
        );
        // SAFETY: bounds were checked against the mapping.
        unsafe { self.base.as_ptr().add(offset).cast::<T>() }
    }
}

impl RegisterAccess for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `register` checks bounds and alignment within the mapping.
        unsafe { self.register::<u32>(offset).read_volatile() }
    }

    fn read64(&self, offset: usize) -> u64 {
        // SAFETY: `register` checks bounds and alignment within the mapping.
        unsafe { self.register::<u64>(offset).read_volatile() }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: `register` checks bounds and alignment within the mapping.
        unsafe { self.register::<u32>(offset).write_volatile(value) }
    }

    fn write64(&self, offset: usize, value: u64) {
        // SAFETY: `register` checks bounds and alignment within the mapping.
        unsafe { self.register::<u64>(offset).write_volatile(value) }
    }
}

/// Requested or performed scope of an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Global = 1,
    Domain = 2,
    /// Device-selective for the context cache, page-selective for the IOTLB.
    Device = 3,
}

impl Granularity {
    /// Decodes a granularity field; zero means the invalidation was not performed.
    pub const fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(Self::Global),
            2 => Some(Self::Domain),
            3 => Some(Self::Device),
            _ => None,
        }
    }

    /// Returns whether `self` covers more than `requested`.
    pub fn is_coarser_than(self, requested: Granularity) -> bool {
        self < requested
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Domain => write!(f, "domain"),
            Self::Device => write!(f, "device"),
        }
    }
}

register_bitfields![u32,
    pub VER [
        Minor OFFSET(0) NUMBITS(4),
        Major OFFSET(4) NUMBITS(4),
    ],

    pub FSTS [
        Overflow OFFSET(0) NUMBITS(1),
        Pending OFFSET(1) NUMBITS(1),
        QueueError OFFSET(4) NUMBITS(1),
        RecordIndex OFFSET(8) NUMBITS(8),
    ],
];

register_bitfields![u64,
    pub CAP [
        Domains OFFSET(0) NUMBITS(3),
        Rwbf OFFSET(4) NUMBITS(1),
        CachingMode OFFSET(7) NUMBITS(1),
        Sagaw OFFSET(9) NUMBITS(3),
        Sagaw4Level OFFSET(10) NUMBITS(1),
        RecordOffset OFFSET(24) NUMBITS(10),
        Records OFFSET(40) NUMBITS(8),
        Esrtps OFFSET(63) NUMBITS(1),
    ],

    pub ECAP [
        Coherency OFFSET(0) NUMBITS(1),
        IotlbOffset OFFSET(8) NUMBITS(10),
    ],

    pub RTADDR [
        Mode OFFSET(10) NUMBITS(2),
        Address OFFSET(12) NUMBITS(52),
    ],

    pub CCMD [
        Domain OFFSET(0) NUMBITS(16),
        Source OFFSET(16) NUMBITS(16),
        Actual OFFSET(59) NUMBITS(2),
        Request OFFSET(61) NUMBITS(2),
        Invalidate OFFSET(63) NUMBITS(1),
    ],

    pub IOTLB [
        Domain OFFSET(32) NUMBITS(16),
        DrainWrites OFFSET(48) NUMBITS(1),
        DrainReads OFFSET(49) NUMBITS(1),
        Actual OFFSET(57) NUMBITS(2),
        Request OFFSET(60) NUMBITS(2),
        Invalidate OFFSET(63) NUMBITS(1),
    ],

    // Fault-recording register, low and high word.
    pub FRCD_LO [
        Info OFFSET(12) NUMBITS(52),
    ],

    pub FRCD_HI [
        Source OFFSET(0) NUMBITS(16),
        TypeHigh OFFSET(28) NUMBITS(1),
        Privileged OFFSET(29) NUMBITS(1),
        Execute OFFSET(30) NUMBITS(1),
        PasidPresent OFFSET(31) NUMBITS(1),
        Reason OFFSET(32) NUMBITS(8),
        Pasid OFFSET(40) NUMBITS(10),
        AddressType OFFSET(60) NUMBITS(2),
        TypeLow OFFSET(62) NUMBITS(1),
        Fault OFFSET(63) NUMBITS(1),
    ],
];

/// Version register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub u32);

impl Version {
    fn fields(self) -> LocalRegisterCopy<u32, VER::Register> {
        LocalRegisterCopy::new(self.0)
    }

    pub fn major(self) -> u8 {
        self.fields().read(VER::Major) as u8
    }

    pub fn minor(self) -> u8 {
        self.fields().read(VER::Minor) as u8
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Capability register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Capability(pub u64);

impl Capability {
    fn fields(self) -> LocalRegisterCopy<u64, CAP::Register> {
        LocalRegisterCopy::new(self.0)
    }

    /// Encoded number of supported domain ids.
    pub fn domains(self) -> u8 {
        self.fields().read(CAP::Domains) as u8
    }

    /// Number of domain ids the unit supports, including the reserved id 0.
    pub fn max_domains(self) -> usize {
        1 << (4 + 2 * self.domains() as usize)
    }

    /// Required write-buffer flushing.
    pub fn rwbf(self) -> bool {
        self.fields().is_set(CAP::Rwbf)
    }

    /// Whether the unit may cache not-present and erroneous entries.
    pub fn caching_mode(self) -> bool {
        self.fields().is_set(CAP::CachingMode)
    }

    /// Supported adjusted guest address widths.
    pub fn sagaw(self) -> u8 {
        self.fields().read(CAP::Sagaw) as u8
    }

    /// Whether 48-bit, 4-level second-level tables are supported.
    pub fn supports_4_level(self) -> bool {
        self.fields().is_set(CAP::Sagaw4Level)
    }

    /// Byte offset of the first fault-recording register.
    pub fn fault_record_offset(self) -> usize {
        self.fields().read(CAP::RecordOffset) as usize * 16
    }

    /// Number of fault-recording registers.
    pub fn fault_records(self) -> usize {
        self.fields().read(CAP::Records) as usize + 1
    }

    /// Whether setting the root table pointer also invalidates all caches.
    pub fn esrtps(self) -> bool {
        self.fields().is_set(CAP::Esrtps)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("max_domains", &self.max_domains())
            .field("rwbf", &self.rwbf())
            .field("caching_mode", &self.caching_mode())
            .field("sagaw", &format_args!("{:#05b}", self.sagaw()))
            .field("fault_record_offset", &format_args!("{:#x}", self.fault_record_offset()))
            .field("fault_records", &self.fault_records())
            .field("esrtps", &self.esrtps())
            .finish()
    }
}

/// Extended capability register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExtendedCapability(pub u64);

impl ExtendedCapability {
    fn fields(self) -> LocalRegisterCopy<u64, ECAP::Register> {
        LocalRegisterCopy::new(self.0)
    }

    /// Whether the unit snoops the CPU cache when walking tables.
    pub fn page_walk_coherency(self) -> bool {
        self.fields().is_set(ECAP::Coherency)
    }

    /// Byte offset of the IOTLB register block.
    pub fn iotlb_block_offset(self) -> usize {
        self.fields().read(ECAP::IotlbOffset) as usize * 16
    }

    /// Byte offset of the IOTLB invalidate register, the second qword of the block.
    pub fn iotlb_offset(self) -> usize {
        self.iotlb_block_offset() + 8
    }
}

impl fmt::Debug for ExtendedCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedCapability")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("page_walk_coherency", &self.page_walk_coherency())
            .field("iotlb_offset", &format_args!("{:#x}", self.iotlb_offset()))
            .finish()
    }
}

bitflags! {
    /// Global command register. Global status reports the same bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalCommand: u32 {
        /// Set interrupt remapping table pointer.
        const SIRTP = 1 << 24;
        /// Set root table pointer.
        const SRTP = 1 << 30;
        /// Translation enable.
        const ENABLE = 1 << 31;

        /// One-shot bits that must not be echoed back from global status.
        const ONE_SHOT = Self::SRTP.bits() | Self::SIRTP.bits();
    }
}

bitflags! {
    /// Global status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GlobalStatus: u32 {
        const IRTPS = 1 << 24;
        const QIES = 1 << 26;
        const RTPS = 1 << 30;
        const ENABLED = 1 << 31;
    }
}

impl GlobalStatus {
    /// Translation is enabled.
    pub fn enabled(self) -> bool {
        self.contains(Self::ENABLED)
    }

    /// The root table pointer was latched.
    pub fn root_table_pointer_set(self) -> bool {
        self.contains(Self::RTPS)
    }

    /// Queued invalidation is enabled.
    pub fn queued_invalidation(self) -> bool {
        self.contains(Self::QIES)
    }

    /// The interrupt remapping table pointer was latched.
    pub fn irq_remapping_table_set(self) -> bool {
        self.contains(Self::IRTPS)
    }
}

/// Root table address register.
pub struct RootTableAddress;

impl RootTableAddress {
    /// Legacy root/context table mode.
    pub const LEGACY: u64 = 0;

    /// Encodes a legacy-mode root table pointer.
    pub fn legacy(address: u64) -> u64 {
        let mut reg = LocalRegisterCopy::<u64, RTADDR::Register>::new(0);
        reg.modify(RTADDR::Address.val(address >> 12));
        reg.modify(RTADDR::Mode.val(Self::LEGACY));
        reg.get()
    }

    /// The root table's physical address.
    pub fn address(value: u64) -> u64 {
        LocalRegisterCopy::<u64, RTADDR::Register>::new(value).read(RTADDR::Address) << 12
    }

    pub fn mode(value: u64) -> u64 {
        LocalRegisterCopy::<u64, RTADDR::Register>::new(value).read(RTADDR::Mode)
    }
}

/// Context command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCommand(pub u64);

impl ContextCommand {
    fn fields(self) -> LocalRegisterCopy<u64, CCMD::Register> {
        LocalRegisterCopy::new(self.0)
    }

    /// Builds an invalidation request.
    pub fn invalidate(granularity: Granularity, source_id: u16, domain_id: u16) -> Self {
        let mut reg = LocalRegisterCopy::<u64, CCMD::Register>::new(0);
        reg.modify(CCMD::Invalidate.val(1));
        reg.modify(CCMD::Request.val(granularity as u64));
        reg.modify(CCMD::Source.val(source_id as u64));
        reg.modify(CCMD::Domain.val(domain_id as u64));
        Self(reg.get())
    }

    /// Marks the request done with `actual` as the performed granularity.
    pub fn complete(self, actual: u64) -> Self {
        let mut reg = self.fields();
        reg.modify(CCMD::Invalidate.val(0));
        reg.modify(CCMD::Actual.val(actual));
        Self(reg.get())
    }

    /// An invalidation is still in progress.
    pub fn in_progress(self) -> bool {
        self.fields().is_set(CCMD::Invalidate)
    }

    /// Raw requested granularity.
    pub fn request_bits(self) -> u64 {
        self.fields().read(CCMD::Request)
    }

    pub fn requested(self) -> Option<Granularity> {
        Granularity::from_bits(self.request_bits())
    }

    /// Granularity the hardware actually performed.
    pub fn actual(self) -> Option<Granularity> {
        Granularity::from_bits(self.fields().read(CCMD::Actual))
    }

    pub fn source_id(self) -> u16 {
        self.fields().read(CCMD::Source) as u16
    }

    pub fn domain_id(self) -> u16 {
        self.fields().read(CCMD::Domain) as u16
    }
}

/// IOTLB invalidate register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbCommand(pub u64);

impl IotlbCommand {
    fn fields(self) -> LocalRegisterCopy<u64, IOTLB::Register> {
        LocalRegisterCopy::new(self.0)
    }

    /// Builds an invalidation request that also drains pending reads and writes.
    pub fn invalidate(granularity: Granularity, domain_id: u16) -> Self {
        let mut reg = LocalRegisterCopy::<u64, IOTLB::Register>::new(0);
        reg.modify(IOTLB::Invalidate.val(1));
        reg.modify(IOTLB::Request.val(granularity as u64));
        reg.modify(IOTLB::DrainReads.val(1));
        reg.modify(IOTLB::DrainWrites.val(1));
        reg.modify(IOTLB::Domain.val(domain_id as u64));
        Self(reg.get())
    }

    /// Marks the request done with `actual` as the performed granularity.
    pub fn complete(self, actual: u64) -> Self {
        let mut reg = self.fields();
        reg.modify(IOTLB::Invalidate.val(0));
        reg.modify(IOTLB::Actual.val(actual));
        Self(reg.get())
    }

    /// An invalidation is still in progress.
    pub fn in_progress(self) -> bool {
        self.fields().is_set(IOTLB::Invalidate)
    }

    /// Raw requested granularity.
    pub fn request_bits(self) -> u64 {
        self.fields().read(IOTLB::Request)
    }

    pub fn requested(self) -> Option<Granularity> {
        Granularity::from_bits(self.request_bits())
    }

    /// Granularity the hardware actually performed.
    pub fn actual(self) -> Option<Granularity> {
        Granularity::from_bits(self.fields().read(IOTLB::Actual))
    }

    pub fn domain_id(self) -> u16 {
        self.fields().read(IOTLB::Domain) as u16
    }
}

/// Fault status register.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FaultStatus(pub u32);

impl FaultStatus {
    /// Writing this value clears every write-1-to-clear status bit.
    pub const CLEAR_ALL: u32 = 0x7d;

    fn fields(self) -> LocalRegisterCopy<u32, FSTS::Register> {
        LocalRegisterCopy::new(self.0)
    }

    /// Builds a status value as the hardware reports it.
    pub fn new(overflow: bool, pending: bool, first_record: usize) -> Self {
        let mut reg = LocalRegisterCopy::<u32, FSTS::Register>::new(0);
        reg.modify(FSTS::Overflow.val(overflow as u32));
        reg.modify(FSTS::Pending.val(pending as u32));
        reg.modify(FSTS::RecordIndex.val(first_record as u32));
        Self(reg.get())
    }

    pub fn overflow(self) -> bool {
        self.fields().is_set(FSTS::Overflow)
    }

    pub fn pending(self) -> bool {
        self.fields().is_set(FSTS::Pending)
    }

    /// Invalidation queue error.
    pub fn queue_error(self) -> bool {
        self.fields().is_set(FSTS::QueueError)
    }

    /// Index of the first pending fault record.
    pub fn first_record_index(self) -> usize {
        self.fields().read(FSTS::RecordIndex) as usize
    }
}

impl fmt::Debug for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultStatus")
            .field("overflow", &self.overflow())
            .field("pending", &self.pending())
            .field("queue_error", &self.queue_error())
            .field("first_record_index", &self.first_record_index())
            .finish()
    }
}

bitflags! {
    /// Fault event control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultEventControl: u32 {
        /// Interrupt pending.
        const PENDING = 1 << 30;
        /// Interrupt mask.
        const MASK = 1 << 31;
    }
}
