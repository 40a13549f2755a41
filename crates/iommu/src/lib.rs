#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Intel VT-d IOMMU driver
//!
//! Drives Intel VT-d DMA remapping units in legacy translation mode:
//!
//! - Root and context tables binding PCI devices to isolation domains.
//! - Domains owning a second-level translation table built with [`xlat`].
//! - Register-based context-cache and IOTLB invalidation.
//! - Decoding and draining of primary fault records.
//! - A software model of the register page for testing in non-kernel environments.

extern crate alloc;

mod config;
mod context_table;
mod domain;
#[cfg(any(test, feature = "software-emulation"))]
mod emulated;
mod error;
mod fault;
mod io_mmu;
mod pci;
pub mod registers;
mod root_table;

pub use config::{Config, PollPolicy};
pub use context_table::{ContextEntry, ContextTable, RootTable};
pub use domain::{DmaBuffer, Domain, DomainAllocator, DomainId, IoRange};
#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::{EmulatedConfig, EmulatedUnit};
pub use error::IommuError;
pub use fault::{FaultReason, FaultRecord, FaultReport, RequestType};
pub use io_mmu::{FaultInterrupt, Invalidation, IoMmu, MsiMessage};
pub use pci::{Bdf, RoutingId};
pub use registers::{Granularity, Mmio, RegisterAccess};
pub use root_table::{ContextChange, ContextRemoval, ManagedRootTable};
