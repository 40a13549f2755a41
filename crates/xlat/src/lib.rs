#![cfg_attr(not(test), no_std)]

//! # Polaris Translation Tables (xlat)
//!
//! Hierarchical address-translation tables shared by the CPU paging code and the
//! IOMMU driver. It provides:
//!
//! - Physical and virtual address types.
//! - A bounded pool of self-aligned table nodes ([`TableAllocator`]).
//! - A generic multi-level table engine ([`TranslationTable`]) with large-page
//!   promotion and eager reclamation of emptied sub-tables.
//! - Descriptor formats for Intel VT-d second-level tables and x86-64 CPU paging.
//! - A read-only walk for diagnostics.

extern crate alloc;

mod address;
mod allocator;
mod cache;
mod error;
mod flags;
mod format;
mod table;
mod walk;

pub use address::{PhysicalAddress, VirtualAddress};
pub use allocator::{TABLE_ENTRIES, TABLE_SIZE, TABLE_SIZE_LOG2, TableAllocator, TableNode, TableView};
pub use cache::{Coherency, flush_line};
pub use error::TableError;
pub use flags::PageFlags;
pub use format::{CpuPaging, Level, LevelKind, SecondLevel, TableFormat};
pub use table::{Translation, TranslationTable};
pub use walk::{Mapping, WalkEntry};

/// Smallest page size handled by any supported format.
pub const PAGE_SIZE: u64 = 1 << 12;
