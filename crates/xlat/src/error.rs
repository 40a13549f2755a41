use core::fmt;

use crate::{PhysicalAddress, VirtualAddress};

/// Errors that can occur while building or editing translation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// A table pool was placed at a physical base that is not table-aligned.
    Misaligned { address: PhysicalAddress },
    /// The request is not a multiple of the minimum page size or leaves the input
    /// address space. Nothing was modified.
    InvalidRange { start: VirtualAddress, size: u64 },
    /// A different mapping is already present at `address`.
    DoubleInsertion { address: VirtualAddress },
    /// The table pool has no free nodes left.
    OutOfMemory,
    /// A table link points outside the pool the table was built from.
    UnknownTable { address: PhysicalAddress },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned { address } => {
                write!(f, "table memory at {address} is not table-aligned")
            }
            Self::InvalidRange { start, size } => {
                write!(f, "invalid range {start}+{size:#x}")
            }
            Self::DoubleInsertion { address } => {
                write!(f, "conflicting mapping already present at {address}")
            }
            Self::OutOfMemory => write!(f, "table pool exhausted"),
            Self::UnknownTable { address } => {
                write!(f, "table {address} does not belong to this pool")
            }
        }
    }
}

impl core::error::Error for TableError {}
