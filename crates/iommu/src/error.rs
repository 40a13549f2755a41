use core::fmt;

use xlat::TableError;

/// Errors reported by the IOMMU driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Building or editing a translation, root or context table failed.
    Table(TableError),
    /// The unit cannot walk 4-level second-level tables.
    UnsupportedTableDepth,
    /// The unit was already enabled by someone else.
    AlreadyEnabled,
    /// Every domain id supported by the unit is in use.
    DomainIdsExhausted,
}

impl From<TableError> for IommuError {
    fn from(error: TableError) -> Self {
        Self::Table(error)
    }
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(error) => write!(f, "table error: {error}"),
            Self::UnsupportedTableDepth => write!(f, "4-level translation tables not supported"),
            Self::AlreadyEnabled => write!(f, "remapping unit already enabled"),
            Self::DomainIdsExhausted => write!(f, "no free domain id"),
        }
    }
}

impl core::error::Error for IommuError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Table(error) => Some(error),
            _ => None,
        }
    }
}
