//! PCI device identities as seen by the remapping hardware.

use core::fmt;

/// A PCI bus/device/function triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    bus: u8,
    device: u8,
    function: u8,
}

impl Bdf {
    /// Creates a BDF.
    ///
    /// # Panics
    ///
    /// Panics if `device` exceeds 31 or `function` exceeds 7.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        assert!(device < 32, "PCI device number out of range");
        assert!(function < 8, "PCI function number out of range");
        Self {
            bus,
            device,
            function,
        }
    }

    pub const fn bus(self) -> u8 {
        self.bus
    }

    pub const fn device(self) -> u8 {
        self.device
    }

    pub const fn function(self) -> u8 {
        self.function
    }

    /// The packed routing id used to index the root and context tables.
    pub const fn routing_id(self) -> RoutingId {
        RoutingId(((self.bus as u16) << 8) | ((self.device as u16) << 3) | self.function as u16)
    }

    /// Index of the device's entry within its bus' context table.
    pub const fn devfn(self) -> u8 {
        self.routing_id().devfn()
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl From<RoutingId> for Bdf {
    fn from(rid: RoutingId) -> Self {
        Self {
            bus: rid.bus(),
            device: rid.devfn() >> 3,
            function: rid.devfn() & 0x7,
        }
    }
}

impl From<Bdf> for RoutingId {
    fn from(bdf: Bdf) -> Self {
        bdf.routing_id()
    }
}

/// A packed PCI requester id: bus in bits 8-15, device/function in bits 0-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutingId(pub u16);

impl RoutingId {
    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn devfn(self) -> u8 {
        self.0 as u8
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Bdf::from(*self), f)
    }
}
