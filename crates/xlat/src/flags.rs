//! Format-independent mapping attributes.

/// Attributes requested for a mapping.
///
/// Each [`TableFormat`](crate::TableFormat) encodes these into its own descriptor bits,
/// dropping attributes it cannot express. A mapping is always readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFlags(u8);

impl PageFlags {
    /// Writable bit (bit 0).
    const WRITABLE: u8 = 1 << 0;

    /// User-accessible bit (bit 1).
    const USER: u8 = 1 << 1;

    /// No-execute bit (bit 2).
    const NO_EXECUTE: u8 = 1 << 2;

    /// Global bit (bit 3).
    const GLOBAL: u8 = 1 << 3;

    /// Uncached bit (bit 4).
    const UNCACHED: u8 = 1 << 4;

    /// Creates read-only, supervisor, executable, cached flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags used for every DMA buffer: read/write, user, no-execute, non-global, cached.
    pub const fn dma_buffer() -> Self {
        Self(Self::WRITABLE | Self::USER | Self::NO_EXECUTE)
    }

    /// Creates page flags from a raw value.
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> u8 {
        self.0
    }

    const fn with(self, bit: u8, set: bool) -> Self {
        if set { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }

    /// Returns whether the mapping is writable.
    pub const fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        *self = self.with(Self::WRITABLE, writable);
    }

    /// Returns a copy with the writable bit set or cleared.
    pub const fn writable(self, writable: bool) -> Self {
        self.with(Self::WRITABLE, writable)
    }

    /// Returns whether the mapping is accessible from user mode.
    pub const fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        *self = self.with(Self::USER, user);
    }

    /// Returns whether execution from the mapping is forbidden.
    pub const fn is_no_execute(self) -> bool {
        (self.0 & Self::NO_EXECUTE) != 0
    }

    /// Sets or clears the no-execute bit.
    pub fn set_no_execute(&mut self, no_execute: bool) {
        *self = self.with(Self::NO_EXECUTE, no_execute);
    }

    /// Returns whether the mapping survives address-space switches.
    pub const fn is_global(self) -> bool {
        (self.0 & Self::GLOBAL) != 0
    }

    /// Sets or clears the global bit.
    pub fn set_global(&mut self, global: bool) {
        *self = self.with(Self::GLOBAL, global);
    }

    /// Returns whether the mapping bypasses the cache.
    pub const fn is_uncached(self) -> bool {
        (self.0 & Self::UNCACHED) != 0
    }

    /// Sets or clears the uncached bit.
    pub fn set_uncached(&mut self, uncached: bool) {
        *self = self.with(Self::UNCACHED, uncached);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_read_only() {
        let flags = PageFlags::empty();
        assert!(!flags.is_writable());
        assert!(!flags.is_user());
        assert!(!flags.is_no_execute());
        assert!(!flags.is_global());
        assert!(!flags.is_uncached());
    }

    #[test]
    fn dma_buffer_flags() {
        let flags = PageFlags::dma_buffer();
        assert!(flags.is_writable());
        assert!(flags.is_user());
        assert!(flags.is_no_execute());
        assert!(!flags.is_global());
        assert!(!flags.is_uncached());
    }

    #[test]
    fn setters_toggle_single_bits() {
        let mut flags = PageFlags::empty();
        flags.set_global(true);
        flags.set_uncached(true);
        assert_eq!(flags.to_raw(), PageFlags::GLOBAL | PageFlags::UNCACHED);

        flags.set_global(false);
        assert_eq!(flags.to_raw(), PageFlags::UNCACHED);
        assert_eq!(PageFlags::from_raw(flags.to_raw()), flags);
    }

    #[test]
    fn builder_style_writable() {
        assert!(PageFlags::empty().writable(true).is_writable());
        assert!(!PageFlags::dma_buffer().writable(false).is_writable());
    }
}
