//! Cache maintenance for table walkers that do not snoop the CPU cache.

/// Whether the hardware that walks a table observes CPU cache contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coherency {
    /// The walker snoops the CPU cache; plain stores are visible.
    #[default]
    Coherent,
    /// The walker reads memory directly; every written descriptor is flushed.
    NonCoherent,
}

impl Coherency {
    /// Returns whether written descriptors must be flushed to memory.
    pub const fn needs_flush(self) -> bool {
        matches!(self, Self::NonCoherent)
    }
}

/// Writes the cache line holding `value` back to memory and invalidates it.
#[inline]
pub fn flush_line<T>(value: &T) {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: clflush only requires a mapped address, which a live reference guarantees.
        unsafe { core::arch::x86_64::_mm_clflush((value as *const T).cast::<u8>()) };
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = value;
    }
}
