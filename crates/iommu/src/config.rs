//! Runtime configuration of a remapping unit.

/// How long the driver waits for the hardware to complete a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollPolicy {
    /// Spin until the hardware completes; an unresponsive unit hangs the caller.
    #[default]
    Unbounded,
    /// Panic after `max_spins` unsuccessful polls.
    Fatal { max_spins: u64 },
}

/// Driver configuration for one remapping unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Log state changes and imprecise invalidations.
    pub verbose: bool,
    pub poll: PollPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: true,
            poll: PollPolicy::Unbounded,
        }
    }
}

impl Config {
    /// A quiet configuration that panics on a stalled unit.
    pub const fn strict(max_spins: u64) -> Self {
        Self {
            verbose: false,
            poll: PollPolicy::Fatal { max_spins },
        }
    }
}
