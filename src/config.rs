//! Kernel tunables, fixed at setup.

use crate::event::VirtualTime;

/// Configuration for one kernel instance.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// Number of logical processes; one worker thread each.
    pub lps: usize,
    /// Simulation horizon. No event with `time >= end_time` is ever handed to
    /// the handler.
    pub end_time: VirtualTime,
    /// A history list growing past this many entries makes the owning LP
    /// request a GVT epoch so fossil collection can reclaim it.
    pub fossil_threshold: usize,
    /// Optional bound on how far `sim_time` may run ahead of the committed
    /// GVT. A throttled LP keeps draining input and serving the reduction but
    /// stops dispatching events until the frontier catches up. `None` means
    /// unlimited optimism.
    pub optimism_window: Option<VirtualTime>,
    /// Capacity of each per-LP input queue; a full queue blocks senders.
    pub channel_capacity: usize,
}

impl KernelConfig {
    pub const DEFAULT_FOSSIL_THRESHOLD: usize = 1024;
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;
    /// Recommended optimism window when throttling is wanted.
    pub const SUGGESTED_OPTIMISM_WINDOW: VirtualTime = 25;

    pub fn new(lps: usize, end_time: VirtualTime) -> Self {
        Self {
            lps,
            end_time,
            fossil_threshold: Self::DEFAULT_FOSSIL_THRESHOLD,
            optimism_window: None,
            channel_capacity: Self::DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_fossil_threshold(mut self, threshold: usize) -> Self {
        self.fossil_threshold = threshold;
        self
    }

    pub fn with_optimism_window(mut self, window: VirtualTime) -> Self {
        self.optimism_window = Some(window);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}
