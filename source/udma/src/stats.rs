use portable_atomic::{AtomicU64, Ordering};

/// Per-channel transfer counters.
///
/// Only successful transfers are counted. These are informational; nothing
/// in the driver depends on them.
#[derive(Debug, Default)]
pub struct Stats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl Stats {
    pub const fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    pub(crate) fn sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }
}
