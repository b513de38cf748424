use maitake::time::Duration;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Configuration for a [`Udma`](crate::Udma) driver instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UdmaSettings {
    /// Reads and writes must be a multiple of this many bytes.
    #[serde(default = "UdmaSettings::default_align_bytes")]
    pub align_bytes: usize,
    /// How long a caller waits to reacquire its channel after the transfer
    /// completes before declaring the channel stalled.
    #[serde(default = "UdmaSettings::default_gate_timeout")]
    pub gate_timeout: Duration,
}

impl UdmaSettings {
    pub const DEFAULT_ALIGN_BYTES: usize = 1;
    pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(5);

    const fn default_align_bytes() -> usize {
        Self::DEFAULT_ALIGN_BYTES
    }
    const fn default_gate_timeout() -> Duration {
        Self::DEFAULT_GATE_TIMEOUT
    }

    pub const fn new() -> Self {
        Self {
            align_bytes: Self::DEFAULT_ALIGN_BYTES,
            gate_timeout: Self::DEFAULT_GATE_TIMEOUT,
        }
    }

    /// Checks that `count` is a valid transfer length.
    ///
    /// An alignment of zero is treated as one.
    pub fn check_count(&self, count: usize) -> Result<(), Error> {
        let align = self.align_bytes.max(1);
        if count == 0 || count % align != 0 {
            tracing::warn!(count, align, "unaligned transfer of {count} bytes requested");
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for UdmaSettings {
    fn default() -> Self {
        Self::new()
    }
}
