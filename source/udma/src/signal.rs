//! Pending-signal state for callers blocked in a channel.
use maitake::sync::WaitQueue;
use portable_atomic::{AtomicBool, Ordering};

/// A caller's pending signals.
///
/// Every wait in [`Channel::transfer`](crate::Channel::transfer) that may be
/// interrupted races against [`Signals::pending`]. If a signal is raised
/// first, the transfer gives up with
/// [`Error::RestartSignal`](crate::Error::RestartSignal).
#[derive(Debug)]
pub struct Signals {
    pending: AtomicBool,
    wait: WaitQueue,
}

impl Signals {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            wait: WaitQueue::new(),
        }
    }

    /// Raises a signal, interrupting any wait on these signals.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.wait.wake_all();
    }

    /// Clears a pending signal once it has been handled.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Completes once a signal is pending.
    pub async fn pending(&self) {
        loop {
            let wait = self.wait.wait();
            futures::pin_mut!(wait);
            // subscribe before checking, so a `raise` in between isn't lost.
            let _ = wait.as_mut().subscribe();

            if self.is_pending() {
                return;
            }

            if wait.await.is_err() {
                // never closed, but don't spin if it somehow is.
                return;
            }
        }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}
