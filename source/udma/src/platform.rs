//! Interfaces to the services a uDMA channel depends on.
//!
//! A [`Platform`] stands in for everything outside the driver core: the
//! device's configuration, the memory manager that pins and maps user pages,
//! and the DMA engine provider that hands out [`Engine`] channels.
use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;

use mycelium_bitfield::bitfield;

use crate::sg::Segment;

/// Platform services consumed by the driver core.
pub trait Platform: Send + Sync + 'static {
    /// A handle to a pinned physical page.
    type Page: Send + 'static;

    /// A DMA engine channel.
    type Engine: Engine;

    /// Returns the DMA channel names from the device configuration, or a
    /// (positive) errno if they could not be read.
    fn dma_names(&self) -> Result<Vec<String>, i32>;

    /// Requests the DMA engine channel called `name`.
    ///
    /// Returns [`None`] if the channel is not (yet) available.
    fn request_channel(&self, name: &str) -> Option<Self::Engine>;

    /// Pins up to `nr_pages` pages of the caller's address space, starting at
    /// the page-aligned address `start`, appending a handle for each pinned
    /// page to `pages`.
    ///
    /// If `write` is `true`, the pages are pinned for writing.
    ///
    /// Returns the number of pages pinned, which may be fewer than requested.
    fn pin_user_pages(
        &self,
        start: usize,
        nr_pages: usize,
        write: bool,
        pages: &mut Vec<Self::Page>,
    ) -> usize;

    /// Marks a pinned page as having been written to.
    fn set_page_dirty(&self, page: &Self::Page);

    /// Releases a page pinned by [`Platform::pin_user_pages`].
    fn put_page(&self, page: Self::Page);

    /// Maps a scatter-gather table for DMA, assigning a bus address to each
    /// segment. Segments refer to entries in `pages` by index.
    ///
    /// Returns the number of segments mapped, or zero on failure.
    fn map_sg(&self, pages: &[Self::Page], sgl: &mut [Segment], dir: DmaDataDirection) -> usize;

    /// Unmaps a table mapped by [`Platform::map_sg`] with the same direction.
    fn unmap_sg(&self, pages: &[Self::Page], sgl: &mut [Segment], dir: DmaDataDirection);
}

/// A DMA engine channel.
///
/// These methods are called with the channel's state lock held. They must not
/// block, and they must never invoke a submitted [`Callback`] synchronously;
/// callbacks are invoked later, from the engine's interrupt handler.
pub trait Engine: Send + Sync + 'static {
    /// A prepared transaction descriptor.
    type Tx: Send;

    /// Prepares a slave scatter-gather transaction over a mapped table.
    ///
    /// Returns [`None`] if no descriptor could be allocated.
    fn prep_slave_sg(
        &self,
        sgl: &[Segment],
        direction: TransferDirection,
        flags: PrepFlags,
    ) -> Option<Self::Tx>;

    /// Submits a prepared transaction to the engine's pending queue.
    ///
    /// The engine invokes `callback` exactly once when the transaction
    /// completes, unless the transaction is terminated first.
    fn submit(&self, tx: Self::Tx, callback: Callback) -> Cookie;

    /// Starts processing pending transactions.
    fn issue_pending(&self);

    /// Aborts all pending and active transactions. Safe to call at any time,
    /// including redundantly.
    fn terminate_all(&self);

    /// Releases the engine channel.
    fn release(&self);
}

/// Direction of a slave transfer, from the DMA engine's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    DevToMem,
    MemToDev,
}

/// Cache maintenance direction used when mapping a table for DMA.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DmaDataDirection {
    /// Memory is flushed before the device reads it.
    ToDevice,
    /// Memory is invalidated after the device writes it.
    FromDevice,
}

/// A transaction handle returned by [`Engine::submit`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Cookie(pub i32);

bitfield! {
    /// Flags passed to [`Engine::prep_slave_sg`].
    #[derive(Eq, PartialEq)]
    pub struct PrepFlags<u32> {
        /// Raise an interrupt when the transaction completes.
        pub const INTERRUPT: bool;
    }
}

/// Something to notify when a transaction completes.
pub trait Complete: Send + Sync {
    fn complete(&self);
}

/// A completion callback attached to a submitted transaction.
///
/// Invoking a `Callback` consumes it, so it can fire at most once.
#[must_use = "a `Callback` does nothing unless it is invoked"]
pub struct Callback {
    ctx: Arc<dyn Complete>,
}

// === impl Cookie ===

impl Cookie {
    /// The smallest cookie denoting a successful submission.
    pub const MIN: Self = Self(1);

    /// Returns `true` if this cookie denotes a successful submission.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= Self::MIN.0
    }
}

// === impl Callback ===

impl Callback {
    pub(crate) fn new(ctx: Arc<dyn Complete>) -> Self {
        Self { ctx }
    }

    /// Notifies the context that its transaction has completed.
    pub fn invoke(self) {
        self.ctx.complete()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}
