//! A single user-buffer DMA transfer, from page pinning to unwind.
//!
//! An [`InFlightTransfer`] is built fresh for every read or write. Preparing
//! it acquires resources in a fixed order, recorded as its [`Stage`];
//! [`InFlightTransfer::unwind`] releases exactly what that stage says was
//! acquired, in reverse order.
use alloc::vec::Vec;
use core::fmt;

use mycelium_bitfield::bitfield;

use crate::{
    mm::{self, UserBuf},
    platform::Platform,
    sg::{ScatterTable, Segment},
    Direction, Error,
};

/// How far preparation of a transfer has progressed.
///
/// Each stage implies every earlier one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Stage {
    /// Nothing has been acquired.
    Empty,
    /// The page handle array has been allocated.
    PagesAllocated,
    /// The scatter-gather table has been allocated.
    TableAllocated,
    /// Every page of the buffer is pinned.
    PagesPinned,
    /// The scatter-gather table is mapped for DMA.
    Mapped,
    /// The transaction was submitted to the DMA engine.
    Started,
}

bitfield! {
    /// Preparation progress flags, derived from a [`Stage`].
    #[derive(Eq, PartialEq)]
    pub struct Progress<u8> {
        pub const TABLE_ALLOCATED: bool;
        pub const PAGES_PINNED: bool;
        pub const DMA_MAPPED: bool;
        pub const DMA_STARTED: bool;
    }
}

pub struct InFlightTransfer<P: Platform> {
    buf: UserBuf,
    direction: Direction,
    nr_pages: usize,
    pages: Option<Vec<P::Page>>,
    table: Option<ScatterTable>,
    stage: Stage,
}

// === impl Stage ===

impl Stage {
    #[must_use]
    pub fn progress(self) -> Progress {
        Progress::new()
            .with(Progress::TABLE_ALLOCATED, self >= Self::TableAllocated)
            .with(Progress::PAGES_PINNED, self >= Self::PagesPinned)
            .with(Progress::DMA_MAPPED, self >= Self::Mapped)
            .with(Progress::DMA_STARTED, self >= Self::Started)
    }
}

// === impl InFlightTransfer ===

impl<P: Platform> InFlightTransfer<P> {
    /// Returns a new, empty transfer of `buf` in `direction`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `buf` is empty or its end overflows the
    /// address space.
    pub fn new(buf: UserBuf, direction: Direction) -> Result<Self, Error> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let nr_pages = buf.page_count().ok_or(Error::InvalidArgument)?;
        Ok(Self {
            buf,
            direction,
            nr_pages,
            pages: None,
            table: None,
            stage: Stage::Empty,
        })
    }

    /// Acquires everything the DMA engine needs to see this transfer: the
    /// page array, the scatter-gather table, the pinned pages and the DMA
    /// mapping.
    ///
    /// On failure, whatever was acquired stays recorded in [`Self::stage`]
    /// and must be released with [`Self::unwind`].
    pub fn prepare(&mut self, platform: &P) -> Result<(), Error> {
        debug_assert_eq!(self.stage, Stage::Empty, "transfers are never reused");
        self.alloc_pages()?;
        self.alloc_table()?;
        self.pin(platform)?;
        self.map(platform)
    }

    /// Records that the transaction was accepted by the DMA engine.
    pub fn started(&mut self) {
        debug_assert_eq!(self.stage, Stage::Mapped);
        self.advance(Stage::Started);
    }

    /// Releases every resource this transfer acquired, returning it to
    /// [`Stage::Empty`]. Calling this again does nothing.
    ///
    /// Pages of a device-to-host transfer that was started are marked dirty
    /// before they are released, since the engine does not report how much
    /// of the buffer it actually wrote.
    pub fn unwind(&mut self, platform: &P) {
        let dirty = self.stage == Stage::Started && self.direction == Direction::DeviceToHost;
        let dir = self.direction.dma_direction();

        loop {
            let next = match self.stage {
                Stage::Empty => return,
                Stage::Started => Stage::Mapped,
                Stage::Mapped => {
                    if let (Some(pages), Some(table)) = (self.pages.as_deref(), self.table.as_mut())
                    {
                        platform.unmap_sg(pages, table.segments_mut(), dir);
                        table.segments_mut().iter_mut().for_each(Segment::clear_dma_addr);
                    }
                    Stage::PagesPinned
                }
                Stage::PagesPinned => {
                    if let Some(pages) = self.pages.as_mut() {
                        for page in pages.drain(..) {
                            if dirty {
                                platform.set_page_dirty(&page);
                            }
                            platform.put_page(page);
                        }
                    }
                    Stage::TableAllocated
                }
                Stage::TableAllocated => {
                    self.table = None;
                    Stage::PagesAllocated
                }
                Stage::PagesAllocated => {
                    self.pages = None;
                    Stage::Empty
                }
            };
            tracing::debug!(from = ?self.stage, to = ?next, dirty, "unwind");
            self.stage = next;
        }
    }

    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[inline]
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.stage.progress()
    }

    #[inline]
    #[must_use]
    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    /// The mapped scatter-gather list, once the transfer has been mapped.
    #[must_use]
    pub fn segments(&self) -> Option<&[Segment]> {
        if self.stage < Stage::Mapped {
            return None;
        }
        self.table.as_ref().map(ScatterTable::segments)
    }

    fn alloc_pages(&mut self) -> Result<(), Error> {
        let mut pages = Vec::new();
        if let Err(error) = pages.try_reserve_exact(self.nr_pages) {
            tracing::warn!(pages = self.nr_pages, %error, "failed to allocate page array");
            return Err(Error::OutOfMemory);
        }
        self.pages = Some(pages);
        self.advance(Stage::PagesAllocated);
        Ok(())
    }

    fn alloc_table(&mut self) -> Result<(), Error> {
        let table = ScatterTable::alloc(self.nr_pages).map_err(|error| {
            tracing::warn!(pages = self.nr_pages, %error, "failed to allocate scatter table");
            Error::TableAllocationFailed
        })?;
        self.table = Some(table);
        self.advance(Stage::TableAllocated);
        Ok(())
    }

    fn pin(&mut self, platform: &P) -> Result<(), Error> {
        let Some(pages) = self.pages.as_mut() else {
            return Err(Error::PagePinningFailed);
        };

        let start = mm::page_base(self.buf.addr());
        let write = self.direction.pins_writable();
        let pinned = platform.pin_user_pages(start, self.nr_pages, write, pages);
        if pinned != self.nr_pages || pages.len() != self.nr_pages {
            tracing::warn!(
                pinned,
                pages = self.nr_pages,
                "failed to pin user pages, releasing partial pin"
            );
            for page in pages.drain(..) {
                platform.put_page(page);
            }
            return Err(Error::PagePinningFailed);
        }

        self.advance(Stage::PagesPinned);
        Ok(())
    }

    fn map(&mut self, platform: &P) -> Result<(), Error> {
        let (Some(pages), Some(table)) = (self.pages.as_deref(), self.table.as_mut()) else {
            return Err(Error::MappingFailed);
        };

        table.populate(self.buf);
        let dir = self.direction.dma_direction();
        let mapped = platform.map_sg(pages, table.segments_mut(), dir);
        if mapped != self.nr_pages {
            tracing::warn!(mapped, pages = self.nr_pages, "failed to map scatter table");
            if mapped != 0 {
                platform.unmap_sg(pages, table.segments_mut(), dir);
            }
            return Err(Error::MappingFailed);
        }

        self.advance(Stage::Mapped);
        Ok(())
    }

    fn advance(&mut self, next: Stage) {
        tracing::debug!(from = ?self.stage, to = ?next, pages = self.nr_pages, "prepare");
        self.stage = next;
    }
}

impl<P: Platform> fmt::Debug for InFlightTransfer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightTransfer")
            .field("buf", &self.buf)
            .field("direction", &self.direction)
            .field("nr_pages", &self.nr_pages)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}
