//! Scatter-gather tables describing a pinned user buffer to a DMA engine.
//!
//! A user buffer is virtually contiguous but physically scattered, so it is
//! described to the DMA engine as a list of [`Segment`]s, one per pinned
//! page. Only the first segment may start partway into its page; every
//! segment ends at or before the end of its page.
use alloc::{collections::TryReserveError, vec::Vec};
use core::cmp;

use crate::mm::{self, UserBuf, PAGE_SIZE};

/// A bus address, as seen by the DMA engine.
pub type DmaAddr = u64;

/// One physically contiguous piece of a transfer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    page: usize,
    offset: usize,
    len: usize,
    dma_addr: Option<DmaAddr>,
}

/// A scatter-gather table with one [`Segment`] per page of a transfer.
#[derive(Debug)]
pub struct ScatterTable {
    segments: Vec<Segment>,
}

// === impl Segment ===

impl Segment {
    /// Index of the pinned page this segment lies in.
    #[inline]
    #[must_use]
    pub fn page_index(&self) -> usize {
        self.page
    }

    /// Byte offset of this segment within its page.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bus address assigned when the table was mapped, if it has been.
    #[inline]
    #[must_use]
    pub fn dma_addr(&self) -> Option<DmaAddr> {
        self.dma_addr
    }

    /// Records the bus address assigned by a DMA mapping.
    #[inline]
    pub fn set_dma_addr(&mut self, addr: DmaAddr) {
        self.dma_addr = Some(addr);
    }

    /// Clears the bus address when the mapping is torn down.
    #[inline]
    pub fn clear_dma_addr(&mut self) {
        self.dma_addr = None;
    }
}

// === impl ScatterTable ===

impl ScatterTable {
    /// Allocates a table with room for `nents` segments.
    pub fn alloc(nents: usize) -> Result<Self, TryReserveError> {
        let mut segments = Vec::new();
        segments.try_reserve_exact(nents)?;
        // won't reallocate, we just reserved exactly this much.
        segments.resize(nents, Segment::default());
        Ok(Self { segments })
    }

    /// Lays `buf` out across the table, one segment per page.
    ///
    /// The table must have been allocated with exactly
    /// [`buf.page_count()`](UserBuf::page_count) entries.
    pub fn populate(&mut self, buf: UserBuf) {
        debug_assert_eq!(
            Some(self.segments.len()),
            buf.page_count(),
            "scatter table must have one entry per page"
        );

        let mut remaining = buf.len();
        for (page, seg) in self.segments.iter_mut().enumerate() {
            let mut len = cmp::min(remaining, PAGE_SIZE);
            let offset = if page == 0 {
                let offset = mm::offset_in_page(buf.addr());
                // don't let the first segment run off the end of its page.
                if offset + len > PAGE_SIZE {
                    len = PAGE_SIZE - offset;
                }
                offset
            } else {
                0
            };

            *seg = Segment {
                page,
                offset,
                len,
                dma_addr: None,
            };
            remaining -= len;
        }

        debug_assert_eq!(remaining, 0, "page count should cover the whole buffer");
    }

    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    #[must_use]
    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total number of bytes described by the table.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }
}
