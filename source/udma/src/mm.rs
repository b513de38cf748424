//! Page geometry for user buffers.

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A buffer in the caller's address space.
///
/// The driver never dereferences a `UserBuf`; it only hands the address to
/// the [`Platform`](crate::Platform) to be pinned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserBuf {
    addr: usize,
    len: usize,
}

/// Returns the offset of `addr` within its page.
#[inline]
#[must_use]
pub const fn offset_in_page(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Returns the address of the page containing `addr`.
#[inline]
#[must_use]
pub const fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Returns the number of pages spanned by `len` bytes starting at `addr`, or
/// `None` if the range overflows the address space.
#[inline]
#[must_use]
pub fn page_count(addr: usize, len: usize) -> Option<usize> {
    let end = offset_in_page(addr).checked_add(len)?;
    Some(end.checked_add(PAGE_SIZE - 1)? / PAGE_SIZE)
}

// === impl UserBuf ===

impl UserBuf {
    #[must_use]
    pub const fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    #[inline]
    #[must_use]
    pub const fn addr(&self) -> usize {
        self.addr
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn page_count(&self) -> Option<usize> {
        page_count(self.addr, self.len)
    }
}
