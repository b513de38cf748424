//! Errors returned by uDMA channel operations.
use core::fmt;

/// An error returned by [`Udma::read`](crate::Udma::read),
/// [`Udma::write`](crate::Udma::write), or [`Channel::transfer`](crate::Channel::transfer).
///
/// Every error other than [`Error::StallFault`] is returned only after all
/// resources acquired for the transfer have been released. No transfer is ever
/// reported as partially successful.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The requested byte count was zero, or was not a multiple of the
    /// configured alignment.
    InvalidArgument,
    /// The channel is not accepting new transfers, either because it was
    /// torn down or because it never finished initializing.
    ChannelClosed,
    /// Allocating the page-handle array failed, or the DMA engine could not
    /// provide a descriptor.
    OutOfMemory,
    /// Allocating the scatter-gather table failed.
    TableAllocationFailed,
    /// Fewer pages than requested could be pinned.
    PagePinningFailed,
    /// The scatter-gather table could not be mapped for DMA.
    MappingFailed,
    /// The DMA engine refused the descriptor.
    SubmissionFailed,
    /// The caller was interrupted while waiting. The whole operation should
    /// be retried.
    RestartSignal,
    /// Reacquiring the channel after the transfer finished timed out.
    ///
    /// This is a driver fault. The in-flight transfer is left in place and
    /// the channel will not recover without intervention.
    StallFault,
}

/// An error returned by [`Udma::attach`](crate::Udma::attach).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttachError {
    /// The platform configuration lists no DMA channel names.
    NoDmaNames,
    /// Reading the DMA channel names failed with the given errno.
    Property(i32),
}

const EIO: i32 = 5;
const EBADF: i32 = 9;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EINVAL: i32 = 22;
const ERESTARTSYS: i32 = 512;

// === impl Error ===

impl Error {
    /// Returns the negative errno value used to report this error through a
    /// POSIX-style `read(2)`/`write(2)` interface.
    #[must_use]
    pub const fn errno(self) -> i32 {
        -match self {
            Self::InvalidArgument => EINVAL,
            Self::ChannelClosed => EBADF,
            Self::OutOfMemory | Self::TableAllocationFailed => ENOMEM,
            Self::PagePinningFailed => EFAULT,
            Self::MappingFailed | Self::SubmissionFailed | Self::StallFault => EIO,
            Self::RestartSignal => ERESTARTSYS,
        }
    }

    /// Returns `true` if the operation may succeed if retried as a whole.
    #[must_use]
    pub const fn is_restart(self) -> bool {
        matches!(self, Self::RestartSignal)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument => {
                "byte count is zero or not a multiple of the channel alignment"
            }
            Self::ChannelClosed => "channel is not accepting transfers",
            Self::OutOfMemory => "out of memory",
            Self::TableAllocationFailed => "failed to allocate scatter-gather table",
            Self::PagePinningFailed => "failed to pin user pages",
            Self::MappingFailed => "failed to map scatter-gather table for DMA",
            Self::SubmissionFailed => "DMA engine rejected the descriptor",
            Self::RestartSignal => "interrupted by a signal",
            Self::StallFault => "channel stalled while reacquiring exclusive access",
        };
        f.write_str(msg)
    }
}

/// Folds the result of a read or write into an `ssize_t`: the number of
/// bytes transferred, or a negative errno.
#[must_use]
pub fn to_ssize(result: Result<usize, Error>) -> isize {
    match result {
        Ok(count) => count as isize,
        Err(error) => error.errno() as isize,
    }
}

// === impl AttachError ===

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDmaNames => f.write_str("no DMA channels specified in \"dma-names\""),
            Self::Property(errno) => write!(
                f,
                "got {errno} when trying to count the elements of \"dma-names\""
            ),
        }
    }
}
