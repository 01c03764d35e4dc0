use core::fmt;

/// Errors surfaced by the pool and the allocator wrappers.
///
/// `OutOfMemory` is the only kind that is expected during normal operation;
/// the rest indicate caller bugs and are reported (or, in debug builds,
/// raised) rather than retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused a mapping. Never retried internally.
    OutOfMemory { requested: usize },
    /// Alignment was zero, not a power of two, or above the 64 KiB ceiling.
    InvalidAlignment { alignment: usize },
    /// The bytes preceding a deallocated pointer matched neither the
    /// envelope sentinel nor any tier's routing record.
    BadDeallocation,
    /// A zero-byte request was made through the allocator interface.
    ZeroSize,
    /// Adding header or padding overhead to the request overflowed `usize`.
    SizeOverflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AllocError::OutOfMemory { requested } => {
                write!(f, "out of memory (requested {} bytes)", requested)
            }
            AllocError::InvalidAlignment { alignment } => {
                write!(f, "invalid alignment {}", alignment)
            }
            AllocError::BadDeallocation => write!(f, "pointer does not belong to this pool"),
            AllocError::ZeroSize => write!(f, "zero-size allocation"),
            AllocError::SizeOverflow => write!(f, "request size overflows"),
        }
    }
}

impl std::error::Error for AllocError {}
