//! Crate errors.

/// Errors that the allocators can throw.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AllocatorError {
    /// The allocator has no room left for the request. Growing the backing store and
    /// retrying may succeed.
    OutOfMemory,
    /// Growing the backing store would exceed its configured maximum.
    CapacityLimitReached,
    /// Alignment is not a power of 2.
    InvalidAlignment,
    /// The requested size is zero or larger than the allocator can ever serve.
    InvalidSize,
    /// The released range is out of bounds or not aligned to the allocator's granularity.
    InvalidFree,
    /// The released range is already free.
    DoubleFree,
    /// The released range overlaps a free range.
    OverlappingFree,
    /// The sub-batch ID is not alive.
    UnknownSubBatch(u32),
    /// The batch ID is not alive.
    UnknownBatch(u32),
    /// The batch or sub-batch linkage is inconsistent.
    CorruptedLinkage(String),
    /// The upload queue reservation is exhausted.
    QueueFull,
    /// An allocator implementation error.
    Internal(String),
}

impl std::fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AllocatorError::OutOfMemory => {
                write!(f, "out of memory")
            }
            AllocatorError::CapacityLimitReached => {
                write!(f, "backing store reached its maximum size")
            }
            AllocatorError::InvalidAlignment => {
                write!(f, "alignment is not a power of 2")
            }
            AllocatorError::InvalidSize => {
                write!(f, "invalid allocation size")
            }
            AllocatorError::InvalidFree => {
                write!(f, "released range is out of bounds or misaligned")
            }
            AllocatorError::DoubleFree => {
                write!(f, "released range is already free")
            }
            AllocatorError::OverlappingFree => {
                write!(f, "released range overlaps a free range")
            }
            AllocatorError::UnknownSubBatch(id) => {
                write!(f, "unknown sub-batch {}", id)
            }
            AllocatorError::UnknownBatch(id) => {
                write!(f, "unknown batch {}", id)
            }
            AllocatorError::CorruptedLinkage(message) => {
                write!(f, "corrupted linkage: {}", message)
            }
            AllocatorError::QueueFull => {
                write!(f, "upload queue is full")
            }
            AllocatorError::Internal(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for AllocatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
