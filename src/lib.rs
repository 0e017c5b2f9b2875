//! Allocators for a GPU-mirrored buffer of per-instance render data.
//!
//! Drawable objects are grouped into batches that share one attribute layout (an
//! [`ArchetypeShape`]). Each batch owns one slab of the shared buffer and splits it between
//! sub-batches, so that new object groups can reuse room in an existing batch instead of
//! requesting a new GPU allocation. Writes into the buffer go through a system-memory mirror
//! and are coalesced into a minimal number of buffer copies by the [`UploadCoalescer`].
//!
//! The building blocks are usable on their own:
//!
//!  - [`BlockHeap`]: general purpose allocator with size-class bins and coalescing.
//!  - [`FixedSizeAllocator`]: freelist of equal sized slabs.
//!  - [`SmallBlockAllocator`]: first-fit sub-allocator for the instances of one slab.
//!  - [`SegregatedUnitAllocator`] and [`IntrusiveUnitBucketAllocator`]: bucketed allocators
//!    for small runs of fixed-size units.
//!
//! [`InstanceBuffer`] ties them together and is the intended entry point.
pub use archetype::{ArchetypeShape, AttributeDescriptor};
pub use batch::{
    AllocationStrategy, BatchId, BatchLayout, BatchSpace, BatchTable, BatchTableDescriptor,
    MetadataUnit, MetadataValue, SubBatchId, SubBatchInfo,
};
pub use buffer::{CopyRegion, GpuBuffer, HostBuffer, SystemBuffer};
pub use error::AllocatorError;
pub use fixed_size::FixedSizeAllocator;
pub use gc::ReferenceBitmap;
pub use heap::{BlockHeap, HeapBlock};
pub use instance_buffer::{
    InstanceBuffer, InstanceBufferDescriptor, InstanceBufferStatistics, InstanceWriter,
};
pub use small_block::SmallBlockAllocator;
pub use unit::{IntrusiveUnitBucketAllocator, SegregatedUnitAllocator};
pub use upload::{
    UploadCoalescer, UploadCoalescerDescriptor, UploadRequest, UploadStatistics, UploadWriter,
};

type Result<T> = std::result::Result<T, AllocatorError>;

mod arena;
mod archetype;
mod batch;
mod buffer;
mod error;
mod fixed_size;
mod gc;
mod heap;
mod instance_buffer;
mod small_block;
mod unit;
mod upload;

/// Size in bytes of one element of the shared buffer. Upload requests, binding windows and
/// bind offsets are expressed in elements.
pub const ELEMENT_SIZE: u64 = 16;

/// Statistic of an allocator.
///
/// Sizes are reported in the native unit of the allocator: bytes for the [`BlockHeap`],
/// slabs for the [`FixedSizeAllocator`], instances for the [`SmallBlockAllocator`] and units
/// for the unit allocators.
pub trait AllocatorStatistic {
    /// Number of live allocations.
    fn allocation_count(&self) -> usize;
    /// Number of free ranges.
    fn free_range_count(&self) -> usize;
    /// Amount of allocated space.
    fn used_size(&self) -> u64;
    /// Amount of free space.
    fn free_size(&self) -> u64;
    /// Size of the largest free range.
    fn largest_free_range(&self) -> u64;

    /// Fraction of the free space that is not part of the largest free range.
    ///
    /// Zero when all free space is contiguous (or when nothing is free), approaching one as
    /// the free space splinters.
    fn fragmentation(&self) -> f32 {
        let free = self.free_size();
        if free == 0 {
            0.0
        } else {
            1.0 - (self.largest_free_range() as f64 / free as f64) as f32
        }
    }
}

#[inline]
pub(crate) fn align_up(offset: u64, alignment: u64) -> u64 {
    (offset + (alignment - 1)) & !(alignment - 1)
}

#[inline]
pub(crate) fn is_aligned(offset: u64, alignment: u64) -> bool {
    offset & (alignment - 1) == 0
}
