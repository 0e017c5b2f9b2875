//! Implements the fixed size slab allocator.

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

use crate::{AllocatorError, AllocatorStatistic, HeapBlock, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Free(Option<u32>),
    Allocated,
}

/// Hands out equally sized slabs from an array-of-links freelist.
///
/// Slab `i` covers the bytes `[i * block_size, (i + 1) * block_size)`.
pub struct FixedSizeAllocator {
    links: Vec<Link>,
    first_free: Option<u32>,
    block_size: u64,
    free_count: u32,
}

impl FixedSizeAllocator {
    /// Creates an allocator with `block_count` free slabs of `block_size` bytes.
    pub fn new(block_size: u64, block_count: u32) -> Self {
        let mut allocator = Self {
            links: Vec::new(),
            first_free: None,
            block_size,
            free_count: 0,
        };
        allocator.resize(block_count);
        allocator
    }

    /// Size of one slab in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Total number of slabs.
    pub fn block_count(&self) -> u32 {
        self.links.len() as u32
    }

    /// Number of free slabs.
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    /// Number of allocated slabs.
    pub fn used_count(&self) -> u32 {
        self.block_count() - self.free_count
    }

    /// Fraction of the slabs that are allocated.
    pub fn utilization_ratio(&self) -> f32 {
        if self.links.is_empty() {
            0.0
        } else {
            self.used_count() as f32 / self.block_count() as f32
        }
    }

    /// True if no slab is allocated.
    pub fn is_empty(&self) -> bool {
        self.free_count == self.block_count()
    }

    /// True if every slab is allocated.
    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    /// Pops a slab from the head of the freelist.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate(&mut self) -> Result<HeapBlock> {
        let index = self.first_free.ok_or(AllocatorError::OutOfMemory)?;

        self.first_free = match self.links[index as usize] {
            Link::Free(next) => next,
            Link::Allocated => {
                return Err(AllocatorError::Internal(
                    "freelist head points to an allocated slab".to_owned(),
                ))
            }
        };
        self.links[index as usize] = Link::Allocated;
        self.free_count -= 1;

        #[cfg(feature = "tracing")]
        trace!("Allocated slab {} ({} free)", index, self.free_count);

        Ok(self.block_at(index))
    }

    /// Pushes a slab back onto the head of the freelist.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn deallocate(&mut self, block: HeapBlock) -> Result<()> {
        let index = match self.index_of(block) {
            Some(index) => index,
            None => {
                #[cfg(feature = "tracing")]
                warn!(
                    "Rejected release of [{}, {}): not a slab of this allocator",
                    block.begin(),
                    block.end()
                );
                return Err(AllocatorError::InvalidFree);
            }
        };

        if let Link::Free(_) = self.links[index as usize] {
            #[cfg(feature = "tracing")]
            warn!("Rejected release of slab {}: already free", index);
            return Err(AllocatorError::DoubleFree);
        }

        self.links[index as usize] = Link::Free(self.first_free);
        self.first_free = Some(index);
        self.free_count += 1;

        Ok(())
    }

    /// Grows the allocator to `new_count` slabs. The new slabs are threaded onto the head of
    /// the freelist in ascending order. Shrinking is ignored.
    pub fn resize(&mut self, new_count: u32) {
        let old_count = self.block_count();
        if new_count <= old_count {
            return;
        }

        self.links.reserve((new_count - old_count) as usize);
        for index in old_count..new_count {
            let next = if index + 1 < new_count {
                Some(index + 1)
            } else {
                self.first_free
            };
            self.links.push(Link::Free(next));
        }

        self.first_free = Some(old_count);
        self.free_count += new_count - old_count;
    }

    /// True if the slab is currently allocated.
    pub fn is_allocated(&self, block: HeapBlock) -> bool {
        self.index_of(block)
            .map(|index| self.links[index as usize] == Link::Allocated)
            .unwrap_or(false)
    }

    fn block_at(&self, index: u32) -> HeapBlock {
        HeapBlock::with_size(index as u64 * self.block_size, self.block_size)
    }

    fn index_of(&self, block: HeapBlock) -> Option<u32> {
        if self.block_size == 0
            || block.size() != self.block_size
            || block.begin() % self.block_size != 0
        {
            return None;
        }

        let index = block.begin() / self.block_size;
        if index < self.links.len() as u64 {
            Some(index as u32)
        } else {
            None
        }
    }
}

impl AllocatorStatistic for FixedSizeAllocator {
    fn allocation_count(&self) -> usize {
        self.used_count() as usize
    }

    fn free_range_count(&self) -> usize {
        self.free_count as usize
    }

    fn used_size(&self) -> u64 {
        self.used_count() as u64
    }

    fn free_size(&self) -> u64 {
        self.free_count as u64
    }

    fn largest_free_range(&self) -> u64 {
        if self.free_count > 0 {
            1
        } else {
            0
        }
    }

    // Every free slab is as good as any other.
    fn fragmentation(&self) -> f32 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_slabs_are_handed_out_in_order() {
        let mut allocator = FixedSizeAllocator::new(256, 3);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(a, HeapBlock::new(0, 256));
        assert_eq!(b, HeapBlock::new(256, 512));
    }

    #[test]
    fn freed_slab_is_reused_first() {
        let mut allocator = FixedSizeAllocator::new(64, 4);
        let _a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        allocator.deallocate(b).unwrap();
        assert_eq!(allocator.allocate().unwrap(), b);
    }

    #[test]
    fn resize_threads_new_slabs_before_old_free_ones() {
        let mut allocator = FixedSizeAllocator::new(64, 2);
        let _a = allocator.allocate().unwrap();
        allocator.resize(4);
        assert_eq!(allocator.free_count(), 3);
        assert_eq!(allocator.allocate().unwrap().begin(), 128);
        assert_eq!(allocator.allocate().unwrap().begin(), 192);
        assert_eq!(allocator.allocate().unwrap().begin(), 64);
        assert_eq!(allocator.allocate(), Err(AllocatorError::OutOfMemory));
    }
}
