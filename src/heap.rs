//! Implements the general purpose block heap.

use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

use crate::{align_up, AllocatorError, AllocatorStatistic, Result};

// The alignment of a size class is stored in the lowest bits of the class.
const ALIGNMENT_BITS: u32 = 6;
const MAX_ALIGNMENT_LOG2: u32 = 0x3f;

/// A contiguous range `[begin, end)` of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapBlock {
    begin: u64,
    end: u64,
}

impl HeapBlock {
    /// Creates the range `[begin, end)`.
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    /// Creates the range `[begin, begin + size)`.
    pub fn with_size(begin: u64, size: u64) -> Self {
        Self::new(begin, begin + size)
    }

    /// First offset of the range.
    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// One past the last offset of the range.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Length of the range.
    pub fn size(&self) -> u64 {
        self.end - self.begin
    }

    /// True if the range has a length of zero.
    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    /// True if both ranges share at least one offset.
    pub fn overlaps(&self, other: &HeapBlock) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

/// A size class: the size of a block shifted left, combined with the log2 of the alignment
/// of its begin offset. Ordering by class orders by size first.
#[derive(Debug, Clone, Copy)]
struct SizeBin {
    size_class: u64,
    blocks_id: usize,
}

impl SizeBin {
    fn new(size: u64, alignment: u64) -> Self {
        let alignment_log2 = alignment.trailing_zeros().min(MAX_ALIGNMENT_LOG2);
        Self {
            size_class: (size << ALIGNMENT_BITS) | alignment_log2 as u64,
            blocks_id: usize::MAX,
        }
    }

    fn of_block(block: HeapBlock) -> Self {
        // An offset of zero is aligned to everything and clamps to the maximum.
        let alignment_log2 = block.begin.trailing_zeros().min(MAX_ALIGNMENT_LOG2);
        Self {
            size_class: (block.size() << ALIGNMENT_BITS) | alignment_log2 as u64,
            blocks_id: usize::MAX,
        }
    }

    fn size(&self) -> u64 {
        self.size_class >> ALIGNMENT_BITS
    }

    fn alignment_log2(&self) -> u32 {
        (self.size_class & MAX_ALIGNMENT_LOG2 as u64) as u32
    }

    fn alignment(&self) -> u64 {
        1u64 << self.alignment_log2()
    }

    fn has_compatible_alignment(&self, required: &SizeBin) -> bool {
        self.alignment_log2() >= required.alignment_log2()
    }
}

/// A general purpose allocator over a range of bytes.
///
/// Free blocks are kept in bins of identical size class. The bins are ordered, so the
/// smallest bin that can satisfy a request is found with a binary search. Every free block
/// is registered under both of its endpoints, so a released block finds its free neighbours
/// in logarithmic time and is merged with them. Free blocks are therefore never adjacent.
pub struct BlockHeap {
    size_bins: Vec<SizeBin>,
    blocks: Vec<Vec<HeapBlock>>,
    blocks_freelist: Vec<usize>,
    free_endpoints: BTreeMap<u64, u64>,
    size: u64,
    free: u64,
    minimum_alignment_log2: u32,
    allocation_count: usize,
}

impl BlockHeap {
    /// Creates a new heap managing `[0, size)`. Every allocation is padded and aligned to
    /// `minimum_alignment`, which needs to be a power of 2.
    pub fn new(size: u64, minimum_alignment: u64) -> Result<Self> {
        if !minimum_alignment.is_power_of_two() {
            return Err(AllocatorError::InvalidAlignment);
        }

        let mut heap = Self {
            size_bins: Vec::new(),
            blocks: Vec::new(),
            blocks_freelist: Vec::new(),
            free_endpoints: BTreeMap::new(),
            size: 0,
            free: 0,
            minimum_alignment_log2: minimum_alignment.trailing_zeros(),
            allocation_count: 0,
        };
        heap.resize(size)?;

        Ok(heap)
    }

    /// The alignment every allocation is padded to.
    pub fn minimum_alignment(&self) -> u64 {
        1u64 << self.minimum_alignment_log2
    }

    /// Size of the managed range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of free bytes.
    pub fn free_space(&self) -> u64 {
        self.free
    }

    /// Number of allocated bytes.
    pub fn used_space(&self) -> u64 {
        self.size - self.free
    }

    /// True if nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.free == self.size
    }

    /// True if nothing is free.
    pub fn is_full(&self) -> bool {
        self.free == 0
    }

    /// The end of the highest allocated block. The backing store needs at least this size.
    pub fn one_past_highest_used_address(&self) -> u64 {
        self.free_endpoints
            .get(&self.size)
            .copied()
            .unwrap_or(self.size)
    }

    /// Grows the managed range to `new_size`. New space is merged with a free tail.
    /// The heap can't shrink.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size < self.size {
            return Err(AllocatorError::InvalidSize);
        }

        if new_size > self.size {
            self.insert_free_block(HeapBlock::new(self.size, new_size));
            self.size = new_size;
        }

        Ok(())
    }

    /// Frees every allocation.
    pub fn clear(&mut self) {
        let size = self.size;

        self.size_bins.clear();
        self.blocks.clear();
        self.blocks_freelist.clear();
        self.free_endpoints.clear();
        self.size = 0;
        self.free = 0;
        self.allocation_count = 0;

        if size > 0 {
            self.insert_free_block(HeapBlock::new(0, size));
            self.size = size;
        }
    }

    /// Allocates a block of at least `size` bytes whose begin is a multiple of `alignment`.
    ///
    /// Fails with `OutOfMemory` if no free block can hold the request. The caller can then
    /// [`resize`](Self::resize) the heap and try again.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<HeapBlock> {
        if size == 0 {
            return Err(AllocatorError::InvalidSize);
        }
        if !alignment.is_power_of_two() {
            return Err(AllocatorError::InvalidAlignment);
        }

        let size = align_up(size, self.minimum_alignment());
        let alignment = alignment.max(self.minimum_alignment());
        let request = SizeBin::new(size, alignment);

        let mut index = self.find_smallest_sufficient_bin(&request);
        while index < self.size_bins.len() {
            let bin = self.size_bins[index];
            if self.can_fit_allocation(&request, &bin) {
                if let Some(block) = self.pop_block_from_bin(bin, index) {
                    let block = self.cut_allocation_from_block(&request, block);
                    self.allocation_count += 1;

                    #[cfg(feature = "tracing")]
                    trace!(
                        "Allocated [{}, {}) on the block heap ({} bytes free)",
                        block.begin,
                        block.end,
                        self.free
                    );

                    return Ok(block);
                }
            }
            index += 1;
        }

        Err(AllocatorError::OutOfMemory)
    }

    /// Releases a block back to the heap and merges it with its free neighbours.
    ///
    /// Releasing a range that is out of bounds or that overlaps free space is rejected and
    /// leaves the heap untouched.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn release(&mut self, block: HeapBlock) -> Result<()> {
        if block.is_empty() || block.end > self.size {
            #[cfg(feature = "tracing")]
            warn!(
                "Rejected release of [{}, {}) on a heap of {} bytes",
                block.begin,
                block.end,
                self.size
            );
            return Err(AllocatorError::InvalidFree);
        }

        if let Err(err) = self.check_not_free(block) {
            #[cfg(feature = "tracing")]
            warn!(
                "Rejected release of [{}, {}): {}",
                block.begin,
                block.end,
                err
            );
            return Err(err);
        }

        self.insert_free_block(block);
        self.allocation_count = self.allocation_count.saturating_sub(1);

        Ok(())
    }

    /// All free blocks ordered by offset.
    pub fn free_blocks(&self) -> impl Iterator<Item = HeapBlock> + '_ {
        self.free_endpoints
            .iter()
            .filter(|(begin, end)| end > begin)
            .map(|(begin, end)| HeapBlock::new(*begin, *end))
    }

    /// Checks the internal bookkeeping of the heap.
    pub fn validate(&self) -> Result<()> {
        let non_empty_lists = self.blocks.iter().filter(|list| !list.is_empty()).count();
        if non_empty_lists != self.size_bins.len() {
            return Err(AllocatorError::Internal(
                "there should be exactly one non-empty block list per size bin".to_owned(),
            ));
        }

        let empty_lists = self.blocks.len() - non_empty_lists;
        if empty_lists != self.blocks_freelist.len()
            || self
                .blocks_freelist
                .iter()
                .any(|id| !self.blocks[*id].is_empty())
        {
            return Err(AllocatorError::Internal(
                "all empty block lists should be in the freelist".to_owned(),
            ));
        }

        if self
            .size_bins
            .windows(2)
            .any(|pair| pair[0].size_class >= pair[1].size_class)
        {
            return Err(AllocatorError::Internal(
                "size bins are not strictly ordered".to_owned(),
            ));
        }

        let mut total_free = 0;
        let mut total_blocks = 0;
        for bin in &self.size_bins {
            for block in &self.blocks[bin.blocks_id] {
                if SizeBin::of_block(*block).size_class != bin.size_class {
                    return Err(AllocatorError::Internal(
                        "block size class doesn't match its bin".to_owned(),
                    ));
                }
                if self.free_endpoints.get(&block.begin) != Some(&block.end)
                    || self.free_endpoints.get(&block.end) != Some(&block.begin)
                {
                    return Err(AllocatorError::Internal(
                        "free block endpoints are not registered".to_owned(),
                    ));
                }
                total_free += block.size();
                total_blocks += 1;
            }
        }

        if total_free != self.free || total_free > self.size {
            return Err(AllocatorError::Internal(
                "free size reported incorrectly".to_owned(),
            ));
        }
        if 2 * total_blocks != self.free_endpoints.len() {
            return Err(AllocatorError::Internal(
                "each free block should have exactly two endpoints".to_owned(),
            ));
        }

        Ok(())
    }

    fn check_not_free(&self, block: HeapBlock) -> Result<()> {
        // The closest endpoint at or below the begin is the begin of an enclosing free block,
        // if there is one.
        if let Some((&key, &other)) = self.free_endpoints.range(..=block.begin).next_back() {
            if other > key && other > block.begin {
                if key == block.begin && other == block.end {
                    return Err(AllocatorError::DoubleFree);
                }
                return Err(AllocatorError::OverlappingFree);
            }
        }

        // Any endpoint strictly inside the block belongs to an overlapping free block.
        if block.end > block.begin + 1
            && self
                .free_endpoints
                .range(block.begin + 1..block.end)
                .next()
                .is_some()
        {
            return Err(AllocatorError::OverlappingFree);
        }

        Ok(())
    }

    fn find_smallest_sufficient_bin(&self, needle: &SizeBin) -> usize {
        self.size_bins
            .partition_point(|bin| bin.size_class < needle.size_class)
    }

    fn can_fit_allocation(&self, allocation: &SizeBin, bin: &SizeBin) -> bool {
        debug_assert!(bin.size_class >= allocation.size_class);

        if self.blocks[bin.blocks_id].is_empty() {
            return false;
        }

        if bin.has_compatible_alignment(allocation) {
            true
        } else {
            bin.size() >= allocation.size() + allocation.alignment()
        }
    }

    fn add_new_bin(&mut self, mut bin: SizeBin, index: usize) -> usize {
        bin.blocks_id = match self.blocks_freelist.pop() {
            Some(id) => id,
            None => {
                self.blocks.push(Vec::new());
                self.blocks.len() - 1
            }
        };
        debug_assert!(self.blocks[bin.blocks_id].is_empty());

        self.size_bins.insert(index, bin);
        index
    }

    fn remove_bin_if_empty(&mut self, bin: SizeBin, index: usize) {
        if !self.blocks[bin.blocks_id].is_empty() {
            return;
        }

        self.size_bins.remove(index);
        self.blocks_freelist.push(bin.blocks_id);
    }

    fn pop_block_from_bin(&mut self, bin: SizeBin, index: usize) -> Option<HeapBlock> {
        let block = self.blocks[bin.blocks_id].pop()?;
        self.remove_endpoints(block);
        self.free -= block.size();
        self.remove_bin_if_empty(bin, index);

        Some(block)
    }

    fn remove_endpoints(&mut self, block: HeapBlock) {
        self.free_endpoints.remove(&block.begin);
        self.free_endpoints.remove(&block.end);
    }

    fn remove_free_block(&mut self, block: HeapBlock) {
        self.remove_endpoints(block);

        let bin = SizeBin::of_block(block);
        let index = self.find_smallest_sufficient_bin(&bin);
        debug_assert!(
            index < self.size_bins.len() && self.size_bins[index].size_class == bin.size_class,
            "expected an exact size bin for an existing free block"
        );

        if let Some(bin) = self.size_bins.get(index).copied() {
            let list = &mut self.blocks[bin.blocks_id];
            if let Some(position) = list.iter().position(|b| *b == block) {
                list.swap_remove(position);
            }
            self.remove_bin_if_empty(bin, index);
        }

        self.free -= block.size();
    }

    fn coalesce(&mut self, block: HeapBlock) -> HeapBlock {
        let mut block = block;

        if let Some(&other) = self.free_endpoints.get(&block.begin) {
            debug_assert!(other < block.begin, "unexpected free endpoint");
            self.remove_free_block(HeapBlock::new(other, block.begin));
            block = HeapBlock::new(other, block.end);
        }

        if let Some(&other) = self.free_endpoints.get(&block.end) {
            debug_assert!(other > block.end, "unexpected free endpoint");
            self.remove_free_block(HeapBlock::new(block.end, other));
            block = HeapBlock::new(block.begin, other);
        }

        block
    }

    fn insert_free_block(&mut self, block: HeapBlock) {
        let block = self.coalesce(block);

        let bin = SizeBin::of_block(block);
        let mut index = self.find_smallest_sufficient_bin(&bin);
        if index >= self.size_bins.len() || self.size_bins[index].size_class != bin.size_class {
            index = self.add_new_bin(bin, index);
        }

        let blocks_id = self.size_bins[index].blocks_id;
        self.blocks[blocks_id].push(block);
        self.free += block.size();

        debug_assert!(!self.free_endpoints.contains_key(&block.begin));
        debug_assert!(!self.free_endpoints.contains_key(&block.end));

        self.free_endpoints.insert(block.begin, block.end);
        self.free_endpoints.insert(block.end, block.begin);
    }

    fn cut_allocation_from_block(&mut self, allocation: &SizeBin, block: HeapBlock) -> HeapBlock {
        debug_assert!(block.size() >= allocation.size());

        if allocation.size() == block.size() {
            return block;
        }

        let aligned_begin = align_up(block.begin, allocation.alignment());
        let aligned_end = aligned_begin + allocation.size();

        if aligned_begin > block.begin {
            self.insert_free_block(HeapBlock::new(block.begin, aligned_begin));
        }
        if aligned_end < block.end {
            self.insert_free_block(HeapBlock::new(aligned_end, block.end));
        }

        HeapBlock::new(aligned_begin, aligned_end)
    }
}

impl AllocatorStatistic for BlockHeap {
    fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    fn free_range_count(&self) -> usize {
        self.free_endpoints.len() / 2
    }

    fn used_size(&self) -> u64 {
        self.used_space()
    }

    fn free_size(&self) -> u64 {
        self.free
    }

    fn largest_free_range(&self) -> u64 {
        self.size_bins.last().map(|bin| bin.size()).unwrap_or(0)
    }
}
