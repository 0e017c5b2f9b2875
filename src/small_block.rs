//! Implements the small block allocator that partitions the instances of one slab.

use slotmap::{new_key_type, SlotMap};
#[cfg(feature = "tracing")]
use tracing::warn;

use crate::{AllocatorError, AllocatorStatistic, Result};

const CURSOR_CACHE_SIZE_LOG2: u32 = 6;
const CURSOR_CACHE_SIZE: usize = 1 << CURSOR_CACHE_SIZE_LOG2;
const CURSOR_CACHE_MASK: u32 = CURSOR_CACHE_SIZE as u32 - 1;
const INITIAL_NODE_CAPACITY: usize = 128;

new_key_type! {
    struct FreeNodeKey;
}

/// A free range of instances.
#[derive(Debug, Clone, Copy)]
struct FreeNode {
    offset: u32,
    count: u32,
    next: Option<FreeNodeKey>,
    prev: Option<FreeNodeKey>,
}

impl FreeNode {
    fn new(offset: u32, count: u32) -> Self {
        Self {
            offset,
            count,
            next: None,
            prev: None,
        }
    }
}

/// Remembers the free node preceding a recently released offset.
#[derive(Debug, Clone, Copy)]
struct CursorCell {
    key: u32,
    prev: Option<FreeNodeKey>,
}

impl Default for CursorCell {
    fn default() -> Self {
        Self {
            key: u32::MAX,
            prev: None,
        }
    }
}

/// First-fit allocator over the instance range `[0, capacity)` of one slab.
///
/// Free ranges form a doubly linked list ordered by offset. Allocation resumes the scan at
/// the node it touched last, and releases find their insertion point through a small cache
/// of recently seen predecessors.
pub struct SmallBlockAllocator {
    capacity: u32,
    pool: SlotMap<FreeNodeKey, FreeNode>,
    head: Option<FreeNodeKey>,
    cursor: Option<FreeNodeKey>,
    max_free: u32,
    max_dirty: bool,
    free_count: u32,
    allocation_count: usize,
    cursor_cache: [CursorCell; CURSOR_CACHE_SIZE],
}

impl SmallBlockAllocator {
    /// Creates an allocator with all of `[0, capacity)` free.
    pub fn new(capacity: u32) -> Self {
        let mut pool = SlotMap::with_capacity_and_key(INITIAL_NODE_CAPACITY);
        let head = if capacity > 0 {
            Some(pool.insert(FreeNode::new(0, capacity)))
        } else {
            None
        };

        Self {
            capacity,
            pool,
            head,
            cursor: head,
            max_free: capacity,
            max_dirty: false,
            free_count: capacity,
            allocation_count: 0,
            cursor_cache: [CursorCell::default(); CURSOR_CACHE_SIZE],
        }
    }

    /// Number of instances managed.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of free instances.
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    /// Number of allocated instances.
    pub fn used_count(&self) -> u32 {
        self.capacity - self.free_count
    }

    /// True if nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.free_count == self.capacity
    }

    /// Free ranges as `(offset, count)` ordered by offset.
    pub fn free_ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut current = self.head;
        std::iter::from_fn(move || {
            let key = current?;
            let node = &self.pool[key];
            current = node.next;
            Some((node.offset, node.count))
        })
    }

    /// Size of the largest free range, computed by walking the list.
    pub fn largest_free_range(&self) -> u32 {
        self.free_ranges().map(|(_, count)| count).max().unwrap_or(0)
    }

    /// Allocates `count` consecutive instances and returns the offset of the first one.
    ///
    /// Returns `None` if no free range is large enough.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        if count == 0 || count > self.free_count {
            return None;
        }
        if !self.max_dirty && self.max_free < count {
            return None;
        }

        let mut observed_max = 0;

        // From the cursor to the tail.
        let mut current = self.cursor;
        while let Some(id) = current {
            let node = self.pool[id];
            observed_max = observed_max.max(node.count);
            if node.count >= count {
                return Some(self.cut_from_node(id, count));
            }
            current = node.next;
        }

        // From the head up to the cursor.
        let mut current = self.head;
        while let Some(id) = current {
            if Some(id) == self.cursor {
                break;
            }
            let node = self.pool[id];
            observed_max = observed_max.max(node.count);
            if node.count >= count {
                return Some(self.cut_from_node(id, count));
            }
            current = node.next;
        }

        self.max_free = observed_max;
        self.max_dirty = false;

        None
    }

    /// Releases `count` instances starting at `offset` and merges them with adjacent free
    /// ranges.
    ///
    /// Ranges out of bounds or overlapping a free range are rejected without changing any
    /// state.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn deallocate(&mut self, offset: u32, count: u32) -> Result<()> {
        if count == 0 || offset as u64 + count as u64 > self.capacity as u64 {
            #[cfg(feature = "tracing")]
            warn!(
                "Rejected release of instances [{}, {}) (capacity {})",
                offset,
                offset as u64 + count as u64,
                self.capacity
            );
            return Err(AllocatorError::InvalidFree);
        }

        let was_empty = self.head.is_none();
        let key = mix32(offset);
        let cache_index = (key & CURSOR_CACHE_MASK) as usize;
        let (prev, next) = self.find_neighbours(offset, key, cache_index);

        if let Some(prev) = prev {
            let node = self.pool[prev];
            if node.offset + node.count > offset {
                #[cfg(feature = "tracing")]
                warn!(
                    "Rejected release of instances [{}, {}): overlaps the free range [{}, {})",
                    offset,
                    offset + count,
                    node.offset,
                    node.offset + node.count
                );
                return Err(overlap_error(node.offset, node.count, offset, count));
            }
        }
        if let Some(next) = next {
            let node = self.pool[next];
            if offset + count > node.offset {
                #[cfg(feature = "tracing")]
                warn!(
                    "Rejected release of instances [{}, {}): overlaps the free range [{}, {})",
                    offset,
                    offset + count,
                    node.offset,
                    node.offset + node.count
                );
                return Err(overlap_error(node.offset, node.count, offset, count));
            }
        }

        let prev_adjacent = prev
            .map(|id| self.pool[id].offset + self.pool[id].count == offset)
            .unwrap_or(false);
        let next_adjacent = next
            .map(|id| offset + count == self.pool[id].offset)
            .unwrap_or(false);

        let (touched, cached_prev) = match (prev, next) {
            (Some(prev), Some(next)) if prev_adjacent && next_adjacent => {
                let consumed = self.pool[next];
                self.pool[prev].count += count + consumed.count;
                self.pool[prev].next = consumed.next;
                if let Some(after) = consumed.next {
                    self.pool[after].prev = Some(prev);
                }
                self.pool.remove(next);
                if self.cursor == Some(next) {
                    self.cursor = Some(prev);
                }
                (prev, Some(prev))
            }
            (Some(prev), _) if prev_adjacent => {
                self.pool[prev].count += count;
                (prev, Some(prev))
            }
            (_, Some(next)) if next_adjacent => {
                self.pool[next].offset = offset;
                self.pool[next].count += count;
                (next, self.pool[next].prev)
            }
            _ => {
                let id = self.pool.insert(FreeNode {
                    offset,
                    count,
                    next,
                    prev,
                });
                match prev {
                    Some(prev) => self.pool[prev].next = Some(id),
                    None => self.head = Some(id),
                }
                if let Some(next) = next {
                    self.pool[next].prev = Some(id);
                }
                (id, prev)
            }
        };

        self.cursor_cache[cache_index] = CursorCell {
            key,
            prev: cached_prev,
        };

        if was_empty {
            self.cursor = self.head;
        }

        self.free_count += count;
        self.allocation_count = self.allocation_count.saturating_sub(1);
        self.max_dirty = true;
        self.max_free = self.max_free.max(self.pool[touched].count);

        Ok(())
    }

    fn cut_from_node(&mut self, id: FreeNodeKey, count: u32) -> u32 {
        let node = &mut self.pool[id];
        let start = node.offset;
        node.offset += count;
        node.count -= count;
        let remaining = node.count;
        let (prev, next) = (node.prev, node.next);

        self.free_count -= count;
        self.allocation_count += 1;
        self.max_dirty = true;

        if remaining == 0 {
            match prev {
                Some(prev) => self.pool[prev].next = next,
                None => self.head = next,
            }
            if let Some(next) = next {
                self.pool[next].prev = prev;
            }
            self.pool.remove(id);
            self.cursor = next;
        } else {
            self.cursor = Some(id);
        }

        start
    }

    /// Finds the free nodes directly before and after `offset`.
    fn find_neighbours(
        &self,
        offset: u32,
        key: u32,
        cache_index: usize,
    ) -> (Option<FreeNodeKey>, Option<FreeNodeKey>) {
        let mut prev = None;
        let mut current = self.head;

        let cell = self.cursor_cache[cache_index];
        if cell.key == key {
            // A removed node has a stale key. Any live node before the offset is a safe start.
            let hint = cell
                .prev
                .and_then(|hint| self.pool.get(hint).map(|node| (hint, node)))
                .filter(|(_, node)| node.offset < offset);
            if let Some((hint, node)) = hint {
                prev = Some(hint);
                current = node.next;
            }
        }

        while let Some(id) = current {
            let node = &self.pool[id];
            if node.offset >= offset {
                break;
            }
            prev = Some(id);
            current = node.next;
        }

        (prev, current)
    }
}

impl AllocatorStatistic for SmallBlockAllocator {
    fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    fn free_range_count(&self) -> usize {
        self.free_ranges().count()
    }

    fn used_size(&self) -> u64 {
        self.used_count() as u64
    }

    fn free_size(&self) -> u64 {
        self.free_count as u64
    }

    fn largest_free_range(&self) -> u64 {
        SmallBlockAllocator::largest_free_range(self) as u64
    }
}

fn overlap_error(free_offset: u32, free_count: u32, offset: u32, count: u32) -> AllocatorError {
    if free_offset <= offset && offset + count <= free_offset + free_count {
        AllocatorError::DoubleFree
    } else {
        AllocatorError::OverlappingFree
    }
}

#[inline]
fn mix32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x85eb_ca6b);
    x ^= x >> 13;
    x = x.wrapping_mul(0xc2b2_ae35);
    x ^= x >> 16;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_first_fit_from_the_cursor() {
        let mut allocator = SmallBlockAllocator::new(100);
        assert_eq!(allocator.allocate(10), Some(0));
        assert_eq!(allocator.allocate(10), Some(10));
        allocator.deallocate(0, 10).unwrap();
        // The cursor sits on [20, 100), so the hole at the front is found after it.
        assert_eq!(allocator.allocate(10), Some(20));
        assert_eq!(allocator.allocate(71), None);
        assert_eq!(allocator.allocate(10), Some(30));
    }

    #[test]
    fn release_merges_with_both_neighbours() {
        let mut allocator = SmallBlockAllocator::new(30);
        assert_eq!(allocator.allocate(10), Some(0));
        assert_eq!(allocator.allocate(10), Some(10));
        assert_eq!(allocator.allocate(10), Some(20));
        allocator.deallocate(0, 10).unwrap();
        allocator.deallocate(20, 10).unwrap();
        allocator.deallocate(10, 10).unwrap();
        assert_eq!(allocator.free_ranges().collect::<Vec<_>>(), vec![(0, 30)]);
        assert_eq!(allocator.allocate(30), Some(0));
    }

    #[test]
    fn stale_cache_entry_falls_back_to_a_scan() {
        let mut allocator = SmallBlockAllocator::new(64);
        for i in 0..8 {
            assert_eq!(allocator.allocate(8), Some(i * 8));
        }
        allocator.deallocate(8, 8).unwrap();
        allocator.deallocate(40, 8).unwrap();
        // Consume the node the cache remembers as predecessor of 40, then free around it.
        assert_eq!(allocator.allocate(8), Some(8));
        assert_eq!(allocator.allocate(8), Some(40));
        allocator.deallocate(48, 8).unwrap();
        allocator.deallocate(40, 8).unwrap();
        assert_eq!(allocator.free_ranges().collect::<Vec<_>>(), vec![(40, 16)]);
    }

    #[test]
    fn mix32_matches_the_murmur_finalizer() {
        assert_eq!(mix32(0), 0);
        assert_ne!(mix32(1), mix32(2));
    }
}
