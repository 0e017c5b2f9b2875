//! Implements the bucketed allocators for runs of fixed-size units.

use std::ops::Range;

use slotmap::{new_key_type, SlotMap};
#[cfg(feature = "tracing")]
use tracing::warn;

use crate::{AllocatorError, AllocatorStatistic, HeapBlock, Result};

new_key_type! {
    struct BucketKey;
}

/// A freed range waiting in a bucket.
#[derive(Debug, Clone, Copy)]
struct BucketNode {
    start_unit: u32,
    next: Option<BucketKey>,
}

/// What a unit of the store currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    /// Not the first unit of a run.
    Inner,
    /// First unit of an allocated run of this many units.
    Live(u32),
    /// First unit of a run waiting in a bucket.
    Free,
}

/// Allocates runs of up to `max_units` units. Freed runs are kept in one bucket per unit
/// count and handed out again to requests of exactly that count. Runs never coalesce.
///
/// Blocks are expressed in bytes: unit `i` covers `[i * unit_bytes, (i + 1) * unit_bytes)`.
pub struct SegregatedUnitAllocator {
    unit_bytes: u64,
    max_units: u32,
    max_total_units: u32,
    bucket_heads: Vec<Option<BucketKey>>,
    nodes: SlotMap<BucketKey, BucketNode>,
    states: Vec<UnitState>,
    units_top: u32,
    free_units: u32,
    free_runs: usize,
    allocation_count: usize,
}

impl SegregatedUnitAllocator {
    /// Creates an empty allocator. The store grows on demand up to `max_total_units`.
    pub fn new(unit_bytes: u64, max_units: u32, max_total_units: u32) -> Result<Self> {
        if unit_bytes == 0 || max_units == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        Ok(Self {
            unit_bytes,
            max_units,
            max_total_units,
            bucket_heads: vec![None; max_units as usize + 1],
            nodes: SlotMap::with_capacity_and_key(128),
            states: Vec::new(),
            units_top: 0,
            free_units: 0,
            free_runs: 0,
            allocation_count: 0,
        })
    }

    /// Size of one unit in bytes.
    pub fn unit_bytes(&self) -> u64 {
        self.unit_bytes
    }

    /// Largest run that can be allocated.
    pub fn max_units(&self) -> u32 {
        self.max_units
    }

    /// Units handed out so far, live or waiting in a bucket.
    pub fn capacity_units(&self) -> u32 {
        self.units_top
    }

    /// Units currently allocated.
    pub fn active_units(&self) -> u32 {
        self.units_top - self.free_units
    }

    /// Bytes handed out so far, live or waiting in a bucket.
    pub fn capacity_bytes(&self) -> u64 {
        self.units_top as u64 * self.unit_bytes
    }

    /// Bytes currently allocated.
    pub fn active_bytes(&self) -> u64 {
        self.active_units() as u64 * self.unit_bytes
    }

    /// Allocates enough units to hold `bytes`.
    pub fn allocate_bytes(&mut self, bytes: u64) -> Result<HeapBlock> {
        let units = (bytes + self.unit_bytes - 1) / self.unit_bytes;
        if units > self.max_units as u64 {
            return Err(AllocatorError::InvalidSize);
        }
        self.allocate(units as u32)
    }

    /// Allocates a run of `units` units, reusing a freed run of the same count if there is one.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate(&mut self, units: u32) -> Result<HeapBlock> {
        if units == 0 || units > self.max_units {
            return Err(AllocatorError::InvalidSize);
        }

        let start_unit = match self.bucket_heads[units as usize] {
            Some(head) => {
                let node = self.nodes.remove(head).ok_or_else(|| {
                    AllocatorError::Internal("bucket head points to a removed node".to_owned())
                })?;
                self.bucket_heads[units as usize] = node.next;
                self.free_units -= units;
                self.free_runs -= 1;
                node.start_unit
            }
            None => {
                if self.units_top as u64 + units as u64 > self.max_total_units as u64 {
                    return Err(AllocatorError::OutOfMemory);
                }
                let start_unit = self.units_top;
                self.units_top += units;
                self.states.resize(self.units_top as usize, UnitState::Inner);
                start_unit
            }
        };

        self.states[start_unit as usize] = UnitState::Live(units);
        self.allocation_count += 1;

        Ok(self.block_of(start_unit, units))
    }

    /// Puts a run into the bucket of its unit count.
    ///
    /// Only exactly one allocated run can be released. Anything else is rejected without
    /// changing any state.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn free(&mut self, block: HeapBlock) -> Result<()> {
        let checked = self
            .units_of(block)
            .ok_or(AllocatorError::InvalidFree)
            .and_then(|(start_unit, units)| {
                match run_error(self.states[start_unit as usize], units) {
                    Some(err) => Err(err),
                    None => Ok((start_unit, units)),
                }
            });
        let (start_unit, units) = match checked {
            Ok(run) => run,
            Err(err) => {
                #[cfg(feature = "tracing")]
                warn!(
                    "Rejected release of [{}, {}): {}",
                    block.begin(),
                    block.end(),
                    err
                );
                return Err(err);
            }
        };

        let id = self.nodes.insert(BucketNode {
            start_unit,
            next: self.bucket_heads[units as usize],
        });
        self.bucket_heads[units as usize] = Some(id);
        self.states[start_unit as usize] = UnitState::Free;
        self.free_units += units;
        self.free_runs += 1;
        self.allocation_count = self.allocation_count.saturating_sub(1);

        Ok(())
    }

    /// Forgets every run and resets the top to zero.
    pub fn clear(&mut self) {
        self.bucket_heads.iter_mut().for_each(|head| *head = None);
        self.nodes.clear();
        self.states.clear();
        self.units_top = 0;
        self.free_units = 0;
        self.free_runs = 0;
        self.allocation_count = 0;
    }

    /// Converts a block into its first unit and unit count.
    pub fn units_of(&self, block: HeapBlock) -> Option<(u32, u32)> {
        if block.is_empty()
            || block.begin() % self.unit_bytes != 0
            || block.size() % self.unit_bytes != 0
            || block.end() > self.capacity_bytes()
        {
            return None;
        }

        let units = block.size() / self.unit_bytes;
        if units > self.max_units as u64 {
            return None;
        }

        Some(((block.begin() / self.unit_bytes) as u32, units as u32))
    }

    fn block_of(&self, start_unit: u32, units: u32) -> HeapBlock {
        HeapBlock::with_size(
            start_unit as u64 * self.unit_bytes,
            units as u64 * self.unit_bytes,
        )
    }
}

impl AllocatorStatistic for SegregatedUnitAllocator {
    fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    fn free_range_count(&self) -> usize {
        self.free_runs
    }

    fn used_size(&self) -> u64 {
        self.active_units() as u64
    }

    fn free_size(&self) -> u64 {
        self.free_units as u64
    }

    fn largest_free_range(&self) -> u64 {
        self.bucket_heads
            .iter()
            .rposition(|head| head.is_some())
            .unwrap_or(0) as u64
    }
}

/// Why releasing a run of `units` starting at a unit in `state` is not allowed.
fn run_error(state: UnitState, units: u32) -> Option<AllocatorError> {
    match state {
        UnitState::Live(live) if live == units => None,
        UnitState::Live(_) => Some(AllocatorError::InvalidFree),
        UnitState::Free => Some(AllocatorError::DoubleFree),
        UnitState::Inner => Some(AllocatorError::OverlappingFree),
    }
}

#[derive(Debug, Clone, Copy)]
enum UnitSlot<T> {
    /// `run` is the length of the run for its first unit and zero for the others.
    Occupied { value: T, run: u32 },
    Vacant { next: Option<u32> },
}

/// A bucketed unit allocator that owns the unit storage.
///
/// The bucket link of a freed run lives in the first slot of the run, so there is no
/// separate node pool.
pub struct IntrusiveUnitBucketAllocator<T: Copy + Default> {
    slots: Vec<UnitSlot<T>>,
    bucket_heads: Vec<Option<u32>>,
    max_units: u32,
    free_units: u32,
}

impl<T: Copy + Default> IntrusiveUnitBucketAllocator<T> {
    /// Creates an empty allocator serving runs of up to `max_units` units.
    pub fn new(max_units: u32) -> Result<Self> {
        if max_units == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        Ok(Self {
            slots: Vec::with_capacity(16),
            bucket_heads: vec![None; max_units as usize + 1],
            max_units,
            free_units: 0,
        })
    }

    /// Units handed out so far, live or waiting in a bucket.
    pub fn capacity_units(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Units currently allocated.
    pub fn active_units(&self) -> u32 {
        self.capacity_units() - self.free_units
    }

    /// Allocates a run of `units` default initialized units.
    pub fn allocate(&mut self, units: u32) -> Result<Range<u32>> {
        if units == 0 || units > self.max_units {
            return Err(AllocatorError::InvalidSize);
        }

        let start = match self.bucket_heads[units as usize] {
            Some(start) => {
                let next = match self.slots[start as usize] {
                    UnitSlot::Vacant { next } => next,
                    UnitSlot::Occupied { .. } => {
                        return Err(AllocatorError::Internal(
                            "bucket head points to an occupied unit".to_owned(),
                        ))
                    }
                };
                self.bucket_heads[units as usize] = next;
                self.free_units -= units;
                start
            }
            None => {
                let start = self.slots.len() as u32;
                self.slots.resize(
                    (start + units) as usize,
                    UnitSlot::Vacant { next: None },
                );
                start
            }
        };

        let range = start..start + units;
        for slot in &mut self.slots[range.start as usize..range.end as usize] {
            *slot = UnitSlot::Occupied {
                value: T::default(),
                run: 0,
            };
        }
        self.slots[start as usize] = UnitSlot::Occupied {
            value: T::default(),
            run: units,
        };

        Ok(range)
    }

    /// Returns a run to the bucket of its length. Only exactly one allocated run can be
    /// released.
    pub fn free(&mut self, range: Range<u32>) -> Result<()> {
        let units = range.end.saturating_sub(range.start);
        if units == 0 || units > self.max_units || range.end > self.capacity_units() {
            return Err(AllocatorError::InvalidFree);
        }

        let state = match self.slots[range.start as usize] {
            UnitSlot::Occupied { run: 0, .. } => UnitState::Inner,
            UnitSlot::Occupied { run, .. } => UnitState::Live(run),
            UnitSlot::Vacant { .. } => UnitState::Free,
        };
        if let Some(err) = run_error(state, units) {
            #[cfg(feature = "tracing")]
            warn!(
                "Rejected release of units [{}, {}): {}",
                range.start,
                range.end,
                err
            );
            return Err(err);
        }

        for slot in &mut self.slots[range.start as usize + 1..range.end as usize] {
            *slot = UnitSlot::Vacant { next: None };
        }
        self.slots[range.start as usize] = UnitSlot::Vacant {
            next: self.bucket_heads[units as usize],
        };
        self.bucket_heads[units as usize] = Some(range.start);
        self.free_units += units;

        Ok(())
    }

    /// The live unit at `index`.
    pub fn get(&self, index: u32) -> Option<&T> {
        match self.slots.get(index as usize) {
            Some(UnitSlot::Occupied { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// The live unit at `index`.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        match self.slots.get_mut(index as usize) {
            Some(UnitSlot::Occupied { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// The live units of a run. Vacant units inside the range are skipped.
    pub fn units(&self, range: Range<u32>) -> impl Iterator<Item = &T> + '_ {
        let end = (range.end as usize).min(self.slots.len());
        let start = (range.start as usize).min(end);
        self.slots[start..end].iter().filter_map(|slot| match slot {
            UnitSlot::Occupied { value, .. } => Some(value),
            UnitSlot::Vacant { .. } => None,
        })
    }

    /// Forgets every run.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.bucket_heads.iter_mut().for_each(|head| *head = None);
        self.free_units = 0;
    }
}
