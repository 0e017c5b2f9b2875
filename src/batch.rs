//! Batch and sub-batch tables.

use std::ops::Range;

#[cfg(feature = "tracing")]
use tracing::{debug, trace, warn};

use crate::archetype::{ShapeKey, ShapeRegistry};
use crate::arena::Arena;
use crate::{
    AllocatorError, AllocatorStatistic, ArchetypeShape, BlockHeap, FixedSizeAllocator, HeapBlock,
    ReferenceBitmap, Result, SegregatedUnitAllocator, SmallBlockAllocator, ELEMENT_SIZE,
};

/// Marks a metadata value as pointing to per-instance data.
const PER_INSTANCE_DATA_BIT: u32 = 0x8000_0000;

/// How slabs are handed out to batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Batches own one window sized slab, shared between any number of sub-batches.
    Multiplexed,
    /// Every batch gets a slab sized to its request from a general heap and holds exactly
    /// one sub-batch.
    Dedicated,
}

/// Describes the configuration of a `BatchTable`.
#[derive(Debug, Clone)]
pub struct BatchTableDescriptor {
    /// How slabs are handed out. Defaults to `Multiplexed`.
    pub strategy: AllocationStrategy,
    /// If set, slabs never cross a binding window. Defaults to `true`.
    pub windowed: bool,
    /// The size of a binding window as log2 bytes. Defaults to 16 (64 KiB).
    pub window_size: u8,
    /// The initial size of the buffer as log2 bytes. Defaults to 21 (2 MiB).
    pub initial_buffer_size: u8,
    /// The hard ceiling of the buffer size in bytes. Defaults to 1023 MiB.
    pub max_buffer_size: u64,
    /// Alignment of dedicated slabs. Defaults to 16.
    pub allocation_alignment: u64,
    /// Maximum number of metadata units a sub-batch can reserve. Defaults to 256.
    pub max_metadata_units: u32,
    /// Maximum number of live sub-batches. Defaults to 4096.
    pub max_sub_batches: u32,
    /// Maximum size of a dedicated slab in unwindowed mode. Defaults to 16 MiB.
    pub max_dedicated_batch_size: u64,
}

impl Default for BatchTableDescriptor {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::Multiplexed,
            windowed: true,
            window_size: 16,
            initial_buffer_size: 21,
            max_buffer_size: 1023 * 1024 * 1024,
            allocation_alignment: 16,
            max_metadata_units: 256,
            max_sub_batches: 4096,
            max_dedicated_batch_size: 16 * 1024 * 1024,
        }
    }
}

/// Id of a batch. Ids of removed batches are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u32);

/// Id of a sub-batch. Ids of removed sub-batches are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubBatchId(pub u32);

/// GPU location of one attribute of one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataUnit {
    /// The attribute.
    pub attribute_id: u32,
    /// Size of one value in system memory.
    pub size_cpu: u16,
    /// Size of one value in the GPU buffer.
    pub size_gpu: u16,
    /// Byte offset of the first value of the chunk in the buffer.
    pub gpu_offset: u64,
}

/// The value a shader reads to locate an attribute stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataValue {
    /// The attribute.
    pub attribute_id: u32,
    /// Byte address of the stream relative to the bind offset. The high bit marks
    /// per-instance data.
    pub value: u32,
}

impl MetadataValue {
    fn per_instance(attribute_id: u32, address: u32) -> Self {
        Self {
            attribute_id,
            value: address | PER_INSTANCE_DATA_BIT,
        }
    }

    /// The byte address without the flag bits.
    pub fn address(&self) -> u32 {
        self.value & !PER_INSTANCE_DATA_BIT
    }

    /// True if the stream holds one value per instance.
    pub fn is_per_instance(&self) -> bool {
        self.value & PER_INSTANCE_DATA_BIT != 0
    }
}

/// Binding information of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    /// Begin of the bound range in elements. Zero if the whole buffer is bound.
    pub bind_offset: u64,
    /// Size of the bound range in elements. Zero if the whole buffer is bound.
    pub bind_size: u64,
    /// The byte range of the slab.
    pub slab: HeapBlock,
    /// Number of instances the slab can hold.
    pub instance_capacity: u32,
    /// One value per attribute, ordered by attribute id.
    pub metadata: Vec<MetadataValue>,
}

/// Room reserved for a group of instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpace {
    /// The batch the instances live in.
    pub batch: BatchId,
    /// The sub-batch owning the instances.
    pub sub_batch: SubBatchId,
    /// First instance inside the batch.
    pub instance_offset: u32,
    /// Number of instances.
    pub instance_count: u32,
    /// Range of the metadata units describing the chunks.
    pub metadata: Range<u32>,
}

/// Public view of a live sub-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatchInfo {
    /// The owning batch.
    pub batch: BatchId,
    /// First instance inside the batch.
    pub instance_offset: u32,
    /// Number of instances.
    pub instance_count: u32,
    /// Range of the metadata units describing the chunks.
    pub metadata: Range<u32>,
}

struct Batch {
    shape: ShapeKey,
    slab: HeapBlock,
    capacity: u32,
    /// Only multiplexed batches share their slab.
    instances: Option<SmallBlockAllocator>,
    first_sub_batch: Option<u32>,
    sub_batch_count: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Clone, Copy)]
struct SubBatch {
    batch: u32,
    instance_offset: u32,
    instance_count: u32,
    metadata: HeapBlock,
    prev: Option<u32>,
    next: Option<u32>,
}

enum SlabSource {
    Windows(FixedSizeAllocator),
    Heap(BlockHeap),
}

enum Placement {
    Existing(u32),
    New(Batch),
}

/// Owns the batches and sub-batches of the instance buffer and the allocators behind them.
///
/// Batches of the same shape form a bucket (a doubly linked list), so that a new sub-batch
/// only looks at batches it is compatible with. A batch lives as long as it has at least one
/// sub-batch.
pub struct BatchTable {
    strategy: AllocationStrategy,
    windowed: bool,
    window_bytes: u64,
    max_buffer_size: u64,
    allocation_alignment: u64,
    max_metadata_units: u32,
    max_sub_batches: u32,
    max_dedicated_batch_size: u64,
    buffer_size: u64,
    slabs: SlabSource,
    shapes: ShapeRegistry,
    batches: Arena<Batch>,
    sub_batches: Arena<SubBatch>,
    metadata_units: SegregatedUnitAllocator,
    metadata: Vec<MetadataUnit>,
    referenced: ReferenceBitmap,
    unreferenced: ReferenceBitmap,
}

impl BatchTable {
    /// Creates a new batch table.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn new(descriptor: &BatchTableDescriptor) -> Result<Self> {
        if descriptor.window_size >= 32 || descriptor.initial_buffer_size >= 48 {
            return Err(AllocatorError::InvalidSize);
        }
        if !descriptor.allocation_alignment.is_power_of_two() {
            return Err(AllocatorError::InvalidAlignment);
        }
        if descriptor.max_metadata_units == 0 || descriptor.max_sub_batches == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        let window_bytes = 1u64 << descriptor.window_size;
        if window_bytes < ELEMENT_SIZE || descriptor.max_buffer_size < window_bytes {
            return Err(AllocatorError::InvalidSize);
        }

        let initial_size = (1u64 << descriptor.initial_buffer_size).min(descriptor.max_buffer_size);
        let allocation_alignment = descriptor.allocation_alignment.max(ELEMENT_SIZE);

        let (slabs, buffer_size) = match descriptor.strategy {
            AllocationStrategy::Multiplexed => {
                let count = (initial_size / window_bytes).max(1);
                (
                    SlabSource::Windows(FixedSizeAllocator::new(window_bytes, count as u32)),
                    count * window_bytes,
                )
            }
            AllocationStrategy::Dedicated => (
                SlabSource::Heap(BlockHeap::new(initial_size, ELEMENT_SIZE)?),
                initial_size,
            ),
        };

        let max_total_units = descriptor
            .max_metadata_units
            .saturating_mul(descriptor.max_sub_batches);
        let metadata_units =
            SegregatedUnitAllocator::new(1, descriptor.max_metadata_units, max_total_units)?;

        #[cfg(feature = "tracing")]
        debug!(
            "Created batch table ({:?}, windowed: {}, window: {} bytes, buffer: {} bytes)",
            descriptor.strategy,
            descriptor.windowed,
            window_bytes,
            buffer_size
        );

        Ok(Self {
            strategy: descriptor.strategy,
            windowed: descriptor.windowed,
            window_bytes,
            max_buffer_size: descriptor.max_buffer_size,
            allocation_alignment,
            max_metadata_units: descriptor.max_metadata_units,
            max_sub_batches: descriptor.max_sub_batches,
            max_dedicated_batch_size: descriptor.max_dedicated_batch_size,
            buffer_size,
            slabs,
            shapes: ShapeRegistry::default(),
            batches: Arena::with_capacity(256),
            sub_batches: Arena::with_capacity(1024),
            metadata_units,
            metadata: Vec::new(),
            referenced: ReferenceBitmap::default(),
            unreferenced: ReferenceBitmap::default(),
        })
    }

    /// The allocation strategy.
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// True if slabs are confined to binding windows.
    pub fn is_windowed(&self) -> bool {
        self.windowed
    }

    /// Size of a binding window in bytes.
    pub fn window_bytes(&self) -> u64 {
        self.window_bytes
    }

    /// The size of the buffer the slabs are carved from.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// One past the highest byte used by any slab.
    pub fn required_buffer_size(&self) -> u64 {
        match &self.slabs {
            SlabSource::Windows(_) => self
                .batches
                .iter()
                .map(|(_, batch)| batch.slab.end())
                .max()
                .unwrap_or(0),
            SlabSource::Heap(heap) => heap.one_past_highest_used_address(),
        }
    }

    /// Number of live batches.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Number of live sub-batches.
    pub fn sub_batch_count(&self) -> usize {
        self.sub_batches.len()
    }

    /// Number of distinct shapes seen so far.
    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    /// Bytes owned by slabs.
    pub fn used_bytes(&self) -> u64 {
        match &self.slabs {
            SlabSource::Windows(windows) => windows.used_count() as u64 * self.window_bytes,
            SlabSource::Heap(heap) => heap.used_space(),
        }
    }

    /// Bytes not owned by any slab.
    pub fn free_bytes(&self) -> u64 {
        self.buffer_size - self.used_bytes()
    }

    /// Fragmentation of the slab allocator.
    pub fn slab_fragmentation(&self) -> f32 {
        match &self.slabs {
            SlabSource::Windows(windows) => windows.fragmentation(),
            SlabSource::Heap(heap) => heap.fragmentation(),
        }
    }

    /// Number of metadata units in use.
    pub fn metadata_units_in_use(&self) -> u32 {
        self.metadata_units.active_units()
    }

    /// Fragmentation of the metadata unit allocator.
    pub fn metadata_fragmentation(&self) -> f32 {
        self.metadata_units.fragmentation()
    }

    /// Gives an attribute a name used in log output.
    pub fn set_attribute_name(&mut self, attribute_id: u32, name: &str) {
        self.shapes.set_attribute_name(attribute_id, name);
    }

    /// Reserves room for one group of instances, split into chunks of the given sizes.
    ///
    /// Existing batches of the shape are searched first; the batch that has room is moved to
    /// the front of its bucket. Otherwise a new batch with a fresh slab is created, growing
    /// the buffer once if the slab allocator is exhausted. A failed call leaves all batches,
    /// sub-batches and allocators as they were.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate(
        &mut self,
        shape: &ArchetypeShape,
        chunk_instance_counts: &[u32],
    ) -> Result<BatchSpace> {
        let instance_count = self.validate_request(shape, chunk_instance_counts)?;
        let key = self.shapes.intern(shape);

        let (placement, instance_offset) = match self.find_batch_with_room(key, instance_count) {
            Some((batch, offset)) => (Placement::Existing(batch), offset),
            None => {
                let mut batch = self.create_batch(key, shape, instance_count)?;
                let offset = match batch.instances.as_mut() {
                    Some(instances) => instances.allocate(instance_count),
                    None => Some(0),
                };
                match offset {
                    Some(offset) => (Placement::New(batch), offset),
                    None => {
                        self.release_slab(batch.slab)?;
                        return Err(AllocatorError::Internal(
                            "fresh batch can't hold its first sub-batch".to_owned(),
                        ));
                    }
                }
            }
        };

        let units = (shape.attribute_count() * chunk_instance_counts.len()) as u32;
        let metadata = match self.metadata_units.allocate(units) {
            Ok(metadata) => metadata,
            Err(err) => {
                #[cfg(feature = "tracing")]
                warn!("Can't reserve {} metadata units: {}", units, err);

                match placement {
                    Placement::Existing(id) => {
                        if let Some(instances) =
                            self.batches.get_mut(id).and_then(|b| b.instances.as_mut())
                        {
                            instances.deallocate(instance_offset, instance_count)?;
                        }
                    }
                    Placement::New(batch) => self.release_slab(batch.slab)?,
                }
                return Err(err);
            }
        };

        let batch_id = match placement {
            Placement::Existing(id) => {
                self.move_to_front(key, id);
                id
            }
            Placement::New(batch) => {
                #[cfg(feature = "tracing")]
                let (slab, capacity) = (batch.slab, batch.capacity);

                let id = self.batches.insert(batch);
                self.link_at_head(key, id);

                #[cfg(feature = "tracing")]
                debug!(
                    "Created batch {} for shape {}: slab [{}, {}), {} instances",
                    id,
                    self.shapes.describe(key),
                    slab.begin(),
                    slab.end(),
                    capacity
                );

                id
            }
        };

        self.write_metadata(batch_id, shape, metadata, instance_offset, chunk_instance_counts);

        let first_sub_batch = self.batches.get(batch_id).and_then(|b| b.first_sub_batch);
        let sub_batch_id = self.sub_batches.insert(SubBatch {
            batch: batch_id,
            instance_offset,
            instance_count,
            metadata,
            prev: None,
            next: first_sub_batch,
        });
        if let Some(next) = first_sub_batch.and_then(|id| self.sub_batches.get_mut(id)) {
            next.prev = Some(sub_batch_id);
        }
        if let Some(batch) = self.batches.get_mut(batch_id) {
            batch.first_sub_batch = Some(sub_batch_id);
            batch.sub_batch_count += 1;
        }

        #[cfg(feature = "tracing")]
        trace!(
            "Allocated sub-batch {} in batch {}: instances [{}, {}), metadata [{}, {})",
            sub_batch_id,
            batch_id,
            instance_offset,
            instance_offset + instance_count,
            metadata.begin(),
            metadata.end()
        );

        Ok(BatchSpace {
            batch: BatchId(batch_id),
            sub_batch: SubBatchId(sub_batch_id),
            instance_offset,
            instance_count,
            metadata: metadata.begin() as u32..metadata.end() as u32,
        })
    }

    /// Removes a sub-batch. Removing the last sub-batch of a batch removes the batch and
    /// releases its slab.
    ///
    /// Unknown ids and broken links are logged and leave the table untouched.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn remove_sub_batch(&mut self, id: SubBatchId) -> Result<()> {
        let sub_batch = match self.sub_batches.get(id.0) {
            Some(sub_batch) => *sub_batch,
            None => {
                #[cfg(feature = "tracing")]
                warn!("Can't remove sub-batch {}: unknown id", id.0);
                return Err(AllocatorError::UnknownSubBatch(id.0));
            }
        };

        let batch = match self.batches.get_mut(sub_batch.batch) {
            Some(batch) => batch,
            None => {
                #[cfg(feature = "tracing")]
                warn!(
                    "Can't remove sub-batch {}: owning batch {} doesn't exist",
                    id.0,
                    sub_batch.batch
                );
                return Err(AllocatorError::CorruptedLinkage(format!(
                    "sub-batch {} is owned by missing batch {}",
                    id.0, sub_batch.batch
                )));
            }
        };

        if let Some(instances) = batch.instances.as_mut() {
            if let Err(_err) =
                instances.deallocate(sub_batch.instance_offset, sub_batch.instance_count)
            {
                #[cfg(feature = "tracing")]
                warn!(
                    "Can't remove sub-batch {}: instance range is inconsistent: {}",
                    id.0,
                    _err
                );
                return Err(AllocatorError::CorruptedLinkage(format!(
                    "instance range of sub-batch {} is not allocated in batch {}",
                    id.0, sub_batch.batch
                )));
            }
        }

        match sub_batch.prev {
            Some(prev) => {
                if let Some(prev) = self.sub_batches.get_mut(prev) {
                    prev.next = sub_batch.next;
                }
            }
            None => {
                if let Some(batch) = self.batches.get_mut(sub_batch.batch) {
                    batch.first_sub_batch = sub_batch.next;
                }
            }
        }
        if let Some(next) = sub_batch.next.and_then(|next| self.sub_batches.get_mut(next)) {
            next.prev = sub_batch.prev;
        }
        self.sub_batches.remove(id.0);
        // A recycled id starts out unmarked.
        self.referenced.clear(id.0);

        let begin = sub_batch.metadata.begin() as usize;
        let end = (sub_batch.metadata.end() as usize).min(self.metadata.len());
        if begin < end {
            self.metadata[begin..end]
                .iter_mut()
                .for_each(|unit| *unit = MetadataUnit::default());
        }
        if let Err(_err) = self.metadata_units.free(sub_batch.metadata) {
            #[cfg(feature = "tracing")]
            warn!(
                "Leaking metadata units of sub-batch {}: {}",
                id.0,
                _err
            );
        }

        let remaining = match self.batches.get_mut(sub_batch.batch) {
            Some(batch) => {
                batch.sub_batch_count = batch.sub_batch_count.saturating_sub(1);
                batch.sub_batch_count
            }
            None => 0,
        };

        #[cfg(feature = "tracing")]
        trace!(
            "Removed sub-batch {} from batch {} ({} left)",
            id.0,
            sub_batch.batch,
            remaining
        );

        if remaining == 0 {
            self.remove_batch(sub_batch.batch)?;
        }

        Ok(())
    }

    /// Marks a sub-batch as still in use for the next garbage collection.
    pub fn mark_referenced(&mut self, id: SubBatchId) {
        if self.sub_batches.contains(id.0) {
            if id.0 >= self.referenced.id_range() {
                self.referenced.resize(self.sub_batches.id_range());
            }
            self.referenced.set(id.0);
        }
    }

    /// Removes every sub-batch that wasn't marked since the last collection. Returns the
    /// number of removed sub-batches.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn collect_garbage(&mut self) -> usize {
        self.unreferenced.reset(self.sub_batches.id_range());
        for (id, _) in self.sub_batches.iter() {
            if !self.referenced.is_set(id) {
                self.unreferenced.set(id);
            }
        }
        self.referenced.reset(self.sub_batches.id_range());

        let unreferenced: Vec<u32> = self.unreferenced.iter_set().collect();
        let mut removed = 0;
        for id in unreferenced {
            if self.remove_sub_batch(SubBatchId(id)).is_ok() {
                removed += 1;
            }
        }

        #[cfg(feature = "tracing")]
        debug!(
            "Garbage collection removed {} sub-batches ({} sub-batches in {} batches left)",
            removed,
            self.sub_batches.len(),
            self.batches.len()
        );

        removed
    }

    /// The binding information of a batch.
    pub fn batch_layout(&self, id: BatchId) -> Option<BatchLayout> {
        let batch = self.batches.get(id.0)?;
        let shape = &self.shapes.get(batch.shape)?.shape;

        let (bind_offset, bind_size) = if self.windowed {
            let bind_size = match self.strategy {
                AllocationStrategy::Multiplexed => self.window_bytes,
                AllocationStrategy::Dedicated => batch.slab.size(),
            };
            (batch.slab.begin(), bind_size)
        } else {
            (0, 0)
        };

        let metadata = shape
            .attributes()
            .iter()
            .zip(shape.stream_offsets(batch.capacity))
            .map(|(attribute, stream_offset)| {
                let address = batch.slab.begin() + stream_offset - bind_offset;
                MetadataValue::per_instance(attribute.id, address as u32)
            })
            .collect();

        Some(BatchLayout {
            bind_offset: bind_offset / ELEMENT_SIZE,
            bind_size: bind_size / ELEMENT_SIZE,
            slab: batch.slab,
            instance_capacity: batch.capacity,
            metadata,
        })
    }

    /// A live sub-batch.
    pub fn sub_batch(&self, id: SubBatchId) -> Option<SubBatchInfo> {
        self.sub_batches.get(id.0).map(|sub_batch| SubBatchInfo {
            batch: BatchId(sub_batch.batch),
            instance_offset: sub_batch.instance_offset,
            instance_count: sub_batch.instance_count,
            metadata: sub_batch.metadata.begin() as u32..sub_batch.metadata.end() as u32,
        })
    }

    /// The sub-batches of a batch, most recent first.
    pub fn sub_batches_of(&self, id: BatchId) -> Vec<SubBatchId> {
        let mut result = Vec::new();
        let mut current = self.batches.get(id.0).and_then(|b| b.first_sub_batch);
        while let Some(sub_batch) = current {
            result.push(SubBatchId(sub_batch));
            current = self.sub_batches.get(sub_batch).and_then(|s| s.next);
        }
        result
    }

    /// The batches of a shape in bucket order.
    pub fn batches_of_shape(&self, shape: &ArchetypeShape) -> Vec<BatchId> {
        let mut result = Vec::new();
        let mut current = self
            .shapes
            .find(shape)
            .and_then(|key| self.shapes.get(key))
            .and_then(|entry| entry.head);
        while let Some(batch) = current {
            result.push(BatchId(batch));
            current = self.batches.get(batch).and_then(|b| b.next);
        }
        result
    }

    /// Metadata units of a range returned by [`allocate`](Self::allocate).
    pub fn metadata(&self, range: Range<u32>) -> &[MetadataUnit] {
        let end = (range.end as usize).min(self.metadata.len());
        let begin = (range.start as usize).min(end);
        &self.metadata[begin..end]
    }

    /// Checks the links between shapes, batches and sub-batches.
    pub fn validate(&self) -> Result<()> {
        let mut linked_batches = 0;
        let mut linked_sub_batches = 0;

        let mut keys: Vec<ShapeKey> = self.batches.iter().map(|(_, b)| b.shape).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let mut prev = None;
            let mut current = self.shapes.get(key).and_then(|entry| entry.head);
            while let Some(id) = current {
                let batch = self.batches.get(id).ok_or_else(|| {
                    AllocatorError::CorruptedLinkage(format!("bucket links missing batch {}", id))
                })?;
                if batch.prev != prev || batch.shape != key {
                    return Err(AllocatorError::CorruptedLinkage(format!(
                        "batch {} is linked into the wrong bucket position",
                        id
                    )));
                }
                self.validate_sub_batches(id, batch)?;
                linked_sub_batches += batch.sub_batch_count as usize;
                linked_batches += 1;
                prev = Some(id);
                current = batch.next;
            }
        }

        if linked_batches != self.batches.len() || linked_sub_batches != self.sub_batches.len() {
            return Err(AllocatorError::CorruptedLinkage(
                "not every batch or sub-batch is reachable".to_owned(),
            ));
        }

        Ok(())
    }

    fn validate_sub_batches(&self, id: u32, batch: &Batch) -> Result<()> {
        let mut ranges = Vec::new();
        let mut prev = None;
        let mut current = batch.first_sub_batch;
        while let Some(sub_id) = current {
            let sub_batch = self.sub_batches.get(sub_id).ok_or_else(|| {
                AllocatorError::CorruptedLinkage(format!(
                    "batch {} links missing sub-batch {}",
                    id, sub_id
                ))
            })?;
            if sub_batch.batch != id || sub_batch.prev != prev {
                return Err(AllocatorError::CorruptedLinkage(format!(
                    "sub-batch {} is linked into the wrong batch",
                    sub_id
                )));
            }
            ranges.push((
                sub_batch.instance_offset,
                sub_batch.instance_offset + sub_batch.instance_count,
            ));
            prev = Some(sub_id);
            current = sub_batch.next;
        }

        if ranges.len() != batch.sub_batch_count as usize || ranges.is_empty() {
            return Err(AllocatorError::CorruptedLinkage(format!(
                "batch {} has a wrong sub-batch count",
                id
            )));
        }

        ranges.sort_unstable();
        if ranges.windows(2).any(|pair| pair[0].1 > pair[1].0)
            || ranges.iter().any(|(_, end)| *end > batch.capacity)
        {
            return Err(AllocatorError::CorruptedLinkage(format!(
                "sub-batches of batch {} overlap or exceed the slab",
                id
            )));
        }

        Ok(())
    }

    fn validate_request(
        &self,
        shape: &ArchetypeShape,
        chunk_instance_counts: &[u32],
    ) -> Result<u32> {
        if chunk_instance_counts.is_empty() || chunk_instance_counts.contains(&0) {
            return Err(AllocatorError::InvalidSize);
        }

        let instance_count: u64 = chunk_instance_counts.iter().map(|c| *c as u64).sum();
        if instance_count > u32::MAX as u64 {
            return Err(AllocatorError::InvalidSize);
        }
        let instance_count = instance_count as u32;

        let units = shape.attribute_count() as u64 * chunk_instance_counts.len() as u64;
        if units > self.max_metadata_units as u64 {
            #[cfg(feature = "tracing")]
            warn!(
                "Sub-batch needs {} metadata units, at most {} are supported",
                units,
                self.max_metadata_units
            );
            return Err(AllocatorError::InvalidSize);
        }

        if self.sub_batches.len() >= self.max_sub_batches as usize {
            #[cfg(feature = "tracing")]
            warn!("Sub-batch limit of {} reached", self.max_sub_batches);
            return Err(AllocatorError::CapacityLimitReached);
        }

        let fits = match self.strategy {
            AllocationStrategy::Multiplexed => {
                instance_count <= shape.max_instances_per_window(self.window_bytes)
            }
            AllocationStrategy::Dedicated if self.windowed => {
                instance_count <= shape.max_instances_per_window(self.window_bytes)
            }
            AllocationStrategy::Dedicated => {
                shape.slab_bytes(instance_count) <= self.max_dedicated_batch_size
            }
        };
        if !fits {
            #[cfg(feature = "tracing")]
            warn!(
                "{} instances of {} bytes don't fit into one batch",
                instance_count,
                shape.bytes_per_instance()
            );
            return Err(AllocatorError::InvalidSize);
        }

        Ok(instance_count)
    }

    fn find_batch_with_room(&mut self, key: ShapeKey, instance_count: u32) -> Option<(u32, u32)> {
        let mut current = self.shapes.get(key)?.head;
        while let Some(id) = current {
            let batch = self.batches.get_mut(id)?;
            if let Some(offset) = batch
                .instances
                .as_mut()
                .and_then(|instances| instances.allocate(instance_count))
            {
                return Some((id, offset));
            }
            current = batch.next;
        }
        None
    }

    fn create_batch(
        &mut self,
        key: ShapeKey,
        shape: &ArchetypeShape,
        instance_count: u32,
    ) -> Result<Batch> {
        let (capacity, instances, slab_bytes, alignment) = match self.strategy {
            AllocationStrategy::Multiplexed => {
                let capacity = shape.max_instances_per_window(self.window_bytes);
                (
                    capacity,
                    Some(SmallBlockAllocator::new(capacity)),
                    self.window_bytes,
                    self.window_bytes,
                )
            }
            AllocationStrategy::Dedicated => {
                let slab_bytes = shape.slab_bytes(instance_count);
                let alignment = if self.windowed {
                    slab_bytes.next_power_of_two().min(self.window_bytes)
                } else {
                    self.allocation_alignment
                };
                (
                    instance_count,
                    None,
                    slab_bytes,
                    alignment.max(self.allocation_alignment),
                )
            }
        };

        let slab = self.acquire_slab(slab_bytes, alignment)?;

        Ok(Batch {
            shape: key,
            slab,
            capacity,
            instances,
            first_sub_batch: None,
            sub_batch_count: 0,
            prev: None,
            next: None,
        })
    }

    fn acquire_slab(&mut self, bytes: u64, alignment: u64) -> Result<HeapBlock> {
        match self.try_acquire_slab(bytes, alignment) {
            Err(AllocatorError::OutOfMemory) => {
                self.grow(bytes + alignment)?;
                self.try_acquire_slab(bytes, alignment)
            }
            result => result,
        }
    }

    fn try_acquire_slab(&mut self, bytes: u64, alignment: u64) -> Result<HeapBlock> {
        match &mut self.slabs {
            SlabSource::Windows(windows) => windows.allocate(),
            SlabSource::Heap(heap) => heap.allocate(bytes, alignment),
        }
    }

    fn release_slab(&mut self, slab: HeapBlock) -> Result<()> {
        match &mut self.slabs {
            SlabSource::Windows(windows) => windows.deallocate(slab),
            SlabSource::Heap(heap) => heap.release(slab),
        }
    }

    /// Doubles the buffer, at least by `minimum_growth` bytes, capped at the maximum size.
    fn grow(&mut self, minimum_growth: u64) -> Result<()> {
        let old_size = self.buffer_size;
        let mut new_size = (old_size * 2)
            .max(old_size + minimum_growth)
            .min(self.max_buffer_size);
        new_size -= match self.slabs {
            SlabSource::Windows(_) => new_size % self.window_bytes,
            SlabSource::Heap(_) => new_size % ELEMENT_SIZE,
        };

        if new_size <= old_size {
            #[cfg(feature = "tracing")]
            warn!(
                "Can't grow the instance buffer beyond {} bytes",
                self.max_buffer_size
            );
            return Err(AllocatorError::CapacityLimitReached);
        }

        match &mut self.slabs {
            SlabSource::Windows(windows) => {
                windows.resize((new_size / self.window_bytes) as u32);
            }
            SlabSource::Heap(heap) => heap.resize(new_size)?,
        }
        self.buffer_size = new_size;

        #[cfg(feature = "tracing")]
        debug!(
            "Grew the instance buffer from {} to {} bytes",
            old_size,
            new_size
        );

        Ok(())
    }

    fn remove_batch(&mut self, id: u32) -> Result<()> {
        let key = match self.batches.get(id) {
            Some(batch) => batch.shape,
            None => return Err(AllocatorError::UnknownBatch(id)),
        };

        self.unlink(key, id);
        if let Some(batch) = self.batches.remove(id) {
            if let Err(err) = self.release_slab(batch.slab) {
                #[cfg(feature = "tracing")]
                warn!(
                    "Can't release slab [{}, {}) of batch {}: {}",
                    batch.slab.begin(),
                    batch.slab.end(),
                    id,
                    err
                );
                return Err(err);
            }

            #[cfg(feature = "tracing")]
            debug!(
                "Removed batch {} of shape {}: slab [{}, {})",
                id,
                self.shapes.describe(key),
                batch.slab.begin(),
                batch.slab.end()
            );
        }

        Ok(())
    }

    fn unlink(&mut self, key: ShapeKey, id: u32) {
        let (prev, next) = match self.batches.get_mut(id) {
            Some(batch) => {
                let links = (batch.prev, batch.next);
                batch.prev = None;
                batch.next = None;
                links
            }
            None => return,
        };

        match prev {
            Some(prev) => {
                if let Some(prev) = self.batches.get_mut(prev) {
                    prev.next = next;
                }
            }
            None => {
                if let Some(entry) = self.shapes.get_mut(key) {
                    entry.head = next;
                }
            }
        }
        if let Some(next) = next.and_then(|next| self.batches.get_mut(next)) {
            next.prev = prev;
        }
    }

    fn link_at_head(&mut self, key: ShapeKey, id: u32) {
        let head = match self.shapes.get_mut(key) {
            Some(entry) => entry.head.replace(id),
            None => return,
        };

        if let Some(batch) = self.batches.get_mut(id) {
            batch.prev = None;
            batch.next = head;
        }
        if let Some(head) = head.and_then(|head| self.batches.get_mut(head)) {
            head.prev = Some(id);
        }
    }

    fn move_to_front(&mut self, key: ShapeKey, id: u32) {
        let is_head = self
            .shapes
            .get(key)
            .map(|entry| entry.head == Some(id))
            .unwrap_or(false);
        if !is_head {
            self.unlink(key, id);
            self.link_at_head(key, id);
        }
    }

    fn write_metadata(
        &mut self,
        batch_id: u32,
        shape: &ArchetypeShape,
        metadata: HeapBlock,
        instance_offset: u32,
        chunk_instance_counts: &[u32],
    ) {
        let (slab_begin, capacity) = match self.batches.get(batch_id) {
            Some(batch) => (batch.slab.begin(), batch.capacity),
            None => return,
        };
        let stream_offsets = shape.stream_offsets(capacity);

        if self.metadata.len() < metadata.end() as usize {
            self.metadata.resize(metadata.end() as usize, MetadataUnit::default());
        }

        let mut unit = metadata.begin() as usize;
        let mut chunk_offset = instance_offset as u64;
        for chunk_count in chunk_instance_counts {
            for (attribute, stream_offset) in shape.attributes().iter().zip(&stream_offsets) {
                let chunk_bytes = chunk_offset * attribute.size_gpu as u64;
                self.metadata[unit] = MetadataUnit {
                    attribute_id: attribute.id,
                    size_cpu: attribute.size_cpu,
                    size_gpu: attribute.size_gpu,
                    gpu_offset: slab_begin + stream_offset + chunk_bytes,
                };
                unit += 1;
            }
            chunk_offset += *chunk_count as u64;
        }
    }
}
