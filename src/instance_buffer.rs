//! The instance buffer: batches, the system memory mirror and the upload queue in one place.

use std::marker::PhantomData;
use std::ops::Range;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::buffer::checked_range;
use crate::is_aligned;
use crate::{
    AllocatorError, ArchetypeShape, BatchId, BatchLayout, BatchSpace, BatchTable,
    BatchTableDescriptor, CopyRegion, GpuBuffer, MetadataUnit, Result, SubBatchId, SubBatchInfo,
    SystemBuffer, UploadCoalescer, UploadCoalescerDescriptor, UploadStatistics, UploadWriter,
    ELEMENT_SIZE,
};

/// Describes the configuration of an `InstanceBuffer`.
#[derive(Debug, Clone, Default)]
pub struct InstanceBufferDescriptor {
    /// Configuration of the batches.
    pub batches: BatchTableDescriptor,
    /// Configuration of the upload queue.
    pub uploads: UploadCoalescerDescriptor,
}

/// Statistic of an `InstanceBuffer`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstanceBufferStatistics {
    /// Size of the buffer in bytes.
    pub buffer_size: u64,
    /// Bytes owned by slabs.
    pub used_bytes: u64,
    /// Bytes not owned by any slab.
    pub free_bytes: u64,
    /// Number of live batches.
    pub batch_count: usize,
    /// Number of live sub-batches.
    pub sub_batch_count: usize,
    /// Metadata units in use.
    pub metadata_units: u32,
    /// Fragmentation of the slab allocator.
    pub slab_fragmentation: f32,
    /// Fragmentation of the metadata allocator.
    pub metadata_fragmentation: f32,
    /// Statistic of the last upload.
    pub last_upload: UploadStatistics,
}

/// A GPU buffer of per-instance data with a system memory mirror.
///
/// Instance data is written into the mirror and queued for upload. `execute_uploads` copies
/// the queued ranges from the mirror into the GPU buffer with as few copies as possible.
/// The buffer grows together with the batches it holds.
pub struct InstanceBuffer<B: GpuBuffer> {
    device: B,
    mirror: SystemBuffer,
    batches: BatchTable,
    uploads: UploadCoalescer,
}

impl<B: GpuBuffer> InstanceBuffer<B> {
    /// Creates a new instance buffer on top of `device`. The device buffer is resized to the
    /// initial size of the batch table.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn new(mut device: B, descriptor: &InstanceBufferDescriptor) -> Result<Self> {
        let batches = BatchTable::new(&descriptor.batches)?;
        let window = if batches.is_windowed() {
            Some((batches.window_bytes() / ELEMENT_SIZE) as u32)
        } else {
            None
        };
        let uploads = UploadCoalescer::new(&descriptor.uploads, window)?;

        let size = batches.buffer_size();
        if device.size() != size {
            device.resize(size)?;
        }

        #[cfg(feature = "tracing")]
        debug!("Created instance buffer of {} bytes", size);

        Ok(Self {
            device,
            mirror: SystemBuffer::new(size),
            batches,
            uploads,
        })
    }

    /// Reserves room for `instance_count` instances of `shape` in one chunk.
    pub fn allocate_batch_space(
        &mut self,
        shape: &ArchetypeShape,
        instance_count: u32,
    ) -> Result<BatchSpace> {
        self.allocate_chunked(shape, &[instance_count])
    }

    /// Reserves room for a group of instances split into chunks. Grows the mirror and the
    /// device buffer if the batches needed more room.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn allocate_chunked(
        &mut self,
        shape: &ArchetypeShape,
        chunk_instance_counts: &[u32],
    ) -> Result<BatchSpace> {
        let space = self.batches.allocate(shape, chunk_instance_counts)?;

        if let Err(err) = self.sync_buffer_size() {
            #[cfg(feature = "tracing")]
            warn!("Can't grow the device buffer: {}", err);

            self.batches.remove_sub_batch(space.sub_batch)?;
            return Err(err);
        }

        Ok(space)
    }

    /// Removes a sub-batch right away.
    pub fn release_sub_batch(&mut self, id: SubBatchId) -> Result<()> {
        self.batches.remove_sub_batch(id)
    }

    /// Marks a sub-batch as alive for the next garbage collection.
    pub fn mark_referenced(&mut self, id: SubBatchId) {
        self.batches.mark_referenced(id);
    }

    /// Removes every sub-batch that wasn't marked since the last collection. Returns the
    /// number of removed sub-batches.
    pub fn run_garbage_collection(&mut self) -> usize {
        self.batches.collect_garbage()
    }

    /// Queues a copy of `size` elements from the mirror into the device buffer.
    pub fn queue_upload(
        &mut self,
        source_offset: u32,
        destination_offset: u32,
        size: u32,
    ) -> Result<()> {
        self.uploads.queue_upload(source_offset, destination_offset, size)
    }

    /// Writes `data` into the mirror at `destination_offset` bytes and queues its upload.
    /// The offset needs to be aligned to an element.
    pub fn write(&mut self, destination_offset: u64, data: &[u8]) -> Result<()> {
        let (offset, size) = element_range(destination_offset, data.len() as u64)?;
        self.mirror.write(destination_offset, data)?;
        self.uploads.queue_upload(offset, offset, size)
    }

    /// A writer for filling the mirror from many threads at once.
    ///
    /// The number of uploads the writer can queue is limited by the queue capacity, see
    /// [`reserve_uploads`](Self::reserve_uploads).
    pub fn upload_writer(&mut self) -> InstanceWriter<'_> {
        InstanceWriter {
            mirror: self.mirror.as_mut_ptr(),
            mirror_len: self.mirror.size(),
            uploads: self.uploads.writer(),
            _mirror: PhantomData,
        }
    }

    /// Grows the upload queue to hold at least `capacity` requests.
    pub fn reserve_uploads(&mut self, capacity: usize) {
        self.uploads.reserve(capacity);
    }

    /// Copies every queued range from the mirror into the device buffer. Returns the number
    /// of issued copies.
    pub fn execute_uploads(&mut self) -> Result<usize> {
        self.uploads
            .execute(self.mirror.as_bytes(), &mut self.device)
    }

    /// Gives an attribute a name used in log output.
    pub fn set_attribute_name(&mut self, attribute_id: u32, name: &str) {
        self.batches.set_attribute_name(attribute_id, name);
    }

    /// Statistic of the buffer.
    pub fn statistics(&self) -> InstanceBufferStatistics {
        InstanceBufferStatistics {
            buffer_size: self.batches.buffer_size(),
            used_bytes: self.batches.used_bytes(),
            free_bytes: self.batches.free_bytes(),
            batch_count: self.batches.batch_count(),
            sub_batch_count: self.batches.sub_batch_count(),
            metadata_units: self.batches.metadata_units_in_use(),
            slab_fragmentation: self.batches.slab_fragmentation(),
            metadata_fragmentation: self.batches.metadata_fragmentation(),
            last_upload: self.uploads.statistics(),
        }
    }

    /// The binding information of a batch.
    pub fn batch_layout(&self, id: BatchId) -> Option<BatchLayout> {
        self.batches.batch_layout(id)
    }

    /// A live sub-batch.
    pub fn sub_batch(&self, id: SubBatchId) -> Option<SubBatchInfo> {
        self.batches.sub_batch(id)
    }

    /// Metadata units of a range returned by an allocation.
    pub fn metadata(&self, range: Range<u32>) -> &[MetadataUnit] {
        self.batches.metadata(range)
    }

    /// The batch table.
    pub fn batches(&self) -> &BatchTable {
        &self.batches
    }

    /// The device buffer.
    pub fn device(&self) -> &B {
        &self.device
    }

    /// The system memory mirror.
    pub fn mirror(&self) -> &SystemBuffer {
        &self.mirror
    }

    fn sync_buffer_size(&mut self) -> Result<()> {
        let new_size = self.batches.buffer_size();
        let old_size = self.mirror.size();
        if new_size <= old_size {
            return Ok(());
        }

        self.device.resize(new_size)?;
        self.mirror.grow(new_size);

        // The device content is undefined after a resize.
        self.device.copy_region(
            self.mirror.as_bytes(),
            &CopyRegion {
                source_offset: 0,
                destination_offset: 0,
                size: new_size,
            },
        )?;

        #[cfg(feature = "tracing")]
        debug!(
            "Resized the instance buffer from {} to {} bytes",
            old_size,
            new_size
        );

        Ok(())
    }
}

/// Writes into the mirror of an `InstanceBuffer` from many threads and queues the uploads.
pub struct InstanceWriter<'a> {
    mirror: *mut u8,
    mirror_len: u64,
    uploads: UploadWriter<'a>,
    _mirror: PhantomData<&'a mut [u8]>,
}

// SAFETY: The mirror is only written through `InstanceWriter::write`, whose contract requires
// concurrent calls to target disjoint ranges. The upload queue only uses atomics.
unsafe impl Send for InstanceWriter<'_> {}
unsafe impl Sync for InstanceWriter<'_> {}

impl<'a> InstanceWriter<'a> {
    /// Copies `data` into the mirror at `destination_offset` bytes and queues its upload.
    /// The offset needs to be aligned to an element.
    ///
    /// # Safety
    ///
    /// Calls running at the same time must write disjoint byte ranges.
    pub unsafe fn write(&self, destination_offset: u64, data: &[u8]) -> Result<()> {
        let (offset, size) = element_range(destination_offset, data.len() as u64)?;
        let range = checked_range(destination_offset, data.len() as u64, self.mirror_len as usize)?;

        std::ptr::copy_nonoverlapping(data.as_ptr(), self.mirror.add(range.start), data.len());

        self.uploads.queue_upload(offset, offset, size)
    }

    /// Queues a copy of `size` elements from the mirror into the device buffer.
    pub fn queue_upload(
        &self,
        source_offset: u32,
        destination_offset: u32,
        size: u32,
    ) -> Result<()> {
        self.uploads.queue_upload(source_offset, destination_offset, size)
    }
}

/// Converts a byte range into the element range covering it.
fn element_range(offset: u64, size: u64) -> Result<(u32, u32)> {
    if !is_aligned(offset, ELEMENT_SIZE) {
        return Err(AllocatorError::InvalidAlignment);
    }

    let begin = offset / ELEMENT_SIZE;
    let count = (size + ELEMENT_SIZE - 1) / ELEMENT_SIZE;
    if begin + count > u32::MAX as u64 {
        return Err(AllocatorError::InvalidSize);
    }

    Ok((begin as u32, count as u32))
}
