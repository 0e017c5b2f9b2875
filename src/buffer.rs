//! Backing buffers of the instance data.

use crate::{AllocatorError, Result};

/// A buffer-to-buffer copy in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyRegion {
    /// Byte offset into the source.
    pub source_offset: u64,
    /// Byte offset into the target buffer.
    pub destination_offset: u64,
    /// Number of bytes to copy.
    pub size: u64,
}

/// The buffer the instance data is uploaded to, usually a GPU buffer.
pub trait GpuBuffer {
    /// The size of the buffer in bytes.
    fn size(&self) -> u64;

    /// Resizes the buffer. The content of the buffer is undefined afterwards.
    fn resize(&mut self, new_size: u64) -> Result<()>;

    /// Copies `region.size` bytes of `source` starting at `region.source_offset` into the
    /// buffer at `region.destination_offset`.
    fn copy_region(&mut self, source: &[u8], region: &CopyRegion) -> Result<()>;
}

/// A `GpuBuffer` living in host memory. It records every copy it executed.
#[derive(Debug, Default, Clone)]
pub struct HostBuffer {
    data: Vec<u8>,
    copies: Vec<CopyRegion>,
}

impl HostBuffer {
    /// Creates a zeroed buffer of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0; size as usize],
            copies: Vec::new(),
        }
    }

    /// The content of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// All copies executed since the last `clear_copy_log`.
    pub fn copy_regions(&self) -> &[CopyRegion] {
        &self.copies
    }

    /// Number of copies executed since the last `clear_copy_log`.
    pub fn copy_count(&self) -> usize {
        self.copies.len()
    }

    /// Forgets the recorded copies.
    pub fn clear_copy_log(&mut self) {
        self.copies.clear();
    }
}

impl GpuBuffer for HostBuffer {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.data.resize(new_size as usize, 0);
        Ok(())
    }

    fn copy_region(&mut self, source: &[u8], region: &CopyRegion) -> Result<()> {
        let src = checked_range(region.source_offset, region.size, source.len())?;
        let dst = checked_range(region.destination_offset, region.size, self.data.len())?;

        self.data[dst].copy_from_slice(&source[src]);
        self.copies.push(*region);

        Ok(())
    }
}

/// The system memory mirror of the instance buffer. Uploads are copied out of it.
#[derive(Debug, Default, Clone)]
pub struct SystemBuffer {
    data: Vec<u8>,
}

impl SystemBuffer {
    /// Creates a zeroed mirror of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self {
            data: vec![0; size as usize],
        }
    }

    /// The size of the mirror in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Grows the mirror. New bytes are zero, existing bytes are kept.
    pub fn grow(&mut self, new_size: u64) {
        if new_size as usize > self.data.len() {
            self.data.resize(new_size as usize, 0);
        }
    }

    /// Copies `bytes` into the mirror at `offset`.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let range = checked_range(offset, bytes.len() as u64, self.data.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// The content of the mirror.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

pub(crate) fn checked_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(size) {
        Some(end) if end <= len as u64 => Ok(offset as usize..end as usize),
        _ => Err(AllocatorError::Internal(format!(
            "range [{}, {}) is out of bounds of a buffer of {} bytes",
            offset,
            offset.saturating_add(size),
            len
        ))),
    }
}
