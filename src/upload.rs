//! Coalescing of uploads into the instance buffer.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[cfg(feature = "tracing")]
use tracing::{trace, warn};

use crate::{AllocatorError, CopyRegion, GpuBuffer, Result, ELEMENT_SIZE};

/// Describes the configuration of an `UploadCoalescer`.
#[derive(Debug, Clone)]
pub struct UploadCoalescerDescriptor {
    /// Requests of mirror copies separated by at most this many elements are merged into one
    /// copy. Defaults to 64.
    pub merge_distance: u32,
    /// Below this number of requests every request is copied on its own. Defaults to 8.
    pub batch_threshold: usize,
    /// Number of requests the queue can hold before it needs to grow. Defaults to 128.
    pub initial_capacity: usize,
}

impl Default for UploadCoalescerDescriptor {
    fn default() -> Self {
        Self {
            merge_distance: 64,
            batch_threshold: 8,
            initial_capacity: 128,
        }
    }
}

/// A copy of `size` elements from `source_offset` to `destination_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadRequest {
    /// Offset into the source in elements.
    pub source_offset: u32,
    /// Offset into the target buffer in elements.
    pub destination_offset: u32,
    /// Number of elements.
    pub size: u32,
}

impl UploadRequest {
    /// Creates a new request.
    pub fn new(source_offset: u32, destination_offset: u32, size: u32) -> Self {
        Self {
            source_offset,
            destination_offset,
            size,
        }
    }

    /// Creates a new request whose source and destination ends fit into `u32`.
    pub fn checked(source_offset: u32, destination_offset: u32, size: u32) -> Result<Self> {
        if source_offset.checked_add(size).is_none()
            || destination_offset.checked_add(size).is_none()
        {
            return Err(AllocatorError::InvalidSize);
        }
        Ok(Self::new(source_offset, destination_offset, size))
    }

    /// One past the last destination element.
    pub fn destination_end(&self) -> u32 {
        self.destination_offset + self.size
    }

    /// True if source and destination offsets are the same, as for copies out of a mirror.
    pub fn is_mirror_copy(&self) -> bool {
        self.source_offset == self.destination_offset
    }

    fn delta(&self) -> i64 {
        self.destination_offset as i64 - self.source_offset as i64
    }

    fn to_copy_region(self) -> CopyRegion {
        CopyRegion {
            source_offset: self.source_offset as u64 * ELEMENT_SIZE,
            destination_offset: self.destination_offset as u64 * ELEMENT_SIZE,
            size: self.size as u64 * ELEMENT_SIZE,
        }
    }
}

/// Statistic of the last `execute`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStatistics {
    /// Requests that were queued.
    pub requests: usize,
    /// Copies that were issued.
    pub copies: usize,
    /// Bytes that were copied, including merged gaps.
    pub bytes: u64,
}

/// Request storage that can be appended to from many threads without reallocation.
struct PendingQueue {
    slots: Vec<[AtomicU32; 3]>,
    len: AtomicUsize,
}

impl PendingQueue {
    fn with_capacity(capacity: usize) -> Self {
        let mut queue = Self {
            slots: Vec::new(),
            len: AtomicUsize::new(0),
        };
        queue.reserve(capacity);
        queue
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn reserve(&mut self, capacity: usize) {
        while self.slots.len() < capacity {
            self.slots.push([AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)]);
        }
    }

    fn push(&mut self, request: UploadRequest) {
        let len = *self.len.get_mut();
        if len >= self.slots.len() {
            let capacity = (self.slots.len() * 2).max(len + 1).max(16);
            self.reserve(capacity);
        }
        let len = self.len.get_mut();
        let slot = &mut self.slots[*len];
        *slot[0].get_mut() = request.source_offset;
        *slot[1].get_mut() = request.destination_offset;
        *slot[2].get_mut() = request.size;
        *len += 1;
    }

    fn push_no_resize(&self, requests: &[UploadRequest]) -> Result<()> {
        let capacity = self.slots.len();
        // The length never moves past the capacity, a failed append reserves nothing.
        let start = self
            .len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |len| {
                let end = len + requests.len();
                if end <= capacity {
                    Some(end)
                } else {
                    None
                }
            })
            .map_err(|_| AllocatorError::QueueFull)?;
        let end = start + requests.len();

        for (slot, request) in self.slots[start..end].iter().zip(requests) {
            slot[0].store(request.source_offset, Ordering::Relaxed);
            slot[1].store(request.destination_offset, Ordering::Relaxed);
            slot[2].store(request.size, Ordering::Relaxed);
        }

        Ok(())
    }

    fn drain(&mut self) -> Vec<UploadRequest> {
        let len = *self.len.get_mut();
        *self.len.get_mut() = 0;

        self.slots[..len]
            .iter_mut()
            .map(|slot| UploadRequest {
                source_offset: *slot[0].get_mut(),
                destination_offset: *slot[1].get_mut(),
                size: *slot[2].get_mut(),
            })
            .filter(|request| request.size > 0)
            .collect()
    }

    fn snapshot(&self) -> Vec<UploadRequest> {
        let len = self.len.load(Ordering::Relaxed);
        self.slots[..len]
            .iter()
            .map(|slot| UploadRequest {
                source_offset: slot[0].load(Ordering::Relaxed),
                destination_offset: slot[1].load(Ordering::Relaxed),
                size: slot[2].load(Ordering::Relaxed),
            })
            .filter(|request| request.size > 0)
            .collect()
    }
}

/// Collects upload requests and issues them as few copies as possible.
///
/// Requests are sorted by destination. Overlapping and adjacent requests that read their
/// source at the same distance are merged. Mirror copies (source equals destination) also
/// merge across small gaps, re-copying the mirror's resident bytes in between. In windowed
/// mode no request and no merged copy crosses a window boundary.
pub struct UploadCoalescer {
    queue: PendingQueue,
    window: Option<u32>,
    merge_distance: u32,
    batch_threshold: usize,
    statistics: UploadStatistics,
}

impl UploadCoalescer {
    /// Creates a new coalescer. `window` is the size of a binding window in elements; `None`
    /// disables window splitting.
    pub fn new(descriptor: &UploadCoalescerDescriptor, window: Option<u32>) -> Result<Self> {
        if window == Some(0) {
            return Err(AllocatorError::InvalidSize);
        }

        Ok(Self {
            queue: PendingQueue::with_capacity(descriptor.initial_capacity),
            window,
            merge_distance: descriptor.merge_distance,
            batch_threshold: descriptor.batch_threshold,
            statistics: UploadStatistics::default(),
        })
    }

    /// The size of a binding window in elements.
    pub fn window(&self) -> Option<u32> {
        self.window
    }

    /// Number of requests the queue holds without growing.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Grows the queue to hold at least `capacity` requests. Needs to be called before
    /// handing out writers to producers.
    pub fn reserve(&mut self, capacity: usize) {
        self.queue.reserve(capacity);
    }

    /// The queued requests in queue order.
    pub fn pending(&self) -> Vec<UploadRequest> {
        self.queue.snapshot()
    }

    /// Queues a copy of `size` elements. Zero sized requests are ignored. Fails with
    /// `InvalidSize` if the source or destination end doesn't fit into `u32`.
    ///
    /// Requests are applied in destination order. Overlapping requests that read different
    /// sources are therefore not applied in queue order.
    pub fn queue_upload(
        &mut self,
        source_offset: u32,
        destination_offset: u32,
        size: u32,
    ) -> Result<()> {
        let request = UploadRequest::checked(source_offset, destination_offset, size)?;
        match self.window {
            Some(window) => {
                for piece in split_at_windows(request, window) {
                    self.queue.push(piece);
                }
            }
            None => {
                if size > 0 {
                    self.queue.push(request);
                }
            }
        }
        Ok(())
    }

    /// A handle to queue requests from many threads at once.
    pub fn writer(&self) -> UploadWriter<'_> {
        UploadWriter {
            queue: &self.queue,
            window: self.window,
        }
    }

    /// Copies every queued request from `source` into `target` and clears the queue, also
    /// when a copy fails. Returns the number of issued copies.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn execute<B: GpuBuffer>(&mut self, source: &[u8], target: &mut B) -> Result<usize> {
        let mut requests = self.queue.drain();
        requests.sort_by_key(|request| request.destination_offset);

        let request_count = requests.len();
        let copies = if request_count < self.batch_threshold {
            requests
        } else {
            self.merge(&requests)
        };

        self.statistics = UploadStatistics {
            requests: request_count,
            copies: 0,
            bytes: 0,
        };

        for copy in &copies {
            let region = copy.to_copy_region();
            if let Err(err) = target.copy_region(source, &region) {
                #[cfg(feature = "tracing")]
                warn!(
                    "Upload of {} bytes to {} failed: {}",
                    region.size,
                    region.destination_offset,
                    err
                );
                return Err(err);
            }
            self.statistics.copies += 1;
            self.statistics.bytes += region.size;
        }

        #[cfg(feature = "tracing")]
        trace!(
            "Executed {} upload requests as {} copies ({} bytes)",
            self.statistics.requests,
            self.statistics.copies,
            self.statistics.bytes
        );

        Ok(self.statistics.copies)
    }

    /// Statistic of the last `execute`.
    pub fn statistics(&self) -> UploadStatistics {
        self.statistics
    }

    /// Merges requests sorted by destination into copy spans.
    pub fn merge(&self, sorted: &[UploadRequest]) -> Vec<UploadRequest> {
        let mut merged = Vec::with_capacity(sorted.len());
        let mut iter = sorted.iter();
        let mut run = match iter.next() {
            Some(first) => *first,
            None => return merged,
        };

        for next in iter {
            let run_end = run.destination_end();
            let span_end = run_end.max(next.destination_end());
            let gap = next.destination_offset as i64 - run_end as i64;

            let same_window = match self.window {
                Some(window) => run.destination_offset / window == (span_end - 1) / window,
                None => true,
            };
            let same_delta = run.delta() == next.delta();
            let mergeable = gap <= 0
                || (gap <= self.merge_distance as i64
                    && run.is_mirror_copy()
                    && next.is_mirror_copy());

            if same_window && same_delta && mergeable {
                run.size = span_end - run.destination_offset;
            } else {
                merged.push(run);
                run = *next;
            }
        }
        merged.push(run);

        merged
    }
}

/// Appends requests to the queue of an `UploadCoalescer` from many threads. The queue never
/// grows through a writer.
#[derive(Clone, Copy)]
pub struct UploadWriter<'a> {
    queue: &'a PendingQueue,
    window: Option<u32>,
}

impl<'a> UploadWriter<'a> {
    /// Queues a copy of `size` elements. Fails with `QueueFull` if the reserved capacity is
    /// exhausted, in which case nothing of the request is queued.
    pub fn queue_upload(
        &self,
        source_offset: u32,
        destination_offset: u32,
        size: u32,
    ) -> Result<()> {
        let result = UploadRequest::checked(source_offset, destination_offset, size)
            .and_then(|request| self.push(request));

        if let Err(_err) = &result {
            #[cfg(feature = "tracing")]
            warn!(
                "Dropped upload of {} elements to {}: {}",
                size,
                destination_offset,
                _err
            );
        }

        result
    }

    fn push(&self, request: UploadRequest) -> Result<()> {
        match self.window {
            Some(window) => {
                let pieces: Vec<UploadRequest> = split_at_windows(request, window).collect();
                self.queue.push_no_resize(&pieces)
            }
            None if request.size > 0 => self.queue.push_no_resize(&[request]),
            None => Ok(()),
        }
    }
}

/// Splits a request into pieces that each stay inside one window. The request's ends need to
/// fit into `u32`.
fn split_at_windows(
    request: UploadRequest,
    window: u32,
) -> impl Iterator<Item = UploadRequest> {
    let mut remaining = request;
    std::iter::from_fn(move || {
        if remaining.size == 0 {
            return None;
        }
        let offset_in_window = remaining.destination_offset % window;
        let size = remaining.size.min(window - offset_in_window);
        let piece = UploadRequest::new(remaining.source_offset, remaining.destination_offset, size);

        remaining.source_offset += size;
        remaining.destination_offset += size;
        remaining.size -= size;

        Some(piece)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_the_source_distance() {
        let pieces: Vec<_> = split_at_windows(UploadRequest::new(10, 1000, 60), 1024).collect();
        assert_eq!(
            pieces,
            vec![
                UploadRequest::new(10, 1000, 24),
                UploadRequest::new(34, 1024, 36)
            ]
        );
    }

    #[test]
    fn requests_with_different_sources_do_not_merge_across_gaps() {
        let coalescer = UploadCoalescer::new(&UploadCoalescerDescriptor::default(), None).unwrap();
        let merged = coalescer.merge(&[
            UploadRequest::new(100, 0, 4),
            UploadRequest::new(104, 4, 4),
            UploadRequest::new(200, 10, 2),
        ]);
        assert_eq!(
            merged,
            vec![UploadRequest::new(100, 0, 8), UploadRequest::new(200, 10, 2)]
        );
    }
}
