use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use instance_alloc::{
    AllocationStrategy, AllocatorError, CopyRegion, GpuBuffer, HostBuffer, UploadCoalescer,
    UploadCoalescerDescriptor, UploadRequest, ELEMENT_SIZE,
};

pub mod fixture;

fn region(source: u64, destination: u64, size: u64) -> CopyRegion {
    CopyRegion {
        source_offset: source * ELEMENT_SIZE,
        destination_offset: destination * ELEMENT_SIZE,
        size: size * ELEMENT_SIZE,
    }
}

fn always_merge(merge_distance: u32) -> UploadCoalescerDescriptor {
    UploadCoalescerDescriptor {
        merge_distance,
        batch_threshold: 0,
        ..Default::default()
    }
}

#[test]
fn upload_merges_mirror_copies_across_small_gaps() {
    fixture::initialize_logging();

    let mut uploads = UploadCoalescer::new(&always_merge(2), None).unwrap();
    uploads.queue_upload(10, 10, 2).unwrap();
    uploads.queue_upload(0, 0, 4).unwrap();
    uploads.queue_upload(4, 4, 4).unwrap();

    let mirror: Vec<u8> = (0..16 * ELEMENT_SIZE).map(|i| i as u8).collect();
    let mut device = HostBuffer::new(16 * ELEMENT_SIZE);

    assert_eq!(uploads.execute(&mirror, &mut device).unwrap(), 1);
    assert_eq!(device.copy_regions(), &[region(0, 0, 12)]);
    assert_eq!(&device.data()[..192], &mirror[..192]);
    assert!(device.data()[192..].iter().all(|byte| *byte == 0));

    let statistics = uploads.statistics();
    assert_eq!(statistics.requests, 3);
    assert_eq!(statistics.copies, 1);
    assert_eq!(statistics.bytes, 192);
    assert!(uploads.pending().is_empty());
}

#[test]
fn upload_keeps_large_gaps() {
    let mut uploads = UploadCoalescer::new(&always_merge(2), None).unwrap();
    uploads.queue_upload(0, 0, 4).unwrap();
    uploads.queue_upload(8, 8, 2).unwrap();

    let mirror = vec![1; 16 * ELEMENT_SIZE as usize];
    let mut device = HostBuffer::new(16 * ELEMENT_SIZE);

    assert_eq!(uploads.execute(&mirror, &mut device).unwrap(), 2);
    assert_eq!(device.copy_regions(), &[region(0, 0, 4), region(8, 8, 2)]);
}

#[test]
fn upload_below_threshold_copies_every_request() {
    let mut uploads = UploadCoalescer::new(&UploadCoalescerDescriptor::default(), None).unwrap();
    uploads.queue_upload(4, 4, 4).unwrap();
    uploads.queue_upload(0, 0, 4).unwrap();

    let mirror = vec![1; 8 * ELEMENT_SIZE as usize];
    let mut device = HostBuffer::new(8 * ELEMENT_SIZE);

    assert_eq!(uploads.execute(&mirror, &mut device).unwrap(), 2);
    assert_eq!(device.copy_regions(), &[region(0, 0, 4), region(4, 4, 4)]);
}

#[test]
fn upload_never_crosses_a_window() {
    fixture::initialize_logging();

    let mut uploads = UploadCoalescer::new(&always_merge(64), Some(1024)).unwrap();
    uploads.queue_upload(900, 900, 300).unwrap();
    assert_eq!(
        uploads.pending(),
        vec![
            UploadRequest::new(900, 900, 124),
            UploadRequest::new(1024, 1024, 176)
        ]
    );

    let size = 2048 * ELEMENT_SIZE;
    let mirror = vec![7; size as usize];
    let mut device = HostBuffer::new(size);

    assert_eq!(uploads.execute(&mirror, &mut device).unwrap(), 2);
    assert_eq!(
        device.copy_regions(),
        &[region(900, 900, 124), region(1024, 1024, 176)]
    );
}

#[test]
fn upload_with_different_sources_is_copied_in_destination_order() {
    let mut uploads = UploadCoalescer::new(&always_merge(64), None).unwrap();
    uploads.queue_upload(200, 2, 4).unwrap();
    uploads.queue_upload(100, 0, 4).unwrap();
    uploads.queue_upload(104, 4, 4).unwrap();

    let mirror = vec![3; 256 * ELEMENT_SIZE as usize];
    let mut device = HostBuffer::new(16 * ELEMENT_SIZE);

    assert_eq!(uploads.execute(&mirror, &mut device).unwrap(), 3);
    assert_eq!(
        device.copy_regions(),
        &[region(100, 0, 4), region(200, 2, 4), region(104, 4, 4)]
    );
}

#[test]
fn upload_result_matches_individual_copies() {
    fixture::initialize_logging();

    let mut rng = StdRng::seed_from_u64(3);
    let elements = 4096u32;
    let window = 256u32;
    let bytes = elements as u64 * ELEMENT_SIZE;

    let mut mirror: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    let mut device = HostBuffer::new(bytes);
    device
        .copy_region(&mirror, &region(0, 0, elements as u64))
        .unwrap();
    device.clear_copy_log();
    let mut reference = device.clone();

    let mut uploads =
        UploadCoalescer::new(&UploadCoalescerDescriptor::default(), Some(window)).unwrap();
    for _ in 0..200 {
        let offset = rng.gen_range(0..elements - 64);
        let size = rng.gen_range(1..64u32);
        let begin = offset as usize * ELEMENT_SIZE as usize;
        let end = (offset + size) as usize * ELEMENT_SIZE as usize;
        for byte in &mut mirror[begin..end] {
            *byte = rng.gen();
        }
        uploads.queue_upload(offset, offset, size).unwrap();
    }

    let requests = uploads.pending();
    for request in &requests {
        reference
            .copy_region(
                &mirror,
                &region(
                    request.source_offset as u64,
                    request.destination_offset as u64,
                    request.size as u64,
                ),
            )
            .unwrap();
    }

    let copies = uploads.execute(&mirror, &mut device).unwrap();
    assert!(copies < requests.len());
    assert_eq!(device.data(), reference.data());
    assert_eq!(device.data(), &mirror[..]);

    let window_bytes = window as u64 * ELEMENT_SIZE;
    for copy in device.copy_regions() {
        assert_eq!(
            copy.destination_offset / window_bytes,
            (copy.destination_offset + copy.size - 1) / window_bytes
        );
    }
}

#[test]
fn upload_writer_reports_a_full_queue() {
    let descriptor = UploadCoalescerDescriptor {
        initial_capacity: 3,
        ..Default::default()
    };
    let mut uploads = UploadCoalescer::new(&descriptor, Some(64)).unwrap();
    assert_eq!(uploads.capacity(), 3);

    let writer = uploads.writer();
    writer.queue_upload(0, 0, 4).unwrap();
    writer.queue_upload(8, 8, 4).unwrap();
    // Spans two windows and needs two slots, only one is left.
    assert_eq!(
        writer.queue_upload(60, 60, 8),
        Err(AllocatorError::QueueFull)
    );
    assert_eq!(uploads.pending().len(), 2);

    let mirror = vec![1; 128 * ELEMENT_SIZE as usize];
    let mut device = HostBuffer::new(128 * ELEMENT_SIZE);
    uploads.execute(&mirror, &mut device).unwrap();
    assert_eq!(uploads.statistics().requests, 2);

    // The queue grows through the owning coalescer.
    uploads.reserve(16);
    uploads.queue_upload(60, 60, 8).unwrap();
    assert_eq!(uploads.pending().len(), 2);
}

#[test]
fn upload_queue_grows_after_writers_ran_out_of_room() {
    fixture::initialize_logging();

    let descriptor = UploadCoalescerDescriptor {
        initial_capacity: 4,
        batch_threshold: 0,
        ..Default::default()
    };
    let mut uploads = UploadCoalescer::new(&descriptor, None).unwrap();

    let writer = uploads.writer();
    let rejected = (0..40)
        .filter(|i| writer.queue_upload(*i, *i, 1) == Err(AllocatorError::QueueFull))
        .count();
    assert_eq!(rejected, 36);
    assert_eq!(uploads.pending().len(), 4);

    uploads.queue_upload(100, 100, 1).unwrap();
    assert_eq!(uploads.pending().len(), 5);
    assert!(uploads.capacity() >= 5);

    let mirror = vec![5; 128 * ELEMENT_SIZE as usize];
    let mut device = HostBuffer::new(128 * ELEMENT_SIZE);
    assert_eq!(uploads.execute(&mirror, &mut device).unwrap(), 2);
    assert_eq!(
        device.copy_regions(),
        &[region(0, 0, 4), region(100, 100, 1)]
    );
    assert!(uploads.pending().is_empty());
}

#[test]
fn upload_rejects_requests_past_the_addressable_range() {
    let mut uploads = UploadCoalescer::new(&always_merge(2), Some(64)).unwrap();

    assert_eq!(
        uploads.queue_upload(u32::MAX - 2, 0, 4),
        Err(AllocatorError::InvalidSize)
    );
    assert_eq!(
        uploads.queue_upload(0, u32::MAX, 1),
        Err(AllocatorError::InvalidSize)
    );
    assert_eq!(
        uploads.writer().queue_upload(0, u32::MAX - 1, 2),
        Err(AllocatorError::InvalidSize)
    );
    assert!(uploads.pending().is_empty());

    // The last addressable element is still accepted.
    uploads.queue_upload(u32::MAX - 1, u32::MAX - 1, 1).unwrap();
    assert_eq!(
        uploads.pending(),
        vec![UploadRequest::new(u32::MAX - 1, u32::MAX - 1, 1)]
    );
}

#[test]
fn instance_buffer_uploads_written_instances() {
    fixture::initialize_logging();

    let mut buffer = fixture::host_instance_buffer(
        fixture::small_windows(AllocationStrategy::Multiplexed),
        UploadCoalescerDescriptor::default(),
    );
    assert_eq!(buffer.device().size(), 4096);

    let shape = fixture::transform_shape();
    let space = buffer.allocate_batch_space(&shape, 4).unwrap();

    let units = buffer.metadata(space.metadata.clone()).to_vec();
    for unit in &units {
        let bytes = vec![unit.attribute_id as u8 + 1; unit.size_gpu as usize * 4];
        buffer.write(unit.gpu_offset, &bytes).unwrap();
    }
    assert_eq!(buffer.write(8, &[1; 16]), Err(AllocatorError::InvalidAlignment));

    assert_eq!(buffer.execute_uploads().unwrap(), 2);
    assert!(buffer.device().data()[..256].iter().all(|byte| *byte == 1));
    assert!(buffer.device().data()[768..832].iter().all(|byte| *byte == 2));
    assert_eq!(buffer.device().data(), buffer.mirror().as_bytes());

    let statistics = buffer.statistics();
    assert_eq!(statistics.batch_count, 1);
    assert_eq!(statistics.sub_batch_count, 1);
    assert_eq!(statistics.metadata_units, 2);
    assert_eq!(statistics.last_upload.copies, 2);
}

#[test]
fn instance_buffer_grows_the_device_buffer() {
    fixture::initialize_logging();

    let mut buffer = fixture::host_instance_buffer(
        fixture::small_windows(AllocationStrategy::Multiplexed),
        UploadCoalescerDescriptor::default(),
    );
    let shape = fixture::transform_shape();

    let first = buffer.allocate_batch_space(&shape, 12).unwrap();
    let offset = buffer.metadata(first.metadata.clone())[0].gpu_offset;
    buffer.write(offset, &[9; 64]).unwrap();
    buffer.execute_uploads().unwrap();

    let mut spaces = vec![first];
    for _ in 0..4 {
        spaces.push(buffer.allocate_batch_space(&shape, 12).unwrap());
    }
    assert_eq!(buffer.device().size(), 8192);
    assert_eq!(buffer.mirror().size(), 8192);
    assert_eq!(buffer.device().data(), buffer.mirror().as_bytes());
    assert_eq!(&buffer.device().data()[..64], &[9; 64][..]);

    buffer.mark_referenced(spaces[2].sub_batch);
    assert_eq!(buffer.run_garbage_collection(), 4);
    assert_eq!(buffer.statistics().batch_count, 1);

    buffer.release_sub_batch(spaces[2].sub_batch).unwrap();
    let statistics = buffer.statistics();
    assert_eq!(statistics.batch_count, 0);
    assert_eq!(statistics.buffer_size, 8192);
    assert_eq!(statistics.free_bytes, 8192);
}

#[test]
fn instance_writer_fills_the_mirror_from_many_threads() {
    fixture::initialize_logging();

    let mut buffer = fixture::host_instance_buffer(
        fixture::small_windows(AllocationStrategy::Multiplexed),
        UploadCoalescerDescriptor::default(),
    );
    let shape = fixture::small_shape();
    let space = buffer.allocate_batch_space(&shape, 60).unwrap();
    let base = buffer.metadata(space.metadata.clone())[0].gpu_offset;

    buffer.reserve_uploads(64);
    {
        let writer = buffer.upload_writer();
        std::thread::scope(|scope| {
            for thread in 0..4u64 {
                let writer = &writer;
                scope.spawn(move || {
                    for instance in 0..15u64 {
                        let index = thread * 15 + instance;
                        let data = [index as u8 + 1; 16];
                        // SAFETY: Every instance is written by exactly one thread.
                        unsafe { writer.write(base + index * 16, &data) }.unwrap();
                    }
                });
            }
        });
    }

    assert_eq!(buffer.execute_uploads().unwrap(), 1);
    let statistics = buffer.statistics().last_upload;
    assert_eq!(statistics.requests, 60);
    assert_eq!(statistics.bytes, 60 * 16);

    let data = &buffer.device().data()[base as usize..base as usize + 60 * 16];
    for (index, instance) in data.chunks(16).enumerate() {
        assert!(instance.iter().all(|byte| *byte == index as u8 + 1));
    }
}
