#![allow(dead_code)]

use instance_alloc::{
    ArchetypeShape, AttributeDescriptor, BatchTableDescriptor, HostBuffer, InstanceBuffer,
    InstanceBufferDescriptor, UploadCoalescerDescriptor,
};

#[cfg(feature = "tracing")]
pub fn initialize_logging() {
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;

        let filter =
            EnvFilter::from_default_env().add_directive("instance_alloc=WARN".parse().unwrap());
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

#[cfg(not(feature = "tracing"))]
pub fn initialize_logging() {}

/// A shape with one attribute per entry. Ids are the entry index, GPU and CPU sizes are equal.
pub fn shape(sizes: &[u16]) -> ArchetypeShape {
    let attributes: Vec<AttributeDescriptor> = sizes
        .iter()
        .enumerate()
        .map(|(id, size)| AttributeDescriptor::new(id as u32, *size, *size))
        .collect();
    ArchetypeShape::new(&attributes).unwrap()
}

/// A local-to-world matrix and a color.
pub fn transform_shape() -> ArchetypeShape {
    shape(&[64, 16])
}

/// A shape with a single 16 byte attribute.
pub fn small_shape() -> ArchetypeShape {
    shape(&[16])
}

/// Batch configuration with small windows, so tests run into limits quickly.
pub fn small_windows(strategy: instance_alloc::AllocationStrategy) -> BatchTableDescriptor {
    BatchTableDescriptor {
        strategy,
        windowed: true,
        window_size: 10,
        initial_buffer_size: 12,
        max_buffer_size: 1 << 14,
        ..Default::default()
    }
}

pub fn host_instance_buffer(
    batches: BatchTableDescriptor,
    uploads: UploadCoalescerDescriptor,
) -> InstanceBuffer<HostBuffer> {
    let descriptor = InstanceBufferDescriptor { batches, uploads };
    InstanceBuffer::new(HostBuffer::new(0), &descriptor).unwrap()
}

/// Asserts that ranges are sorted, disjoint and non-adjacent.
pub fn assert_separated(ranges: &[(u64, u64)]) {
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 < pair[1].0,
            "ranges {:?} and {:?} touch or overlap",
            pair[0],
            pair[1]
        );
    }
}
