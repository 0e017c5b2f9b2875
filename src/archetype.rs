//! Attribute layouts of batches.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::{align_up, AllocatorError, Result, ELEMENT_SIZE};

/// One per-instance attribute of an archetype shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeDescriptor {
    /// Identifier of the attribute, for example the shader property it feeds.
    pub id: u32,
    /// Size of one value in system memory.
    pub size_cpu: u16,
    /// Size of one value in the GPU buffer.
    pub size_gpu: u16,
}

impl AttributeDescriptor {
    /// Creates a new descriptor.
    pub fn new(id: u32, size_cpu: u16, size_gpu: u16) -> Self {
        Self {
            id,
            size_cpu,
            size_gpu,
        }
    }
}

/// The ordered set of attributes shared by all instances of a batch.
///
/// A slab of a shape stores one stream per attribute. Stream `i` holds `size_gpu` bytes per
/// instance and starts on a 16 byte boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchetypeShape {
    attributes: Vec<AttributeDescriptor>,
}

impl ArchetypeShape {
    /// Creates a shape. Attributes are sorted by id; duplicate ids are rejected.
    pub fn new(attributes: &[AttributeDescriptor]) -> Result<Self> {
        if attributes.is_empty() {
            return Err(AllocatorError::InvalidSize);
        }

        let mut attributes = attributes.to_vec();
        attributes.sort_by_key(|attribute| attribute.id);
        if attributes.windows(2).any(|pair| pair[0].id == pair[1].id) {
            return Err(AllocatorError::Internal(
                "archetype shape has duplicate attribute ids".to_owned(),
            ));
        }

        Ok(Self { attributes })
    }

    /// The attributes ordered by id.
    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Number of attributes.
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// GPU bytes of one instance over all streams.
    pub fn bytes_per_instance(&self) -> u64 {
        self.attributes
            .iter()
            .map(|attribute| attribute.size_gpu as u64)
            .sum()
    }

    /// Number of instances whose streams fit into one binding window of `window_bytes`.
    pub fn max_instances_per_window(&self, window_bytes: u64) -> u32 {
        let padding = ELEMENT_SIZE * self.attributes.len() as u64;
        let available = window_bytes.saturating_sub(padding);
        (available / self.bytes_per_instance().max(1)).min(u32::MAX as u64) as u32
    }

    /// Byte size of every stream for `instance_capacity` instances.
    pub fn stream_sizes(&self, instance_capacity: u32) -> impl Iterator<Item = u64> + '_ {
        self.attributes.iter().map(move |attribute| {
            align_up(
                attribute.size_gpu as u64 * instance_capacity as u64,
                ELEMENT_SIZE,
            )
        })
    }

    /// Offset of every stream relative to the slab begin.
    pub fn stream_offsets(&self, instance_capacity: u32) -> Vec<u64> {
        self.stream_sizes(instance_capacity)
            .scan(0, |offset, size| {
                let begin = *offset;
                *offset += size;
                Some(begin)
            })
            .collect()
    }

    /// Bytes of a slab holding `instance_capacity` instances.
    pub fn slab_bytes(&self, instance_capacity: u32) -> u64 {
        self.stream_sizes(instance_capacity).sum()
    }
}

new_key_type! {
    pub(crate) struct ShapeKey;
}

pub(crate) struct ShapeEntry {
    pub(crate) shape: ArchetypeShape,
    /// First batch of the bucket of batches sharing this shape.
    pub(crate) head: Option<u32>,
}

/// Deduplicates shapes and keeps the batch bucket of each.
#[derive(Default)]
pub(crate) struct ShapeRegistry {
    shapes: SlotMap<ShapeKey, ShapeEntry>,
    lookup: HashMap<ArchetypeShape, ShapeKey>,
    attribute_names: HashMap<u32, String>,
}

impl ShapeRegistry {
    /// Returns the key of `shape`, registering it on first use.
    pub(crate) fn intern(&mut self, shape: &ArchetypeShape) -> ShapeKey {
        if let Some(key) = self.lookup.get(shape) {
            return *key;
        }

        let key = self.shapes.insert(ShapeEntry {
            shape: shape.clone(),
            head: None,
        });
        self.lookup.insert(shape.clone(), key);
        key
    }

    /// Returns the key of `shape` if it was registered before.
    pub(crate) fn find(&self, shape: &ArchetypeShape) -> Option<ShapeKey> {
        self.lookup.get(shape).copied()
    }

    pub(crate) fn get(&self, key: ShapeKey) -> Option<&ShapeEntry> {
        self.shapes.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: ShapeKey) -> Option<&mut ShapeEntry> {
        self.shapes.get_mut(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.shapes.len()
    }

    pub(crate) fn set_attribute_name(&mut self, id: u32, name: &str) {
        self.attribute_names.insert(id, name.to_owned());
    }

    /// Human readable description of a shape for log output.
    pub(crate) fn describe(&self, key: ShapeKey) -> String {
        let entry = match self.shapes.get(key) {
            Some(entry) => entry,
            None => return "<unknown shape>".to_owned(),
        };

        let names: Vec<String> = entry
            .shape
            .attributes()
            .iter()
            .map(|attribute| match self.attribute_names.get(&attribute.id) {
                Some(name) => format!("{}({}b)", name, attribute.size_gpu),
                None => format!("#{}({}b)", attribute.id, attribute.size_gpu),
            })
            .collect();

        format!("[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ArchetypeShape {
        ArchetypeShape::new(&[
            AttributeDescriptor::new(7, 64, 64),
            AttributeDescriptor::new(3, 16, 16),
            AttributeDescriptor::new(5, 4, 4),
        ])
        .unwrap()
    }

    #[test]
    fn attributes_are_sorted_by_id() {
        let ids: Vec<u32> = shape().attributes().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn duplicate_and_empty_shapes_are_rejected() {
        assert!(ArchetypeShape::new(&[]).is_err());
        assert!(ArchetypeShape::new(&[
            AttributeDescriptor::new(1, 4, 4),
            AttributeDescriptor::new(1, 8, 8),
        ])
        .is_err());
    }

    #[test]
    fn streams_fit_into_one_window() {
        let shape = shape();
        assert_eq!(shape.bytes_per_instance(), 84);
        let capacity = shape.max_instances_per_window(65536);
        assert_eq!(capacity, (65536 - 48) / 84);
        assert!(shape.slab_bytes(capacity) <= 65536);
        assert_eq!(shape.stream_offsets(3), vec![0, 48, 64]);
    }

    #[test]
    fn registry_deduplicates_shapes() {
        let mut registry = ShapeRegistry::default();
        let a = registry.intern(&shape());
        let b = registry.intern(&shape());
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        registry.set_attribute_name(3, "color");
        assert_eq!(registry.describe(a), "[color(16b), #5(4b), #7(64b)]");
    }
}
