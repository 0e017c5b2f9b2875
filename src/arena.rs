//! Index arena with stable, recycled ids.

#[derive(Debug)]
enum Slot<T> {
    Occupied(T),
    Vacant { next_free: Option<u32> },
}

/// Stores values under `u32` ids. Removed ids are chained through their vacant slots and
/// handed out again before the arena grows.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    first_free: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            first_free: None,
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            first_free: None,
            len: 0,
        }
    }

    /// Number of live values.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// One past the highest id ever handed out.
    pub(crate) fn id_range(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn insert(&mut self, value: T) -> u32 {
        self.len += 1;
        match self.first_free {
            Some(id) => {
                if let Slot::Vacant { next_free } = self.slots[id as usize] {
                    self.first_free = next_free;
                }
                self.slots[id as usize] = Slot::Occupied(value);
                id
            }
            None => {
                self.slots.push(Slot::Occupied(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        let slot = self.slots.get_mut(id as usize)?;
        if let Slot::Vacant { .. } = slot {
            return None;
        }

        let previous = std::mem::replace(
            slot,
            Slot::Vacant {
                next_free: self.first_free,
            },
        );
        self.first_free = Some(id);
        self.len -= 1;

        match previous {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        match self.slots.get(id as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        match self.slots.get_mut(id as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Live values with their ids, ordered by id.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                Slot::Occupied(value) => Some((id as u32, value)),
                Slot::Vacant { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_ids_are_reused_last_in_first_out() {
        let mut arena = Arena::with_capacity(4);
        let a = arena.insert("a");
        let b = arena.insert("b");
        let c = arena.insert("c");
        assert_eq!((a, b, c), (0, 1, 2));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(c), Some("c"));
        assert_eq!(arena.remove(c), None);
        assert_eq!(arena.len(), 1);

        assert_eq!(arena.insert("d"), c);
        assert_eq!(arena.insert("e"), a);
        assert_eq!(arena.insert("f"), 3);
        assert_eq!(arena.id_range(), 4);
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut arena = Arena::default();
        for value in 0..5 {
            arena.insert(value);
        }
        arena.remove(1);
        arena.remove(3);
        let ids: Vec<u32> = arena.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 2, 4]);
        assert!(!arena.contains(3));
        assert_eq!(arena.get(4), Some(&4));
    }
}
