//! Bitmap used by the sub-batch garbage collection.

/// A bitmap over a dense id range.
#[derive(Debug, Default, Clone)]
pub struct ReferenceBitmap {
    words: Vec<u64>,
    id_range: u32,
}

impl ReferenceBitmap {
    /// Creates a cleared bitmap for the ids `[0, id_range)`.
    pub fn with_id_range(id_range: u32) -> Self {
        let mut bitmap = Self::default();
        bitmap.reset(id_range);
        bitmap
    }

    /// Clears every bit and resizes the bitmap to `[0, id_range)`.
    pub fn reset(&mut self, id_range: u32) {
        let word_count = (id_range as usize + 63) / 64;
        self.words.clear();
        self.words.resize(word_count, 0);
        self.id_range = id_range;
    }

    /// Resizes the bitmap to `[0, id_range)`, keeping the bits of ids that stay in range.
    pub fn resize(&mut self, id_range: u32) {
        let word_count = (id_range as usize + 63) / 64;
        self.words.resize(word_count, 0);
        if id_range % 64 != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << (id_range % 64)) - 1;
            }
        }
        self.id_range = id_range;
    }

    /// Number of ids the bitmap covers.
    pub fn id_range(&self) -> u32 {
        self.id_range
    }

    /// Sets the bit of `id`. Ids outside of the range are ignored.
    pub fn set(&mut self, id: u32) {
        if id < self.id_range {
            self.words[(id / 64) as usize] |= 1 << (id % 64);
        }
    }

    /// Clears the bit of `id`. Ids outside of the range are ignored.
    pub fn clear(&mut self, id: u32) {
        if id < self.id_range {
            self.words[(id / 64) as usize] &= !(1 << (id % 64));
        }
    }

    /// True if the bit of `id` is set.
    pub fn is_set(&self, id: u32) -> bool {
        id < self.id_range && self.words[(id / 64) as usize] & (1 << (id % 64)) != 0
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// The ids of all set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(index, word)| SetBits {
                word: *word,
                base: index as u32 * 64,
            })
    }
}

struct SetBits {
    word: u64,
    base: u32,
}

impl Iterator for SetBits {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros();
        self.word &= self.word - 1;
        Some(self.base + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_set_bits_across_words() {
        let mut bitmap = ReferenceBitmap::with_id_range(200);
        for id in &[0, 5, 63, 64, 130, 199] {
            bitmap.set(*id);
        }
        bitmap.clear(5);
        bitmap.set(200);

        assert_eq!(
            bitmap.iter_set().collect::<Vec<_>>(),
            vec![0, 63, 64, 130, 199]
        );
        assert_eq!(bitmap.count_set(), 5);
        assert!(bitmap.is_set(64));
        assert!(!bitmap.is_set(200));
    }

    #[test]
    fn resize_keeps_bits_in_range() {
        let mut bitmap = ReferenceBitmap::with_id_range(10);
        bitmap.set(3);
        bitmap.set(9);

        bitmap.resize(130);
        bitmap.set(129);
        assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), vec![3, 9, 129]);

        bitmap.resize(8);
        assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), vec![3]);
        assert_eq!(bitmap.id_range(), 8);
    }
}
