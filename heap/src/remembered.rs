/// Tracks old-to-new pointer slots so a minor collection can update them
/// without scanning the whole old space.
///
/// Each element is a slot: the address of a word that held a new-space
/// pointer when the write barrier saw it. Slots may go stale (the pointer was
/// overwritten or the containing block died); the collector re-checks each
/// slot's current value before following it.
///
/// Designed for fast common-case insertion: elements live in two partitions,
/// a clean array (sorted, unique) and a dirty array (neither). New slots are
/// appended to the dirty array; when it fills up it is sorted and merged into
/// a new clean array, dropping duplicates.
pub struct RememberedSet {
    clean: Vec<usize>,
    dirty: Vec<usize>,
}

const DIRTY_CAPACITY: usize = 256;

impl RememberedSet {
    pub fn new() -> RememberedSet {
        RememberedSet {
            clean: Vec::new(),
            dirty: Vec::with_capacity(DIRTY_CAPACITY),
        }
    }

    pub fn add(&mut self, slot: usize) {
        if self.dirty.len() == DIRTY_CAPACITY {
            self.sort_and_merge();
        }
        self.dirty.push(slot);
    }

    pub fn len(&mut self) -> usize {
        self.sort_and_merge();
        self.clean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clean.is_empty() && self.dirty.is_empty()
    }

    pub fn clear(&mut self) {
        self.clean.clear();
        self.dirty.clear();
    }

    /// Drain every recorded slot, deduplicated.
    pub fn drain(&mut self) -> Vec<usize> {
        self.sort_and_merge();
        std::mem::take(&mut self.clean)
    }

    fn sort_and_merge(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        self.dirty.sort_unstable();
        let mut merged = Vec::with_capacity(self.clean.len() + self.dirty.len());
        let (mut i, mut j) = (0, 0);
        while i < self.clean.len() || j < self.dirty.len() {
            let next = match (self.clean.get(i), self.dirty.get(j)) {
                (Some(&a), Some(&b)) if a <= b => {
                    i += 1;
                    a
                }
                (_, Some(&b)) => {
                    j += 1;
                    b
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, None) => unreachable!(),
            };
            if merged.last() != Some(&next) {
                merged.push(next);
            }
        }
        self.clean = merged;
        self.dirty.clear();
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_and_sorts() {
        let mut set = RememberedSet::new();
        for slot in [48usize, 16, 32, 16, 48, 8] {
            set.add(slot);
        }
        assert_eq!(set.len(), 4);
        assert_eq!(set.drain(), vec![8, 16, 32, 48]);
        assert!(set.is_empty());
    }

    #[test]
    fn survives_dirty_overflow() {
        let mut set = RememberedSet::new();
        for i in 0..10_000usize {
            set.add((i % 100) * 8);
        }
        assert_eq!(set.len(), 100);
    }

    #[test]
    fn clear_empties_both_partitions() {
        let mut set = RememberedSet::new();
        set.add(8);
        set.len();
        set.add(16);
        set.clear();
        assert!(set.is_empty());
    }
}
