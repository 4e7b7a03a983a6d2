//! Fixed-capacity ring of the most recent samples.

/// Circular buffer holding the last `capacity` pushed items.
///
/// Pushing is O(1) and the only mutation; once full, each push overwrites the
/// oldest item. Traversal always runs oldest to newest and never visits an
/// unfilled slot.
#[derive(Clone, Debug)]
pub struct HistoryRing<T> {
    items: Vec<T>,
    capacity: usize,
    /// Slot the next push writes to; holds the oldest item once full.
    cursor: usize,
}

impl<T> HistoryRing<T> {
    /// Creates an empty ring. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        } else {
            self.items[self.cursor] = item;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        // Before the first wrap `cursor == len`, so `older` is empty.
        let (newer, older) = self.items.split_at(self.cursor.min(self.items.len()));
        older.iter().chain(newer.iter())
    }

    /// Visits every retained item, oldest to newest.
    pub fn for_each(&self, visit: impl FnMut(&T)) {
        self.iter().for_each(visit);
    }

    pub fn oldest(&self) -> Option<&T> {
        self.iter().next()
    }

    pub fn newest(&self) -> Option<&T> {
        let last = (self.cursor + self.capacity - 1) % self.capacity;
        self.items.get(last)
    }
}

impl<T: Clone> HistoryRing<T> {
    /// Copies the retained items out, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
