use std::collections::{BTreeMap, BTreeSet};

/// Releases items strictly in ascending index order, buffering anything that
/// arrives early.
///
/// An index marked with [`ReorderBuffer::skip`] is stepped over once the
/// cursor reaches it, which leaves a gap instead of blocking forever.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
    skipped: BTreeSet<usize>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            skipped: BTreeSet::new(),
        }
    }

    /// Index the buffer is waiting for.
    pub fn expected(&self) -> usize {
        self.next
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Accept `item` for `index` and return every item that is now in order.
    pub fn push(&mut self, index: usize, item: T) -> Vec<(usize, T)> {
        if index < self.next {
            tracing::warn!("Segment {index} arrived after its slot was passed, dropped.");
            return Vec::new();
        }

        self.pending.insert(index, item);
        self.release()
    }

    /// Give up on `index`. Returns items released by stepping over it.
    pub fn skip(&mut self, index: usize) -> Vec<(usize, T)> {
        if index >= self.next {
            self.skipped.insert(index);
        }
        self.release()
    }

    /// Drop everything still waiting behind a gap.
    pub fn discard(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        self.skipped.clear();
        count
    }

    fn release(&mut self) -> Vec<(usize, T)> {
        let mut ready = Vec::new();
        loop {
            if let Some(item) = self.pending.remove(&self.next) {
                ready.push((self.next, item));
            } else if !self.skipped.remove(&self.next) {
                break;
            }
            self.next += 1;
        }
        ready
    }
}
