//! Order-independent collection of per-worker results.
//!
//! Each worker appends to its own slot. Merging walks the slots in worker
//! order and numbers every item along that walk. When items are sorted, that
//! sequence number is the tie-breaker, so the output depends only on what each
//! worker contributed, never on which worker finished first.

use std::cmp::Ordering;

/// Per-worker buffers with a deterministic merge.
#[derive(Debug, Clone)]
pub struct DeterministicReduction<T> {
    slots: Vec<Vec<T>>,
}

impl<T> DeterministicReduction<T> {
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a reduction needs at least one worker slot");
        Self {
            slots: (0..workers).map(|_| Vec::new()).collect(),
        }
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// Append `item` to `worker`'s slot.
    ///
    /// # Panics
    ///
    /// Panics if `worker >= self.workers()`.
    #[inline]
    pub fn add(&mut self, worker: usize, item: T) {
        self.slots[worker].push(item);
    }

    /// Items currently held, across all slots.
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// One worker's contributions so far.
    pub fn slot(&self, worker: usize) -> &[T] {
        &self.slots[worker]
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Vec<T>] {
        &mut self.slots
    }

    /// Drain all slots in worker order, numbering items along the way.
    fn drain_sequenced(&mut self) -> Vec<(u64, T)> {
        let mut out = Vec::with_capacity(self.len());
        let mut seq = 0u64;
        for slot in &mut self.slots {
            for item in slot.drain(..) {
                out.push((seq, item));
                seq += 1;
            }
        }
        out
    }

    /// Concatenate in worker order without sorting.
    pub fn merge(&mut self) -> Vec<T> {
        self.drain_sequenced().into_iter().map(|(_, item)| item).collect()
    }

    /// Merge and sort by `compare`, ties broken by merge sequence.
    pub fn merge_and_sort_by<F>(&mut self, mut compare: F) -> Vec<T>
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        let mut items = self.drain_sequenced();
        items.sort_by(|(sa, a), (sb, b)| compare(a, b).then(sa.cmp(sb)));
        items.into_iter().map(|(_, item)| item).collect()
    }

    /// Merge and sort by a derived key, ties broken by merge sequence.
    pub fn merge_and_sort_by_key<K, F>(&mut self, mut key: F) -> Vec<T>
    where
        K: Ord,
        F: FnMut(&T) -> K,
    {
        self.merge_and_sort_by(|a, b| key(a).cmp(&key(b)))
    }

    /// Fold every item in merge order. Use for commutative totals where
    /// the sort is unnecessary, or for order-sensitive folds that should
    /// follow worker order.
    pub fn merge_fold<A, F>(&mut self, init: A, f: F) -> A
    where
        F: FnMut(A, T) -> A,
    {
        self.merge().into_iter().fold(init, f)
    }
}
