//! Bounded best-K ranking used per seed by the clone engine.
//!
//! A max-heap keyed on "badness" keeps the worst retained entry on top, so a
//! new entry costs O(log K): it either replaces the top or is discarded.
//! Equal keys are ordered by insertion sequence, the earlier entry winning.

use crate::track::RankKey;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct Ranked<T> {
    key: RankKey,
    seq: u64,
    item: T,
}

impl<T> Ranked<T> {
    /// `Greater` means worse.
    fn badness(&self, other: &Self) -> Ordering {
        self.key.cmp_rank(&other.key).then(self.seq.cmp(&other.seq))
    }
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.badness(other) == Ordering::Equal
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.badness(other)
    }
}

/// Keeps at most `capacity` entries, the best by [`RankKey`] then by
/// insertion order.
#[derive(Debug, Clone)]
pub struct BoundedRanking<T> {
    heap: BinaryHeap<Ranked<T>>,
    capacity: usize,
    next_seq: u64,
    discarded: usize,
}

impl<T> BoundedRanking<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity + 1),
            capacity,
            next_seq: 0,
            discarded: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Entries pushed out or refused since the last drain.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Key of the worst retained entry.
    pub fn worst_key(&self) -> Option<RankKey> {
        self.heap.peek().map(|r| r.key)
    }

    /// Offers an entry. Returns whether it was retained.
    pub fn push(&mut self, key: RankKey, item: T) -> bool {
        let entry = Ranked {
            key,
            seq: self.next_seq,
            item,
        };
        self.next_seq += 1;

        if self.heap.len() < self.capacity {
            self.heap.push(entry);
            return true;
        }
        self.discarded += 1;
        match self.heap.peek_mut() {
            Some(mut worst) if entry < *worst => {
                *worst = entry;
                true
            }
            _ => false,
        }
    }

    /// Removes every entry, best first, and resets the counters.
    pub fn drain_sorted(&mut self) -> Vec<(RankKey, T)> {
        let heap = std::mem::take(&mut self.heap);
        self.next_seq = 0;
        self.discarded = 0;
        heap.into_sorted_vec().into_iter().map(|r| (r.key, r.item)).collect()
    }
}
