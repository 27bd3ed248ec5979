// Pending-task priority queue
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct QueueItem<T> {
    priority: u8,
    created_at: DateTime<Utc>,
    seq: u64,
    item: T,
}

impl<T> QueueItem<T> {
    fn key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.seq)
    }
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    // BinaryHeap is a max-heap: the smallest key must compare greatest
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Lower priority value first, then older `created_at`, then insertion order
pub struct PriorityQueue<T> {
    heap: BinaryHeap<QueueItem<T>>,
    seq: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        PriorityQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, priority: u8, created_at: DateTime<Utc>, item: T) {
        self.seq += 1;
        self.heap.push(QueueItem {
            priority,
            created_at,
            seq: self.seq,
            item,
        });
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    /// Items in pop order, without removing them
    pub fn ordered(&self) -> Vec<&T> {
        let mut items: Vec<&QueueItem<T>> = self.heap.iter().collect();
        items.sort_by(|a, b| a.key().cmp(&b.key()));
        items.into_iter().map(|entry| &entry.item).collect()
    }

    pub fn find<P: Fn(&T) -> bool>(&self, predicate: P) -> Option<&T> {
        self.heap.iter().map(|entry| &entry.item).find(|item| predicate(item))
    }
}
