//! Priority queue of pending work items.

use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use crate::types::WorkItem;

/// How size-derived priorities are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityOrder {
    /// Smallest files first.
    #[default]
    Ascending,
    Descending,
}

impl PriorityOrder {
    pub fn key_for_size(self, size: u64) -> u64 {
        match self {
            PriorityOrder::Ascending => size,
            PriorityOrder::Descending => u64::MAX - size,
        }
    }
}

/// Min-heap on (priority key, insertion sequence): lowest key first, FIFO among equal keys.
#[derive(Debug)]
pub struct PriorityScheduler {
    heap: BinaryHeap<Reverse<(u64, u64, PathBuf)>>,
    seq: u64,
    order: PriorityOrder,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(PriorityOrder::Ascending)
    }
}

impl PriorityScheduler {
    pub fn new(order: PriorityOrder) -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
            order,
        }
    }

    /// Queue `path`. Without an explicit priority the key is derived from the file's current
    /// size (missing files sort as size 0).
    pub fn add(&mut self, path: PathBuf, priority: Option<u64>) {
        let key = priority.unwrap_or_else(|| {
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            self.order.key_for_size(size)
        });
        self.push(path, key);
    }

    /// Queue `path` with a size already known from the walk.
    pub fn add_with_size(&mut self, path: PathBuf, size: u64) {
        let key = self.order.key_for_size(size);
        self.push(path, key);
    }

    fn push(&mut self, path: PathBuf, key: u64) {
        self.heap.push(Reverse((key, self.seq, path)));
        self.seq += 1;
    }

    /// Pop up to `n` items, lowest key first.
    pub fn take_batch(&mut self, n: usize) -> Vec<WorkItem> {
        let mut out = Vec::with_capacity(n.min(self.heap.len()));
        while out.len() < n {
            let Some(Reverse((priority_key, _, path))) = self.heap.pop() else {
                break;
            };
            out.push(WorkItem { path, priority_key });
        }
        out
    }

    /// Remove everything left, in priority order.
    pub fn drain(&mut self) -> Vec<WorkItem> {
        self.take_batch(self.heap.len())
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
