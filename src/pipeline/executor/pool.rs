//! Bounded worker pool: `width` scoped threads pull indexed items from a channel.

use crossbeam_channel::unbounded;
use std::thread;

use super::{BatchExecutor, ItemJob, run_isolated};
use crate::types::{ItemOutcome, WorkItem};

pub struct PoolExecutor {
    width: usize,
}

impl PoolExecutor {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }
}

impl BatchExecutor for PoolExecutor {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn concurrency(&self) -> usize {
        self.width
    }

    fn execute(&self, items: Vec<WorkItem>, job: &ItemJob) -> Vec<ItemOutcome> {
        let n = items.len();
        if n == 0 {
            return Vec::new();
        }
        let (work_tx, work_rx) = unbounded::<(usize, WorkItem)>();
        let (done_tx, done_rx) = unbounded::<(usize, ItemOutcome)>();
        for pair in items.into_iter().enumerate() {
            // Receiver is alive until the scope below ends.
            let _ = work_tx.send(pair);
        }
        // Closing the work channel lets idle workers exit.
        drop(work_tx);

        thread::scope(|s| {
            for _ in 0..self.width.min(n) {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                s.spawn(move || {
                    while let Ok((idx, item)) = work_rx.recv() {
                        let outcome = run_isolated(job, &item);
                        if done_tx.send((idx, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(done_tx);

        let mut slots: Vec<Option<ItemOutcome>> = (0..n).map(|_| None).collect();
        for (idx, outcome) in done_rx.iter() {
            slots[idx] = Some(outcome);
        }
        slots.into_iter().flatten().collect()
    }
}
