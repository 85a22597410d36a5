//! One dedicated thread per item, at most `width` at a time, each with an optional timeout.
//!
//! A timed-out item is reported as a transient failure. The thread itself cannot be killed:
//! it is abandoned, its late result is discarded, and it keeps its slot until it exits, so
//! later items and later batches never push the thread count past `width`.
//!
//! Isolation is per thread. An abort inside the callback still ends the process; pair this
//! executor with [`CommandProcessor`](crate::pipeline::CommandProcessor) to get a child
//! process per item.

use crossbeam_channel::{Receiver, Sender, after, never, select, unbounded};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::{BatchExecutor, ItemJob, failed_outcome, run_isolated};
use crate::resilience::ErrorKind;
use crate::types::{ItemOutcome, WorkItem};

/// How often a batch blocked only by abandoned threads re-checks for a free slot.
const SLOT_POLL: Duration = Duration::from_millis(25);

pub struct IsolatedExecutor {
    width: usize,
    item_timeout: Option<Duration>,
    /// Item threads alive right now, including abandoned ones.
    running: Arc<AtomicUsize>,
    freed_tx: Sender<()>,
    freed_rx: Receiver<()>,
}

/// Held by an item thread; releases the slot when the thread ends.
struct Slot {
    running: Arc<AtomicUsize>,
    freed: Sender<()>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
        let _ = self.freed.send(());
    }
}

impl IsolatedExecutor {
    pub fn new(width: usize, item_timeout: Option<Duration>) -> Self {
        let (freed_tx, freed_rx) = unbounded();
        Self {
            width: width.max(1),
            item_timeout,
            running: Arc::new(AtomicUsize::new(0)),
            freed_tx,
            freed_rx,
        }
    }

    /// Threads still running, abandoned ones included.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Time until the oldest in-flight item hits the timeout.
    fn next_wait(&self, in_flight: &HashMap<usize, (Instant, WorkItem)>) -> Option<Duration> {
        let limit = self.item_timeout?;
        in_flight
            .values()
            .map(|(started, _)| limit.saturating_sub(started.elapsed()))
            .min()
    }

    fn slot(&self) -> Slot {
        self.running.fetch_add(1, Ordering::AcqRel);
        Slot {
            running: Arc::clone(&self.running),
            freed: self.freed_tx.clone(),
        }
    }
}

impl BatchExecutor for IsolatedExecutor {
    fn name(&self) -> &'static str {
        "isolated"
    }

    fn concurrency(&self) -> usize {
        self.width
    }

    fn execute(&self, items: Vec<WorkItem>, job: &ItemJob) -> Vec<ItemOutcome> {
        let n = items.len();
        let mut slots: Vec<Option<ItemOutcome>> = (0..n).map(|_| None).collect();
        let (tx, rx) = unbounded::<(usize, ItemOutcome)>();
        let mut in_flight: HashMap<usize, (Instant, WorkItem)> = HashMap::new();
        let mut queue = items.into_iter().enumerate().peekable();
        let mut done = 0_usize;

        while done < n {
            while self.running() < self.width {
                let Some((idx, item)) = queue.next() else {
                    break;
                };
                let (job, tx, moved) = (Arc::clone(job), tx.clone(), item.clone());
                let slot = self.slot();
                let spawned = thread::Builder::new()
                    .name(format!("ingest-item-{idx}"))
                    .spawn(move || {
                        let outcome = run_isolated(&job, &moved);
                        drop(slot);
                        let _ = tx.send((idx, outcome));
                    });
                match spawned {
                    Ok(_) => {
                        in_flight.insert(idx, (Instant::now(), item));
                    }
                    Err(e) => {
                        slots[idx] = Some(failed_outcome(
                            item,
                            ErrorKind::ResourceExhaustion,
                            format!("cannot spawn item thread: {e}"),
                            0,
                        ));
                        done += 1;
                    }
                }
            }
            if done == n {
                break;
            }

            let timer = match self.next_wait(&in_flight) {
                Some(wait) => after(wait),
                None if in_flight.is_empty() && queue.peek().is_some() => after(SLOT_POLL),
                None => never(),
            };
            select! {
                recv(rx) -> msg => {
                    if let Ok((idx, outcome)) = msg
                        && in_flight.remove(&idx).is_some()
                    {
                        slots[idx] = Some(outcome);
                        done += 1;
                    }
                }
                recv(self.freed_rx) -> _ => {}
                recv(timer) -> _ => {}
            }

            if let Some(limit) = self.item_timeout {
                let expired: Vec<usize> = in_flight
                    .iter()
                    .filter(|(_, (started, _))| started.elapsed() >= limit)
                    .map(|(idx, _)| *idx)
                    .collect();
                for idx in expired {
                    if let Some((_, item)) = in_flight.remove(&idx) {
                        warn!(
                            "{}: timed out after {:?}; abandoning its thread",
                            item.path.display(),
                            limit
                        );
                        slots[idx] = Some(failed_outcome(
                            item,
                            ErrorKind::Transient,
                            format!("timed out after {limit:?}"),
                            1,
                        ));
                        done += 1;
                    }
                }
            }
        }
        slots.into_iter().flatten().collect()
    }
}
