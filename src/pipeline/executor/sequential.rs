use super::{BatchExecutor, ItemJob, run_isolated};
use crate::types::{ItemOutcome, WorkItem};

/// Runs items one after another on the calling thread.
pub struct SequentialExecutor;

impl BatchExecutor for SequentialExecutor {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn concurrency(&self) -> usize {
        1
    }

    fn execute(&self, items: Vec<WorkItem>, job: &ItemJob) -> Vec<ItemOutcome> {
        items.iter().map(|item| run_isolated(job, item)).collect()
    }
}
