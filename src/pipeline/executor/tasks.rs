//! Rayon-backed executor: items become tasks on a dedicated pool of `width` threads.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{BatchExecutor, ItemJob, run_isolated};
use crate::types::{ItemOutcome, WorkItem};

pub struct TaskExecutor {
    pool: ThreadPool,
    width: usize,
}

impl TaskExecutor {
    pub fn new(width: usize) -> Result<Self> {
        let width = width.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(width)
            .thread_name(|i| format!("ingest-task-{i}"))
            .build()
            .context("build task pool")?;
        Ok(Self { pool, width })
    }
}

impl BatchExecutor for TaskExecutor {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn concurrency(&self) -> usize {
        self.width
    }

    fn execute(&self, items: Vec<WorkItem>, job: &ItemJob) -> Vec<ItemOutcome> {
        self.pool.install(|| {
            items
                .par_iter()
                .with_max_len(1)
                .map(|item| run_isolated(job, item))
                .collect()
        })
    }
}
