//! Batch executors: run one job per work item under a concurrency cap and return one
//! outcome per item, in input order. A panic in one item never affects the others.

mod isolated;
mod pool;
mod sequential;
mod tasks;

pub use isolated::IsolatedExecutor;
pub use pool::PoolExecutor;
pub use sequential::SequentialExecutor;
pub use tasks::TaskExecutor;

use anyhow::Result;
use serde::Deserialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::resilience::{ErrorKind, panic_message};
use crate::types::{ItemOutcome, ItemStatus, WorkItem};

/// Per-item work handed to an executor.
pub type ItemJob = Arc<dyn Fn(&WorkItem) -> ItemOutcome + Send + Sync>;

pub trait BatchExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound on items running at once.
    fn concurrency(&self) -> usize;

    /// Run `job` for every item. Returns exactly `items.len()` outcomes, in input order.
    fn execute(&self, items: Vec<WorkItem>, job: &ItemJob) -> Vec<ItemOutcome>;
}

/// Concurrency strategy, chosen by configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Sequential,
    /// Fixed worker threads pulling from a channel.
    #[default]
    Pool,
    /// Rayon thread pool.
    Tasks,
    /// One thread per item with an optional per-item timeout.
    Isolated,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Sequential => "sequential",
            ExecutorKind::Pool => "pool",
            ExecutorKind::Tasks => "tasks",
            ExecutorKind::Isolated => "isolated",
        }
    }

    /// Build the executor with `workers` width. `item_timeout` only applies to `Isolated`.
    pub fn build(
        self,
        workers: usize,
        item_timeout: Option<Duration>,
    ) -> Result<Box<dyn BatchExecutor>> {
        let workers = workers.max(1);
        Ok(match self {
            ExecutorKind::Sequential => Box::new(SequentialExecutor),
            ExecutorKind::Pool => Box::new(PoolExecutor::new(workers)),
            ExecutorKind::Tasks => Box::new(TaskExecutor::new(workers)?),
            ExecutorKind::Isolated => Box::new(IsolatedExecutor::new(workers, item_timeout)),
        })
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutorKind::Sequential),
            "pool" => Ok(ExecutorKind::Pool),
            "tasks" => Ok(ExecutorKind::Tasks),
            "isolated" => Ok(ExecutorKind::Isolated),
            other => anyhow::bail!("unknown executor {other:?}"),
        }
    }
}

/// Terminal failure outcome of `kind` for `item`.
pub fn failed_outcome(
    item: WorkItem,
    kind: ErrorKind,
    message: String,
    attempts: u32,
) -> ItemOutcome {
    ItemOutcome {
        item,
        status: ItemStatus::Failed {
            kind,
            severity: kind.classification().severity,
            message,
        },
        attempts,
    }
}

/// Run `job` for `item`, turning a panic into an `Unknown` failure.
pub(crate) fn run_isolated(job: &ItemJob, item: &WorkItem) -> ItemOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| job(item))) {
        Ok(outcome) => outcome,
        Err(payload) => failed_outcome(
            item.clone(),
            ErrorKind::Unknown,
            format!("item job panicked: {}", panic_message(&*payload)),
            1,
        ),
    }
}
