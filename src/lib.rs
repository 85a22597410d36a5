//! ingestkit: adaptive, resumable batch ingestion of slowly-changing file trees.
//!
//! A run detects what changed since the last run (SQLite checksum store), queues new and
//! modified files smallest-first, and pushes them through a processing callback in batches
//! whose size adapts to latency, memory pressure and success rate. Failures are classified,
//! retried with backoff and fenced by a circuit breaker; successes land in a ledger so the
//! same content is never processed twice under the same pipeline version.

pub mod detect;
pub mod engine;
pub mod pipeline;
pub mod resilience;
pub mod tuning;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

pub use detect::{ChangeDetector, DetectOptions};
pub use engine::db_ops::{ChecksumStore, LedgerCheck, ProcessingLedger};
pub use pipeline::{
    BatchExecutor, BatchProgress, CancelToken, CommandProcessor, ExecutorKind,
    PipelineOrchestrator, PriorityOrder, PriorityScheduler, Processor, RunControl,
};
pub use resilience::{
    CircuitBreaker, CircuitConfig, CircuitState, ErrorClassifier, ErrorKind, ProcessError,
    RetryPolicy, RetryStrategy, Severity,
};
pub use tuning::{AdaptiveBatchSizer, MemoryMonitor};
pub use utils::config::{BatchSizeRange, RunConfig};
pub use utils::load_run_config;

use log::debug;
use std::path::Path;
use std::sync::Arc;

/// Result alias used by public ingestkit API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Single entry point: run one ingest pass over `root` with `processor`.
///
/// - **`config: None`** → defaults, then `.ingestkit.toml` in `root`, then `.env` /
///   environment overrides.
/// - **`config: Some(cfg)`** → `cfg` as given; its `source_root` is replaced by `root`.
///
/// Item failures do not fail the call; they are counted in the returned [`RunReport`].
///
/// ```ignore
/// let report = ingestkit::ingest_dir(path, None, |p: &std::path::Path| {
///     Ok(ingestkit::Processed::new(extract(p)?))
/// })?;
/// ```
pub fn ingest_dir<P>(root: &Path, config: Option<RunConfig>, processor: P) -> Result<RunReport>
where
    P: Processor + 'static,
{
    let config = match config {
        Some(mut cfg) => {
            cfg.source_root = root.to_path_buf();
            cfg
        }
        None => load_run_config(root)?,
    };
    debug!(
        "{} CONFIG:{:#?}",
        env!("CARGO_PKG_NAME").to_string().to_uppercase(),
        config
    );
    PipelineOrchestrator::new(config, Arc::new(processor)).run()
}
