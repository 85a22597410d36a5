//! Public and internal types for the ingestkit API and pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::resilience::{ErrorKind, Severity};

/// How a [`FileChecksum`] was derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// blake3 over path + size + mtime. O(1), used by routine scans.
    Fast,
    /// blake3 over the whole file content.
    Exact,
}

impl ChecksumKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumKind::Fast => "fast",
            ChecksumKind::Exact => "exact",
        }
    }

    /// Parse the stored column value. Unknown values fall back to `Fast` so a stale row is
    /// simply re-verified by the cheap signal.
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "exact" => ChecksumKind::Exact,
            _ => ChecksumKind::Fast,
        }
    }
}

/// One row of the checksum store (same shape as the `checksums` table).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChecksum {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in nanoseconds since epoch.
    pub mtime_ns: i64,
    /// Hex-encoded blake3 digest.
    pub checksum: String,
    pub kind: ChecksumKind,
    /// Unix seconds of the scan that produced this row.
    pub last_checked: i64,
}

/// Result of comparing a source tree to the checksum store. The four lists never overlap.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChangeSet {
    pub new: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

impl ChangeSet {
    /// True when nothing needs processing or pruning.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Paths that need to go through the processing callback.
    pub fn pending(&self) -> impl Iterator<Item = &PathBuf> {
        self.new.iter().chain(self.modified.iter())
    }

    pub fn total_seen(&self) -> usize {
        self.new.len() + self.modified.len() + self.unchanged.len()
    }
}

/// A successful processing record (same shape as a row of the `ledger` table).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub path: PathBuf,
    pub content_checksum: String,
    pub result_id: String,
    /// Unix seconds.
    pub completed_at: i64,
    pub pipeline_version: u32,
    pub metadata: serde_json::Value,
}

/// One file awaiting processing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    /// Lower keys are taken first.
    pub priority_key: u64,
}

/// Output of one executed batch; feeds the batch sizer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub batch_size: usize,
    pub wall_time_secs: f64,
    /// Fraction of host memory in use when the batch finished (0..=1).
    pub memory_fraction: f64,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchMetrics {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }
}

/// A classified failure of one logical operation.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub id: u64,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    /// Logical operation key, e.g. `process:/abs/path`.
    pub context: String,
    /// Unix seconds of the last failed attempt.
    pub timestamp: i64,
    pub retry_count: u32,
    pub resolved: bool,
}

/// What the processing callback hands back for one file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Processed {
    pub result_id: String,
    pub metadata: serde_json::Value,
}

impl Processed {
    pub fn new(result_id: impl Into<String>) -> Self {
        Self {
            result_id: result_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Final state of one dispatched item.
#[derive(Clone, Debug)]
pub enum ItemStatus {
    /// Callback succeeded; ledger must be updated with `content_checksum`.
    Processed {
        result_id: String,
        metadata: serde_json::Value,
        content_checksum: String,
    },
    /// Ledger already held this exact content; nothing was called.
    Reused { result_id: String },
    /// Identical content was already processed at another path; its entry is copied to this
    /// path when the batch is recorded.
    Moved {
        result_id: String,
        metadata: serde_json::Value,
        content_checksum: String,
    },
    /// Terminal failure after classification and retries.
    Failed {
        kind: ErrorKind,
        severity: Severity,
        message: String,
    },
}

/// One outcome per dispatched item.
#[derive(Clone, Debug)]
pub struct ItemOutcome {
    pub item: WorkItem,
    pub status: ItemStatus,
    /// Callback invocations made for this item (0 when reused or short-circuited).
    pub attempts: u32,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.status, ItemStatus::Failed { .. })
    }
}

/// Pipeline phase, in run order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Scanning,
    Scheduling,
    Executing,
    Adapting,
    Draining,
    Finalizing,
}

/// Why the run loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing new, modified or deleted.
    NoChanges,
    QueueEmpty,
    DeadlineExceeded,
    Cancelled,
}

/// Summary produced at the end of every run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub files_seen: usize,
    pub new: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub scheduled: usize,
    pub batches: usize,
    pub succeeded: usize,
    /// Subset of `succeeded` answered from the ledger without calling the processor.
    pub reused: usize,
    pub failed: usize,
    pub vanished: usize,
    /// Items left in the scheduler for the next run.
    pub remaining: usize,
    pub wall_time_secs: f64,
    pub peak_memory_fraction: f64,
    pub final_batch_size: usize,
    pub full_rescan: bool,
    pub stop_reason: StopReason,
    pub final_phase: RunPhase,
    pub circuit_states: BTreeMap<String, crate::resilience::CircuitSnapshot>,
    pub recent_errors: Vec<ErrorRecord>,
}
