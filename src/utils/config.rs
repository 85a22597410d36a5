//! Application configuration: constants, package paths and the run configuration.
//! Tuning and thresholds in one place.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::pipeline::executor::ExecutorKind;
use crate::pipeline::scheduler::PriorityOrder;
use crate::resilience::{CircuitConfig, RetryPolicy};
use crate::utils::fd_limit::determine_threads_given_fd_limit;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived paths: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    db_filename: String,
    config_filename: String,
    env_prefix: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache paths from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                db_filename: format!(".{pkg}"),
                config_filename: format!(".{pkg}.toml"),
                env_prefix: pkg.to_uppercase(),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// State database filename (checksums + ledger), created in the source root by default.
    pub fn db_filename(&self) -> &str {
        &self.db_filename
    }

    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }

    /// Environment variable name for `key`, e.g. `INGESTKIT_WORKERS`.
    pub fn env_var(&self, key: &str) -> String {
        format!("{}_{}", self.env_prefix, key)
    }

    /// Names excluded from the walk regardless of user patterns: the config file and the
    /// state DB with its WAL/SHM siblings.
    pub fn default_exclude_patterns(&self) -> Vec<String> {
        vec![
            self.config_filename.clone(),
            self.db_filename.clone(),
            format!("{}-wal", self.db_filename),
            format!("{}-shm", self.db_filename),
        ]
    }
}

// ---- Worker threads ----

/// Worker count when none is configured: available threads, capped by the FD budget.
pub fn default_worker_count() -> usize {
    determine_threads_given_fd_limit(rayon::current_num_threads())
}

// ---- Batch sizing ----

/// Batch sizer defaults and score weights.
pub struct BatchConsts;

impl BatchConsts {
    pub const MIN: usize = 1;
    pub const MAX: usize = 64;
    pub const STEP: usize = 4;
    pub const INITIAL: usize = 8;
    /// Rolling window of recent batch metrics.
    pub const WINDOW: usize = 10;
    /// Samples needed before the trend is trusted.
    pub const MIN_SAMPLES: usize = 3;
    pub const TIME_WEIGHT: f64 = 0.4;
    pub const MEMORY_WEIGHT: f64 = 0.3;
    pub const SUCCESS_WEIGHT: f64 = 0.3;
    /// Batches finishing within this wall time get a full time score.
    pub const REFERENCE_BATCH_SECS: f64 = 30.0;
    /// Memory utilisation band that scores 1.0.
    pub const MEMORY_BAND: (f64, f64) = (0.4, 0.7);
    pub const HIGH_WATER: f64 = 0.8;
    pub const LOW_WATER: f64 = 0.5;
}

// ---- Memory ----

pub struct MemoryConsts;

impl MemoryConsts {
    pub const WARNING_FRACTION: f64 = 0.80;
    pub const CRITICAL_FRACTION: f64 = 0.90;
    pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);
}

// ---- Hashing ----

/// Hashing I/O thresholds and buffer sizes.
pub struct HashingConsts;

impl HashingConsts {
    /// File size above which hashing uses memory-mapped I/O (bytes). 100 MB.
    pub const HASH_MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;
    /// Chunk size for reading files below mmap threshold (bytes). 1 MB.
    pub const HASH_READ_CHUNK_SIZE: usize = 1024 * 1024;
}

// ---- Database ----

/// Rows per transaction when bulk-writing checksums.
pub const DB_INSERT_BATCH_SIZE: usize = 1000;

/// Superseded ledger entries older than this are garbage-collected (30 days).
pub const LEDGER_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// ---- Reporting ----

/// ErrorRecords kept for the run report.
pub const ERROR_HISTORY_CAP: usize = 50;

/// Name of the guarded operation wrapping the processing callback.
pub const PROCESS_OPERATION: &str = "process";

/// Min/max/step for the adaptive batch sizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSizeRange {
    pub min: usize,
    pub max: usize,
    pub step: usize,
    pub initial: usize,
}

impl Default for BatchSizeRange {
    fn default() -> Self {
        Self {
            min: BatchConsts::MIN,
            max: BatchConsts::MAX,
            step: BatchConsts::STEP,
            initial: BatchConsts::INITIAL,
        }
    }
}

/// Everything one run needs. Build with [`RunConfig::new`] and override fields, or load
/// from `.ingestkit.toml` via [`crate::utils::ingest_toml::load_run_config`].
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub source_root: PathBuf,
    /// Include globs (gitignore syntax). Empty means every file.
    pub file_patterns: Vec<String>,
    /// Exclude globs, applied after the include globs.
    pub exclude: Vec<String>,
    /// State DB path. When None, uses `source_root.join(".ingestkit")`.
    pub state_db: Option<PathBuf>,
    pub batch: BatchSizeRange,
    pub worker_count: usize,
    pub executor: ExecutorKind,
    /// Warning threshold (fraction of host memory in use).
    pub max_memory_fraction: f64,
    pub critical_memory_fraction: f64,
    pub memory_sample_interval: Duration,
    pub max_run_duration: Option<Duration>,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitConfig,
    pub force_full_rescan_every: Option<Duration>,
    /// Verify every scan with content hashes, not just forced rescans.
    pub exact_checksums: bool,
    /// Mtime tolerance window in nanoseconds.
    pub mtime_window_ns: i64,
    pub follow_links: bool,
    /// Walk with jwalk (parallel) instead of walkdir (serial).
    pub parallel_walk: bool,
    pub priority_order: PriorityOrder,
    /// Per-item wall-clock limit for the isolated executor.
    pub item_timeout: Option<Duration>,
    pub ledger_retention: Duration,
    /// Processing-logic tag. When it differs from the one stored in the ledger, the ledger
    /// is invalidated so everything is reprocessed.
    pub logic_version: Option<String>,
    /// Reuse a ledger result for identical content found under a different path.
    pub reuse_moved_content: bool,
}

impl RunConfig {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            file_patterns: Vec::new(),
            exclude: Vec::new(),
            state_db: None,
            batch: BatchSizeRange::default(),
            worker_count: default_worker_count(),
            executor: ExecutorKind::Pool,
            max_memory_fraction: MemoryConsts::WARNING_FRACTION,
            critical_memory_fraction: MemoryConsts::CRITICAL_FRACTION,
            memory_sample_interval: MemoryConsts::SAMPLE_INTERVAL,
            max_run_duration: None,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitConfig::default(),
            force_full_rescan_every: None,
            exact_checksums: false,
            mtime_window_ns: 0,
            follow_links: false,
            parallel_walk: false,
            priority_order: PriorityOrder::Ascending,
            item_timeout: None,
            ledger_retention: LEDGER_RETENTION,
            logic_version: None,
            reuse_moved_content: false,
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_db.clone().unwrap_or_else(|| {
            self.source_root
                .join(PackagePaths::get().db_filename())
        })
    }

    pub fn root(&self) -> &Path {
        &self.source_root
    }

    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        let b = &self.batch;
        if b.min == 0 || b.min > b.max {
            bail!("batch size range invalid: min {} max {}", b.min, b.max);
        }
        if b.step == 0 {
            bail!("batch size step must be at least 1");
        }
        if self.worker_count == 0 {
            bail!("worker count must be at least 1");
        }
        let (warn, crit) = (self.max_memory_fraction, self.critical_memory_fraction);
        if !(warn > 0.0 && warn <= crit && crit <= 1.0) {
            bail!(
                "memory thresholds must satisfy 0 < warning ({}) <= critical ({}) <= 1",
                warn,
                crit
            );
        }
        if self.circuit_breaker.failure_threshold == 0 {
            bail!("circuit breaker failure threshold must be at least 1");
        }
        if self.retry.max_delay < self.retry.base_delay {
            bail!("retry max delay must not be below base delay");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = RunConfig::new("/tmp");
        cfg.worker_count = 4;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.state_db_path(), PathBuf::from("/tmp/.ingestkit"));
    }

    #[test]
    fn bad_ranges_are_rejected() {
        let mut cfg = RunConfig::new("/tmp");
        cfg.worker_count = 1;
        cfg.batch.min = 10;
        cfg.batch.max = 5;
        assert!(cfg.validate().is_err());

        let mut cfg = RunConfig::new("/tmp");
        cfg.worker_count = 1;
        cfg.max_memory_fraction = 0.95;
        cfg.critical_memory_fraction = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn walk_skips_own_state_files() {
        let ex = PackagePaths::get().default_exclude_patterns();
        assert!(ex.contains(&".ingestkit".to_string()));
        assert!(ex.contains(&".ingestkit-wal".to_string()));
        assert!(ex.contains(&".ingestkit.toml".to_string()));
    }
}
