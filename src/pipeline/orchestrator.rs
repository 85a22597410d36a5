//! Run loop: detect → schedule → execute batch → record → adapt, until the queue is empty,
//! the deadline passes or the run is cancelled.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::{ChangeDetector, DetectOptions};
use crate::engine::db_ops::{ChecksumStore, ProcessingLedger};
use crate::engine::tools::canonicalize_root;
use crate::pipeline::context::{CancelToken, RunControl};
use crate::pipeline::executor::{ItemJob, failed_outcome};
use crate::pipeline::processor::Processor;
use crate::pipeline::scheduler::PriorityScheduler;
use crate::pipeline::walk::WalkOptions;
use crate::resilience::{ErrorClassifier, Resilience};
use crate::tuning::{AdaptiveBatchSizer, MemoryMonitor};
use crate::types::{
    BatchMetrics, ChangeSet, FileChecksum, ItemOutcome, ItemStatus, RunPhase, RunReport,
    StopReason, WorkItem,
};
use crate::utils::config::{PROCESS_OPERATION, RunConfig};
use crate::utils::unix_now;

/// Passed to the `on_batch` callback after every executed batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchProgress {
    /// 1-based.
    pub batch_index: usize,
    pub batch_size: usize,
    /// Items consumed so far (including vanished).
    pub done: usize,
    pub scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub next_batch_size: usize,
}

type BatchCallback = Box<dyn FnMut(&BatchProgress)>;

/// Composes detection, scheduling, execution and adaptation for one run.
pub struct PipelineOrchestrator {
    config: RunConfig,
    processor: Arc<dyn Processor>,
    classifier: ErrorClassifier,
    cancel: CancelToken,
    stores: Option<(Arc<ChecksumStore>, Arc<ProcessingLedger>)>,
    on_batch: Option<BatchCallback>,
}

/// Running counters for the report.
#[derive(Default)]
struct Tally {
    batches: usize,
    succeeded: usize,
    reused: usize,
    failed: usize,
    vanished: usize,
    /// Paths whose checksum rows are dropped at drain so the next run sees them again.
    deferred: Vec<PathBuf>,
}

fn enter(phase: &mut RunPhase, next: RunPhase) {
    if *phase != next {
        debug!("phase: {:?} -> {:?}", phase, next);
        *phase = next;
    }
}

impl PipelineOrchestrator {
    pub fn new(config: RunConfig, processor: Arc<dyn Processor>) -> Self {
        Self {
            config,
            processor,
            classifier: ErrorClassifier::default(),
            cancel: CancelToken::new(),
            stores: None,
            on_batch: None,
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Use these stores instead of opening the configured state DB.
    pub fn with_stores(mut self, checksums: Arc<ChecksumStore>, ledger: Arc<ProcessingLedger>) -> Self {
        self.stores = Some((checksums, ledger));
        self
    }

    pub fn on_batch<F>(mut self, f: F) -> Self
    where
        F: FnMut(&BatchProgress) + 'static,
    {
        self.on_batch = Some(Box::new(f));
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn open_stores(&self) -> Result<(Arc<ChecksumStore>, Arc<ProcessingLedger>)> {
        if let Some((c, l)) = &self.stores {
            return Ok((Arc::clone(c), Arc::clone(l)));
        }
        let db = self.config.state_db_path();
        let checksums = ChecksumStore::open(&db).context("open checksum store")?;
        let ledger = ProcessingLedger::open(&db).context("open processing ledger")?;
        Ok((Arc::new(checksums), Arc::new(ledger)))
    }

    /// True when a forced exact rescan is due.
    fn full_rescan_due(&self, checksums: &ChecksumStore) -> Result<bool> {
        if self.config.exact_checksums {
            return Ok(true);
        }
        let Some(every) = self.config.force_full_rescan_every else {
            return Ok(false);
        };
        Ok(match checksums.last_full_rescan()? {
            None => true,
            Some(last) => unix_now() - last >= every.as_secs() as i64,
        })
    }

    /// Run once. Only setup failures return `Err`; item failures end up in the report.
    pub fn run(mut self) -> Result<RunReport> {
        let started = Instant::now();
        self.config.validate()?;
        let cfg = self.config.clone();
        let root = canonicalize_root(&cfg.source_root)?;
        let control = RunControl::new(self.cancel.clone(), cfg.max_run_duration);
        let (checksums, ledger) = self.open_stores()?;
        if let Some(tag) = &cfg.logic_version {
            ledger.ensure_logic_version(tag)?;
        }

        let monitor = Arc::new(MemoryMonitor::new(
            cfg.max_memory_fraction,
            cfg.critical_memory_fraction,
            cfg.memory_sample_interval,
        ));
        {
            let (c, l) = (Arc::clone(&checksums), Arc::clone(&ledger));
            monitor.add_reclaim_hook(Box::new(move || {
                c.shrink_memory();
                l.shrink_memory();
            }));
        }
        let sampler = monitor.start();

        let mut phase = RunPhase::Scanning;
        debug!("phase: {:?} ({})", phase, root.display());
        let full_rescan = self.full_rescan_due(&checksums)?;
        let detector = ChangeDetector::with_options(
            &checksums,
            DetectOptions {
                exact: full_rescan,
                mtime_window_ns: cfg.mtime_window_ns,
                exclude: cfg.exclude.clone(),
                walk: WalkOptions {
                    follow_links: cfg.follow_links,
                    parallel: cfg.parallel_walk,
                    stat_workers: cfg.worker_count,
                },
            },
        );
        let (changes, staged) = detector.detect_staged(&root, &cfg.file_patterns)?;
        if full_rescan {
            checksums.record_full_rescan(unix_now())?;
        }
        // Checksum rows of new and modified files are committed only once the file is handled.
        let mut staged: HashMap<PathBuf, FileChecksum> =
            staged.into_iter().map(|row| (row.path.clone(), row)).collect();
        let unprocessed = unprocessed_unchanged(&ledger, &changes)?;

        let resilience = Arc::new(Resilience::new(
            self.classifier.clone(),
            cfg.retry.clone(),
            cfg.circuit_breaker,
        ));
        let mut sizer = AdaptiveBatchSizer::new(cfg.batch);
        let mut scheduler = PriorityScheduler::new(cfg.priority_order);
        let mut tally = Tally::default();
        let scheduled;
        let stop_reason;

        if changes.is_empty() && unprocessed.is_empty() {
            info!("no changes under {}", root.display());
            scheduled = 0;
            stop_reason = StopReason::NoChanges;
        } else {
            enter(&mut phase, RunPhase::Scheduling);
            for path in changes.pending() {
                scheduler.add(path.clone(), None);
            }
            if !unprocessed.is_empty() {
                info!(
                    "{} unchanged files have no ledger entry under version {}; scheduling them",
                    unprocessed.len(),
                    ledger.pipeline_version()
                );
                for path in unprocessed {
                    scheduler.add(path, None);
                }
            }
            scheduled = scheduler.size();
            debug!("scheduled {} items", scheduled);

            let executor = cfg.executor.build(cfg.worker_count, cfg.item_timeout)?;
            debug!(
                "executor {} with concurrency {}",
                executor.name(),
                executor.concurrency()
            );
            let job = item_job(
                Arc::clone(&ledger),
                Arc::clone(&resilience),
                Arc::clone(&self.processor),
                control.clone(),
                cfg.reuse_moved_content,
            );

            stop_reason = loop {
                if let Some(reason) = control.should_stop() {
                    break reason;
                }
                if scheduler.is_empty() {
                    break StopReason::QueueEmpty;
                }
                enter(&mut phase, RunPhase::Executing);
                let batch = scheduler.take_batch(sizer.next_batch_size());
                let (present, gone): (Vec<WorkItem>, Vec<WorkItem>) =
                    batch.into_iter().partition(|item| item.path.is_file());
                if !gone.is_empty() {
                    tally.vanished += gone.len();
                    let paths: Vec<PathBuf> = gone.into_iter().map(|i| i.path).collect();
                    for p in &paths {
                        debug!("{} vanished before dispatch", p.display());
                    }
                    checksums.delete_many(paths.iter())?;
                }
                if present.is_empty() {
                    continue;
                }

                let batch_size = present.len();
                let t0 = Instant::now();
                let outcomes = executor.execute(present, &job);
                let wall = t0.elapsed();
                let (ok, bad) =
                    record_outcomes(&checksums, &ledger, &mut staged, outcomes, &mut tally);

                enter(&mut phase, RunPhase::Adapting);
                let sample = monitor.sample();
                monitor.observe(sample);
                let metrics = BatchMetrics {
                    batch_size,
                    wall_time_secs: wall.as_secs_f64(),
                    memory_fraction: sample.used_fraction,
                    success_count: ok,
                    failure_count: bad,
                };
                sizer.record_outcome(metrics);
                if monitor.take_reduce_hint() {
                    sizer.force_decrease();
                }
                tally.batches += 1;
                debug!(
                    "batch {}: {} ok, {} failed in {:.2}s, next size {}",
                    tally.batches,
                    ok,
                    bad,
                    wall.as_secs_f64(),
                    sizer.next_batch_size()
                );
                if let Some(cb) = self.on_batch.as_mut() {
                    cb(&BatchProgress {
                        batch_index: tally.batches,
                        batch_size,
                        done: scheduled - scheduler.size(),
                        scheduled,
                        succeeded: tally.succeeded,
                        failed: tally.failed,
                        next_batch_size: sizer.next_batch_size(),
                    });
                }
                enter(&mut phase, RunPhase::Scheduling);
            };
        }

        enter(&mut phase, RunPhase::Draining);
        let remaining = scheduler.drain();
        if !remaining.is_empty() {
            info!(
                "{:?}: leaving {} items for the next run",
                stop_reason,
                remaining.len()
            );
        }
        tally
            .deferred
            .extend(remaining.iter().map(|i| i.path.clone()));
        if !tally.deferred.is_empty() {
            checksums.delete_many(tally.deferred.iter())?;
        }
        sampler.stop();

        enter(&mut phase, RunPhase::Finalizing);
        if let Err(e) = ledger.collect_garbage(cfg.ledger_retention) {
            warn!("ledger gc failed: {:#}", e);
        }
        if let Err(e) = checksums.prune_older_than(cfg.ledger_retention) {
            warn!("checksum prune failed: {:#}", e);
        }

        let report = build_report(
            &changes,
            scheduled,
            &tally,
            remaining.len(),
            started.elapsed(),
            &monitor,
            &sizer,
            &resilience,
            full_rescan,
            stop_reason,
            phase,
        );
        info!(
            "run finished ({:?}): {} scheduled, {} succeeded ({} reused), {} failed, {} remaining",
            report.stop_reason,
            report.scheduled,
            report.succeeded,
            report.reused,
            report.failed,
            report.remaining
        );
        Ok(report)
    }
}

/// Per-item work: ledger check, optional moved-content reuse, then the guarded processor call.
fn item_job(
    ledger: Arc<ProcessingLedger>,
    resilience: Arc<Resilience>,
    processor: Arc<dyn Processor>,
    control: RunControl,
    reuse_moved_content: bool,
) -> ItemJob {
    Arc::new(move |item: &WorkItem| {
        let context = format!("{}:{}", PROCESS_OPERATION, item.path.display());
        let check = match ledger.check(&item.path) {
            Ok(c) => c,
            Err(e) => {
                let cls = resilience.classifier.classify(&e);
                let message = format!("{e:#}");
                resilience.errors.record(&context, &cls, message.clone());
                return failed_outcome(item.clone(), cls.kind, message, 0);
            }
        };
        if let Some(result_id) = check.reuse {
            return ItemOutcome {
                item: item.clone(),
                status: ItemStatus::Reused { result_id },
                attempts: 0,
            };
        }
        if reuse_moved_content
            && let Ok(Some(entry)) = ledger.find_by_content(&check.checksum)
        {
            debug!(
                "{}: reusing result of identical {}",
                item.path.display(),
                entry.path.display()
            );
            return ItemOutcome {
                item: item.clone(),
                status: ItemStatus::Moved {
                    result_id: entry.result_id,
                    metadata: entry.metadata,
                    content_checksum: check.checksum,
                },
                attempts: 0,
            };
        }

        let (result, attempts) = resilience.call(PROCESS_OPERATION, &context, &control, || {
            processor.process(&item.path)
        });
        let status = match result {
            Ok(processed) => ItemStatus::Processed {
                result_id: processed.result_id,
                metadata: processed.metadata,
                content_checksum: check.checksum,
            },
            Err(failure) => ItemStatus::Failed {
                kind: failure.classification.kind,
                severity: failure.classification.severity,
                message: failure.message,
            },
        };
        ItemOutcome {
            item: item.clone(),
            status,
            attempts,
        }
    })
}

/// Schedule-worthy unchanged files: those without any ledger entry under the current version.
/// Covers a version bump as well as rows left behind by a run that never finished.
fn unprocessed_unchanged(ledger: &ProcessingLedger, changes: &ChangeSet) -> Result<Vec<PathBuf>> {
    if changes.unchanged.is_empty() {
        return Ok(Vec::new());
    }
    let processed = ledger.processed_paths()?;
    Ok(changes
        .unchanged
        .iter()
        .filter(|p| !processed.contains(*p))
        .cloned()
        .collect())
}

/// Write ledger entries and commit staged checksum rows for successes, then tally the batch.
/// Returns (successes, failures).
fn record_outcomes(
    checksums: &ChecksumStore,
    ledger: &ProcessingLedger,
    staged: &mut HashMap<PathBuf, FileChecksum>,
    outcomes: Vec<ItemOutcome>,
    tally: &mut Tally,
) -> (usize, usize) {
    let (mut ok, mut bad) = (0, 0);
    let mut handled = Vec::new();
    for outcome in outcomes {
        let path = outcome.item.path;
        let recorded = match outcome.status {
            ItemStatus::Processed {
                result_id,
                metadata,
                content_checksum,
            } => ledger
                .record(&path, &content_checksum, &result_id, &metadata)
                .map(|()| false),
            ItemStatus::Moved {
                result_id,
                metadata,
                content_checksum,
            } => ledger
                .record(&path, &content_checksum, &result_id, &metadata)
                .map(|()| true),
            ItemStatus::Reused { .. } => Ok(true),
            ItemStatus::Failed {
                kind,
                severity,
                message,
            } => {
                warn!(
                    "{}: {:?} ({:?}) after {} attempt(s): {}",
                    path.display(),
                    kind,
                    severity,
                    outcome.attempts,
                    message
                );
                bad += 1;
                tally.deferred.push(path);
                continue;
            }
        };
        match recorded {
            Ok(reused) => {
                ok += 1;
                if reused {
                    tally.reused += 1;
                }
                if let Some(row) = staged.remove(&path) {
                    handled.push(row);
                }
            }
            Err(e) => {
                warn!("{}: handled but not recorded: {:#}", path.display(), e);
                bad += 1;
                tally.deferred.push(path);
            }
        }
    }
    if let Err(e) = checksums.put_many(&handled) {
        // The ledger already holds these; the next pass reports them again and reuses.
        warn!("cannot commit {} checksum rows: {:#}", handled.len(), e);
    }
    tally.succeeded += ok;
    tally.failed += bad;
    (ok, bad)
}

#[allow(clippy::too_many_arguments)]
fn build_report(
    changes: &ChangeSet,
    scheduled: usize,
    tally: &Tally,
    remaining: usize,
    wall: Duration,
    monitor: &MemoryMonitor,
    sizer: &AdaptiveBatchSizer,
    resilience: &Resilience,
    full_rescan: bool,
    stop_reason: StopReason,
    final_phase: RunPhase,
) -> RunReport {
    RunReport {
        files_seen: changes.total_seen(),
        new: changes.new.len(),
        modified: changes.modified.len(),
        deleted: changes.deleted.len(),
        unchanged: changes.unchanged.len(),
        scheduled,
        batches: tally.batches,
        succeeded: tally.succeeded,
        reused: tally.reused,
        failed: tally.failed,
        vanished: tally.vanished,
        remaining,
        wall_time_secs: wall.as_secs_f64(),
        peak_memory_fraction: monitor.peak_fraction(),
        final_batch_size: sizer.next_batch_size(),
        full_rescan,
        stop_reason,
        final_phase,
        circuit_states: resilience.breaker.snapshot(),
        recent_errors: resilience.errors.recent(),
    }
}
