//! CLI handler: load config, layer flags on top, run once, print and optionally save the report.

use anyhow::{Context, Result};
use kdam::Animation;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::arg_parser::Cli;
use crate::engine::db_ops::ProcessingLedger;
use crate::engine::hashing::exact_checksum;
use crate::engine::progress::{ProgressBarConfig, batch_progress_callback, create_progress_bar};
use crate::pipeline::context::CancelToken;
use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::pipeline::processor::{CommandProcessor, Processor};
use crate::types::{Processed, RunReport};
use crate::utils::config::RunConfig;
use crate::utils::{Colors, determine_threads_given_fd_limit, load_run_config, setup_logging};

/// Flags override `.ingestkit.toml` and environment values.
fn apply_cli(cli: &Cli, cfg: &mut RunConfig) {
    if let Some(db) = &cli.db {
        cfg.state_db = Some(db.clone());
    }
    if !cli.pattern.is_empty() {
        cfg.file_patterns = cli.pattern.clone();
    }
    cfg.exclude.extend(cli.exclude.iter().cloned());
    if let Some(n) = cli.workers {
        cfg.worker_count = determine_threads_given_fd_limit(n);
    }
    if let Some(kind) = cli.executor {
        cfg.executor = kind;
    }
    if let Some(secs) = cli.max_run_secs {
        cfg.max_run_duration = Some(Duration::from_secs(secs));
    }
    if let Some(secs) = cli.item_timeout_secs {
        cfg.item_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(min) = cli.batch_min {
        cfg.batch.min = min;
    }
    if let Some(max) = cli.batch_max {
        cfg.batch.max = max;
    }
    cfg.batch.initial = cfg.batch.initial.clamp(cfg.batch.min, cfg.batch.max.max(cfg.batch.min));
    if let Some(exact) = cli.exact {
        cfg.exact_checksums = exact;
    }
    if let Some(secs) = cli.full_rescan_every_secs {
        cfg.force_full_rescan_every = Some(Duration::from_secs(secs));
    }
    if let Some(follow) = cli.follow_links {
        cfg.follow_links = follow;
    }
    if let Some(secs) = cli.mtime_window {
        cfg.mtime_window_ns = secs.saturating_mul(1_000_000_000);
    }
    if let Some(tag) = &cli.logic_version {
        cfg.logic_version = Some(tag.clone());
    }
}

fn content_hash_processor(path: &Path) -> Result<Processed> {
    Ok(Processed::new(exact_checksum(path)?))
}

fn print_summary(report: &RunReport) {
    info!(
        "{} new, {} modified, {} deleted, {} unchanged ({} files seen)",
        Colors::colorize(Colors::NEW, &report.new.to_string()),
        Colors::colorize(Colors::MODIFIED, &report.modified.to_string()),
        Colors::colorize(Colors::DELETED, &report.deleted.to_string()),
        report.unchanged,
        report.files_seen
    );
    info!(
        "{} batches: {} succeeded ({} reused), {} failed, {} vanished, {} remaining in {:.2}s",
        report.batches,
        report.succeeded,
        report.reused,
        Colors::colorize(Colors::FAILED, &report.failed.to_string()),
        report.vanished,
        report.remaining,
        report.wall_time_secs
    );
    for err in report.recent_errors.iter().filter(|e| !e.resolved) {
        warn!("{:?} {}: {}", err.kind, err.context, err.message);
    }
}

/// Run one ingest pass for the CLI.
pub fn handle_run(cli: &Cli) -> Result<()> {
    let verbose = cli.verbose.unwrap_or(false);
    setup_logging(verbose);

    let mut cfg = load_run_config(&cli.dir)?;
    apply_cli(cli, &mut cfg);
    debug!("{} CONFIG:{:#?}", env!("CARGO_PKG_NAME").to_uppercase(), cfg);

    if cli.invalidate {
        let ledger = ProcessingLedger::open(&cfg.state_db_path())?;
        ledger.invalidate_all()?;
    }

    let processor: Arc<dyn Processor> = match &cli.exec {
        Some(cmd) => Arc::new(CommandProcessor::parse(cmd)?),
        None => Arc::new(content_hash_processor),
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            warn!("Ctrl+C handler not installed: {}", e);
        }
    }

    let mut orchestrator = PipelineOrchestrator::new(cfg, processor).with_cancel(cancel);
    if verbose {
        let bar = create_progress_bar(ProgressBarConfig::new(0, "Processing", Animation::Classic));
        orchestrator = orchestrator.on_batch(batch_progress_callback(bar));
    }
    let report = orchestrator.run()?;
    if verbose {
        eprintln!();
    }
    print_summary(&report);

    if let Some(path) = &cli.report {
        let file = std::fs::File::create(path)
            .with_context(|| format!("create report {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report).context("write report")?;
        info!("report written to {}", path.display());
    }
    Ok(())
}
