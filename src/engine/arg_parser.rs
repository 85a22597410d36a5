use clap::Parser;
use std::path::PathBuf;

use crate::pipeline::executor::ExecutorKind;

struct DefaultArgs;

impl DefaultArgs {
    pub const DIR: &'static str = ".";
}

/// Adaptive, resumable batch ingestion of a directory tree.
#[derive(Clone, Parser)]
#[command(name = "ingestkit")]
#[command(about = "Process new and modified files under DIR in adaptive batches; skip content already processed.")]
pub struct Cli {
    /// Directory to ingest. Default: current directory.
    #[arg(value_name = "DIR", default_value = DefaultArgs::DIR)]
    pub dir: PathBuf,

    /// State database path. Default: `.ingestkit` in DIR.
    #[arg(long, short)]
    pub db: Option<PathBuf>,

    /// Command run per file; `{}` is replaced by the path (appended if absent).
    /// Without it, each file's result id is its content hash.
    #[arg(long, short = 'x', value_name = "CMD")]
    pub exec: Option<String>,

    /// Include patterns (glob syntax). Can specify multiple: -p '*.md' '*.pdf'
    #[arg(long, short = 'p', num_args = 1..)]
    pub pattern: Vec<String>,

    /// Exclude patterns (glob syntax). Can specify multiple: -e pattern1 pattern2 pattern3
    #[arg(long, short = 'e', num_args = 1..)]
    pub exclude: Vec<String>,

    /// Worker threads. Default: available threads, capped by the open-file limit.
    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    /// Concurrency strategy: sequential, pool, tasks or isolated.
    #[arg(long, value_enum)]
    pub executor: Option<ExecutorKind>,

    /// Stop starting new batches after this many seconds; leftovers wait for the next run.
    #[arg(long, value_name = "SECS")]
    pub max_run_secs: Option<u64>,

    /// Per-item timeout in seconds (isolated executor).
    #[arg(long, value_name = "SECS")]
    pub item_timeout_secs: Option<u64>,

    /// Smallest batch size.
    #[arg(long)]
    pub batch_min: Option<usize>,

    /// Largest batch size.
    #[arg(long)]
    pub batch_max: Option<usize>,

    /// Verify changes with full-content hashes (slower but exact).
    #[arg(long, short = 'c', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub exact: Option<bool>,

    /// Force an exact rescan when this many seconds passed since the last one.
    #[arg(long, value_name = "SECS")]
    pub full_rescan_every_secs: Option<u64>,

    /// Follow symbolic links.
    #[arg(long, short = 'f', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub follow_links: Option<bool>,

    /// Mtime tolerance window in seconds. Files within this window are considered unchanged.
    #[arg(long, short = 'm', value_parser = clap::value_parser!(i64))]
    pub mtime_window: Option<i64>,

    /// Processing-logic tag; a different tag than last run reprocesses everything.
    #[arg(long)]
    pub logic_version: Option<String>,

    /// Forget every ledger entry (bump the pipeline version) before running.
    #[arg(long)]
    pub invalidate: bool,

    /// Write the run report as JSON to this file.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Verbose output.
    #[arg(long, short = 'v', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub verbose: Option<bool>,
}
