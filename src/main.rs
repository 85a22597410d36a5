//! ingestkit CLI: process new and modified files under a directory in adaptive batches.

use anyhow::Result;
use clap::Parser;
use ingestkit::engine::arg_parser::Cli;
use ingestkit::engine::handle_run;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
