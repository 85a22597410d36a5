pub mod config;
pub mod fd_limit;
pub mod ingest_toml;
pub mod logger;

pub use config::*;
pub use fd_limit::{FDS_PER_WORKER, determine_threads_given_fd_limit, max_open_fds};
pub use ingest_toml::load_run_config;
pub use logger::{Colors, setup_logging};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in unix seconds (0 if the clock is before the epoch).
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
