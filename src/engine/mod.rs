//! Engine: persistence, hashing, path tools and the CLI surface.

pub mod arg_parser;
pub mod cli;
pub mod db_ops;
pub mod hashing;
pub mod progress;
pub mod tools;

pub use arg_parser::Cli;
pub use cli::handle_run;
pub use db_ops::{ChecksumStore, LedgerCheck, ProcessingLedger, open_db, open_db_in_memory};
pub use hashing::{exact_checksum, fast_checksum, hash_file};
pub use tools::{FileFilter, mtime_changed, path_relative_to};
