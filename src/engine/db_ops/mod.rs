//! Database operations: schema, open, checksum store, processing ledger, run info.

mod checksums;
mod connection;
mod ledger;
mod runinfo;

pub use checksums::ChecksumStore;
pub use connection::{open_db, open_db_in_memory};
pub use ledger::{LedgerCheck, ProcessingLedger};
pub use runinfo::{RunInfoKey, load_run_info, save_run_info};

/// WAL tuning pragmas (synchronous, autocheckpoint, size limit). Use after PRAGMA journal_mode = WAL.
pub(crate) const WAL_PRAGMAS: &str = r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 10000;
        PRAGMA journal_size_limit = 67108864;
        "#;

/// Upsert for the checksums table.
pub(crate) const UPSERT_CHECKSUM_SQL: &str = "INSERT OR REPLACE INTO checksums \
     (path, size, mtime_ns, checksum, kind, last_checked) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Upsert for the ledger keyed by (path, checksum). Keeps the rowid so supersession order
/// stays (completed_at, rowid).
pub(crate) const UPSERT_LEDGER_SQL: &str = "INSERT INTO ledger \
     (path, checksum, result_id, completed_at, pipeline_version, metadata) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
     ON CONFLICT(path, checksum) DO UPDATE SET \
     result_id = excluded.result_id, completed_at = excluded.completed_at, \
     pipeline_version = excluded.pipeline_version, metadata = excluded.metadata";

/// Schema for checksums, ledger and runinfo tables.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checksums (
    path TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    kind TEXT NOT NULL,
    last_checked INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger (
    path TEXT NOT NULL,
    checksum TEXT NOT NULL,
    result_id TEXT NOT NULL,
    completed_at INTEGER NOT NULL,
    pipeline_version INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT 'null',
    PRIMARY KEY (path, checksum)
);
CREATE INDEX IF NOT EXISTS idx_ledger_checksum ON ledger(checksum);

CREATE TABLE IF NOT EXISTS runinfo (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
"#;
