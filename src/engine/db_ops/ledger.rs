//! Processing ledger: which exact content has been processed under the current version.

use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::engine::hashing::exact_checksum;
use crate::engine::tools::path_to_db_string;
use crate::types::LedgerEntry;
use crate::utils::unix_now;

use super::runinfo::{RunInfoKey, load_run_info, save_run_info};
use super::{UPSERT_LEDGER_SQL, open_db, open_db_in_memory};

const INITIAL_PIPELINE_VERSION: u32 = 1;

const SELECT_ENTRY: &str =
    "SELECT path, checksum, result_id, completed_at, pipeline_version, metadata FROM ledger";

/// Outcome of a ledger lookup for one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerCheck {
    /// Content checksum the lookup was made with; pass it back to
    /// [`ProcessingLedger::record`] so the entry matches the bytes that were processed.
    pub checksum: String,
    /// Result id of a matching entry under the current pipeline version.
    pub reuse: Option<String>,
}

impl LedgerCheck {
    pub fn should_process(&self) -> bool {
        self.reuse.is_none()
    }
}

/// Ledger over the `ledger` table, keyed by (path, content checksum).
///
/// The pipeline version lives in `runinfo` and is cached here; [`invalidate_all`] bumps it
/// so older entries stop matching without being deleted.
///
/// [`invalidate_all`]: ProcessingLedger::invalidate_all
pub struct ProcessingLedger {
    conn: Mutex<Connection>,
    version: AtomicU32,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let path: String = row.get(0)?;
    let version: i64 = row.get(4)?;
    let metadata: String = row.get(5)?;
    Ok(LedgerEntry {
        path: PathBuf::from(path),
        content_checksum: row.get(1)?,
        result_id: row.get(2)?,
        completed_at: row.get(3)?,
        pipeline_version: version.clamp(0, u32::MAX as i64) as u32,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

impl ProcessingLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::from_connection(open_db(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(open_db_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        let version = match load_run_info::<u32>(&conn, RunInfoKey::PipelineVersion)? {
            Some(v) => v,
            None => {
                save_run_info(&conn, RunInfoKey::PipelineVersion, &INITIAL_PIPELINE_VERSION)?;
                INITIAL_PIPELINE_VERSION
            }
        };
        Ok(Self {
            conn: Mutex::new(conn),
            version: AtomicU32::new(version),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pipeline_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Look up `(path, checksum)` under the current version without touching the file.
    pub fn lookup(&self, path: &Path, checksum: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT result_id FROM ledger WHERE path = ?1 AND checksum = ?2 AND pipeline_version = ?3",
            (path_to_db_string(path), checksum, self.pipeline_version()),
            |row| row.get(0),
        )
        .optional()
        .context("ledger lookup")
    }

    /// Hash the file's current content and look it up.
    pub fn check(&self, path: &Path) -> Result<LedgerCheck> {
        let checksum = exact_checksum(path)?;
        let reuse = self.lookup(path, &checksum)?;
        Ok(LedgerCheck { checksum, reuse })
    }

    /// `(true, None)` when the current content still needs processing, `(false, Some(id))`
    /// when it was already processed under the current version.
    pub fn should_process(&self, path: &Path) -> Result<(bool, Option<String>)> {
        let check = self.check(path)?;
        Ok((check.should_process(), check.reuse))
    }

    /// Hash the file again and record a successful processing of that content.
    pub fn mark_processed(
        &self,
        path: &Path,
        result_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let checksum = exact_checksum(path)?;
        self.record(path, &checksum, result_id, metadata)
    }

    /// Upsert an entry for content already hashed as `checksum`.
    pub fn record(
        &self,
        path: &Path,
        checksum: &str,
        result_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let meta = serde_json::to_string(metadata).context("serialize ledger metadata")?;
        let conn = self.lock();
        conn.execute(
            UPSERT_LEDGER_SQL,
            (
                path_to_db_string(path),
                checksum,
                result_id,
                unix_now(),
                self.pipeline_version(),
                meta,
            ),
        )
        .context("upsert ledger entry")?;
        Ok(())
    }

    /// Most recent entry under the current version for identical content at any path.
    pub fn find_by_content(&self, checksum: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "{SELECT_ENTRY} WHERE checksum = ?1 AND pipeline_version = ?2 \
                 ORDER BY completed_at DESC, rowid DESC LIMIT 1"
            ),
            (checksum, self.pipeline_version()),
            row_to_entry,
        )
        .optional()
        .context("ledger content lookup")
    }

    /// Every entry for `path`, newest first, across all versions.
    pub fn entries_for(&self, path: &Path) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_ENTRY} WHERE path = ?1 ORDER BY completed_at DESC, rowid DESC"
            ))
            .context("prepare ledger scan")?;
        let rows = stmt.query_map([path_to_db_string(path)], row_to_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("read ledger entries")
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM ledger", [], |row| row.get(0))
            .context("count ledger")?;
        Ok(n.max(0) as usize)
    }

    /// Bump the pipeline version. History stays on disk; nothing matches until reprocessed.
    /// Returns the new version.
    pub fn invalidate_all(&self) -> Result<u32> {
        let conn = self.lock();
        let next = self.pipeline_version().saturating_add(1);
        save_run_info(&conn, RunInfoKey::PipelineVersion, &next)?;
        self.version.store(next, Ordering::Release);
        info!("ledger invalidated; pipeline version now {}", next);
        Ok(next)
    }

    /// Align the ledger with a processing-logic tag. The first tag seen is stored as-is;
    /// a different tag later invalidates the ledger. Returns true if it invalidated.
    pub fn ensure_logic_version(&self, tag: &str) -> Result<bool> {
        let stored: Option<String> = load_run_info(&self.lock(), RunInfoKey::LogicVersion)?;
        match stored {
            Some(s) if s == tag => Ok(false),
            Some(s) => {
                debug!("logic version changed: {} -> {}", s, tag);
                self.invalidate_all()?;
                save_run_info(&self.lock(), RunInfoKey::LogicVersion, &tag)?;
                Ok(true)
            }
            None => {
                save_run_info(&self.lock(), RunInfoKey::LogicVersion, &tag)?;
                Ok(false)
            }
        }
    }

    /// Paths with at least one entry under the current pipeline version.
    pub fn processed_paths(&self) -> Result<HashSet<PathBuf>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT path FROM ledger WHERE pipeline_version = ?1")
            .context("prepare ledger path scan")?;
        let rows = stmt.query_map([self.pipeline_version()], |row| {
            row.get::<_, String>(0).map(PathBuf::from)
        })?;
        rows.collect::<rusqlite::Result<HashSet<_>>>()
            .context("read ledger paths")
    }

    /// Delete entries older than `retention` that are superseded: a newer entry exists for
    /// the same path, or they belong to an older pipeline version. Returns rows removed.
    pub fn collect_garbage(&self, retention: Duration) -> Result<usize> {
        let cutoff = unix_now() - retention.as_secs().min(i64::MAX as u64) as i64;
        let conn = self.lock();
        let removed = conn
            .execute(
                "DELETE FROM ledger WHERE completed_at <= ?1 AND (
                    pipeline_version < ?2
                    OR EXISTS (
                        SELECT 1 FROM ledger AS newer
                        WHERE newer.path = ledger.path
                          AND (newer.completed_at > ledger.completed_at
                               OR (newer.completed_at = ledger.completed_at
                                   AND newer.rowid > ledger.rowid))
                    )
                )",
                (cutoff, self.pipeline_version()),
            )
            .context("ledger garbage collection")?;
        if removed > 0 {
            debug!("ledger gc removed {} superseded entries", removed);
        }
        Ok(removed)
    }

    /// Ask SQLite to release cache memory (memory-pressure reclaim hook).
    pub fn shrink_memory(&self) {
        if let Ok(conn) = self.conn.try_lock() {
            let _ = conn.execute_batch("PRAGMA shrink_memory");
        }
    }
}
