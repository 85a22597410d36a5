//! Durable path → checksum mapping.

use anyhow::{Context, Result};
use log::debug;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::engine::tools::path_to_db_string;
use crate::types::{ChecksumKind, FileChecksum};
use crate::utils::config::DB_INSERT_BATCH_SIZE;
use crate::utils::unix_now;

use super::runinfo::{RunInfoKey, load_run_info, save_run_info};
use super::{UPSERT_CHECKSUM_SQL, open_db, open_db_in_memory};

/// Checksum store over the `checksums` table. Every operation takes the connection lock,
/// so concurrent callers are serialised; each write commits before returning.
pub struct ChecksumStore {
    conn: Mutex<Connection>,
}

fn row_to_checksum(row: &Row<'_>) -> rusqlite::Result<FileChecksum> {
    let path: String = row.get(0)?;
    let size: i64 = row.get(1)?;
    let kind: String = row.get(4)?;
    Ok(FileChecksum {
        path: PathBuf::from(path),
        size: size.max(0) as u64,
        mtime_ns: row.get(2)?,
        checksum: row.get(3)?,
        kind: ChecksumKind::from_db_str(&kind),
        last_checked: row.get(5)?,
    })
}

fn execute_upsert(stmt: &mut rusqlite::Statement<'_>, fc: &FileChecksum) -> Result<()> {
    stmt.execute((
        path_to_db_string(&fc.path),
        fc.size as i64,
        fc.mtime_ns,
        fc.checksum.as_str(),
        fc.kind.as_str(),
        fc.last_checked,
    ))
    .context("upsert checksum")?;
    Ok(())
}

impl ChecksumStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_db(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &Path) -> Result<Option<FileChecksum>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT path, size, mtime_ns, checksum, kind, last_checked FROM checksums WHERE path = ?1",
            [path_to_db_string(path)],
            row_to_checksum,
        )
        .optional()
        .context("get checksum")
    }

    /// Upsert by path.
    pub fn put(&self, fc: &FileChecksum) -> Result<()> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(UPSERT_CHECKSUM_SQL)
            .context("prepare upsert")?;
        execute_upsert(&mut stmt, fc)
    }

    /// Upsert many rows, one transaction per [`DB_INSERT_BATCH_SIZE`] chunk.
    pub fn put_many(&self, rows: &[FileChecksum]) -> Result<()> {
        let mut conn = self.lock();
        for chunk in rows.chunks(DB_INSERT_BATCH_SIZE) {
            let tx = conn.transaction().context("begin transaction")?;
            {
                let mut stmt = tx.prepare(UPSERT_CHECKSUM_SQL).context("prepare upsert")?;
                for fc in chunk {
                    execute_upsert(&mut stmt, fc)?;
                }
            }
            tx.commit().context("commit transaction")?;
        }
        Ok(())
    }

    /// Returns true if a row was removed.
    pub fn delete(&self, path: &Path) -> Result<bool> {
        let conn = self.lock();
        let n = conn
            .execute(
                "DELETE FROM checksums WHERE path = ?1",
                [path_to_db_string(path)],
            )
            .context("delete checksum")?;
        Ok(n > 0)
    }

    /// Delete many paths in one transaction. Returns the number of rows removed.
    pub fn delete_many<'a, I>(&self, paths: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction().context("begin transaction")?;
        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare("DELETE FROM checksums WHERE path = ?1")
                .context("prepare delete")?;
            for p in paths {
                removed += stmt
                    .execute([path_to_db_string(p)])
                    .context("delete checksum")?;
            }
        }
        tx.commit().context("commit transaction")?;
        Ok(removed)
    }

    /// Full table: path → row.
    pub fn all(&self) -> Result<HashMap<PathBuf, FileChecksum>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT path, size, mtime_ns, checksum, kind, last_checked FROM checksums")
            .context("prepare scan")?;
        let rows = stmt.query_map([], row_to_checksum)?;
        let mut map = HashMap::new();
        for row in rows {
            let fc = row?;
            map.insert(fc.path.clone(), fc);
        }
        Ok(map)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM checksums", [], |row| row.get(0))
            .context("count checksums")?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove rows not checked for at least `age` whose file no longer exists on disk.
    pub fn prune_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = unix_now() - age.as_secs().min(i64::MAX as u64) as i64;
        let stale: Vec<PathBuf> = self
            .all()?
            .into_values()
            .filter(|fc| fc.last_checked <= cutoff && !fc.path.exists())
            .map(|fc| fc.path)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let removed = self.delete_many(stale.iter())?;
        debug!("pruned {} checksum rows for vanished files", removed);
        Ok(removed)
    }

    /// Unix seconds of the last exact-checksum detection pass, if any.
    pub fn last_full_rescan(&self) -> Result<Option<i64>> {
        load_run_info(&self.lock(), RunInfoKey::LastFullRescan)
    }

    pub fn record_full_rescan(&self, at: i64) -> Result<()> {
        save_run_info(&self.lock(), RunInfoKey::LastFullRescan, &at)
    }

    /// Ask SQLite to release cache memory (memory-pressure reclaim hook).
    pub fn shrink_memory(&self) {
        if let Ok(conn) = self.conn.try_lock() {
            let _ = conn.execute_batch("PRAGMA shrink_memory");
        }
    }
}
