//! Small JSON bookkeeping rows in the `runinfo` table.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Known runinfo keys.
#[derive(Clone, Copy, Debug)]
pub enum RunInfoKey {
    /// Unix seconds of the last detection pass that used exact checksums.
    LastFullRescan,
    /// Current ledger pipeline version (u32).
    PipelineVersion,
    /// Processing-logic tag the ledger version was last aligned with.
    LogicVersion,
}

impl RunInfoKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunInfoKey::LastFullRescan => "last_full_rescan",
            RunInfoKey::PipelineVersion => "ledger.pipeline_version",
            RunInfoKey::LogicVersion => "ledger.logic_version",
        }
    }
}

/// Load and decode a runinfo row. `Ok(None)` when the key is absent.
pub fn load_run_info<T: DeserializeOwned>(conn: &Connection, key: RunInfoKey) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM runinfo WHERE key = ?1",
            [key.as_str()],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("load runinfo {}", key.as_str()))?;
    data.map(|s| {
        serde_json::from_str(&s).with_context(|| format!("parse runinfo {}", key.as_str()))
    })
    .transpose()
}

pub fn save_run_info<T: Serialize>(conn: &Connection, key: RunInfoKey, value: &T) -> Result<()> {
    let json = serde_json::to_string(value).context("serialize runinfo")?;
    conn.execute(
        "INSERT OR REPLACE INTO runinfo (key, data) VALUES (?1, ?2)",
        [key.as_str(), json.as_str()],
    )
    .with_context(|| format!("save runinfo {}", key.as_str()))?;
    Ok(())
}
