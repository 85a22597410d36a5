//! Change detection: compare a walked tree against the checksum store.

use anyhow::Result;
use log::{debug, warn};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::db_ops::ChecksumStore;
use crate::engine::hashing::{exact_checksum, fast_checksum};
use crate::engine::tools::{FileFilter, canonicalize_root, mtime_changed, path_to_db_string};
use crate::pipeline::walk::{Candidate, WalkOptions, collect_candidates};
use crate::types::{ChangeSet, ChecksumKind, FileChecksum};
use crate::utils::unix_now;

/// Detection settings beyond the include patterns.
#[derive(Clone, Debug, Default)]
pub struct DetectOptions {
    /// Hash full content and compare against stored exact checksums.
    pub exact: bool,
    pub mtime_window_ns: i64,
    pub exclude: Vec<String>,
    pub walk: WalkOptions,
}

/// Classifies files under a root as new, modified, deleted or unchanged, and keeps the
/// checksum store in step with what it reports.
pub struct ChangeDetector<'a> {
    store: &'a ChecksumStore,
    opts: DetectOptions,
}

/// Per-candidate verdict before persisting.
struct Verdict {
    path: PathBuf,
    state: State,
    /// Row to upsert, if any.
    row: Option<FileChecksum>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Modified,
    Unchanged,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a ChecksumStore) -> Self {
        Self::with_options(store, DetectOptions::default())
    }

    pub fn with_options(store: &'a ChecksumStore, opts: DetectOptions) -> Self {
        Self { store, opts }
    }

    pub fn options(&self) -> &DetectOptions {
        &self.opts
    }

    /// Walk `root` with the include `patterns`, diff against the store and persist the result:
    /// new and modified files get a fresh row, deleted files lose theirs.
    pub fn detect_changes(&self, root: &Path, patterns: &[String]) -> Result<ChangeSet> {
        let (changes, staged) = self.detect_staged(root, patterns)?;
        self.store.put_many(&staged)?;
        Ok(changes)
    }

    /// Like [`detect_changes`], but the rows for new and modified files are returned instead
    /// of written. Deletions and refreshed rows of unchanged files are still persisted.
    ///
    /// The caller commits a staged row once its file has been handled; until then the next
    /// pass keeps reporting the file as new or modified.
    ///
    /// [`detect_changes`]: ChangeDetector::detect_changes
    pub fn detect_staged(
        &self,
        root: &Path,
        patterns: &[String],
    ) -> Result<(ChangeSet, Vec<FileChecksum>)> {
        let root = canonicalize_root(root)?;
        let filter = Arc::new(FileFilter::new(&root, patterns, &self.opts.exclude)?);
        let candidates = collect_candidates(&root, Arc::clone(&filter), &self.opts.walk)?;

        let known = self.store.all()?;
        let now = unix_now();
        let exact = self.opts.exact;
        let window = self.opts.mtime_window_ns;

        let verdicts: Vec<Verdict> = candidates
            .par_iter()
            .map(|c| classify_candidate(c, known.get(&c.path), exact, window, now))
            .collect();

        let seen: HashSet<&Path> = candidates.iter().map(|c| c.path.as_path()).collect();
        let mut changes = ChangeSet::default();
        // Only rows under this root (and matching the filter) can be reported deleted.
        for path in known.keys() {
            if path.starts_with(&root) && !seen.contains(path.as_path()) && filter.includes_file(path)
            {
                changes.deleted.push(path.clone());
            }
        }

        let mut staged = Vec::new();
        let mut refreshed = Vec::new();
        for v in verdicts {
            match v.state {
                State::New => changes.new.push(v.path),
                State::Modified => changes.modified.push(v.path),
                State::Unchanged => changes.unchanged.push(v.path),
            }
            match (v.state, v.row) {
                (State::Unchanged, Some(row)) => refreshed.push(row),
                (_, Some(row)) => staged.push(row),
                (_, None) => {}
            }
        }
        changes.new.sort();
        changes.modified.sort();
        changes.deleted.sort();
        changes.unchanged.sort();

        self.store.put_many(&refreshed)?;
        if !changes.deleted.is_empty() {
            self.store.delete_many(changes.deleted.iter())?;
        }
        debug!(
            "detect: {} new, {} modified, {} deleted, {} unchanged ({} rows staged, {} refreshed, exact={})",
            changes.new.len(),
            changes.modified.len(),
            changes.deleted.len(),
            changes.unchanged.len(),
            staged.len(),
            refreshed.len(),
            exact
        );
        Ok((changes, staged))
    }
}

fn fast_row(c: &Candidate, now: i64) -> FileChecksum {
    FileChecksum {
        path: c.path.clone(),
        size: c.size,
        mtime_ns: c.mtime_ns,
        checksum: fast_checksum(&path_to_db_string(&c.path), c.size, c.mtime_ns),
        kind: ChecksumKind::Fast,
        last_checked: now,
    }
}

/// Exact row for `c`, or a fast one if the content cannot be read.
fn exact_row(c: &Candidate, now: i64) -> (FileChecksum, bool) {
    match exact_checksum(&c.path) {
        Ok(checksum) => (
            FileChecksum {
                path: c.path.clone(),
                size: c.size,
                mtime_ns: c.mtime_ns,
                checksum,
                kind: ChecksumKind::Exact,
                last_checked: now,
            },
            true,
        ),
        Err(e) => {
            warn!("detect: cannot hash {}: {:#}", c.path.display(), e);
            (fast_row(c, now), false)
        }
    }
}

fn classify_candidate(
    c: &Candidate,
    stored: Option<&FileChecksum>,
    exact: bool,
    window: i64,
    now: i64,
) -> Verdict {
    let Some(stored) = stored else {
        let row = if exact { exact_row(c, now).0 } else { fast_row(c, now) };
        return Verdict {
            path: c.path.clone(),
            state: State::New,
            row: Some(row),
        };
    };

    // Size alone decides when mtime resolution is too coarse to move.
    let cheap_changed = stored.size != c.size || mtime_changed(c.mtime_ns, stored.mtime_ns, window);

    if !exact {
        return Verdict {
            path: c.path.clone(),
            state: if cheap_changed { State::Modified } else { State::Unchanged },
            row: cheap_changed.then(|| fast_row(c, now)),
        };
    }

    let (row, hashed) = exact_row(c, now);
    let changed = if hashed && stored.kind == ChecksumKind::Exact {
        row.checksum != stored.checksum
    } else {
        cheap_changed
    };
    // Keep the refreshed row even when unchanged: it upgrades fast rows and absorbs touches.
    let needs_write = changed
        || stored.kind != row.kind
        || stored.mtime_ns != row.mtime_ns
        || stored.checksum != row.checksum;
    Verdict {
        path: c.path.clone(),
        state: if changed { State::Modified } else { State::Unchanged },
        row: needs_write.then_some(row),
    }
}
