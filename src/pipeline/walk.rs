//! Tree walk for change detection: walk thread → path channel → stat workers → candidates.

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, UNIX_EPOCH};

use crate::engine::tools::FileFilter;

/// Path channel capacity. The walk blocks on send once stat workers fall this far behind.
pub const WALK_CHANNEL_CAP: usize = 50_000;

/// Walk settings for one detection pass.
#[derive(Clone, Debug)]
pub struct WalkOptions {
    pub follow_links: bool,
    /// jwalk (parallel directory reads) instead of walkdir.
    pub parallel: bool,
    pub stat_workers: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            parallel: false,
            stat_workers: 4,
        }
    }
}

/// A file found by the walk, with the cheap change signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ns: i64,
}

/// One result from a directory walk: a regular file, something to ignore, or an error.
pub enum WalkOutcome {
    File(PathBuf),
    Skip,
    Err { msg: String, path: Option<PathBuf> },
}

fn to_outcome_jwalk(r: Result<jwalk::DirEntry<((), ())>, jwalk::Error>) -> WalkOutcome {
    match r {
        Ok(entry) if entry.file_type().is_file() => WalkOutcome::File(entry.path()),
        Ok(_) => WalkOutcome::Skip,
        Err(err) => WalkOutcome::Err {
            msg: format!("{}", err),
            path: err.path().map(PathBuf::from),
        },
    }
}

fn to_outcome_walkdir(r: Result<walkdir::DirEntry, walkdir::Error>) -> WalkOutcome {
    match r {
        Ok(entry) if entry.file_type().is_file() => WalkOutcome::File(entry.into_path()),
        Ok(_) => WalkOutcome::Skip,
        Err(err) => WalkOutcome::Err {
            msg: format!("{}", err),
            path: err.path().map(PathBuf::from),
        },
    }
}

fn jwalk_iter(
    root: &Path,
    filter: Arc<FileFilter>,
    follow_links: bool,
) -> Box<dyn Iterator<Item = WalkOutcome>> {
    use jwalk::Parallelism;
    Box::new(
        jwalk::WalkDir::new(root)
            .follow_links(follow_links)
            .skip_hidden(false)
            .parallelism(Parallelism::RayonDefaultPool {
                busy_timeout: Duration::from_secs(60),
            })
            .process_read_dir(move |_depth, _path, _state, children| {
                children.retain(|child| match child {
                    Ok(e) if e.file_type().is_dir() => filter.includes_dir(&e.path()),
                    _ => true,
                });
            })
            .into_iter()
            .map(to_outcome_jwalk),
    )
}

fn walkdir_iter(
    root: &Path,
    filter: Arc<FileFilter>,
    follow_links: bool,
) -> Box<dyn Iterator<Item = WalkOutcome>> {
    Box::new(
        walkdir::WalkDir::new(root)
            .follow_links(follow_links)
            .into_iter()
            .filter_entry(move |e| !e.file_type().is_dir() || filter.includes_dir(e.path()))
            .map(to_outcome_walkdir),
    )
}

/// Consume `iter`, send included files to `path_tx`, log and count walk errors.
/// Returns (paths sent, errors skipped).
fn run_walk_loop<I>(path_tx: Sender<PathBuf>, filter: &FileFilter, iter: I) -> (usize, usize)
where
    I: Iterator<Item = WalkOutcome>,
{
    let mut sent = 0_usize;
    let mut skipped = 0_usize;
    for outcome in iter {
        match outcome {
            WalkOutcome::File(path) => {
                if !filter.includes_file(&path) {
                    continue;
                }
                if path_tx.send(path).is_err() {
                    break;
                }
                sent += 1;
            }
            WalkOutcome::Skip => {}
            WalkOutcome::Err { msg, path } => {
                skipped += 1;
                match path {
                    Some(p) => warn!("walk: skipping {}: {}", p.display(), msg),
                    None => warn!("walk: {}", msg),
                }
            }
        }
    }
    drop(path_tx);
    (sent, skipped)
}

fn spawn_walk_thread(
    root: PathBuf,
    filter: Arc<FileFilter>,
    opts: &WalkOptions,
    path_tx: Sender<PathBuf>,
) -> JoinHandle<(usize, usize)> {
    let (parallel, follow_links) = (opts.parallel, opts.follow_links);
    thread::spawn(move || {
        let iter = match parallel {
            true => jwalk_iter(&root, Arc::clone(&filter), follow_links),
            false => walkdir_iter(&root, Arc::clone(&filter), follow_links),
        };
        run_walk_loop(path_tx, &filter, iter)
    })
}

/// Size and mtime (ns since epoch) for one path. `None` when it vanished mid-walk.
pub fn stat_candidate(path: &Path) -> Option<Candidate> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0);
    Some(Candidate {
        path: path.to_path_buf(),
        size: meta.len(),
        mtime_ns,
    })
}

fn spawn_stat_workers(
    path_rx: Receiver<PathBuf>,
    cand_tx: &Sender<Candidate>,
    n: usize,
) -> Vec<JoinHandle<()>> {
    (0..n.max(1))
        .map(|_| {
            let path_rx = path_rx.clone();
            let cand_tx = cand_tx.clone();
            thread::spawn(move || {
                while let Ok(path) = path_rx.recv() {
                    match stat_candidate(&path) {
                        Some(c) => {
                            if cand_tx.send(c).is_err() {
                                break;
                            }
                        }
                        None => debug!("walk: {} vanished before stat", path.display()),
                    }
                }
            })
        })
        .collect()
}

/// Walk `root` (already canonical) and return every included regular file with its size and
/// mtime. Unreadable entries are logged and skipped.
pub fn collect_candidates(
    root: &Path,
    filter: Arc<FileFilter>,
    opts: &WalkOptions,
) -> Result<Vec<Candidate>> {
    let (path_tx, path_rx) = bounded::<PathBuf>(WALK_CHANNEL_CAP);
    let (cand_tx, cand_rx) = bounded::<Candidate>(WALK_CHANNEL_CAP);

    let walk_handle = spawn_walk_thread(root.to_path_buf(), filter, opts, path_tx);
    let workers = spawn_stat_workers(path_rx, &cand_tx, opts.stat_workers);
    // Dropping the last sender closes the channel once workers exit.
    drop(cand_tx);

    let mut out = Vec::new();
    while let Ok(c) = cand_rx.recv() {
        out.push(c);
    }
    let (sent, skipped) = walk_handle
        .join()
        .map_err(|_| anyhow!("walk thread panicked"))?;
    for h in workers {
        h.join().map_err(|_| anyhow!("stat worker panicked"))?;
    }
    debug!(
        "walk: {} paths sent, {} stat'd, {} walk errors skipped",
        sent,
        out.len(),
        skipped
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sorted_names(cands: &[Candidate], root: &Path) -> Vec<String> {
        let mut v: Vec<String> = cands
            .iter()
            .map(|c| {
                c.path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        v.sort();
        v
    }

    #[test]
    fn walk_applies_patterns_and_prunes_excluded_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("docs/skip")).unwrap();
        fs::write(root.join("a.md"), "a").unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::write(root.join("docs/c.md"), "c").unwrap();
        fs::write(root.join("docs/skip/d.md"), "d").unwrap();
        fs::write(root.join(".ingestkit"), "db").unwrap();

        let filter =
            Arc::new(FileFilter::new(&root, &["*.md".into()], &["skip/".into()]).unwrap());
        for parallel in [false, true] {
            let opts = WalkOptions {
                parallel,
                ..WalkOptions::default()
            };
            let cands = collect_candidates(&root, Arc::clone(&filter), &opts).unwrap();
            assert_eq!(sorted_names(&cands, &root), vec!["a.md", "docs/c.md"]);
        }
    }

    #[test]
    fn stat_reports_size() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f.bin");
        fs::write(&p, [0_u8; 17]).unwrap();
        let c = stat_candidate(&p).unwrap();
        assert_eq!(c.size, 17);
        assert!(c.mtime_ns > 0);
        assert!(stat_candidate(&tmp.path().join("missing")).is_none());
    }
}
