//! Path and filter utilities

use anyhow::{Context, Result};
use ignore::overrides::{Override, OverrideBuilder};
use std::path::{Path, PathBuf};

use crate::utils::config::PackagePaths;

/// Convert absolute path to relative path from base
pub fn path_relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    path.strip_prefix(base).ok().map(|p| p.to_path_buf())
}

/// Store key for a path: forward slashes regardless of platform.
pub fn path_to_db_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Check if a file should be excluded based on OS-specific hidden files
pub fn is_os_hidden_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    matches!(
        name,
        ".DS_Store" | ".AppleDouble" | ".LSOverride" | "Thumbs.db" | "ehthumbs.db" | "Desktop.ini"
    ) || name.starts_with("._")
}

/// Check if mtime has changed beyond tolerance window
pub fn mtime_changed(new_mtime: i64, old_mtime: i64, tolerance_ns: i64) -> bool {
    let mtime_diff = (new_mtime - old_mtime).abs();
    mtime_diff > tolerance_ns
}

/// Include/exclude matcher for the walk, using gitignore glob syntax.
///
/// With no include patterns every file is a candidate. Excludes (user patterns plus our own
/// state files) always win over includes.
pub struct FileFilter {
    root: PathBuf,
    /// Includes as whitelist globs followed by negated excludes (last match wins).
    files: Override,
    /// Negated excludes only; used to prune directories.
    dirs: Override,
}

impl FileFilter {
    pub fn new(root: &Path, include: &[String], exclude: &[String]) -> Result<Self> {
        let mut files = OverrideBuilder::new(root);
        let mut dirs = OverrideBuilder::new(root);
        for pattern in include {
            files
                .add(pattern)
                .with_context(|| format!("invalid file pattern {pattern:?}"))?;
        }
        let defaults = PackagePaths::get().default_exclude_patterns();
        for pattern in exclude.iter().chain(defaults.iter()) {
            let negated = format!("!{}", pattern.strip_prefix('!').unwrap_or(pattern));
            files
                .add(&negated)
                .with_context(|| format!("invalid exclude pattern {pattern:?}"))?;
            dirs.add(&negated)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            files: files.build().context("build file filter")?,
            dirs: dirs.build().context("build directory filter")?,
        })
    }

    /// True if the file at `path` (absolute, under root) should be scanned.
    pub fn includes_file(&self, path: &Path) -> bool {
        if path == self.root || is_os_hidden_file(path) {
            return false;
        }
        !self.files.matched(path, false).is_ignore()
    }

    /// True if the walk should descend into `dir`. Only excludes apply to directories;
    /// include patterns describe files.
    pub fn includes_dir(&self, dir: &Path) -> bool {
        dir == self.root || !self.dirs.matched(dir, true).is_ignore()
    }
}

/// Canonicalize the source root, failing if it is not a directory.
pub fn canonicalize_root(path: &Path) -> Result<PathBuf> {
    let root = path
        .canonicalize()
        .with_context(|| format!("canonicalize {}", path.display()))?;
    if !root.is_dir() {
        anyhow::bail!("source root is not a directory: {}", root.display());
    }
    Ok(root)
}
