//! Working-tree traversal with early directory pruning.
//!
//! Backed by the `ignore` crate's `WalkBuilder`. The reconciler must see
//! every file inside a special repository, including files its inner
//! `.gitignore` would hide, so the standard ignore filters are switched off;
//! noise directories (dependency caches, virtual environments) and the
//! nested metadata directory are pruned during traversal rather than
//! filtered afterwards, so their subtrees are never entered at all.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Result;
use ignore::WalkBuilder;

/// Walker that prunes directories by name while collecting files.
pub struct PrunedWalker {
    prune_names: Vec<OsString>,
}

impl PrunedWalker {
    /// `prune_names` are directory basenames skipped wholesale
    /// (e.g. `.git`, `node_modules`, `venv`).
    pub fn new(prune_names: &[String]) -> Self {
        Self {
            prune_names: prune_names.iter().map(OsString::from).collect(),
        }
    }

    /// Collects every file under `root`, entering pruned directories never.
    ///
    /// Returns the files plus the pruned directories that were actually hit,
    /// so the caller can log what was excluded.
    pub fn collect_files(&self, root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mut files = Vec::new();
        let mut pruned = Vec::new();
        let prune_names = self.prune_names.clone();

        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !(is_dir && prune_names.iter().any(|n| n.as_os_str() == entry.file_name()))
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                // Unreadable entries are skipped, not fatal
                Err(_) => continue,
            };
            if entry.file_type().is_some_and(|t| t.is_file()) {
                files.push(entry.into_path());
            }
        }

        // Record which pruned dirs exist directly under the walked tree;
        // deeper occurrences were never entered.
        for name in &self.prune_names {
            let candidate = root.join(name);
            if candidate.is_dir() {
                pruned.push(candidate);
            }
        }

        Ok((files, pruned))
    }
}

/// Collects every file under `dir` with no pruning at all.
pub fn collect_all_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .build()
    {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_some_and(|t| t.is_file()) {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}
