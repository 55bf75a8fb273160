//! One synchronization cycle, end to end.
//!
//! A cycle settles embedded repositories first, sweeps their residue, then
//! handles ordinary tracked-file changes, commits everything once, and
//! finally reconciles with the remote. Phase failures before the remote
//! sync are logged and the cycle presses on; only the remote sync outcome
//! is surfaced to the caller, which owns cross-cycle failure counting.

use std::{path::PathBuf, thread};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::core::batch::{BatchExecutor, BatchOp};
use crate::core::cache::HashCache;
use crate::core::git::GitOps;
use crate::core::index::{IndexMutator, LockDisposition, check_lock_marker};
use crate::core::merge::MergeEngine;
use crate::core::reconcile::Reconciler;
use crate::infra::config::SyncConfig;

/// Owns every component and drives them through cycles.
pub struct SyncAgent {
    cfg: SyncConfig,
    git: GitOps,
    reconciler: Reconciler,
    batches: BatchExecutor,
    merge: MergeEngine,
}

impl SyncAgent {
    pub fn new(cfg: SyncConfig, git: GitOps) -> Result<Self> {
        let cache = HashCache::new();
        let mutator = IndexMutator::new(
            git.clone(),
            cfg.index_retry_policy(),
            cfg.lock_max_age(),
            cfg.lock_wait(),
        );
        let batches = BatchExecutor::new(
            git.clone(),
            cfg.batch_retry_policy(),
            cfg.batch_size,
            cfg.dynamic_batching,
        );
        let reconciler =
            Reconciler::new(&cfg, git.clone(), cache, mutator, batches.clone())?;
        let merge = MergeEngine::new(&cfg, git.clone())?;

        Ok(Self { cfg, git, reconciler, batches, merge })
    }

    /// Runs one full cycle. The returned error covers only the remote-sync
    /// phase; everything before it degrades to log output so a single bad
    /// phase cannot wedge the agent.
    pub fn run_cycle(&self) -> Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        info!(%timestamp, "starting sync cycle");

        self.clear_stale_lock();
        self.health_check();

        match self.reconciler.run() {
            Ok(report) if !report.fully_succeeded() => {
                error!(
                    failed = report.failures.len(),
                    total = report.jobs_total,
                    "embedded repository reconciliation partially failed"
                );
            }
            Ok(_) => {}
            Err(e) => error!("embedded repository reconciliation failed: {e:#}"),
        }

        match self.reconciler.sweep_orphans() {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "orphan sweep removed stale metadata"),
            Err(e) => error!("orphan sweep failed: {e:#}"),
        }

        if let Err(e) = self.untrack_newly_ignored() {
            error!("ignored-file cleanup failed: {e:#}");
        }
        if let Err(e) = self.untrack_deleted() {
            error!("deleted-file cleanup failed: {e:#}");
        }
        if let Err(e) = self.stage_modified() {
            error!("staging modified files failed: {e:#}");
        }

        self.unified_commit(&timestamp.to_string());

        // Remote sync is the only phase whose failure the caller sees
        self.git
            .fetch(&self.cfg.remote_name)
            .context("fetching from remote")?;
        self.merge
            .sync_with_remote()
            .context("syncing with remote")?;

        if let Err(e) = self.merge.prune_backups() {
            warn!("backup branch pruning failed: {e:#}");
        }

        info!("sync cycle complete");
        Ok(())
    }

    /// Clears an abandoned index lock before the cycle touches the index;
    /// a young lock is waited out once, then the cycle proceeds and lets
    /// per-call retry handle any remaining contention.
    fn clear_stale_lock(&self) {
        let lock = self.git.index_lock_path();
        if check_lock_marker(&lock, self.cfg.lock_max_age()) == LockDisposition::Held {
            info!("index lock held, waiting before cycle start");
            thread::sleep(self.cfg.lock_wait());
        }
    }

    /// Verifies the repository answers basic queries; a failing status
    /// check is repaired with a soft index reset.
    fn health_check(&self) {
        if let Err(e) = self.git.status_porcelain() {
            warn!("status check failed, rebuilding index: {e}");
            if let Err(e) = self.git.reset("HEAD", false) {
                error!("index rebuild failed: {e}");
            }
        }
        match self.git.has_staged_changes() {
            Ok(true) => debug!("staging area carries changes from a previous phase"),
            Ok(false) => {}
            Err(e) => warn!("could not inspect staging area: {e}"),
        }
    }

    /// Root-relative prefixes of every embedded repository; their files are
    /// owned by the reconciler and excluded from ordinary-file handling.
    fn special_repo_prefixes(&self) -> Vec<String> {
        let mut prefixes = Vec::new();
        for base in &self.cfg.special_base_dirs {
            let base_path = self.git.root().join(base);
            if Reconciler::is_special_repo(&base_path) {
                prefixes.push(base.clone());
            }
            if let Ok(entries) = std::fs::read_dir(&base_path) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() && Reconciler::is_special_repo(&path) {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        prefixes.push(format!("{base}/{name}"));
                    }
                }
            }
        }
        prefixes
    }

    fn in_special_repo(prefixes: &[String], path: &str) -> bool {
        prefixes.iter().any(|p| path.starts_with(&format!("{p}/")))
    }

    /// Untracks files that newer ignore rules now exclude, leaving embedded
    /// repositories and virtualized metadata alone.
    fn untrack_newly_ignored(&self) -> Result<()> {
        let ignored = self.git.ls_files(&[
            "-z",
            "--cached",
            "--ignored",
            "--exclude-standard",
            "--",
            ".",
        ])?;
        if ignored.is_empty() {
            return Ok(());
        }

        let prefixes = self.special_repo_prefixes();
        let doomed: Vec<PathBuf> = ignored
            .iter()
            .filter(|p| !p.is_empty())
            .filter(|p| !Self::in_special_repo(&prefixes, p))
            .filter(|p| !p.contains("/gitdir/") && !p.contains("/gitdir.tar"))
            .map(PathBuf::from)
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }
        info!(files = doomed.len(), "untracking newly ignored files");
        let report = self.batches.execute(BatchOp::Untrack, &doomed)?;
        debug!(
            processed = report.files_processed,
            failed = report.batches_failed,
            "ignored-file cleanup done"
        );
        Ok(())
    }

    fn untrack_deleted(&self) -> Result<()> {
        let deleted =
            self.git
                .ls_files(&["-z", "--deleted", "--exclude-standard", "--", "."])?;
        let prefixes = self.special_repo_prefixes();
        let doomed: Vec<PathBuf> = deleted
            .iter()
            .filter(|p| !p.is_empty())
            .filter(|p| !Self::in_special_repo(&prefixes, p))
            .map(PathBuf::from)
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }
        info!(files = doomed.len(), "untracking deleted files");
        self.batches.execute(BatchOp::Untrack, &doomed)?;
        Ok(())
    }

    fn stage_modified(&self) -> Result<()> {
        let changed = self.git.ls_files(&[
            "-z",
            "--modified",
            "--others",
            "--exclude-standard",
            "--",
            ".",
        ])?;
        let prefixes = self.special_repo_prefixes();
        let to_stage: Vec<PathBuf> = changed
            .iter()
            .filter(|p| !p.is_empty())
            .filter(|p| !Self::in_special_repo(&prefixes, p))
            .map(PathBuf::from)
            .collect();

        if to_stage.is_empty() {
            debug!("no ordinary file changes");
            return Ok(());
        }
        info!(files = to_stage.len(), "staging modified and new files");
        let report = self.batches.execute(BatchOp::Stage, &to_stage)?;
        if !report.fully_succeeded() {
            warn!(
                failed = report.batches_failed,
                "some staging batches failed, their files retry next cycle"
            );
        }
        Ok(())
    }

    /// Single commit point for everything the earlier phases staged,
    /// pushed immediately to narrow the race window against the remote.
    fn unified_commit(&self, timestamp: &str) {
        match self.git.has_staged_changes() {
            Ok(true) => {
                let message =
                    format!("{} all changes at {timestamp}", self.cfg.commit_msg_prefix);
                match self.git.commit(&message) {
                    Ok(()) => {
                        info!("committed staged changes");
                        if let Err(e) =
                            self.git.push(&self.cfg.remote_name, &self.cfg.branch_name)
                        {
                            warn!("immediate push failed, retrying after merge: {e}");
                        }
                    }
                    Err(e) => error!("commit failed: {e}"),
                }
            }
            Ok(false) => debug!("nothing to commit this cycle"),
            Err(e) => error!("could not inspect staged changes: {e}"),
        }
    }
}
