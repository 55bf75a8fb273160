//! Divergence classification and the three-way merge engine.
//!
//! Each cycle the local head, the remote head, and their merge base are
//! resolved fresh and classified into one of four states. Same and the two
//! fast-forward shapes are trivial; the diverged path is where the engine
//! earns its keep: backup branch first, automatic merge, auto-resolution of
//! machine-regenerable lock-file conflicts, and a rollback ladder that
//! guarantees the repository is never left half-merged.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Local;
use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::git::{GitError, GitOps};
use crate::infra::config::{FailureStrategy, SyncConfig};

const BACKUP_PREFIX: &str = "backup-before-merge-";

/// How the local and remote histories relate, recomputed every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Same,
    Behind,
    Ahead,
    Diverged,
}

/// Classifies three revision identifiers into a [`BranchState`].
///
/// Order matters: equality is checked before the fast-forward shapes, so
/// `local == remote == base` lands on `Same` and not `Behind`.
pub fn classify(local: &str, remote: &str, base: &str) -> BranchState {
    if local == remote {
        BranchState::Same
    } else if local == base {
        BranchState::Behind
    } else if remote == base {
        BranchState::Ahead
    } else {
        BranchState::Diverged
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    /// Conflicts survived auto-resolution; the repository was rolled back
    /// and the named backup branch holds the pre-merge state.
    #[error("merge conflicts require manual resolution (backup branch: {backup})")]
    UnresolvedConflicts { backup: String },

    /// Every rung of the rollback ladder failed.
    #[error("rollback failed, repository may be in an inconsistent state")]
    RollbackFailed(#[source] GitError),
}

/// Reconciles the local branch with its remote counterpart.
pub struct MergeEngine {
    git: GitOps,
    remote: String,
    branch: String,
    strategy: FailureStrategy,
    lock_patterns: GlobSet,
    merge_log_lines: u32,
    backup_retention: usize,
}

impl MergeEngine {
    pub fn new(cfg: &SyncConfig, git: GitOps) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &cfg.lock_file_patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("invalid lock-file pattern {pattern:?}"))?,
            );
        }

        Ok(Self {
            git,
            remote: cfg.remote_name.clone(),
            branch: cfg.branch_name.clone(),
            strategy: cfg.merge_failure_strategy,
            lock_patterns: builder.build().context("building lock-file pattern set")?,
            merge_log_lines: cfg.merge_log_lines,
            backup_retention: cfg.backup_retention,
        })
    }

    /// Classifies divergence against the remote and executes the matching
    /// strategy. [`MergeError::UnresolvedConflicts`] is returned (after a
    /// completed rollback) when a diverged merge cannot be finished
    /// automatically.
    pub fn sync_with_remote(&self) -> Result<()> {
        // Merge must begin from a clean stage; leftovers get their own
        // commit rather than being mixed into the merge
        match self.git.has_staged_changes() {
            Ok(true) => {
                warn!("staged leftovers detected, committing before merge");
                if let Err(e) = self.git.commit("chore: commit staged changes before merge") {
                    warn!("leftover commit failed: {e}");
                }
            }
            Ok(false) => {}
            Err(e) => warn!("could not inspect staged state: {e}"),
        }

        let remote_ref = format!("{}/{}", self.remote, self.branch);
        let local = self.git.rev_parse("@").context("resolving local head")?;
        let remote = self
            .git
            .rev_parse(&remote_ref)
            .with_context(|| format!("resolving {remote_ref}"))?;
        let base = self
            .git
            .merge_base("@", &remote_ref)
            .context("resolving merge base")?;

        match classify(&local, &remote, &base) {
            BranchState::Same => {
                debug!("local and remote are identical");
                Ok(())
            }
            BranchState::Behind => {
                info!("local is behind, fast-forwarding");
                self.git
                    .pull_rebase(&self.remote, &self.branch)
                    .context("fast-forward pull")?;
                Ok(())
            }
            BranchState::Ahead => {
                info!("local is ahead, pushing");
                self.git
                    .push(&self.remote, &self.branch)
                    .context("pushing local commits")?;
                Ok(())
            }
            BranchState::Diverged => {
                warn!("histories diverged, attempting three-way merge");
                self.merge_diverged(&remote_ref)
            }
        }
    }

    fn merge_diverged(&self, remote_ref: &str) -> Result<()> {
        let backup = format!("{BACKUP_PREFIX}{}", Local::now().format("%Y%m%d-%H%M%S"));
        self.git
            .create_branch(&backup)
            .with_context(|| format!("creating backup branch {backup}"))?;
        debug!(backup, "backup branch created");

        let message = format!(
            "Auto-merge: three-way merge at {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        match self.git.merge(remote_ref, &message, self.merge_log_lines) {
            Ok(()) => {
                info!("automatic merge succeeded");
                self.push_and_drop_backup(&backup)
            }
            Err(e) => {
                debug!("merge reported conflicts: {e}");
                self.resolve_conflicts(&backup, &message)
            }
        }
    }

    /// Pushes the merged result. A push failure is surfaced but never
    /// rolls back the merge itself, and the backup branch is only dropped
    /// once the push is confirmed.
    fn push_and_drop_backup(&self, backup: &str) -> Result<()> {
        if let Err(e) = self.git.push(&self.remote, &self.branch) {
            error!("push failed, local merge is complete and backup is retained: {e}");
            return Err(e).context("pushing merge result");
        }
        info!("merge result pushed");

        if let Err(e) = self.git.delete_branch(backup) {
            warn!(backup, "backup branch cleanup failed (ignored): {e}");
        }
        Ok(())
    }

    fn resolve_conflicts(&self, backup: &str, message: &str) -> Result<()> {
        let conflicts = self
            .git
            .conflicted_files()
            .context("listing conflicted files")?;
        warn!(count = conflicts.len(), "merge conflicts detected");
        for file in &conflicts {
            warn!(file = file.as_str(), "conflicted");
        }

        // Generated lock/manifest files are machine-regenerable; taking the
        // remote version is always safe
        let mut resolved = 0usize;
        for file in &conflicts {
            if !self.is_lock_file(file) {
                continue;
            }
            debug!(file = file.as_str(), "auto-resolving lock-file conflict with remote version");
            if let Err(e) = self.git.checkout_theirs(file) {
                warn!(file = file.as_str(), "checkout of remote version failed: {e}");
                continue;
            }
            if let Err(e) = self.git.stage_path(file) {
                warn!(file = file.as_str(), "staging resolved file failed: {e}");
                continue;
            }
            resolved += 1;
        }
        if resolved > 0 {
            info!(resolved, total = conflicts.len(), "auto-resolved lock-file conflicts");
        }

        let remaining = self
            .git
            .conflicted_files()
            .context("re-listing conflicted files")?;

        if remaining.is_empty() {
            info!("all conflicts auto-resolved, completing merge");
            self.git.commit(message).context("committing merge")?;
            return self.push_and_drop_backup(backup);
        }

        error!(
            remaining = remaining.len(),
            "unresolved conflicts remain, rolling back"
        );
        self.safe_rollback(backup)?;
        Err(MergeError::UnresolvedConflicts { backup: backup.to_string() }.into())
    }

    /// Restores a known-good state after a failed merge.
    ///
    /// The ladder descends from gentlest to bluntest: abort the merge, soft
    /// reset to clear merge state, hard reset to the backup branch, and as
    /// a last resort hard reset to head. Afterwards the configured failure
    /// strategy decides whether the remote is overwritten or left alone.
    fn safe_rollback(&self, backup: &str) -> Result<()> {
        warn!("performing safe rollback");

        if let Err(e) = self.git.merge_abort() {
            warn!("merge abort failed: {e}");
            if let Err(e) = self.git.reset("HEAD", false) {
                error!("soft reset failed: {e}");
            }
        }

        info!(backup, "restoring backup branch state");
        if let Err(e) = self.git.reset(backup, true) {
            error!("reset to backup failed: {e}");
            if let Err(e) = self.git.reset("HEAD", true) {
                return Err(MergeError::RollbackFailed(e).into());
            }
        }
        info!("rollback completed");

        match self.strategy {
            FailureStrategy::ForcePush => {
                // Destructive to remote-only commits; meant for ephemeral
                // single-writer environments
                warn!("failure strategy force-push: overwriting remote with rolled-back state");
                self.git
                    .force_push(&self.remote, &self.branch)
                    .context("force-pushing rolled-back state")?;
                info!("remote force-synced");
            }
            FailureStrategy::Rollback => {
                info!(backup, "failure strategy rollback: backup branch retained for manual resolution");
            }
        }
        Ok(())
    }

    fn is_lock_file(&self, path: &str) -> bool {
        let name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        self.lock_patterns.is_match(&name)
    }

    /// Deletes backup branches beyond the retention count, oldest first.
    /// Timestamped names sort chronologically, so a plain sort suffices.
    pub fn prune_backups(&self) -> Result<usize> {
        let branches = self.git.branches().context("listing branches")?;
        let mut backups: Vec<&String> = branches
            .iter()
            .filter(|b| b.starts_with(BACKUP_PREFIX))
            .collect();

        if backups.len() <= self.backup_retention {
            debug!(
                count = backups.len(),
                retention = self.backup_retention,
                "no backup branches to prune"
            );
            return Ok(0);
        }

        backups.sort();
        let doomed: Vec<&String> = backups[..backups.len() - self.backup_retention].to_vec();
        info!(count = doomed.len(), "pruning old backup branches");

        let mut deleted = 0usize;
        let mut seen: HashSet<&str> = HashSet::new();
        for branch in doomed {
            if !seen.insert(branch.as_str()) {
                continue;
            }
            match self.git.delete_branch(branch) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(branch = branch.as_str(), "backup prune failed: {e}"),
            }
        }
        Ok(deleted)
    }
}
