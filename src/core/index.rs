//! Atomic bulk mutation of the tracked index under lock contention.
//!
//! All index writes funnel through [`IndexMutator::apply`], which converts a
//! batch of per-file write intents into one `git update-index --index-info`
//! call. One external process invocation per batch instead of one per file
//! is the dominant performance decision of the whole engine.
//!
//! The underlying tool guards its index with a filesystem lock marker.
//! Before each attempt the marker is inspected: an aged-out marker is
//! deleted as abandoned, a younger one is treated as legitimately held and
//! waited out without consuming an attempt. Contention surfaced by the bulk
//! call itself is retried with exponential backoff; exhausting the budget is
//! fatal, because a half-mutated index must never be silently accepted.

use std::{fs, path::Path, thread, time::Duration};

use anyhow::Result;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::core::git::GitOps;
use crate::infra::retry::{RetryExhausted, RetryPolicy};

/// Write intent for one tracked entry. Path is root-relative, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    pub mode: FileMode,
    pub hash: String,
    pub path: String,
}

/// Index entry mode; only regular and executable blobs are produced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Regular,
    Executable,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
        }
    }

    /// Derives the mode from filesystem metadata (any execute bit wins).
    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 != 0 {
            FileMode::Executable
        } else {
            FileMode::Regular
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_meta: &fs::Metadata) -> Self {
        FileMode::Regular
    }
}

/// What the lock-marker inspection decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDisposition {
    /// No marker present
    Absent,
    /// Marker aged past the staleness threshold and was deleted
    RemovedStale,
    /// Marker is young; a legitimate holder is assumed
    Held,
}

/// Inspects (and possibly deletes) the index lock marker at `lock_path`.
///
/// The age heuristic is the only way to distinguish an abandoned marker from
/// one held by a live external process, since that process is not ours to
/// ask.
pub fn check_lock_marker(lock_path: &Path, max_age: Duration) -> LockDisposition {
    let Ok(meta) = fs::metadata(lock_path) else {
        return LockDisposition::Absent;
    };

    let age = meta
        .modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .unwrap_or(Duration::ZERO);

    if age > max_age {
        warn!(?age, "removing stale index lock marker");
        if let Err(e) = fs::remove_file(lock_path) {
            warn!("failed to remove stale lock marker: {e}");
            return LockDisposition::Held;
        }
        LockDisposition::RemovedStale
    } else {
        debug!(?age, "index lock marker held by a live actor");
        LockDisposition::Held
    }
}

/// Applies batches of [`FileOperation`]s to the index atomically.
#[derive(Debug, Clone)]
pub struct IndexMutator {
    git: GitOps,
    policy: RetryPolicy,
    lock_max_age: Duration,
    lock_wait: Duration,
}

impl IndexMutator {
    pub fn new(
        git: GitOps,
        policy: RetryPolicy,
        lock_max_age: Duration,
        lock_wait: Duration,
    ) -> Self {
        Self { git, policy, lock_max_age, lock_wait }
    }

    /// Applies all operations as one bulk index update.
    ///
    /// Within the batch, the last write for a given path wins. The call is
    /// the single serialization point for a reconciliation job, so the
    /// resulting index mutation is atomic relative to other readers.
    pub fn apply(&self, operations: &[FileOperation]) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }

        // Last write wins; IndexMap keeps first-seen ordering for the payload
        let mut deduped: IndexMap<&str, &FileOperation> =
            IndexMap::with_capacity(operations.len());
        for op in operations {
            deduped.insert(op.path.as_str(), op);
        }

        let mut payload = String::new();
        for op in deduped.values() {
            payload.push_str(&format!("{} {}\t{}\n", op.mode.as_str(), op.hash, op.path));
        }

        let lock_path = self.git.index_lock_path();
        let mut last_error = None;

        let mut attempt = 1u32;
        while attempt <= self.policy.max_attempts {
            // Waiting on a live holder does not consume an attempt; the
            // marker eventually ages into staleness, so this terminates.
            if check_lock_marker(&lock_path, self.lock_max_age) == LockDisposition::Held {
                thread::sleep(self.lock_wait);
                continue;
            }

            debug!(
                attempt,
                max = self.policy.max_attempts,
                files = deduped.len(),
                "bulk index update"
            );

            match self.git.update_index_info(&payload) {
                Ok(()) => {
                    debug!(files = deduped.len(), "index update succeeded");
                    return Ok(());
                }
                Err(e) if e.is_lock_contention() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(attempt, ?delay, "index update hit lock contention; backing off");
                    thread::sleep(delay);
                    last_error = Some(e);
                    attempt += 1;
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        let attempts = attempt.min(self.policy.max_attempts);
        let last = last_error
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("unknown failure"));
        Err(RetryExhausted::new("bulk index update", attempts, last).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_marker_reports_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join("index.lock");
        assert_eq!(
            check_lock_marker(&lock, Duration::from_secs(60)),
            LockDisposition::Absent
        );
    }

    #[test]
    fn young_marker_is_held_and_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join("index.lock");
        fs::write(&lock, "").unwrap();

        assert_eq!(
            check_lock_marker(&lock, Duration::from_secs(60)),
            LockDisposition::Held
        );
        assert!(lock.exists());
    }

    #[test]
    fn stale_marker_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = tmp.path().join("index.lock");
        fs::write(&lock, "").unwrap();

        // Age the marker well past the threshold
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&lock, old).unwrap();

        assert_eq!(
            check_lock_marker(&lock, Duration::from_secs(60)),
            LockDisposition::RemovedStale
        );
        assert!(!lock.exists());
    }

    #[test]
    fn file_mode_strings() {
        assert_eq!(FileMode::Regular.as_str(), "100644");
        assert_eq!(FileMode::Executable.as_str(), "100755");
    }
}
