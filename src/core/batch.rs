//! Chunked staging and untracking with retry and dynamic batch sizing.
//!
//! Command lines have platform length limits and one giant invocation
//! amplifies transient failures, so path sets are split into batches and
//! each batch is retried independently with exponential backoff. A batch
//! that exhausts its retries is recorded and skipped; the remaining batches
//! still run, and the caller decides what a partial failure means.

use std::{path::PathBuf, thread};

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::git::GitOps;
use crate::infra::retry::RetryPolicy;

/// Which index-affecting command a batch run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    /// `add --` on each batch
    Stage,
    /// `rm --cached --ignore-unmatch --` on each batch
    Untrack,
}

impl BatchOp {
    fn verb(self) -> &'static str {
        match self {
            BatchOp::Stage => "stage",
            BatchOp::Untrack => "untrack",
        }
    }
}

/// Outcome of one chunked run over a path set.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub batches_run: usize,
    pub batches_failed: usize,
    pub files_processed: usize,
    /// Paths belonging to batches that exhausted their retries
    pub failed_paths: Vec<PathBuf>,
    /// Wall time of each batch, in submission order
    pub batch_timings: Vec<std::time::Duration>,
}

impl BatchReport {
    pub fn fully_succeeded(&self) -> bool {
        self.batches_failed == 0
    }
}

/// Runs staging/untracking over path sets in retried chunks.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    git: GitOps,
    policy: RetryPolicy,
    batch_size: usize,
    dynamic: bool,
}

impl BatchExecutor {
    pub fn new(git: GitOps, policy: RetryPolicy, batch_size: usize, dynamic: bool) -> Self {
        Self { git, policy, batch_size: batch_size.max(1), dynamic }
    }

    /// Picks a batch size from the workload shape.
    ///
    /// Small sets go through in one call; large sets of small files take
    /// bigger chunks than sets dominated by heavyweight files, where a
    /// failed batch wastes more work on retry.
    fn effective_batch_size(&self, paths: &[PathBuf]) -> usize {
        if !self.dynamic {
            return self.batch_size;
        }
        if paths.len() < 50 {
            return paths.len().max(1);
        }
        if paths.len() < 100 {
            return 50;
        }

        let mut total: u64 = 0;
        let mut counted: u64 = 0;
        for p in paths {
            if let Ok(meta) = std::fs::metadata(self.git.root().join(p)) {
                total += meta.len();
                counted += 1;
            }
        }
        let avg = if counted > 0 { total / counted } else { 0 };

        if avg < 1024 * 1024 {
            200
        } else if avg < 10 * 1024 * 1024 {
            100
        } else {
            50
        }
    }

    /// Executes `op` over `paths` in chunks, retrying each chunk on failure.
    pub fn execute(&self, op: BatchOp, paths: &[PathBuf]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if paths.is_empty() {
            return Ok(report);
        }

        let size = self.effective_batch_size(paths);
        debug!(
            op = op.verb(),
            total = paths.len(),
            batch_size = size,
            "running chunked index operation"
        );

        for chunk in paths.chunks(size) {
            report.batches_run += 1;
            let started = std::time::Instant::now();
            let ok = self.run_chunk(op, chunk)?;
            report.batch_timings.push(started.elapsed());
            if ok {
                report.files_processed += chunk.len();
            } else {
                report.batches_failed += 1;
                report.failed_paths.extend_from_slice(chunk);
            }
        }

        if report.batches_failed > 0 {
            warn!(
                op = op.verb(),
                failed = report.batches_failed,
                total = report.batches_run,
                "some batches exhausted their retries"
            );
        }
        Ok(report)
    }

    /// Runs one chunk with retry; returns whether it eventually succeeded.
    ///
    /// Paths are root-relative; the conversion to argument strings happens
    /// here, once per attempt set.
    fn run_chunk(&self, op: BatchOp, chunk: &[PathBuf]) -> Result<bool> {
        let args: Vec<String> = chunk
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        for attempt in 1..=self.policy.max_attempts {
            let outcome = match op {
                BatchOp::Stage => self.git.stage_batch(&args),
                BatchOp::Untrack => self.git.untrack_batch(&args),
            };
            match outcome {
                Ok(()) => return Ok(true),
                // Only lock contention is transient enough to retry
                Err(e) if e.is_lock_contention() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        op = op.verb(),
                        attempt,
                        ?delay,
                        "batch hit lock contention, backing off"
                    );
                    thread::sleep(delay);
                }
                Err(e) => {
                    warn!(op = op.verb(), files = chunk.len(), "batch gave up: {e}");
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn executor(dynamic: bool) -> BatchExecutor {
        let git = GitOps::new(std::env::temp_dir());
        let policy = RetryPolicy::new(1, Duration::from_millis(1));
        BatchExecutor::new(git, policy, 100, dynamic)
    }

    fn fake_paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("missing-{i}"))).collect()
    }

    #[test]
    fn tiny_sets_fit_one_batch() {
        let exec = executor(true);
        assert_eq!(exec.effective_batch_size(&fake_paths(10)), 10);
    }

    #[test]
    fn medium_sets_take_fifty() {
        let exec = executor(true);
        assert_eq!(exec.effective_batch_size(&fake_paths(70)), 50);
    }

    #[test]
    fn large_sets_of_unstattable_paths_take_two_hundred() {
        // metadata fails for every path, so the average size is zero
        let exec = executor(true);
        assert_eq!(exec.effective_batch_size(&fake_paths(150)), 200);
    }

    #[test]
    fn static_sizing_ignores_workload() {
        let exec = executor(false);
        assert_eq!(exec.effective_batch_size(&fake_paths(3)), 100);
    }

    #[test]
    fn empty_input_is_a_clean_noop() {
        let exec = executor(true);
        let report = exec.execute(BatchOp::Stage, &[]).unwrap();
        assert_eq!(report.batches_run, 0);
        assert!(report.fully_succeeded());
    }
}
