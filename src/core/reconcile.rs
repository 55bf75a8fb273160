//! Embedded-repository virtualization and reconciliation.
//!
//! A directory carrying its own git metadata cannot be tracked by a parent
//! repository as-is: the nested `.git` would either be swallowed as a
//! gitlink or corrupt the parent index. The reconciler instead virtualizes
//! it, tracking every nested metadata file under a `gitdir/` stand-in path
//! while the working contents are tracked normally. Each cycle re-walks the
//! embedded repositories, re-hashes what changed (through the identity
//! cache), applies the result as one atomic index mutation, and removes
//! entries whose backing files are gone.
//!
//! Jobs run concurrently on a pool capped at the job count; file hashing
//! inside a job fans out on a second, globally shared pool. The two pools
//! are distinct, so a job thread blocking on hash results never starves the
//! hashing threads it is waiting for.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use indexmap::IndexSet;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::core::batch::{BatchExecutor, BatchOp};
use crate::core::cache::HashCache;
use crate::core::classify::classify_by_size;
use crate::core::git::GitOps;
use crate::core::index::{FileMode, FileOperation, IndexMutator};
use crate::infra::config::SyncConfig;
use crate::infra::walk::{PrunedWalker, collect_all_files};

/// Real nested metadata directory name.
const META_DIR: &str = ".git";
/// Virtualized stand-in segment under which nested metadata is tracked.
const VIRT_DIR: &str = "gitdir";

/// One embedded repository to reconcile this cycle.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    /// Root-relative path, `/`-separated
    pub rel: String,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Short name for logging
    pub name: String,
}

/// Aggregate outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub jobs_total: usize,
    pub operations_applied: usize,
    pub deletions: usize,
    /// One entry per failed job; siblings are unaffected
    pub failures: Vec<String>,
}

impl ReconcileReport {
    pub fn fully_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct JobOutcome {
    operations: usize,
    deletions: usize,
}

/// Discovers and reconciles embedded repositories under the configured
/// base directories.
pub struct Reconciler {
    git: GitOps,
    cache: HashCache,
    mutator: IndexMutator,
    batches: BatchExecutor,
    hash_pool: Arc<rayon::ThreadPool>,
    walker: PrunedWalker,
    base_dirs: Vec<String>,
    small_limit: u64,
    medium_limit: u64,
    max_workers: usize,
}

impl Reconciler {
    pub fn new(
        cfg: &SyncConfig,
        git: GitOps,
        cache: HashCache,
        mutator: IndexMutator,
        batches: BatchExecutor,
    ) -> Result<Self> {
        let hash_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.max_workers.max(1))
            .thread_name(|i| format!("hash-{i}"))
            .build()
            .context("building shared hashing pool")?;

        // The nested metadata directory is walked separately, never as
        // ordinary working content
        let mut prune = cfg.noise_dirs.clone();
        prune.push(META_DIR.to_string());

        Ok(Self {
            git,
            cache,
            mutator,
            batches,
            hash_pool: Arc::new(hash_pool),
            walker: PrunedWalker::new(&prune),
            base_dirs: cfg.special_base_dirs.clone(),
            small_limit: cfg.small_file_threshold,
            medium_limit: cfg.medium_file_threshold,
            max_workers: cfg.max_workers.max(1),
        })
    }

    /// Reconciles every discovered embedded repository.
    ///
    /// Jobs run concurrently; a broken job is recorded in the report and
    /// never blocks its siblings.
    pub fn run(&self) -> Result<ReconcileReport> {
        let jobs = self.discover_jobs()?;
        let mut report = ReconcileReport { jobs_total: jobs.len(), ..Default::default() };

        if jobs.is_empty() {
            debug!("no embedded repositories to reconcile");
            return Ok(report);
        }

        let workers = self.max_workers.min(jobs.len());
        info!(repos = jobs.len(), workers, "reconciling embedded repositories");

        let job_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("reconcile-{i}"))
            .build()
            .context("building reconciliation worker pool")?;

        let outcomes: Vec<(String, Result<JobOutcome>)> = job_pool.install(|| {
            jobs.par_iter()
                .map(|job| (job.name.clone(), self.process_job(job)))
                .collect()
        });

        for (name, outcome) in outcomes {
            match outcome {
                Ok(o) => {
                    report.operations_applied += o.operations;
                    report.deletions += o.deletions;
                }
                Err(e) => {
                    error!(repo = %name, "reconciliation failed: {e:#}");
                    report.failures.push(format!("{name}: {e:#}"));
                }
            }
        }

        if report.failures.is_empty() {
            info!(
                repos = report.jobs_total,
                operations = report.operations_applied,
                deletions = report.deletions,
                "embedded repositories settled"
            );
        } else {
            warn!(
                failed = report.failures.len(),
                total = report.jobs_total,
                "some embedded repositories failed to reconcile"
            );
        }
        Ok(report)
    }

    /// A directory is special when it carries nested metadata in any of its
    /// three shapes: live, previously virtualized, or archived.
    pub fn is_special_repo(path: &Path) -> bool {
        path.join(META_DIR).is_dir()
            || path.join(VIRT_DIR).is_dir()
            || path.join("gitdir.tar").is_file()
    }

    /// Collects candidate directories and filters them down to jobs.
    ///
    /// Candidates come from three sources per base directory: the base
    /// itself, its first-level subdirectories, and the parents of tracked
    /// virtualized-metadata paths. The last source is what keeps a
    /// repository deleted from disk discoverable, so its index entries can
    /// be reaped.
    fn discover_jobs(&self) -> Result<Vec<ReconcileJob>> {
        let mut candidates: IndexSet<String> = IndexSet::new();

        for base in &self.base_dirs {
            let base_path = self.git.root().join(base);
            if base_path.is_dir() {
                candidates.insert(base.clone());
            }

            if let Ok(entries) = fs::read_dir(&base_path) {
                for entry in entries.flatten() {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        candidates.insert(format!("{base}/{name}"));
                    }
                }
            }

            match self.git.ls_files(&["--cached", "--", base]) {
                Ok(tracked) => {
                    for path in tracked {
                        if let Some((prefix, _)) = path.split_once(&format!("/{VIRT_DIR}/")) {
                            candidates.insert(prefix.to_string());
                        }
                    }
                }
                Err(e) => debug!(base, "could not list tracked paths: {e}"),
            }
        }

        let mut jobs = Vec::new();
        for rel in candidates {
            let path = self.git.root().join(&rel);
            if Self::is_special_repo(&path) || !path.exists() {
                let name = Path::new(&rel)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| rel.clone());
                jobs.push(ReconcileJob { rel, path, name });
            }
        }
        Ok(jobs)
    }

    fn process_job(&self, job: &ReconcileJob) -> Result<JobOutcome> {
        if !job.path.exists() {
            return self.reap_deleted(job);
        }

        // Snapshot first; everything tracked here but neither re-emitted
        // nor still on disk gets removed at the end
        let snapshot = self
            .git
            .ls_files(&["-z", "--cached", "--", &job.rel])
            .with_context(|| format!("snapshotting index under {}", job.rel))?;

        let (work_files, pruned) = self
            .walker
            .collect_files(&job.path)
            .with_context(|| format!("walking {}", job.rel))?;
        if !pruned.is_empty() {
            debug!(repo = %job.name, excluded = pruned.len(), "pruned noise directories");
        }

        let meta_dir = job.path.join(META_DIR);
        let meta_files = if meta_dir.is_dir() {
            collect_all_files(&meta_dir)
                .with_context(|| format!("walking nested metadata of {}", job.rel))?
        } else {
            Vec::new()
        };

        let capacity = work_files.len() + meta_files.len();
        let classes = classify_by_size(work_files, self.small_limit, self.medium_limit);
        debug!(
            repo = %job.name,
            small = classes.small.len(),
            medium = classes.medium.len(),
            large = classes.large.len(),
            meta = meta_files.len(),
            "collected files"
        );

        let mut operations: Vec<FileOperation> = Vec::with_capacity(capacity);

        // Small files fan out on the shared hashing pool
        if !classes.small.is_empty() {
            let ops: Vec<FileOperation> = self.hash_pool.install(|| {
                classes
                    .small
                    .par_iter()
                    .filter_map(|p| self.hash_work_file(p))
                    .collect()
            });
            operations.extend(ops);
        }

        for path in &classes.medium {
            if let Some(op) = self.hash_work_file(path) {
                operations.push(op);
            }
        }

        // Large files go strictly serially; their IO cost dominates and a
        // per-file log line gives progress visibility
        for path in &classes.large {
            if let Ok(meta) = fs::metadata(path) {
                info!(
                    path = %path.display(),
                    size_mb = meta.len() / (1024 * 1024),
                    "hashing large file"
                );
            }
            if let Some(op) = self.hash_work_file(path) {
                operations.push(op);
            }
        }

        // Nested metadata hashed in parallel and remapped to virtualized
        // paths; appended last so fresh metadata wins over any materialized
        // copy picked up by the working walk
        if !meta_files.is_empty() {
            let ops: Vec<FileOperation> = self.hash_pool.install(|| {
                meta_files
                    .par_iter()
                    .filter_map(|p| self.hash_meta_file(p))
                    .collect()
            });
            operations.extend(ops);
        }

        self.mutator
            .apply(&operations)
            .with_context(|| format!("applying index mutation for {}", job.rel))?;

        let removed = self.reconcile_deletions(&snapshot, &operations)?;

        if !meta_files.is_empty() {
            self.materialize_virtualized(&job.rel)?;
        }

        debug!(
            repo = %job.name,
            operations = operations.len(),
            deletions = removed,
            cache = self.cache.len(),
            "reconciliation complete"
        );
        Ok(JobOutcome { operations: operations.len(), deletions: removed })
    }

    /// Deletion case: the repository directory is gone, so every index
    /// entry under it is removed and no new operations are emitted.
    fn reap_deleted(&self, job: &ReconcileJob) -> Result<JobOutcome> {
        let tracked = self.git.ls_files(&["-z", "--cached", "--", &job.rel])?;
        if tracked.is_empty() {
            return Ok(JobOutcome::default());
        }

        info!(repo = %job.name, entries = tracked.len(), "repository deleted; reaping index entries");
        let paths: Vec<PathBuf> = tracked.iter().map(PathBuf::from).collect();
        let report = self.batches.execute(BatchOp::Untrack, &paths)?;
        Ok(JobOutcome { deletions: report.files_processed, ..Default::default() })
    }

    /// Hashes one working file, consulting the identity cache first.
    /// Stat or hash failures drop the file from this cycle, never fail the
    /// job.
    fn hash_work_file(&self, path: &Path) -> Option<FileOperation> {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), "stat failed, skipping: {e}");
                return None;
            }
        };
        let mode = FileMode::from_metadata(&meta);
        let modified = meta.modified().ok()?;

        let hash = match self.cache.get(path, modified, meta.len()) {
            Some(h) => h,
            None => match self.git.hash_object_write(path) {
                Ok(h) => {
                    self.cache.set(path, h.clone(), modified, meta.len());
                    h
                }
                Err(e) => {
                    warn!(path = %path.display(), "hash failed, skipping: {e}");
                    return None;
                }
            },
        };

        let rel = self.rel_string(path)?;
        Some(FileOperation { mode, hash, path: rel })
    }

    /// Hashes one nested metadata file and rewrites its path onto the
    /// virtualized segment. Metadata churns every cycle, so the identity
    /// cache is not consulted.
    fn hash_meta_file(&self, path: &Path) -> Option<FileOperation> {
        let meta = fs::metadata(path).ok()?;
        let mode = FileMode::from_metadata(&meta);
        let hash = match self.git.hash_object_write(path) {
            Ok(h) => h,
            Err(e) => {
                warn!(path = %path.display(), "metadata hash failed, skipping: {e}");
                return None;
            }
        };
        let rel = self.rel_string(path)?;
        let virt = rel.replacen(&format!("/{META_DIR}/"), &format!("/{VIRT_DIR}/"), 1);
        Some(FileOperation { mode, hash, path: virt })
    }

    fn rel_string(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.git.root()).ok()?;
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    /// Removes snapshot entries that were neither re-emitted this cycle nor
    /// still present on disk. Legacy entries tracked under the real
    /// metadata segment are checked through their virtualized counterpart,
    /// since the real segment is never re-emitted.
    fn reconcile_deletions(
        &self,
        snapshot: &[String],
        operations: &[FileOperation],
    ) -> Result<usize> {
        if snapshot.is_empty() {
            return Ok(0);
        }

        let op_paths: HashSet<&str> = operations.iter().map(|o| o.path.as_str()).collect();
        let meta_seg = format!("/{META_DIR}/");
        let virt_seg = format!("/{VIRT_DIR}/");

        let mut stale: Vec<PathBuf> = Vec::new();
        for path in snapshot {
            if path.is_empty() {
                continue;
            }
            let survives = if path.contains(&meta_seg) {
                op_paths.contains(path.replacen(&meta_seg, &virt_seg, 1).as_str())
            } else {
                op_paths.contains(path.as_str())
            };
            if !survives && !self.git.root().join(path).exists() {
                stale.push(PathBuf::from(path));
            }
        }

        if stale.is_empty() {
            return Ok(0);
        }
        debug!(count = stale.len(), "removing index entries without backing files");
        let report = self.batches.execute(BatchOp::Untrack, &stale)?;
        Ok(report.files_processed)
    }

    /// Ensures every indexed virtualized-metadata file also exists in the
    /// working tree, writing missing ones out of the index. Downstream use
    /// of the embedded repository expects real files on disk, not merely
    /// index entries.
    fn materialize_virtualized(&self, rel: &str) -> Result<()> {
        let prefix = format!("{rel}/{VIRT_DIR}");
        let tracked = self.git.ls_files(&["-z", "--cached", "--", &prefix])?;

        let mut written = 0usize;
        for entry in &tracked {
            let full = self.git.root().join(entry);
            if full.exists() {
                continue;
            }
            if let Some(parent) = full.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    debug!(path = %full.display(), "could not create parent: {e}");
                    continue;
                }
            }
            match self.git.show_index_blob(entry) {
                Ok(bytes) => match fs::write(&full, bytes) {
                    Ok(()) => written += 1,
                    Err(e) => debug!(path = %full.display(), "write failed: {e}"),
                },
                Err(e) => debug!(path = entry.as_str(), "index read failed: {e}"),
            }
        }
        if written > 0 {
            debug!(rel, written, "materialized virtualized metadata files");
        }
        Ok(())
    }

    /// Removes virtualized-metadata residue left behind by deleted or
    /// hollowed-out repositories. Runs independently of reconciliation.
    pub fn sweep_orphans(&self) -> Result<usize> {
        let mut removed = 0usize;

        // Shell directories: a parent whose only child is the virtualized
        // segment holds no working content worth keeping
        for base in &self.base_dirs {
            let base_path = self.git.root().join(base);
            if !base_path.exists() {
                continue;
            }
            removed += self.sweep_shell_dirs(&base_path)?;
        }

        // Index residue: tracked virtualized paths whose parent directory
        // no longer exists on disk
        let tracked = self.git.ls_files(&["--cached"])?;
        let virt_seg = format!("/{VIRT_DIR}/");

        let mut dead_parents: IndexSet<String> = IndexSet::new();
        for path in &tracked {
            if let Some((parent, _)) = path.split_once(&virt_seg) {
                if !dead_parents.contains(parent) && !self.git.root().join(parent).exists() {
                    warn!(parent, "tracked virtualized metadata has no backing directory");
                    dead_parents.insert(parent.to_string());
                }
            }
        }

        if !dead_parents.is_empty() {
            let orphaned: Vec<PathBuf> = tracked
                .iter()
                .filter(|p| {
                    dead_parents
                        .iter()
                        .any(|d| p.starts_with(&format!("{d}{virt_seg}")))
                })
                .map(PathBuf::from)
                .collect();
            info!(files = orphaned.len(), "reaping orphaned virtualized metadata");
            removed += self.batches.execute(BatchOp::Untrack, &orphaned)?.files_processed;
        }

        Ok(removed)
    }

    fn sweep_shell_dirs(&self, base: &Path) -> Result<usize> {
        let mut shells: Vec<PathBuf> = Vec::new();

        let mut pending = vec![base.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                if entry.file_name() == VIRT_DIR {
                    if let Some(parent) = path.parent() {
                        if dir_contains_only(parent, VIRT_DIR) {
                            shells.push(parent.to_path_buf());
                        }
                    }
                } else {
                    pending.push(path);
                }
            }
        }

        let mut removed = 0usize;
        for shell in shells {
            info!(path = %shell.display(), "removing empty virtualized shell");
            if let Err(e) = fs::remove_dir_all(&shell) {
                error!(path = %shell.display(), "shell removal failed: {e}");
                continue;
            }
            // Stage the deletion so the index catches up
            if let Some(rel) = self.rel_string(&shell) {
                if let Err(e) = self.git.stage_path(&rel) {
                    debug!(rel, "could not stage shell removal: {e}");
                }
            }
            removed += 1;
        }
        Ok(removed)
    }
}

fn dir_contains_only(dir: &Path, name: &str) -> bool {
    match fs::read_dir(dir) {
        Ok(entries) => entries.flatten().all(|e| e.file_name() == name),
        Err(_) => false,
    }
}
