//! Integration tests for embedded-repository reconciliation.

mod util;

use std::{fs, path::Path, time::Duration};

use resync::core::batch::BatchExecutor;
use resync::core::cache::HashCache;
use resync::core::git::GitOps;
use resync::core::index::IndexMutator;
use resync::core::reconcile::Reconciler;
use resync::infra::config::SyncConfig;
use resync::infra::retry::RetryPolicy;
use util::{git, init_repo, tracked_paths, write_file};

fn reconciler(root: &Path, base_dirs: &[&str]) -> Reconciler {
    let mut cfg = SyncConfig::default();
    cfg.special_base_dirs = base_dirs.iter().map(|s| s.to_string()).collect();
    cfg.max_workers = 4;

    let git = GitOps::new(root);
    let mutator = IndexMutator::new(
        git.clone(),
        RetryPolicy::new(3, Duration::from_millis(10)),
        Duration::from_secs(60),
        Duration::from_millis(20),
    );
    let batches = BatchExecutor::new(
        git.clone(),
        RetryPolicy::new(2, Duration::from_millis(5)),
        100,
        true,
    );
    Reconciler::new(&cfg, git, HashCache::new(), mutator, batches).expect("reconciler")
}

#[test]
fn fresh_repository_yields_operations_and_no_deletions() {
    let (_tmp, root) = init_repo();

    // A previously virtualized repository: three small work files and an
    // empty stand-in directory marking it as special
    fs::create_dir_all(root.join("projects/app/gitdir")).unwrap();
    write_file(&root, "projects/app/a.txt", "aaa\n");
    write_file(&root, "projects/app/b.txt", "bbb\n");
    write_file(&root, "projects/app/c.txt", "ccc\n");

    let report = reconciler(&root, &["projects"]).run().expect("run");

    assert!(report.fully_succeeded());
    assert_eq!(report.jobs_total, 1);
    assert_eq!(report.operations_applied, 3);
    assert_eq!(report.deletions, 0);

    let tracked = tracked_paths(&root);
    for rel in ["projects/app/a.txt", "projects/app/b.txt", "projects/app/c.txt"] {
        assert!(tracked.contains(&rel.to_string()), "missing {rel}");
    }
}

#[test]
fn nested_metadata_is_tracked_under_virtualized_paths() {
    let (_tmp, root) = init_repo();

    let app = root.join("projects/app");
    fs::create_dir_all(&app).unwrap();
    git(&app, &["init"]);
    write_file(&root, "projects/app/main.py", "print('hi')\n");

    let report = reconciler(&root, &["projects"]).run().expect("run");
    assert!(report.fully_succeeded());

    let tracked = tracked_paths(&root);
    assert!(tracked.contains(&"projects/app/main.py".to_string()));
    assert!(tracked.contains(&"projects/app/gitdir/HEAD".to_string()));
    assert!(
        tracked.iter().all(|p| !p.contains("/.git/")),
        "real metadata paths must never be tracked"
    );

    // Materialization mirrors indexed metadata back onto disk
    let materialized = app.join("gitdir/HEAD");
    assert!(materialized.exists());
    assert_eq!(
        fs::read(&materialized).unwrap(),
        fs::read(app.join(".git/HEAD")).unwrap()
    );
}

#[test]
fn deleted_repository_is_reaped_with_zero_new_operations() {
    let (_tmp, root) = init_repo();

    fs::create_dir_all(root.join("projects/app")).unwrap();
    write_file(&root, "projects/app/gitdir/config", "fake metadata\n");
    write_file(&root, "projects/app/data.txt", "payload\n");

    let engine = reconciler(&root, &["projects"]);
    engine.run().expect("seed run");
    assert!(tracked_paths(&root).contains(&"projects/app/data.txt".to_string()));

    fs::remove_dir_all(root.join("projects/app")).unwrap();
    let report = engine.run().expect("reap run");

    assert!(report.fully_succeeded());
    assert_eq!(report.operations_applied, 0);
    assert!(report.deletions >= 2);
    assert!(
        tracked_paths(&root).iter().all(|p| !p.starts_with("projects/app/")),
        "all index entries under the deleted repository must be gone"
    );
}

#[test]
fn files_removed_from_disk_are_removed_from_the_index() {
    let (_tmp, root) = init_repo();

    fs::create_dir_all(root.join("projects/app/gitdir")).unwrap();
    write_file(&root, "projects/app/kept.txt", "kept\n");
    write_file(&root, "projects/app/doomed.txt", "doomed\n");

    let engine = reconciler(&root, &["projects"]);
    engine.run().expect("seed run");

    fs::remove_file(root.join("projects/app/doomed.txt")).unwrap();
    let report = engine.run().expect("second run");

    assert_eq!(report.deletions, 1);
    let tracked = tracked_paths(&root);
    assert!(tracked.contains(&"projects/app/kept.txt".to_string()));
    assert!(!tracked.contains(&"projects/app/doomed.txt".to_string()));
}

#[test]
fn noise_directories_are_pruned_from_the_walk() {
    let (_tmp, root) = init_repo();

    fs::create_dir_all(root.join("projects/app/gitdir")).unwrap();
    write_file(&root, "projects/app/src.py", "code\n");
    write_file(&root, "projects/app/node_modules/dep/index.js", "junk\n");
    write_file(&root, "projects/app/.venv/lib/site.py", "junk\n");

    reconciler(&root, &["projects"]).run().expect("run");

    let tracked = tracked_paths(&root);
    assert!(tracked.contains(&"projects/app/src.py".to_string()));
    assert!(tracked.iter().all(|p| !p.contains("node_modules")));
    assert!(tracked.iter().all(|p| !p.contains(".venv")));
}

#[test]
fn orphan_sweep_reaps_tracked_metadata_without_backing_directory() {
    let (_tmp, root) = init_repo();

    fs::create_dir_all(root.join("projects/app")).unwrap();
    write_file(&root, "projects/app/gitdir/config", "fake metadata\n");

    let engine = reconciler(&root, &["projects"]);
    engine.run().expect("seed run");
    assert!(tracked_paths(&root).contains(&"projects/app/gitdir/config".to_string()));

    // Delete the directory out from under the index, then sweep
    fs::remove_dir_all(root.join("projects/app")).unwrap();
    let removed = engine.sweep_orphans().expect("sweep");

    assert!(removed >= 1);
    assert!(
        tracked_paths(&root).iter().all(|p| !p.starts_with("projects/app/")),
        "orphaned virtualized metadata must be reaped"
    );
}

#[test]
fn orphan_sweep_removes_empty_virtualized_shells() {
    let (_tmp, root) = init_repo();

    // A shell: nothing left but the virtualized metadata subtree
    write_file(&root, "projects/shell/gitdir/config", "leftover\n");

    let engine = reconciler(&root, &["projects"]);
    let removed = engine.sweep_orphans().expect("sweep");

    assert!(removed >= 1);
    assert!(!root.join("projects/shell").exists());
}
