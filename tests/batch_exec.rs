//! Integration tests for the chunked stage/untrack executor.

mod util;

use std::{path::PathBuf, time::Duration};

use resync::core::batch::{BatchExecutor, BatchOp};
use resync::core::git::GitOps;
use resync::infra::retry::RetryPolicy;
use util::{commit_all, init_repo, tracked_paths, write_file};

fn executor(root: &std::path::Path, batch_size: usize, dynamic: bool) -> BatchExecutor {
    BatchExecutor::new(
        GitOps::new(root),
        RetryPolicy::new(2, Duration::from_millis(5)),
        batch_size,
        dynamic,
    )
}

#[test]
fn staging_new_files_lands_in_index() {
    let (_tmp, root) = init_repo();
    write_file(&root, "one.txt", "1\n");
    write_file(&root, "dir/two.txt", "2\n");

    let paths = vec![PathBuf::from("one.txt"), PathBuf::from("dir/two.txt")];
    let report = executor(&root, 100, true)
        .execute(BatchOp::Stage, &paths)
        .expect("stage");

    assert!(report.fully_succeeded());
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.batch_timings.len(), report.batches_run);

    let tracked = tracked_paths(&root);
    assert!(tracked.contains(&"one.txt".to_string()));
    assert!(tracked.contains(&"dir/two.txt".to_string()));
}

#[test]
fn untracking_keeps_files_on_disk() {
    let (_tmp, root) = init_repo();
    write_file(&root, "keep.txt", "data\n");
    commit_all(&root, "add keep.txt");

    let report = executor(&root, 100, true)
        .execute(BatchOp::Untrack, &[PathBuf::from("keep.txt")])
        .expect("untrack");

    assert!(report.fully_succeeded());
    assert!(!tracked_paths(&root).contains(&"keep.txt".to_string()));
    assert!(root.join("keep.txt").exists());
}

#[test]
fn failed_batch_does_not_abort_the_rest() {
    let (_tmp, root) = init_repo();
    write_file(&root, "good-1.txt", "1\n");
    write_file(&root, "good-2.txt", "2\n");

    // Static batch size of one isolates the failure to its own batch
    let paths = vec![
        PathBuf::from("good-1.txt"),
        PathBuf::from("does-not-exist.txt"),
        PathBuf::from("good-2.txt"),
    ];
    let report = executor(&root, 1, false)
        .execute(BatchOp::Stage, &paths)
        .expect("execute");

    assert_eq!(report.batches_run, 3);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.failed_paths, vec![PathBuf::from("does-not-exist.txt")]);

    let tracked = tracked_paths(&root);
    assert!(tracked.contains(&"good-1.txt".to_string()));
    assert!(tracked.contains(&"good-2.txt".to_string()));
}

#[test]
fn untrack_of_unknown_paths_is_tolerated() {
    // rm --ignore-unmatch treats unknown paths as a no-op success
    let (_tmp, root) = init_repo();
    let report = executor(&root, 100, true)
        .execute(BatchOp::Untrack, &[PathBuf::from("never-tracked.txt")])
        .expect("untrack");
    assert!(report.fully_succeeded());
}
