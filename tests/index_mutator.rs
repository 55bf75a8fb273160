//! Integration tests for bulk index mutation and lock handling.

mod util;

use std::{fs, time::Duration};

use resync::core::git::GitOps;
use resync::core::index::{FileMode, FileOperation, IndexMutator};
use resync::infra::retry::RetryPolicy;
use util::{init_repo, tracked_paths, write_file};

fn mutator(git: GitOps) -> IndexMutator {
    IndexMutator::new(
        git,
        RetryPolicy::new(3, Duration::from_millis(10)),
        Duration::from_secs(60),
        Duration::from_millis(20),
    )
}

fn op_for(git: &GitOps, rel: &str) -> FileOperation {
    let hash = git
        .hash_object_write(&git.root().join(rel))
        .expect("hash object");
    FileOperation { mode: FileMode::Regular, hash, path: rel.to_string() }
}

#[test]
fn apply_adds_entries_to_the_index() {
    let (_tmp, root) = init_repo();
    let git = GitOps::new(&root);

    write_file(&root, "a.txt", "alpha\n");
    write_file(&root, "sub/b.txt", "beta\n");

    let ops = vec![op_for(&git, "a.txt"), op_for(&git, "sub/b.txt")];
    mutator(git).apply(&ops).expect("apply");

    let tracked = tracked_paths(&root);
    assert!(tracked.contains(&"a.txt".to_string()));
    assert!(tracked.contains(&"sub/b.txt".to_string()));
}

#[test]
fn apply_is_idempotent() {
    let (_tmp, root) = init_repo();
    let git = GitOps::new(&root);

    write_file(&root, "a.txt", "alpha\n");
    let ops = vec![op_for(&git, "a.txt")];

    let m = mutator(git);
    m.apply(&ops).expect("first apply");
    let first = util::git(&root, &["ls-files", "-s"]);

    m.apply(&ops).expect("second apply");
    let second = util::git(&root, &["ls-files", "-s"]);

    assert_eq!(first, second);
}

#[test]
fn duplicate_paths_last_write_wins() {
    let (_tmp, root) = init_repo();
    let git = GitOps::new(&root);

    write_file(&root, "a.txt", "old\n");
    let stale = op_for(&git, "a.txt");
    write_file(&root, "a.txt", "new\n");
    let fresh = op_for(&git, "a.txt");
    assert_ne!(stale.hash, fresh.hash);

    mutator(git).apply(&[stale, fresh.clone()]).expect("apply");

    let listing = util::git(&root, &["ls-files", "-s", "--", "a.txt"]);
    assert!(listing.contains(&fresh.hash));
}

#[test]
fn empty_operation_set_is_a_noop() {
    let (_tmp, root) = init_repo();
    let before = util::git(&root, &["ls-files", "-s"]);
    mutator(GitOps::new(&root)).apply(&[]).expect("apply");
    assert_eq!(before, util::git(&root, &["ls-files", "-s"]));
}

#[test]
fn stale_lock_is_deleted_and_apply_proceeds() {
    let (_tmp, root) = init_repo();
    let git = GitOps::new(&root);

    let lock = git.index_lock_path();
    fs::write(&lock, "").unwrap();
    let ancient = filetime::FileTime::from_unix_time(1_000_000, 0);
    filetime::set_file_mtime(&lock, ancient).unwrap();

    write_file(&root, "a.txt", "alpha\n");
    let ops = vec![op_for(&git, "a.txt")];

    // One real attempt is enough once the stale marker is cleared
    let m = IndexMutator::new(
        git,
        RetryPolicy::new(1, Duration::from_millis(10)),
        Duration::from_secs(60),
        Duration::from_millis(20),
    );
    m.apply(&ops).expect("apply past stale lock");

    assert!(!lock.exists());
    assert!(tracked_paths(&root).contains(&"a.txt".to_string()));
}

#[test]
fn young_lock_is_waited_out_without_consuming_attempts() {
    let (_tmp, root) = init_repo();
    let git = GitOps::new(&root);

    let lock = git.index_lock_path();
    fs::write(&lock, "").unwrap();

    write_file(&root, "a.txt", "alpha\n");
    let ops = vec![op_for(&git, "a.txt")];

    // A single attempt plus a short staleness window: the marker is young
    // at first, gets waited on, ages past the window, and the one real
    // attempt still succeeds.
    let m = IndexMutator::new(
        git,
        RetryPolicy::new(1, Duration::from_millis(10)),
        Duration::from_millis(200),
        Duration::from_millis(50),
    );
    m.apply(&ops).expect("apply after waiting out the lock");

    assert!(tracked_paths(&root).contains(&"a.txt".to_string()));
}
