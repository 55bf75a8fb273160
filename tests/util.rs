//! Shared test utilities for integration tests
//!
//! Provides git repository fixtures and helper functions used across
//! multiple test files. Every fixture configures a throwaway identity so
//! commits work in clean CI environments.

#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::TempDir;

/// Runs a git command in `dir`, panicking with full diagnostics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed in {}:\n{}",
        dir.display(),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Configures a local throwaway identity for commits.
pub fn set_identity(dir: &Path) {
    git(dir, &["config", "user.email", "sync@test.invalid"]);
    git(dir, &["config", "user.name", "Sync Test"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

/// Initializes a repository on branch `main` with one initial commit.
/// Returns the tempdir plus the canonicalized repository root.
pub fn init_repo() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().expect("tempdir");
    let root = fs::canonicalize(tmp.path()).expect("canonicalize");

    git(&root, &["init"]);
    git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    set_identity(&root);

    write_file(&root, "README.md", "# fixture\n");
    git(&root, &["add", "."]);
    git(&root, &["commit", "-m", "initial commit"]);

    (tmp, root)
}

/// Initializes a repository plus a bare remote it pushes `main` to.
/// Returns (tempdir, work root, bare remote path).
pub fn init_repo_with_remote() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().expect("tempdir");
    let base = fs::canonicalize(tmp.path()).expect("canonicalize");

    let remote = base.join("remote.git");
    fs::create_dir_all(&remote).unwrap();
    git(&remote, &["init", "--bare"]);
    git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    let work = base.join("work");
    fs::create_dir_all(&work).unwrap();
    git(&work, &["init"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    set_identity(&work);

    write_file(&work, "README.md", "# fixture\n");
    git(&work, &["add", "."]);
    git(&work, &["commit", "-m", "initial commit"]);

    git(&work, &["remote", "add", "origin", &remote.to_string_lossy()]);
    git(&work, &["push", "-u", "origin", "main"]);

    (tmp, work, remote)
}

/// Clones the bare remote into a second working copy on `main`.
pub fn clone_remote(remote: &Path, dest: &Path) -> PathBuf {
    let parent = dest.parent().expect("clone destination parent");
    git(
        parent,
        &[
            "clone",
            "-b",
            "main",
            &remote.to_string_lossy(),
            &dest.to_string_lossy(),
        ],
    );
    let root = fs::canonicalize(dest).expect("canonicalize clone");
    set_identity(&root);
    root
}

/// Writes a file under `root`, creating parent directories as needed.
pub fn write_file(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body.as_bytes()).unwrap();
}

/// Stages everything and commits.
pub fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}

/// Current head revision of `rev` (for example `HEAD` or `origin/main`).
pub fn rev(dir: &Path, rev: &str) -> String {
    git(dir, &["rev-parse", rev])
}

/// All paths currently in the index.
pub fn tracked_paths(dir: &Path) -> Vec<String> {
    git(dir, &["ls-files"])
        .lines()
        .map(str::to_string)
        .collect()
}
