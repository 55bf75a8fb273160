//! Thin synchronous wrapper over the `git` command surface.
//!
//! Every call shells out, captures stdout/stderr, and maps a non-zero exit
//! into a typed [`GitError`] carrying the diagnostic text. Callers that need
//! to distinguish transient index-lock contention from real failures inspect
//! the error with [`GitError::is_lock_contention`].

use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::debug;

/// Failure surfaced by a git invocation.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {cmdline} failed (exit {code:?}): {stderr}")]
    Command {
        cmdline: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to spawn git {cmdline}")]
    Spawn {
        cmdline: String,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    /// True when the failure text indicates another actor holds the index
    /// lock; such failures are worth retrying with backoff.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            GitError::Command { stderr, .. } => stderr.contains("index.lock"),
            GitError::Spawn { .. } => false,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::Command { code, .. } => *code,
            GitError::Spawn { .. } => None,
        }
    }
}

/// Git operations rooted at one repository working tree.
#[derive(Debug, Clone)]
pub struct GitOps {
    root: PathBuf,
}

impl GitOps {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens the repository containing `dir` by asking git for the toplevel.
    pub fn discover(dir: &Path) -> Result<Self, GitError> {
        let probe = Self::new(dir);
        let top = probe.run(&["rev-parse", "--show-toplevel"])?;
        Ok(Self::new(PathBuf::from(top)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the index lock marker left by git while the index is held.
    pub fn index_lock_path(&self) -> PathBuf {
        self.root.join(".git").join("index.lock")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Runs git, returning trimmed stdout on success.
    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let out = self.run_raw(args)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Runs git, returning raw stdout bytes (blob content is not UTF-8).
    fn run_raw(&self, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let cmdline = args.join(" ");
        debug!(target: "resync::git", "git {cmdline}");

        let output = self
            .command(args)
            .output()
            .map_err(|source| GitError::Spawn { cmdline: cmdline.clone(), source })?;

        if !output.status.success() {
            return Err(GitError::Command {
                cmdline,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Runs git with a line-oriented payload streamed to stdin.
    fn run_with_stdin(&self, args: &[&str], payload: &str) -> Result<String, GitError> {
        let cmdline = args.join(" ");
        debug!(target: "resync::git", "git {cmdline} (stdin: {} bytes)", payload.len());

        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| GitError::Spawn { cmdline: cmdline.clone(), source })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .map_err(|source| GitError::Spawn { cmdline: cmdline.clone(), source })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|source| GitError::Spawn { cmdline: cmdline.clone(), source })?;

        if !output.status.success() {
            return Err(GitError::Command {
                cmdline,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    // --- object & index ---

    /// Hashes a file into the object store (`-w`), returning the blob hash.
    ///
    /// Writing the object matters: indexed-but-absent paths are later
    /// materialized by reading the blob back out of the index.
    pub fn hash_object_write(&self, path: &Path) -> Result<String, GitError> {
        self.run(&["hash-object", "-w", "--", &path.to_string_lossy()])
    }

    /// Bulk index update from `mode hash TAB path` lines.
    pub fn update_index_info(&self, payload: &str) -> Result<(), GitError> {
        self.run_with_stdin(&["update-index", "--index-info"], payload)?;
        Ok(())
    }

    /// Content of a path as currently staged in the index (`git show :path`).
    pub fn show_index_blob(&self, path: &str) -> Result<Vec<u8>, GitError> {
        self.run_raw(&["show", &format!(":{path}")])
    }

    // --- staging ---

    pub fn stage_path(&self, path: &str) -> Result<(), GitError> {
        self.run(&["add", "--", path])?;
        Ok(())
    }

    pub fn stage_batch(&self, paths: &[String]) -> Result<(), GitError> {
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args)?;
        Ok(())
    }

    pub fn untrack_batch(&self, paths: &[String]) -> Result<(), GitError> {
        let mut args = vec!["rm", "--cached", "--ignore-unmatch", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args)?;
        Ok(())
    }

    // --- commit & status ---

    pub fn commit(&self, message: &str) -> Result<(), GitError> {
        self.run(&["commit", "-m", message])?;
        Ok(())
    }

    /// True when the index differs from HEAD.
    pub fn has_staged_changes(&self) -> Result<bool, GitError> {
        match self.run(&["diff", "--cached", "--quiet"]) {
            Ok(_) => Ok(false),
            Err(ref e) if e.exit_code() == Some(1) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn status_porcelain(&self) -> Result<String, GitError> {
        self.run(&["status", "--porcelain"])
    }

    // --- remote ---

    pub fn fetch(&self, remote: &str) -> Result<(), GitError> {
        self.run(&["fetch", remote])?;
        Ok(())
    }

    pub fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(&["push", remote, branch])?;
        Ok(())
    }

    pub fn force_push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(&["push", "--force", remote, branch])?;
        Ok(())
    }

    pub fn pull_rebase(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(&["pull", "--rebase", remote, branch])?;
        Ok(())
    }

    // --- revisions & merge ---

    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        self.run(&["rev-parse", rev])
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<String, GitError> {
        self.run(&["merge-base", a, b])
    }

    pub fn merge(&self, branch: &str, message: &str, log_lines: u32) -> Result<(), GitError> {
        let log = format!("--log={log_lines}");
        let mut args = vec!["merge", branch, "--no-edit", "-m", message];
        if log_lines > 0 {
            args.push(&log);
        }
        self.run(&args)?;
        Ok(())
    }

    pub fn merge_abort(&self) -> Result<(), GitError> {
        self.run(&["merge", "--abort"])?;
        Ok(())
    }

    pub fn reset(&self, rev: &str, hard: bool) -> Result<(), GitError> {
        if hard {
            self.run(&["reset", "--hard", rev])?;
        } else {
            self.run(&["reset", rev])?;
        }
        Ok(())
    }

    /// Paths currently in the unmerged (conflicted) state.
    pub fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(split_lines(&out))
    }

    /// Resolves one conflicted path by taking the incoming side.
    pub fn checkout_theirs(&self, path: &str) -> Result<(), GitError> {
        self.run(&["checkout", "--theirs", "--", path])?;
        Ok(())
    }

    // --- branches ---

    pub fn create_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", name])?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", "-D", name])?;
        Ok(())
    }

    pub fn branches(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["branch", "--list"])?;
        Ok(out
            .lines()
            .map(|l| l.trim_start_matches('*').trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    // --- listing ---

    /// `git ls-files` with arbitrary flags; splits on NUL when `-z` is
    /// passed, on newlines otherwise. Unquotes escaped paths either way.
    pub fn ls_files(&self, args: &[&str]) -> Result<Vec<String>, GitError> {
        let mut full = vec!["ls-files"];
        full.extend_from_slice(args);
        let out = self.run(&full)?;

        let parts: Vec<String> = if args.contains(&"-z") {
            out.split('\0')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            split_lines(&out)
        };

        Ok(parts.iter().map(|p| unquote_path(p)).collect())
    }
}

fn split_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Undoes git's C-style path quoting.
///
/// Paths containing bytes outside the printable ASCII range come back from
/// `ls-files` wrapped in double quotes with octal escapes
/// (`"a\303\244.txt"`); strip the quotes and decode the escapes so the path
/// can be compared against the filesystem.
pub fn unquote_path(path: &str) -> String {
    let bytes = path.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return path.to_string();
    }

    let inner = &bytes[1..bytes.len() - 1];
    let mut decoded: Vec<u8> = Vec::with_capacity(inner.len());
    let mut i = 0;

    while i < inner.len() {
        if inner[i] == b'\\' && i + 1 < inner.len() {
            // Octal escape \ddd
            if i + 3 < inner.len()
                && inner[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
            {
                if let Ok(val) =
                    u8::from_str_radix(std::str::from_utf8(&inner[i + 1..i + 4]).unwrap_or(""), 8)
                {
                    decoded.push(val);
                    i += 4;
                    continue;
                }
            }
            match inner[i + 1] {
                b'n' => decoded.push(b'\n'),
                b't' => decoded.push(b'\t'),
                b'\\' => decoded.push(b'\\'),
                b'"' => decoded.push(b'"'),
                other => {
                    decoded.push(b'\\');
                    decoded.push(other);
                }
            }
            i += 2;
        } else {
            decoded.push(inner[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
