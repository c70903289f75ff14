//! Git adapter for session branches, checkpoints, and the draft guard.
//!
//! Relay only needs a handful of porcelain operations, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Backoff delays for transient `index.lock` contention (milliseconds).
const RETRY_DELAYS_MS: &[u64] = &[100, 500, 2000];

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
    /// Source path of a rename or copy.
    pub orig_path: Option<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["-c", "core.quotepath=off", "status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout `branch` starting at `start_point`.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn checkout_new_branch_from(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Rename a local branch (works for the checked-out branch too).
    #[instrument(skip_all, fields(from, to))]
    pub fn rename_branch(&self, from: &str, to: &str) -> Result<()> {
        debug!(from, to, "renaming branch");
        self.run_checked(&["branch", "-m", from, to])?;
        Ok(())
    }

    /// Stage all changes except paths under `excluded` (respects .gitignore).
    pub fn add_all_except(&self, excluded: &[&str]) -> Result<()> {
        let mut args = vec!["add".to_string(), "-A".to_string(), "--".to_string(), ".".to_string()];
        args.extend(excluded.iter().map(|path| format!(":(exclude){path}")));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    /// True if `path` exists in the `HEAD` commit.
    pub fn exists_in_head(&self, path: &str) -> Result<bool> {
        let spec = format!("HEAD:{path}");
        Ok(self.run(&["cat-file", "-e", &spec])?.status.success())
    }

    /// Restore `path` in index and worktree to its `HEAD` content.
    #[instrument(skip_all, fields(path))]
    pub fn restore_from_head(&self, path: &str) -> Result<()> {
        self.run_checked(&["checkout", "HEAD", "--", path])?;
        Ok(())
    }

    /// Drop `path` from the index without touching the worktree.
    pub fn unstage(&self, path: &str) -> Result<()> {
        self.run_checked(&["rm", "-q", "--cached", "--ignore-unmatch", "--", path])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run and require success, retrying transient lock contention.
    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let mut attempt = 0;
        loop {
            let output = self.run(args)?;
            if output.status.success() {
                return Ok(output);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let transient = stderr.contains("index.lock") || stderr.contains("Unable to create");
            if transient && let Some(delay) = RETRY_DELAYS_MS.get(attempt) {
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay,
                    "transient git failure, retrying: {}",
                    stderr.trim()
                );
                thread::sleep(Duration::from_millis(*delay));
                attempt += 1;
                continue;
            }
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
            orig_path: None,
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let rest = line[3..].trim();
    let (orig_path, path) = match rest.split_once(" -> ") {
        Some((old, new)) => (Some(unquote(old.trim())), unquote(new.trim())),
        None => (None, unquote(rest)),
    };
    Ok(StatusEntry {
        code,
        path,
        orig_path,
    })
}

/// Porcelain wraps paths containing spaces in double quotes.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string(),
                orig_path: None,
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(e.code, " M");
        assert_eq!(e.path, "src/main.rs");
    }

    #[test]
    fn parses_rename_and_quoted_paths() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
        assert_eq!(e.orig_path.as_deref(), Some("old.txt"));
        let quoted = parse_status_line("?? \"my notes.md\"").expect("parse");
        assert_eq!(quoted.path, "my notes.md");
    }

    #[test]
    fn add_all_except_skips_excluded_directory() {
        let repo = TestRepo::new();
        fs::create_dir_all(repo.path().join(".relay/state")).expect("mkdir");
        fs::write(repo.path().join(".relay/state/relay.lock"), "{}").expect("write lock");
        fs::write(repo.path().join("notes.md"), "notes").expect("write");

        let git = Git::new(repo.path());
        git.add_all_except(&[".relay"]).expect("add");
        assert!(git.commit_staged("relay: test").expect("commit"));

        let remaining = git.status_porcelain().expect("status");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, ".relay/state/relay.lock");
        assert!(!git.commit_staged("relay: empty").expect("commit"));
    }

    #[test]
    fn rename_and_branch_helpers() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        git.checkout_new_branch_from("feature", "main").expect("branch");
        assert_eq!(git.current_branch().expect("branch"), "feature");
        git.rename_branch("feature", "feature-old").expect("rename");
        assert!(git.branch_exists("feature-old").expect("exists"));
        assert!(!git.branch_exists("feature").expect("exists"));
        assert!(git.exists_in_head("README.md").expect("cat-file"));
        assert!(!git.exists_in_head("missing.rs").expect("cat-file"));
    }
}
