//! Session branch lifecycle, checkpoint commits, and the plan-drafting guard.
//!
//! The session identity lives in `state/session.json`; branch names are derived
//! from that record instead of being parsed back out of git.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{PathClass, classify_path, is_under};
use crate::io::config::RelayConfig;
use crate::io::fsutil::{read_optional, write_atomic, write_json_atomic};
use crate::io::git::Git;
use crate::io::init::{CONTINUATION_PLACEHOLDER, RelayPaths};
use crate::io::signals::is_drafting;

const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Archive the current branch and start over from trunk.
    Fresh,
    /// Keep working on the existing branch.
    Continue,
}

/// Persisted session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBranch {
    pub name: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
}

impl SessionBranch {
    pub fn new(name: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            name: name.into(),
            mode,
            started_at: Utc::now(),
        }
    }

    /// Name the branch is renamed to when a fresh session replaces it.
    pub fn archived_name(&self) -> String {
        format!(
            "{}-archived-{}",
            self.name,
            self.started_at.format(ARCHIVE_STAMP_FORMAT)
        )
    }
}

/// Git-facing session operations for one state home.
pub struct SessionManager<'a> {
    paths: &'a RelayPaths,
    config: &'a RelayConfig,
    git: Git,
}

impl<'a> SessionManager<'a> {
    pub fn new(paths: &'a RelayPaths, config: &'a RelayConfig) -> Self {
        Self {
            paths,
            config,
            git: Git::new(&config.project_dir),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn load_record(&self) -> Result<Option<SessionBranch>> {
        let path = &self.paths.session_path;
        let Some(contents) = read_optional(path)? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&contents)
            .with_context(|| format!("parse session record {}", path.display()))?;
        Ok(Some(record))
    }

    fn save_record(&self, record: &SessionBranch) -> Result<()> {
        write_json_atomic(&self.paths.session_path, record)
    }

    /// Make sure the session branch is checked out.
    #[instrument(skip(self))]
    pub fn ensure_branch(&self, mode: SessionMode) -> Result<SessionBranch> {
        let name = self.config.session.branch.as_str();
        match mode {
            SessionMode::Fresh => self.start_fresh(name),
            SessionMode::Continue => self.continue_existing(name),
        }
    }

    fn start_fresh(&self, name: &str) -> Result<SessionBranch> {
        if self.git.branch_exists(name)? {
            let previous = match self.load_record()? {
                Some(record) if record.name == name => record,
                _ => SessionBranch::new(name, SessionMode::Continue),
            };
            if self.git.current_branch().ok().as_deref() == Some(name) {
                // Pending work travels with the archived branch.
                self.commit("archive session")?;
            }
            let archived = self.unused_archive_name(&previous)?;
            self.git.rename_branch(name, &archived)?;
            info!(from = name, to = %archived, "archived session branch");
        }
        self.git
            .checkout_new_branch_from(name, &self.config.session.trunk_branch)?;
        write_atomic(&self.paths.continuation_path, CONTINUATION_PLACEHOLDER)?;

        let record = SessionBranch::new(name, SessionMode::Fresh);
        self.save_record(&record)?;
        info!(branch = name, trunk = %self.config.session.trunk_branch, "started fresh session");
        Ok(record)
    }

    fn continue_existing(&self, name: &str) -> Result<SessionBranch> {
        if self.git.branch_exists(name)? {
            if self.git.current_branch().ok().as_deref() != Some(name) {
                self.git.checkout_branch(name)?;
            }
        } else {
            debug!(branch = name, "session branch missing, creating from trunk");
            self.git
                .checkout_new_branch_from(name, &self.config.session.trunk_branch)?;
        }
        match self.load_record()? {
            Some(record) if record.name == name => Ok(record),
            _ => {
                let record = SessionBranch::new(name, SessionMode::Continue);
                self.save_record(&record)?;
                Ok(record)
            }
        }
    }

    fn unused_archive_name(&self, previous: &SessionBranch) -> Result<String> {
        let base = previous.archived_name();
        let mut candidate = base.clone();
        let mut n = 2;
        while self.git.branch_exists(&candidate)? {
            candidate = format!("{base}-{n}");
            n += 1;
        }
        Ok(candidate)
    }

    /// Stage everything except the state home and commit as `relay: <tag>`.
    ///
    /// Returns `Ok(false)` when there was nothing to commit.
    #[instrument(skip(self))]
    pub fn commit(&self, tag: &str) -> Result<bool> {
        let home = self.state_home_pathspec();
        let excluded: Vec<&str> = home.iter().map(String::as_str).collect();
        self.git.add_all_except(&excluded)?;
        let committed = self.git.commit_staged(&format!("relay: {tag}"))?;
        if committed {
            info!(tag, "checkpoint committed");
        }
        Ok(committed)
    }

    /// State home relative to the project, when it lies inside it.
    fn state_home_pathspec(&self) -> Option<String> {
        let project = fs::canonicalize(&self.config.project_dir).ok()?;
        let home = fs::canonicalize(&self.paths.home).unwrap_or_else(|_| self.paths.home.clone());
        let rel = home.strip_prefix(&project).ok()?;
        if rel.as_os_str().is_empty() {
            warn!("state home is the project root; nothing excluded from commits");
            return None;
        }
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    /// Revert code changes while a plan is being drafted.
    ///
    /// No-op (empty list) when the drafting marker is absent.
    pub fn enforce_draft_guard(&self) -> Result<Vec<String>> {
        if !is_drafting(self.paths) {
            return Ok(Vec::new());
        }
        self.revert_code_changes()
    }

    /// Restore tracked code files from `HEAD` and delete new ones.
    ///
    /// Paths are taken relative to the repository root, which must be the
    /// project directory.
    pub fn revert_code_changes(&self) -> Result<Vec<String>> {
        let home = self.state_home_pathspec();
        let mut reverted = Vec::new();
        for entry in self.git.status_porcelain()? {
            let candidates = std::iter::once(entry.path.clone()).chain(entry.orig_path.clone());
            for path in candidates {
                if home
                    .as_deref()
                    .is_some_and(|home| is_under(Path::new(&path), Path::new(home)))
                {
                    continue;
                }
                if classify_path(Path::new(&path), &self.config.draft_guard.code_extensions)
                    != PathClass::Code
                {
                    continue;
                }
                self.revert_path(&path)?;
                reverted.push(path);
            }
        }
        reverted.sort();
        reverted.dedup();
        if !reverted.is_empty() {
            info!(count = reverted.len(), paths = ?reverted, "draft guard reverted code changes");
        }
        Ok(reverted)
    }

    fn revert_path(&self, path: &str) -> Result<()> {
        if self.git.exists_in_head(path)? {
            return self.git.restore_from_head(path);
        }
        self.git.unstage(path)?;
        let full = self.git.workdir().join(path);
        if full.is_file() || full.is_symlink() {
            fs::remove_file(&full).with_context(|| format!("remove {}", full.display()))?;
        }
        Ok(())
    }

    /// Append a dated entry to the continuation log.
    pub fn append_continuation(&self, heading: &str, body: &str) -> Result<()> {
        let path = &self.paths.continuation_path;
        let mut log = read_optional(path)?.unwrap_or_else(|| CONTINUATION_PLACEHOLDER.to_string());
        if !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&format!(
            "## {} {}\n\n{}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            heading.trim(),
            body.trim_end()
        ));
        write_atomic(path, &log)
    }

    /// Last `max_bytes` of the continuation log, or `None` if it has no entries.
    pub fn continuation_tail(&self, max_bytes: usize) -> Result<Option<String>> {
        let Some(log) = read_optional(&self.paths.continuation_path)? else {
            return Ok(None);
        };
        let entries = log.strip_prefix(CONTINUATION_PLACEHOLDER).unwrap_or(&log).trim();
        if entries.is_empty() {
            return Ok(None);
        }
        let mut start = entries.len().saturating_sub(max_bytes);
        while !entries.is_char_boundary(start) {
            start += 1;
        }
        Ok(Some(entries[start..].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::signals::set_drafting;
    use crate::test_support::TestRepo;

    #[test]
    fn archived_name_uses_start_stamp() {
        let record = SessionBranch {
            name: "relay/session".to_string(),
            mode: SessionMode::Fresh,
            started_at: DateTime::parse_from_rfc3339("2025-03-04T05:06:07Z")
                .expect("timestamp")
                .with_timezone(&Utc),
        };
        assert_eq!(
            record.archived_name(),
            "relay/session-archived-20250304-050607"
        );
    }

    #[test]
    fn continue_creates_branch_from_trunk_then_reuses_it() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let session = SessionManager::new(&paths, &config);

        let first = session.ensure_branch(SessionMode::Continue).expect("ensure");
        assert_eq!(first.name, "relay/session");
        assert_eq!(repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]), "relay/session");

        repo.git(&["checkout", "-q", "main"]);
        let second = session.ensure_branch(SessionMode::Continue).expect("ensure");
        assert_eq!(second, first);
        assert_eq!(repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]), "relay/session");
    }

    #[test]
    fn fresh_archives_previous_branch_with_its_work() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let session = SessionManager::new(&paths, &config);

        let old = session.ensure_branch(SessionMode::Continue).expect("ensure");
        repo.write("notes.md", "old session\n");
        session.append_continuation("chat", "remember this").expect("append");

        let fresh = session.ensure_branch(SessionMode::Fresh).expect("fresh");
        assert_eq!(fresh.mode, SessionMode::Fresh);
        assert!(session.git().branch_exists(&old.archived_name()).expect("exists"));
        assert!(!repo.path().join("notes.md").exists());
        assert_eq!(session.continuation_tail(1000).expect("tail"), None);
        assert_eq!(session.load_record().expect("load"), Some(fresh));

        let archived_files = repo.git(&["ls-tree", "--name-only", &old.archived_name()]);
        assert!(archived_files.lines().any(|line| line == "notes.md"));
    }

    #[test]
    fn commit_excludes_state_home_and_reports_clean_tree() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let session = SessionManager::new(&paths, &config);
        std::fs::write(&paths.lock_path, "{}").expect("lock");
        repo.write("docs/plan.md", "plan\n");

        assert!(session.commit("task #1: write docs").expect("commit"));
        assert_eq!(repo.git(&["log", "-1", "--format=%s"]), "relay: task #1: write docs");
        let committed = repo.git(&["show", "--name-only", "--format=", "HEAD"]);
        assert_eq!(committed, "docs/plan.md");

        assert!(!session.commit("nothing").expect("commit"));
    }

    #[test]
    fn draft_guard_reverts_code_and_keeps_documents() {
        let repo = TestRepo::new();
        repo.write("main.py", "print('v1')\n");
        repo.git(&["add", "main.py"]);
        repo.git(&["commit", "-q", "-m", "add main"]);
        let paths = repo.init_relay();
        let config = repo.config();
        let session = SessionManager::new(&paths, &config);
        set_drafting(&paths).expect("drafting");

        repo.write("main.py", "print('v2')\n");
        repo.write("spec.md", "# Spec\n");
        repo.write("tools/new.rs", "fn main() {}\n");
        repo.write("Makefile", "all:\n");
        repo.git(&["add", "tools/new.rs"]);

        let reverted = session.enforce_draft_guard().expect("guard");
        assert_eq!(reverted, vec!["Makefile", "main.py", "tools/new.rs"]);
        assert_eq!(
            std::fs::read_to_string(repo.path().join("main.py")).expect("read"),
            "print('v1')\n"
        );
        assert!(!repo.path().join("tools/new.rs").exists());
        assert!(repo.path().join("spec.md").exists());

        assert!(session.enforce_draft_guard().expect("guard").is_empty());
        assert!(session.commit("chat").expect("commit"));
        let committed = repo.git(&["show", "--name-only", "--format=", "HEAD"]);
        assert_eq!(committed, "spec.md");
    }

    #[test]
    fn draft_guard_is_inactive_without_marker() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let session = SessionManager::new(&paths, &config);
        repo.write("app.js", "1;\n");
        assert!(session.enforce_draft_guard().expect("guard").is_empty());
        assert!(repo.path().join("app.js").exists());
    }

    #[test]
    fn continuation_tail_returns_latest_entries() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let session = SessionManager::new(&paths, &config);
        session.append_continuation("first", "alpha").expect("append");
        session.append_continuation("second", "omega").expect("append");

        let tail = session.continuation_tail(10_000).expect("tail").expect("entries");
        assert!(tail.contains("first"));
        assert!(tail.ends_with("omega"));
        let short = session.continuation_tail(5).expect("tail").expect("entries");
        assert_eq!(short, "omega");
    }
}
