//! Per-invocation artifacts under `runs/`.
//!
//! These are product artifacts for post-mortem inspection and are always
//! written, independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Artifact paths for one task (or one chat turn).
#[derive(Debug, Clone)]
pub struct TaskLogPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub primary_log_path: PathBuf,
    pub fallback_log_path: PathBuf,
    pub report_path: PathBuf,
}

impl TaskLogPaths {
    /// `runs/<run-stamp>/task-<id>/`
    pub fn for_task(runs_dir: &Path, run_stamp: &str, task_id: u32) -> Self {
        Self::in_dir(runs_dir.join(run_stamp).join(format!("task-{task_id}")))
    }

    /// `runs/chat/<stamp>/`
    pub fn for_chat(runs_dir: &Path, stamp: &str) -> Self {
        Self::in_dir(runs_dir.join("chat").join(stamp))
    }

    fn in_dir(dir: PathBuf) -> Self {
        Self {
            prompt_path: dir.join("prompt.md"),
            primary_log_path: dir.join("primary.log"),
            fallback_log_path: dir.join("fallback.log"),
            report_path: dir.join("report.md"),
            dir,
        }
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        self.write(&self.prompt_path, prompt)
    }

    pub fn write_report(&self, report: &str) -> Result<()> {
        self.write(&self.report_path, report)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create task log dir {}", self.dir.display()))?;
        fs::write(path, contents).with_context(|| format!("write task log {}", path.display()))
    }
}
