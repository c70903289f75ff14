//! Global invocation lock shared by the chat and dispatch flows.
//!
//! The lock file is created with exclusive-create semantics, so at most one
//! agent invocation is in flight per state home across processes.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::fsutil::{read_optional, remove_if_exists};

/// Which flow holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockHolder {
    Dispatch,
    Chat,
    /// Operator branch switch (`relay session new`).
    Session,
}

impl LockHolder {
    pub fn as_str(self) -> &'static str {
        match self {
            LockHolder::Dispatch => "dispatch",
            LockHolder::Chat => "chat",
            LockHolder::Session => "session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: LockHolder,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u32>,
}

/// Returned (inside `anyhow::Error`) when another invocation holds the lock.
#[derive(Debug, Clone)]
pub struct LockHeldError {
    pub current: Option<LockInfo>,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.current {
            Some(info) => write!(
                f,
                "lock held by {} (pid {}, since {})",
                info.holder.as_str(),
                info.pid,
                info.acquired_at.to_rfc3339()
            ),
            None => write!(f, "lock held (holder unreadable)"),
        }
    }
}

impl std::error::Error for LockHeldError {}

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    info: LockInfo,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours; `kill` may have cleared it.
        match read(&self.path) {
            Ok(Some(current)) if current == self.info => {
                if let Err(err) = remove_if_exists(&self.path) {
                    warn!(err = %err, "failed to release lock");
                } else {
                    debug!(holder = self.info.holder.as_str(), "lock released");
                }
            }
            Ok(_) => debug!("lock already cleared"),
            Err(err) => warn!(err = %err, "failed to read lock on release"),
        }
    }
}

/// Try to take the lock; fails with [`LockHeldError`] if it exists.
pub fn acquire(path: &Path, holder: LockHolder, task_id: Option<u32>) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let info = LockInfo {
        holder,
        pid: std::process::id(),
        acquired_at: Utc::now(),
        task_id,
    };
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let current = read(path).unwrap_or(None);
            return Err(LockHeldError { current }.into());
        }
        Err(err) => return Err(err).with_context(|| format!("create lock {}", path.display())),
    };
    let mut buf = serde_json::to_string_pretty(&info).context("serialize lock")?;
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write lock {}", path.display()))?;
    debug!(holder = holder.as_str(), ?task_id, "lock acquired");
    Ok(LockGuard {
        path: path.to_path_buf(),
        info,
    })
}

/// Current lock holder, if any.
pub fn read(path: &Path) -> Result<Option<LockInfo>> {
    let Some(contents) = read_optional(path)? else {
        return Ok(None);
    };
    let info = serde_json::from_str(&contents)
        .with_context(|| format!("parse lock {}", path.display()))?;
    Ok(Some(info))
}

/// Remove the lock regardless of holder (operator recovery).
pub fn force_clear(path: &Path) -> Result<bool> {
    remove_if_exists(path)
}
