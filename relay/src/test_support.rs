//! Test-only helpers: record builders, a scratch git repo, and a scripted backend.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::core::types::{
    BackendKind, DispatchRun, DispatchTask, ExecutionMode, ExecutionPlan, PlanStatus,
    RECORD_VERSION, Task, Tier,
};
use crate::io::backend::{Backend, Backends, InvokeRequest, Invocation};
use crate::io::config::RelayConfig;
use crate::io::init::{InitOptions, RelayPaths, init_relay};

/// Create a deterministic task (`"task {id}"`, difficulty 3, no platform/model).
pub fn task(id: u32, deps: &[u32]) -> Task {
    Task {
        id,
        description: format!("task {id}"),
        summary: None,
        difficulty: 3,
        tier: Tier::Mid,
        platform: None,
        model: None,
        deps: deps.to_vec(),
        scope: Vec::new(),
        status: None,
        error: None,
    }
}

/// Wrap tasks in a plan with status `pending_review`.
pub fn plan_with(tasks: Vec<Task>) -> ExecutionPlan {
    ExecutionPlan {
        version: RECORD_VERSION,
        status: PlanStatus::PendingReview,
        tasks,
        spec_ref: None,
        default_platform: None,
        default_model: None,
    }
}

/// Create a dispatch task on `claude/opus` with no status.
pub fn dispatch_task(id: u32, deps: &[u32]) -> DispatchTask {
    DispatchTask {
        id,
        description: format!("task {id}"),
        platform: BackendKind::Claude,
        model: "opus".to_string(),
        deps: deps.to_vec(),
        scope: Vec::new(),
        status: None,
        error: None,
    }
}

/// Wrap tasks in an approved step-mode run with a fixed timestamp.
pub fn dispatch_run(tasks: Vec<DispatchTask>) -> DispatchRun {
    DispatchRun {
        version: RECORD_VERSION,
        timestamp: Utc
            .with_ymd_and_hms(2025, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
        status: PlanStatus::Approved,
        mode: ExecutionMode::Step,
        spec_ref: None,
        tasks,
    }
}

/// A temporary git repository on `main` with one commit (`README.md`).
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        git(&root, &["init", "-q"]);
        git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&root, &["config", "user.email", "test@example.com"]);
        git(&root, &["config", "user.name", "test"]);
        git(&root, &["config", "commit.gpgsign", "false"]);
        fs::write(root.join("README.md"), "hi\n").expect("write readme");
        git(&root, &["add", "README.md"]);
        git(&root, &["commit", "-q", "-m", "chore: init"]);
        Self { _temp: temp, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Initialize the state home and return it.
    pub fn init_relay(&self) -> RelayPaths {
        init_relay(&self.root.join(".relay"), &InitOptions { force: false }).expect("init relay")
    }

    /// Default config pointed at this repo, with short poll intervals.
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            project_dir: self.root.clone(),
            poll_interval_ms: 10,
            continue_poll_interval_ms: 20,
            ..RelayConfig::default()
        }
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    /// Run git in the repo and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        git(&self.root, args)
    }

    pub fn commit_count(&self) -> usize {
        self.git(&["rev-list", "--count", "HEAD"])
            .parse()
            .expect("commit count")
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(root: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// One scripted backend response, plus files the "agent" writes before returning.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCall {
    pub invocation: Invocation,
    pub files: Vec<(String, String)>,
}

impl ScriptedCall {
    /// Exit 0 with `output` on stdout.
    pub fn ok(output: &str) -> Self {
        Self {
            invocation: Invocation {
                output: output.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
            },
            files: Vec::new(),
        }
    }

    /// Non-zero exit, no output, and a quota marker on stderr.
    pub fn rate_limited() -> Self {
        Self {
            invocation: Invocation {
                output: String::new(),
                stderr: "Error: rate limit exceeded (429)".to_string(),
                exit_code: Some(1),
                timed_out: false,
            },
            files: Vec::new(),
        }
    }

    /// Non-zero exit with unrelated stderr.
    pub fn failed(stderr: &str) -> Self {
        Self {
            invocation: Invocation {
                output: String::new(),
                stderr: stderr.to_string(),
                exit_code: Some(2),
                timed_out: false,
            },
            files: Vec::new(),
        }
    }

    /// Also write `contents` to `rel` (relative to the request workdir).
    pub fn writing(mut self, rel: &str, contents: &str) -> Self {
        self.files.push((rel.to_string(), contents.to_string()));
        self
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    calls: Vec<ScriptedCall>,
    requests: Vec<InvokeRequest>,
    observed: Vec<bool>,
}

/// Backend that replays scripted calls and records every request.
///
/// Clones share state, so a test can keep a handle after registering a clone.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    kind: BackendKind,
    observe: Option<PathBuf>,
    state: Rc<RefCell<ScriptedState>>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, calls: Vec<ScriptedCall>) -> Self {
        let mut calls = calls;
        calls.reverse();
        Self {
            kind,
            observe: None,
            state: Rc::new(RefCell::new(ScriptedState {
                calls,
                ..ScriptedState::default()
            })),
        }
    }

    /// Record whether `path` exists at the moment of each invocation.
    pub fn observing(mut self, path: impl Into<PathBuf>) -> Self {
        self.observe = Some(path.into());
        self
    }

    pub fn requests(&self) -> Vec<InvokeRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests().into_iter().map(|req| req.model).collect()
    }

    pub fn observed(&self) -> Vec<bool> {
        self.state.borrow().observed.clone()
    }

    pub fn remaining(&self) -> usize {
        self.state.borrow().calls.len()
    }

    /// Registry containing only this backend.
    pub fn registry(&self) -> Backends {
        let mut backends = Backends::new();
        backends.register(Box::new(self.clone()));
        backends
    }
}

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        if let Some(path) = &self.observe {
            state.observed.push(path.exists());
        }
        let call = state
            .calls
            .pop()
            .ok_or_else(|| anyhow!("scripted backend exhausted"))?;
        for (rel, contents) in &call.files {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }
        Ok(call.invocation)
    }
}
