//! Backend abstraction for coding-agent CLIs.
//!
//! The [`Backend`] trait decouples dispatch and chat from the actual agent
//! process (`claude -p`, `codex exec`, `gemini`). Tests use scripted backends
//! that return predetermined invocations without spawning processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::BackendKind;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one backend invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Working directory for the agent process (the project).
    pub workdir: PathBuf,
    /// Prompt text fed on stdin.
    pub prompt: String,
    pub model: String,
    /// Restrict the agent to workspace writes where the backend supports it.
    pub sandboxed: bool,
    pub timeout: Duration,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Extra CLI flags appended before the prompt.
    pub extra_flags: Vec<String>,
    /// Where to write the stdout/stderr log, if anywhere.
    pub log_path: Option<PathBuf>,
    /// Where to record the child pid while it runs.
    pub pid_path: Option<PathBuf>,
}

/// Result of one backend invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub output: String,
    pub stderr: String,
    /// `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Abstraction over agent backends.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Run the agent once. Non-zero exits are reported in the result, not as errors;
    /// `Err` means the process could not be run at all.
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation>;
}

/// Backend adapters keyed by kind.
#[derive(Default)]
pub struct Backends {
    entries: BTreeMap<BackendKind, Box<dyn Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the real CLI adapters.
    pub fn system() -> Self {
        let mut backends = Self::new();
        backends.register(Box::new(ClaudeBackend::new("claude")));
        backends.register(Box::new(CodexBackend::new("codex")));
        backends.register(Box::new(GeminiBackend::new("gemini")));
        backends
    }

    /// Register (or replace) the adapter for `backend.kind()`.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.entries.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: BackendKind) -> Result<&dyn Backend> {
        self.entries
            .get(&kind)
            .map(|backend| backend.as_ref())
            .ok_or_else(|| anyhow!("no backend registered for {kind}"))
    }
}

/// Adapter for `claude -p`.
pub struct ClaudeBackend {
    program: String,
}

impl ClaudeBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Backend for ClaudeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    #[instrument(skip_all, fields(model = %request.model, sandboxed = request.sandboxed))]
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let _hooks = HookStash::stash(&request.workdir)?;
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p")
            .arg("--model")
            .arg(&request.model)
            .arg("--output-format")
            .arg("text");
        if request.sandboxed {
            cmd.arg("--permission-mode").arg("acceptEdits");
        } else {
            cmd.arg("--dangerously-skip-permissions");
        }
        run_cli(cmd, request, "claude")
    }
}

/// Adapter for `codex exec`.
pub struct CodexBackend {
    program: String,
}

impl CodexBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Backend for CodexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    #[instrument(skip_all, fields(model = %request.model, sandboxed = request.sandboxed))]
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("exec")
            .arg("--skip-git-repo-check")
            .arg("--model")
            .arg(&request.model)
            .arg("--sandbox")
            .arg(if request.sandboxed {
                "workspace-write"
            } else {
                "danger-full-access"
            });
        run_cli(cmd, request, "codex")
    }
}

/// Adapter for the `gemini` CLI.
pub struct GeminiBackend {
    program: String,
}

impl GeminiBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Backend for GeminiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
    }

    #[instrument(skip_all, fields(model = %request.model, sandboxed = request.sandboxed))]
    fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--model").arg(&request.model).arg("--yolo");
        if request.sandboxed {
            cmd.arg("--sandbox");
        }
        run_cli(cmd, request, "gemini")
    }
}

fn run_cli(mut cmd: Command, request: &InvokeRequest, label: &str) -> Result<Invocation> {
    info!(backend = label, workdir = %request.workdir.display(), "starting agent");
    cmd.args(&request.extra_flags).current_dir(&request.workdir);
    let output = run_command_with_timeout(
        cmd,
        Some(request.prompt.as_bytes()),
        request.timeout,
        request.output_limit_bytes,
        request.pid_path.as_deref(),
    )
    .with_context(|| format!("run {label}"))?;

    if let Some(path) = &request.log_path {
        write_invocation_log(path, label, &request.model, &output)?;
    }
    if output.timed_out {
        warn!(backend = label, timeout_secs = request.timeout.as_secs(), "agent timed out");
    } else if !output.status.success() {
        warn!(backend = label, exit_code = ?output.status.code(), "agent exited non-zero");
    } else {
        debug!(backend = label, "agent completed");
    }

    Ok(Invocation {
        output: output.stdout_lossy(),
        stderr: output.stderr_lossy(),
        exit_code: output.exit_code(),
        timed_out: output.timed_out,
    })
}

fn write_invocation_log(path: &Path, label: &str, model: &str, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create invocation log dir {}", parent.display()))?;
    }
    let mut buf = format!(
        "backend: {label}\nmodel: {model}\nexit_code: {:?}\ntimed_out: {}\n",
        output.exit_code(),
        output.timed_out
    );
    buf.push_str("\n=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str(&output.truncated_notice("stdout"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf.push_str(&output.truncated_notice("stderr"));
    fs::write(path, buf).with_context(|| format!("write invocation log {}", path.display()))
}

const HOOK_SETTINGS: &[&str] = &["settings.json", "settings.local.json"];
const STASH_SUFFIX: &str = "relay-stash";

/// Moves project Claude settings that declare `hooks` aside for one invocation.
///
/// Project hooks can block or reroute a non-interactive run. The files are
/// restored when the guard drops, including on error paths.
#[derive(Debug)]
pub struct HookStash {
    moved: Vec<(PathBuf, PathBuf)>,
}

impl HookStash {
    pub fn stash(workdir: &Path) -> Result<Self> {
        let dir = workdir.join(".claude");
        let mut moved = Vec::new();
        for name in HOOK_SETTINGS {
            let path = dir.join(name);
            if !declares_hooks(&path) {
                continue;
            }
            let stashed = path.with_extension(format!("json.{STASH_SUFFIX}"));
            fs::rename(&path, &stashed)
                .with_context(|| format!("stash {}", path.display()))?;
            debug!(path = %path.display(), "stashed hook settings");
            moved.push((path, stashed));
        }
        Ok(Self { moved })
    }

    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }
}

impl Drop for HookStash {
    fn drop(&mut self) {
        for (original, stashed) in self.moved.drain(..) {
            if let Err(err) = fs::rename(&stashed, &original) {
                warn!(err = %err, path = %original.display(), "failed to restore hook settings");
            }
        }
    }
}

fn declares_hooks(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(value) => value.get("hooks").is_some(),
        Err(_) => false,
    }
}
