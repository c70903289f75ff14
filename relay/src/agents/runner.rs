//! Agent runner: one invocation plus at most one fallback retry.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::failure::{AttemptView, is_rate_limited, should_fallback};
use crate::core::tiers::{TierTable, fallback_models};
use crate::core::types::BackendKind;
use crate::io::backend::{Backends, InvokeRequest, Invocation};
use crate::io::config::RelayConfig;

/// Settings shared by every invocation.
#[derive(Debug, Clone)]
pub struct RunnerPolicy {
    /// Routine/fallback models per backend, from the tier table.
    pub tiers: TierTable,
    pub rate_limit_markers: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub extra_flags: Vec<String>,
    /// Where the in-flight child pid is recorded.
    pub pid_path: Option<PathBuf>,
}

impl RunnerPolicy {
    pub fn from_config(cfg: &RelayConfig, pid_path: Option<PathBuf>) -> Self {
        Self {
            tiers: cfg.tiers.clone(),
            rate_limit_markers: cfg.agent.rate_limit_markers.clone(),
            timeout: Duration::from_secs(cfg.agent.timeout_secs),
            output_limit_bytes: cfg.agent.output_limit_bytes,
            extra_flags: cfg.agent.extra_flags.clone(),
            pid_path,
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub platform: BackendKind,
    pub model: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub sandboxed: bool,
    pub primary_log: Option<PathBuf>,
    pub fallback_log: Option<PathBuf>,
}

/// One invocation and its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub model: String,
    pub invocation: Invocation,
    pub rate_limited: bool,
}

impl Attempt {
    fn view(&self) -> AttemptView<'_> {
        AttemptView {
            exit_code: self.invocation.exit_code,
            output: &self.invocation.output,
            stderr: &self.invocation.stderr,
        }
    }

    pub fn has_output(&self) -> bool {
        self.view().has_output()
    }
}

/// Outcome of a primary attempt and its optional fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub primary: Attempt,
    pub fallback: Option<Attempt>,
    /// Output of the successful attempt, or a synthetic diagnostic.
    pub output: String,
    pub succeeded: bool,
}

impl AgentRun {
    /// The attempt whose result counts.
    pub fn final_attempt(&self) -> &Attempt {
        self.fallback.as_ref().unwrap_or(&self.primary)
    }

    /// True when the fallback attempt produced the output.
    pub fn recovered_by_fallback(&self) -> bool {
        self.succeeded && self.fallback.is_some()
    }
}

/// Runs agents through the backend registry with the fallback policy applied.
pub struct AgentRunner<'a> {
    backends: &'a Backends,
    policy: RunnerPolicy,
}

impl<'a> AgentRunner<'a> {
    pub fn new(backends: &'a Backends, policy: RunnerPolicy) -> Self {
        Self { backends, policy }
    }

    /// Invoke the agent; retry once with the invoked backend's fallback model
    /// when the primary attempt produced nothing and qualifies.
    ///
    /// `Err` only when a backend could not be run at all.
    #[instrument(skip_all, fields(platform = %request.platform, model = %request.model))]
    pub fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        let primary = self.attempt(request, &request.model, request.primary_log.clone())?;
        if primary.has_output() {
            return Ok(AgentRun {
                output: primary.invocation.output.clone(),
                primary,
                fallback: None,
                succeeded: true,
            });
        }

        let fallback_model = match fallback_models(&self.policy.tiers, request.platform) {
            Some((routine, fallback))
                if should_fallback(&primary.view(), &request.model, routine, fallback) =>
            {
                Some(fallback.to_string())
            }
            _ => None,
        };
        let fallback = match fallback_model {
            Some(model) => {
                info!(
                    from = %request.model,
                    to = %model,
                    rate_limited = primary.rate_limited,
                    "retrying with fallback model"
                );
                Some(self.attempt(request, &model, request.fallback_log.clone())?)
            }
            None => None,
        };

        if let Some(attempt) = &fallback
            && attempt.has_output()
        {
            return Ok(AgentRun {
                output: attempt.invocation.output.clone(),
                primary,
                fallback,
                succeeded: true,
            });
        }

        let output = diagnostic(&primary, fallback.as_ref());
        warn!(%output, "agent produced no usable output");
        Ok(AgentRun {
            primary,
            fallback,
            output,
            succeeded: false,
        })
    }

    fn attempt(&self, request: &AgentRequest, model: &str, log_path: Option<PathBuf>) -> Result<Attempt> {
        let backend = self.backends.get(request.platform)?;
        let invocation = backend.invoke(&InvokeRequest {
            workdir: request.workdir.clone(),
            prompt: request.prompt.clone(),
            model: model.to_string(),
            sandboxed: request.sandboxed,
            timeout: self.policy.timeout,
            output_limit_bytes: self.policy.output_limit_bytes,
            extra_flags: self.policy.extra_flags.clone(),
            log_path,
            pid_path: self.policy.pid_path.clone(),
        })?;
        let view = AttemptView {
            exit_code: invocation.exit_code,
            output: &invocation.output,
            stderr: &invocation.stderr,
        };
        let rate_limited = is_rate_limited(&view, &self.policy.rate_limit_markers);
        Ok(Attempt {
            model: model.to_string(),
            invocation,
            rate_limited,
        })
    }
}

const STDERR_TAIL_CHARS: usize = 400;

/// Human-readable explanation for an empty result.
fn diagnostic(primary: &Attempt, fallback: Option<&Attempt>) -> String {
    let mut lines = vec![format!("No output from {}", describe(primary))];
    if let Some(fallback) = fallback {
        lines.push(format!("Fallback: no output from {}", describe(fallback)));
    }
    let last = fallback.unwrap_or(primary);
    let stderr = last.invocation.stderr.trim();
    if !stderr.is_empty() {
        lines.push(format!("stderr: {}", tail_chars(stderr, STDERR_TAIL_CHARS)));
    }
    lines.join("\n")
}

fn describe(attempt: &Attempt) -> String {
    let status = if attempt.invocation.timed_out {
        "timed out".to_string()
    } else {
        match attempt.invocation.exit_code {
            Some(code) => format!("exit {code}"),
            None => "killed".to_string(),
        }
    };
    let limited = if attempt.rate_limited { ", rate limited" } else { "" };
    format!("{} ({status}{limited})", attempt.model)
}

/// Last `max` characters of `text`.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
