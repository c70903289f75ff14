//! Shared deterministic types for relay core logic.
//!
//! These types define the persisted record contracts (plan, dispatch run,
//! tasks). They carry no I/O and serialize to stable JSON.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every plan and dispatch record.
pub const RECORD_VERSION: u32 = 1;

/// Interchangeable agent backend (a.k.a. platform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Codex,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Claude, BackendKind::Codex, BackendKind::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
            BackendKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown backend '{s}' (expected claude, codex or gemini)"))
    }
}

/// Coarse difficulty/cost bucket used to pick a default platform and model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Mid,
    Top,
}

/// Per-task execution status. Moves only `pending -> running -> done|error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }
}

/// Plan-level status shared by [`ExecutionPlan`] and [`DispatchRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    PendingReview,
    Confirming,
    SelectingModel,
    Approved,
    Executing,
    Stopped,
    Completed,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::PendingReview => "pending_review",
            PlanStatus::Confirming => "confirming",
            PlanStatus::SelectingModel => "selecting_model",
            PlanStatus::Approved => "approved",
            PlanStatus::Executing => "executing",
            PlanStatus::Stopped => "stopped",
            PlanStatus::Completed => "completed",
        }
    }
}

impl FromStr for PlanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s.trim() {
            "pending_review" => PlanStatus::PendingReview,
            "confirming" => PlanStatus::Confirming,
            "selecting_model" => PlanStatus::SelectingModel,
            "approved" => PlanStatus::Approved,
            "executing" => PlanStatus::Executing,
            "stopped" => PlanStatus::Stopped,
            "completed" => PlanStatus::Completed,
            other => return Err(anyhow!("unknown plan status '{other}'")),
        };
        Ok(status)
    }
}

/// How the dispatch engine proceeds after a task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Pause after every task until the operator continues or stops.
    #[default]
    Step,
    /// Run every runnable task back to back.
    Auto,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Step => "step",
            ExecutionMode::Auto => "auto",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "step" => Ok(ExecutionMode::Step),
            "auto" => Ok(ExecutionMode::Auto),
            other => Err(anyhow!("unknown execution mode '{other}' (expected step or auto)")),
        }
    }
}

/// One unit of work inside an [`ExecutionPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub difficulty: u8,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub deps: Vec<u32>,
    /// Files the task is allowed to touch (prompt scope boundary).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The editable task list before and during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub version: u32,
    pub status: PlanStatus,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_platform: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ExecutionPlan {
    pub fn task(&self, id: u32) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: u32) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }
}

/// Execution-facing projection of a task with platform and model resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: u32,
    pub description: String,
    pub platform: BackendKind,
    pub model: String,
    #[serde(default)]
    pub deps: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The approved snapshot of a plan that the dispatch engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRun {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub status: PlanStatus,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_ref: Option<String>,
    pub tasks: Vec<DispatchTask>,
}

impl DispatchRun {
    pub fn task(&self, id: u32) -> Option<&DispatchTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: u32) -> Option<&mut DispatchTask> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Stable identifier used to group per-task artifacts on disk.
    pub fn run_stamp(&self) -> String {
        self.timestamp.format("%Y%m%d-%H%M%S").to_string()
    }
}
