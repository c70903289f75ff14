//! Human-readable plan rendering for approval prompts and status queries.

use crate::core::progress::Progress;
use crate::core::types::{ExecutionPlan, Task, TaskStatus};

/// Render every task with its resolved platform/model, difficulty badge, and deps.
pub fn format_summary(plan: &ExecutionPlan) -> String {
    let progress = Progress::from_statuses(plan.tasks.iter().map(|task| task.status));
    let mut lines = Vec::with_capacity(plan.tasks.len() + 3);
    lines.push(format!(
        "Plan: {} ({} tasks, done {}, error {}, remaining {})",
        plan.status.as_str(),
        progress.total,
        progress.done,
        progress.error,
        progress.remaining()
    ));
    if let Some(spec) = &plan.spec_ref {
        lines.push(format!("Spec: {spec}"));
    }
    for task in &plan.tasks {
        lines.push(format_task_line(task));
    }
    lines.join("\n")
}

fn format_task_line(task: &Task) -> String {
    let platform = task
        .platform
        .map(|platform| platform.as_str())
        .unwrap_or("?");
    let model = task.model.as_deref().unwrap_or("?");
    let deps = if task.deps.is_empty() {
        "-".to_string()
    } else {
        task.deps
            .iter()
            .map(|dep| format!("#{dep}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut line = format!(
        "{} #{} {} {} [{platform}/{model}] deps: {deps}",
        status_marker(task.status),
        task.id,
        difficulty_badge(task.difficulty),
        task.summary.as_deref().unwrap_or(&task.description),
    );
    if let Some(error) = &task.error {
        line.push_str(&format!("\n    error: {error}"));
    }
    line
}

/// Three-dot badge: 1-2 low, 3 medium, 4-5 high.
pub fn difficulty_badge(difficulty: u8) -> &'static str {
    match difficulty {
        0..=2 => "(●○○)",
        3 => "(●●○)",
        _ => "(●●●)",
    }
}

fn status_marker(status: Option<TaskStatus>) -> &'static str {
    match status {
        None | Some(TaskStatus::Pending) => "[ ]",
        Some(TaskStatus::Running) => "[>]",
        Some(TaskStatus::Done) => "[x]",
        Some(TaskStatus::Error) => "[!]",
    }
}
