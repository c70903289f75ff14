//! Deterministic task selection for the dispatch engine.

use crate::core::types::{DispatchTask, TaskStatus};

/// Result of scanning a dispatch run for the next task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<'a> {
    /// Lowest-id pending task whose dependencies are all `done`.
    Runnable(&'a DispatchTask),
    /// Unresolved tasks remain but none is runnable (ids of the unresolved tasks).
    Blocked(Vec<u32>),
    /// Every task is `done` or `error`.
    Complete,
}

/// True if the task has not started (`pending` or no status at all).
pub fn is_pending(status: Option<TaskStatus>) -> bool {
    matches!(status, None | Some(TaskStatus::Pending))
}

/// True if the task can still change state.
pub fn is_unresolved(status: Option<TaskStatus>) -> bool {
    matches!(
        status,
        None | Some(TaskStatus::Pending) | Some(TaskStatus::Running)
    )
}

/// Pick the next runnable task.
///
/// A task whose dependency ended in `error` is never selected; the caller
/// sees `Blocked` until an operator intervenes.
pub fn next_runnable(tasks: &[DispatchTask]) -> Selection<'_> {
    let deps_done = |task: &DispatchTask| {
        task.deps.iter().all(|dep| {
            tasks
                .iter()
                .find(|candidate| candidate.id == *dep)
                .is_some_and(|candidate| candidate.status == Some(TaskStatus::Done))
        })
    };

    let runnable = tasks
        .iter()
        .filter(|task| is_pending(task.status) && deps_done(task))
        .min_by_key(|task| task.id);
    if let Some(task) = runnable {
        return Selection::Runnable(task);
    }

    let mut unresolved: Vec<u32> = tasks
        .iter()
        .filter(|task| is_unresolved(task.status))
        .map(|task| task.id)
        .collect();
    if unresolved.is_empty() {
        return Selection::Complete;
    }
    unresolved.sort_unstable();
    Selection::Blocked(unresolved)
}
