//! Task counters shared by narration and completion checks.

use crate::core::types::TaskStatus;

/// Done/error/unresolved counts for a task list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub error: usize,
    pub running: usize,
}

impl Progress {
    pub fn from_statuses<I: IntoIterator<Item = Option<TaskStatus>>>(statuses: I) -> Self {
        let mut progress = Progress::default();
        for status in statuses {
            progress.total += 1;
            match status {
                Some(TaskStatus::Done) => progress.done += 1,
                Some(TaskStatus::Error) => progress.error += 1,
                Some(TaskStatus::Running) => progress.running += 1,
                Some(TaskStatus::Pending) | None => {}
            }
        }
        progress
    }

    /// `total - done - error`.
    pub fn remaining(&self) -> usize {
        self.total - self.done - self.error
    }

    /// A plan is complete iff every task is `done` or `error`.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}
