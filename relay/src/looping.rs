//! Poll loop for `relay daemon`: each pass answers operator messages, then runs
//! one dispatch tick.

use std::thread;

use tracing::{debug, error, info};

use crate::chat::{ChatOutcome, process_inbox};
use crate::context::RelayContext;
use crate::dispatch::{Dispatcher, TickOutcome};

/// Counters for one `run_loop` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub passes: u64,
    pub replies: u64,
    pub tasks: u64,
    /// Chat or dispatch errors that were logged and skipped.
    pub errors: u64,
}

/// Run passes until `shutdown` returns true.
///
/// Errors never end the loop; they are logged and the next pass retries. The
/// loop sleeps `poll_interval` between passes unless a task just ran.
pub fn run_loop<F: FnMut() -> bool>(ctx: RelayContext<'_>, mut shutdown: F) -> LoopStats {
    let mut dispatcher = Dispatcher::new();
    let mut stats = LoopStats::default();
    info!(
        project = %ctx.config.project_dir.display(),
        home = %ctx.paths.home.display(),
        "relay loop started"
    );
    while !shutdown() {
        let ran_task = run_pass(ctx, &mut dispatcher, &mut stats);
        if !ran_task {
            thread::sleep(ctx.config.poll_interval());
        }
    }
    info!(?stats, "relay loop stopped");
    stats
}

/// One chat pass and one dispatch tick. Returns whether a task ran.
pub fn run_pass(ctx: RelayContext<'_>, dispatcher: &mut Dispatcher, stats: &mut LoopStats) -> bool {
    stats.passes += 1;
    match process_inbox(ctx) {
        Ok(ChatOutcome::Replied { messages, .. }) => {
            stats.replies += 1;
            debug!(messages, "chat replied");
        }
        Ok(outcome) => debug!(?outcome, "chat pass"),
        Err(err) => {
            stats.errors += 1;
            error!(err = %format!("{err:#}"), "chat pass failed");
        }
    }
    match dispatcher.tick(ctx) {
        Ok(TickOutcome::Ran(task)) => {
            stats.tasks += 1;
            debug!(id = task.id, status = task.status.as_str(), "dispatch ran task");
            true
        }
        Ok(outcome) => {
            debug!(?outcome, "dispatch tick");
            false
        }
        Err(err) => {
            stats.errors += 1;
            error!(err = %format!("{err:#}"), "dispatch tick failed");
            false
        }
    }
}
