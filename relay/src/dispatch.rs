//! Dispatch engine: one tick selects and runs at most one task of the approved run.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::agents::report::{ReportLimits, read_completion_report};
use crate::agents::runner::{AgentRequest, AgentRun, AgentRunner, RunnerPolicy};
use crate::context::RelayContext;
use crate::core::progress::Progress;
use crate::core::selector::{Selection, next_runnable};
use crate::core::summary::format_summary;
use crate::core::types::{DispatchRun, DispatchTask, ExecutionMode, ExecutionPlan, PlanStatus, TaskStatus};
use crate::io::dispatch_store::DispatchStore;
use crate::io::fsutil::{quarantine, remove_if_exists};
use crate::io::init::RelayPaths;
use crate::io::lock::{self, LockHeldError, LockHolder};
use crate::io::plan_store::PlanStore;
use crate::io::prompt::{CompletedDep, PromptBuilder, TaskHeader, TaskPromptInputs};
use crate::io::queue::OutboundPayload;
use crate::io::signals::{WaitOutcome, is_drafting, wait_for_continue};
use crate::io::task_log::TaskLogPaths;
use crate::session::{SessionManager, SessionMode};

pub const CONTINUE_CALLBACK: &str = "dispatch:continue";
pub const STOP_CALLBACK: &str = "dispatch:stop";

/// Continue/stop buttons attached to step-through narration.
pub fn continue_markup() -> Value {
    json!({
        "inline_keyboard": [[
            { "text": "Continue", "callback_data": CONTINUE_CALLBACK },
            { "text": "Stop", "callback_data": STOP_CALLBACK },
        ]]
    })
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No approved dispatch run.
    Idle,
    /// A plan is being drafted; dispatch is paused.
    Drafting,
    /// Another invocation holds the lock.
    Busy,
    /// Unresolved tasks remain but none can start (their ids).
    Waiting(Vec<u32>),
    /// Every task was already resolved; the run was closed out.
    Completed,
    Ran(TaskOutcome),
}

/// Result of running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub id: u32,
    pub status: TaskStatus,
    /// Model that produced the final attempt.
    pub model: String,
    pub fallback_used: bool,
    pub report: String,
    pub progress: Progress,
    /// The run reached `completed` with this task.
    pub completed: bool,
    /// Step-through wait result, when the engine paused.
    pub wait: Option<WaitOutcome>,
}

/// Stateful driver for dispatch ticks.
///
/// Remembers the last blocked set so a stalled run is narrated once, not on
/// every poll.
#[derive(Debug, Default)]
pub struct Dispatcher {
    last_blocked: Option<Vec<u32>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run at most one ready task under the global lock.
    ///
    /// In step mode the lock is released before waiting for the operator's
    /// continue signal, so chat can run while the run is paused.
    pub fn tick(&mut self, ctx: RelayContext<'_>) -> Result<TickOutcome> {
        let paths = ctx.paths;
        if is_drafting(paths) {
            debug!("plan drafting in progress, dispatch paused");
            return Ok(TickOutcome::Drafting);
        }
        let dispatch = DispatchStore::new(&paths.dispatch_path);
        let Some(mut run) = load_or_quarantine(paths, "dispatch run", &paths.dispatch_path, || {
            dispatch.load()
        }) else {
            return Ok(TickOutcome::Idle);
        };
        if run.status != PlanStatus::Approved {
            return Ok(TickOutcome::Idle);
        }
        let plans = PlanStore::new(&paths.plan_path);
        let plan = load_or_quarantine(paths, "plan", &paths.plan_path, || plans.load());

        let task = match next_runnable(&run.tasks) {
            Selection::Runnable(task) => task.clone(),
            Selection::Blocked(ids) => {
                if self.last_blocked.as_ref() != Some(&ids) {
                    warn!(blocked = ?ids, "no runnable task; waiting on unresolved dependencies");
                    narrate(paths, OutboundPayload::Text(blocked_message(&run, &ids)));
                    self.last_blocked = Some(ids.clone());
                }
                return Ok(TickOutcome::Waiting(ids));
            }
            Selection::Complete => {
                self.last_blocked = None;
                finish_run(paths, &mut run, plan, None)?;
                return Ok(TickOutcome::Completed);
            }
        };
        self.last_blocked = None;

        let guard = match lock::acquire(&paths.lock_path, LockHolder::Dispatch, Some(task.id)) {
            Ok(guard) => guard,
            Err(err) => {
                if let Some(held) = err.downcast_ref::<LockHeldError>() {
                    debug!(%held, "dispatch tick skipped");
                    return Ok(TickOutcome::Busy);
                }
                return Err(err);
            }
        };

        mark_running(&dispatch, &mut run, &plans, plan.as_ref(), task.id)?;
        let before = progress_of(&run);
        let position = before.done + before.error + 1;
        info!(id = task.id, position, total = before.total, model = %task.model, "starting task");
        narrate(
            paths,
            OutboundPayload::Text(format!(
                "Task {position}/{}: #{} {}\nModel: {}/{}\nDone {} | Error {} | Remaining {}",
                before.total,
                task.id,
                task.description,
                task.platform,
                task.model,
                before.done,
                before.error,
                before.remaining()
            )),
        );

        let logs = TaskLogPaths::for_task(&paths.runs_dir, &run.run_stamp(), task.id);
        let prompt = PromptBuilder::new(ctx.config.agent.prompt_budget_bytes).build_task(
            &TaskPromptInputs {
                task: TaskHeader {
                    id: task.id,
                    position,
                    total: before.total,
                    description: task.description.clone(),
                },
                spec_ref: run.spec_ref.clone(),
                scope: task.scope.clone(),
                completed: completed_deps(&run, &task),
                plan_overview: plan.as_ref().map(format_summary).unwrap_or_default(),
                report_file: ctx.config.agent.report_file.clone(),
            },
        )?;
        if let Err(err) = logs.write_prompt(&prompt) {
            warn!(err = %err, "failed to write task prompt log");
        }

        let session = SessionManager::new(paths, ctx.config);
        if let Err(err) = session.ensure_branch(SessionMode::Continue) {
            warn!(err = %err, "could not check out session branch; running on current branch");
        }

        let runner = AgentRunner::new(
            ctx.backends,
            RunnerPolicy::from_config(ctx.config, Some(paths.pid_path.clone())),
        );
        let result = runner.run(&AgentRequest {
            platform: task.platform,
            model: task.model.clone(),
            prompt,
            workdir: ctx.config.project_dir.clone(),
            sandboxed: true,
            primary_log: Some(logs.primary_log_path.clone()),
            fallback_log: Some(logs.fallback_log_path.clone()),
        });
        let finished = conclude(ctx, &task, result);
        if let Err(err) = logs.write_report(&finished.report) {
            warn!(err = %err, "failed to write task report log");
        }

        let (run, plan) = record_result(paths, &task, &finished)?;
        if let Err(err) = session.commit(&format!("task #{}: {}", task.id, task.description)) {
            warn!(err = %err, "checkpoint commit failed");
        }
        drop(guard);

        let progress = run
            .as_ref()
            .map(progress_of)
            .or_else(|| plan.as_ref().map(|plan| Progress::from_statuses(plan.tasks.iter().map(|t| t.status))))
            .unwrap_or_default();
        let mut outcome = TaskOutcome {
            id: task.id,
            status: finished.status,
            model: finished.model.clone(),
            fallback_used: finished.fallback_used,
            report: finished.report.clone(),
            progress,
            completed: false,
            wait: None,
        };

        let Some(mut run) = run else {
            info!(id = task.id, "dispatch run removed while the task ran");
            narrate(paths, OutboundPayload::Text(result_message(&task, &finished, progress)));
            return Ok(TickOutcome::Ran(outcome));
        };
        if progress.is_complete() {
            finish_run(paths, &mut run, plan, Some(&finished.report))?;
            outcome.completed = true;
            return Ok(TickOutcome::Ran(outcome));
        }

        let text = result_message(&task, &finished, progress);
        match run.mode {
            ExecutionMode::Auto => narrate(paths, OutboundPayload::Text(text)),
            ExecutionMode::Step => {
                narrate(
                    paths,
                    OutboundPayload::Markup {
                        text,
                        markup: continue_markup(),
                    },
                );
                let wait = wait_for_continue(paths, ctx.config.continue_poll_interval())?;
                info!(?wait, "step-through wait finished");
                outcome.wait = Some(wait);
            }
        }
        Ok(TickOutcome::Ran(outcome))
    }
}

/// Outcome of one task invocation, before it is persisted.
#[derive(Debug, Clone)]
struct Finished {
    status: TaskStatus,
    model: String,
    fallback_used: bool,
    report: String,
    error: Option<String>,
}

fn conclude(ctx: RelayContext<'_>, task: &DispatchTask, result: Result<AgentRun>) -> Finished {
    let workdir = &ctx.config.project_dir;
    let report_file = &ctx.config.agent.report_file;
    let run = match result {
        Ok(run) => run,
        Err(err) => {
            warn!(id = task.id, err = %err, "agent invocation failed");
            discard_report(workdir, report_file);
            let message = format!("{err:#}");
            return Finished {
                status: TaskStatus::Error,
                model: task.model.clone(),
                fallback_used: false,
                report: message.clone(),
                error: Some(message),
            };
        }
    };
    let model = run.final_attempt().model.clone();
    let fallback_used = run.fallback.is_some();
    if !run.succeeded {
        discard_report(workdir, report_file);
        return Finished {
            status: TaskStatus::Error,
            model,
            fallback_used,
            report: run.output.clone(),
            error: Some(run.output),
        };
    }
    let limits = ReportLimits {
        min_bytes: ctx.config.agent.report_min_bytes,
        tail_bytes: ctx.config.agent.report_tail_bytes,
    };
    let report = match read_completion_report(workdir, report_file, &run.output, limits) {
        Ok(report) => report.text,
        Err(err) => {
            warn!(err = %err, "failed to read completion report; using raw output");
            run.output.clone()
        }
    };
    Finished {
        status: TaskStatus::Done,
        model,
        fallback_used,
        report,
        error: None,
    }
}

/// A failed task must not leave a report behind for the next one.
fn discard_report(workdir: &Path, report_file: &str) {
    if let Err(err) = remove_if_exists(&workdir.join(report_file)) {
        warn!(err = %err, "failed to remove stale report");
    }
}

/// Load a record; a malformed one is moved aside and treated as absent.
fn load_or_quarantine<T>(
    paths: &RelayPaths,
    label: &str,
    path: &Path,
    load: impl FnOnce() -> Result<Option<T>>,
) -> Option<T> {
    match load() {
        Ok(record) => record,
        Err(err) => {
            warn!(err = %format!("{err:#}"), label, "malformed record");
            match quarantine(path) {
                Ok(moved) => {
                    warn!(to = %moved.display(), label, "record quarantined");
                    narrate(
                        paths,
                        OutboundPayload::Text(format!(
                            "The {label} record was malformed and has been moved to {}.",
                            moved.display()
                        )),
                    );
                }
                Err(err) => warn!(err = %err, label, "failed to quarantine record"),
            }
            None
        }
    }
}

fn mark_running(
    dispatch: &DispatchStore,
    run: &mut DispatchRun,
    plans: &PlanStore,
    plan: Option<&ExecutionPlan>,
    id: u32,
) -> Result<()> {
    if let Some(task) = run.task_mut(id) {
        task.status = Some(TaskStatus::Running);
        task.error = None;
    }
    dispatch.save(run)?;

    if let Some(plan) = plan {
        let mut plan = plan.clone();
        if plan.status == PlanStatus::Approved {
            plan.status = PlanStatus::Executing;
        }
        if let Some(task) = plan.task_mut(id) {
            task.status = Some(TaskStatus::Running);
            task.error = None;
        }
        if let Err(err) = plans.save(&plan) {
            warn!(err = %err, "failed to mark plan task running");
        }
    }
    Ok(())
}

/// Re-read both records (the operator may have stopped the run meanwhile) and
/// store the task result in whichever still exist.
fn record_result(
    paths: &RelayPaths,
    task: &DispatchTask,
    finished: &Finished,
) -> Result<(Option<DispatchRun>, Option<ExecutionPlan>)> {
    let dispatch = DispatchStore::new(&paths.dispatch_path);
    let mut run = dispatch.load()?;
    if let Some(run) = run.as_mut() {
        if let Some(entry) = run.task_mut(task.id) {
            entry.status = Some(finished.status);
            entry.error = finished.error.clone();
        }
        dispatch.save(run)?;
    }

    let plans = PlanStore::new(&paths.plan_path);
    let mut plan = match plans.load() {
        Ok(plan) => plan,
        Err(err) => {
            warn!(err = %err, "plan unreadable; task result kept in dispatch run only");
            None
        }
    };
    if let Some(plan) = plan.as_mut() {
        if let Some(entry) = plan.task_mut(task.id) {
            entry.status = Some(finished.status);
            entry.error = finished.error.clone();
        }
        if let Err(err) = plans.save(plan) {
            warn!(err = %err, "failed to record task result in plan");
        }
    }
    info!(id = task.id, status = finished.status.as_str(), "task finished");
    Ok((run, plan))
}

/// Close out a fully resolved run and narrate the final summary.
fn finish_run(
    paths: &RelayPaths,
    run: &mut DispatchRun,
    plan: Option<ExecutionPlan>,
    last_report: Option<&str>,
) -> Result<()> {
    run.status = PlanStatus::Completed;
    DispatchStore::new(&paths.dispatch_path).save(run)?;
    let progress = progress_of(run);

    let summary = match plan {
        Some(mut plan) => {
            plan.status = PlanStatus::Completed;
            if let Err(err) = PlanStore::new(&paths.plan_path).save(&plan) {
                warn!(err = %err, "failed to mark plan completed");
            }
            format_summary(&plan)
        }
        None => format!(
            "Plan: completed ({} tasks, done {}, error {})",
            progress.total, progress.done, progress.error
        ),
    };
    info!(done = progress.done, error = progress.error, "dispatch run completed");

    let mut text = format!(
        "Plan completed: {} done, {} error.\n\n{summary}",
        progress.done, progress.error
    );
    if let Some(report) = last_report.filter(|report| !report.trim().is_empty()) {
        text.push_str(&format!("\n\nLast report:\n{}", report.trim()));
    }
    narrate(paths, OutboundPayload::Text(text));
    Ok(())
}

fn progress_of(run: &DispatchRun) -> Progress {
    Progress::from_statuses(run.tasks.iter().map(|task| task.status))
}

fn completed_deps(run: &DispatchRun, task: &DispatchTask) -> Vec<CompletedDep> {
    task.deps
        .iter()
        .filter_map(|dep| run.task(*dep))
        .filter(|dep| dep.status == Some(TaskStatus::Done))
        .map(|dep| CompletedDep {
            id: dep.id,
            description: dep.description.clone(),
        })
        .collect()
}

fn result_message(task: &DispatchTask, finished: &Finished, progress: Progress) -> String {
    let mut text = match finished.status {
        TaskStatus::Done if finished.fallback_used => format!(
            "Task #{} done with fallback model {} ({} returned nothing).",
            task.id, finished.model, task.model
        ),
        TaskStatus::Done => format!("Task #{} done.", task.id),
        _ => format!("Task #{} failed.", task.id),
    };
    let body = finished.report.trim();
    if !body.is_empty() {
        text.push_str(&format!("\n\n{body}"));
    }
    text.push_str(&format!(
        "\n\nDone {} | Error {} | Remaining {}",
        progress.done,
        progress.error,
        progress.remaining()
    ));
    text
}

fn blocked_message(run: &DispatchRun, blocked: &[u32]) -> String {
    let ids = blocked
        .iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ");
    let failed = run
        .tasks
        .iter()
        .filter(|task| task.status == Some(TaskStatus::Error))
        .map(|task| format!("#{}", task.id))
        .collect::<Vec<_>>();
    let mut text = format!("Waiting: tasks {ids} cannot start until their dependencies are done.");
    if !failed.is_empty() {
        text.push_str(&format!(" Failed: {}.", failed.join(", ")));
    }
    text.push_str(" Use `relay plan reset-task <id>` to retry a task.");
    text
}

/// Narration is best-effort: a failed enqueue is logged, never fatal.
fn narrate(paths: &RelayPaths, payload: OutboundPayload) {
    if let Err(err) = paths.outbox().enqueue_outbound(payload) {
        warn!(err = %err, "failed to enqueue narration");
    }
}
