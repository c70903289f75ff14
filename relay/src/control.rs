//! Operator control surface behind the CLI: plan lifecycle, run control, recovery.

use std::fmt;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, warn};

use crate::core::invariants::is_valid_model_id;
use crate::core::progress::Progress;
use crate::core::summary::format_summary;
use crate::core::tiers::apply_tier_defaults;
use crate::core::types::{
    BackendKind, DispatchRun, DispatchTask, ExecutionMode, ExecutionPlan, PlanStatus,
    RECORD_VERSION, TaskStatus,
};
use crate::io::config::RelayConfig;
use crate::io::dispatch_store::DispatchStore;
use crate::io::fsutil::{read_optional, remove_if_exists};
use crate::io::init::RelayPaths;
use crate::io::lock::{self, LockHolder, LockInfo};
use crate::io::plan_store::{PlanStore, load_plan_file};
use crate::io::queue::OutboundPayload;
use crate::io::signals;
use crate::session::{SessionBranch, SessionManager, SessionMode};

fn plans(paths: &RelayPaths) -> PlanStore {
    PlanStore::new(&paths.plan_path)
}

fn dispatch(paths: &RelayPaths) -> DispatchStore {
    DispatchStore::new(&paths.dispatch_path)
}

fn active_run(paths: &RelayPaths) -> Result<Option<DispatchRun>> {
    Ok(dispatch(paths)
        .load()?
        .filter(|run| run.status == PlanStatus::Approved))
}

fn notify(paths: &RelayPaths, text: String) {
    if let Err(err) = paths.outbox().enqueue_outbound(OutboundPayload::Text(text)) {
        warn!(err = %err, "failed to enqueue notice");
    }
}

/// Store a plan handed over by the planning step, ready for review.
pub fn load_plan(paths: &RelayPaths, file: &Path) -> Result<ExecutionPlan> {
    if active_run(paths)?.is_some() {
        return Err(anyhow!(
            "a dispatch run is active; stop it before loading a new plan"
        ));
    }
    let mut plan =
        load_plan_file(file)?.ok_or_else(|| anyhow!("plan file {} not found", file.display()))?;
    plan.status = PlanStatus::PendingReview;
    plans(paths).save(&plan)?;
    info!(tasks = plan.tasks.len(), "plan loaded for review");
    notify(paths, format!("Plan ready for review:\n{}", format_summary(&plan)));
    Ok(plan)
}

pub fn set_plan_status(paths: &RelayPaths, status: PlanStatus) -> Result<ExecutionPlan> {
    let store = plans(paths);
    let mut plan = store.require()?;
    plan.status = status;
    store.save(&plan)?;
    Ok(plan)
}

/// Assign a platform/model to one task, or to the whole plan.
///
/// A plan-wide choice becomes the plan default and clears per-task choices so
/// every task picks it up at approval.
pub fn select_model(
    paths: &RelayPaths,
    platform: BackendKind,
    model: &str,
    task: Option<u32>,
) -> Result<ExecutionPlan> {
    if !is_valid_model_id(model) {
        return Err(anyhow!("invalid model id '{model}'"));
    }
    let store = plans(paths);
    let mut plan = store.require()?;
    match task {
        Some(id) => {
            let entry = plan
                .task_mut(id)
                .ok_or_else(|| anyhow!("plan has no task #{id}"))?;
            entry.platform = Some(platform);
            entry.model = Some(model.to_string());
        }
        None => {
            plan.default_platform = Some(platform);
            plan.default_model = Some(model.to_string());
            for entry in &mut plan.tasks {
                entry.platform = None;
                entry.model = None;
            }
        }
    }
    store.save(&plan)?;
    info!(%platform, model, ?task, "model selected");
    Ok(plan)
}

/// Authorize execution: resolve tier defaults and write the dispatch run.
pub fn approve(
    paths: &RelayPaths,
    config: &RelayConfig,
    mode: Option<ExecutionMode>,
) -> Result<DispatchRun> {
    if active_run(paths)?.is_some() {
        return Err(anyhow!("a dispatch run is already active"));
    }
    let store = plans(paths);
    let mut plan = store.require()?;
    if matches!(plan.status, PlanStatus::Executing | PlanStatus::Completed) {
        return Err(anyhow!("plan is {}; nothing to approve", plan.status.as_str()));
    }
    apply_tier_defaults(&mut plan, config.backend, &config.tiers);
    let tasks = plan
        .tasks
        .iter()
        .map(|task| {
            let (Some(platform), Some(model)) = (task.platform, task.model.clone()) else {
                return Err(anyhow!(
                    "task #{} has no platform/model (no tier row for {})",
                    task.id,
                    config.backend
                ));
            };
            Ok(DispatchTask {
                id: task.id,
                description: task.description.clone(),
                platform,
                model,
                deps: task.deps.clone(),
                scope: task.scope.clone(),
                status: task.status,
                error: task.error.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    plan.status = PlanStatus::Approved;
    let run = DispatchRun {
        version: RECORD_VERSION,
        timestamp: Utc::now(),
        status: PlanStatus::Approved,
        mode: mode.unwrap_or(config.mode),
        spec_ref: plan.spec_ref.clone(),
        tasks,
    };

    store.save(&plan)?;
    dispatch(paths).save(&run)?;
    signals::clear_drafting(paths)?;
    signals::consume_continue(paths)?;
    info!(tasks = run.tasks.len(), mode = ?run.mode, "plan approved");
    notify(
        paths,
        format!(
            "Plan approved: {} tasks, {} mode.",
            run.tasks.len(),
            mode_name(run.mode)
        ),
    );
    Ok(run)
}

fn mode_name(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Step => "step-through",
        ExecutionMode::Auto => "auto",
    }
}

/// Resume a paused step-through run.
pub fn request_continue(paths: &RelayPaths) -> Result<()> {
    if active_run(paths)?.is_none() {
        return Err(anyhow!("no active dispatch run"));
    }
    signals::request_continue(paths)
}

/// Stop execution at the next task boundary. Returns whether a run was active.
pub fn stop(paths: &RelayPaths) -> Result<bool> {
    let store = plans(paths);
    if let Some(mut plan) = store.load()? {
        plan.status = PlanStatus::Stopped;
        store.save(&plan)?;
    }
    let removed = dispatch(paths).clear()?;
    signals::consume_continue(paths)?;
    info!(removed, "execution stopped");
    notify(paths, "Execution stopped.".to_string());
    Ok(removed)
}

/// What `kill` found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    pub agent_pid: Option<u32>,
    pub holder: Option<LockInfo>,
    pub lock_cleared: bool,
}

/// Terminate the in-flight agent, then clear the lock.
///
/// Only the pid in `state/agent.pid` is signalled. The lock holder is the
/// daemon or CLI that spawned the agent; it is reported but left running.
/// Task statuses are left as they are; a killed task stays `running` until
/// `reset_task`.
pub fn kill(paths: &RelayPaths) -> Result<KillReport> {
    let agent_pid = read_optional(&paths.pid_path)?.and_then(|pid| pid.trim().parse::<u32>().ok());
    if let Some(pid) = agent_pid {
        terminate(pid);
    }
    let holder = lock::read(&paths.lock_path).unwrap_or_else(|err| {
        warn!(err = %err, "lock unreadable");
        None
    });
    let lock_cleared = lock::force_clear(&paths.lock_path)?;
    remove_if_exists(&paths.pid_path)?;
    info!(?agent_pid, lock_cleared, "kill finished");
    Ok(KillReport {
        agent_pid,
        holder,
        lock_cleared,
    })
}

fn terminate(pid: u32) {
    match Command::new("kill").args(["-TERM", &pid.to_string()]).status() {
        Ok(status) if status.success() => info!(pid, "sent SIGTERM"),
        Ok(status) => warn!(pid, code = ?status.code(), "kill reported failure"),
        Err(err) => warn!(pid, err = %err, "failed to run kill"),
    }
}

/// Put a `running` or `error` task back to `pending` in both records.
pub fn reset_task(paths: &RelayPaths, id: u32) -> Result<()> {
    let mut found = false;

    let runs = dispatch(paths);
    if let Some(mut run) = runs.load()? {
        if let Some(task) = run.task_mut(id) {
            check_resettable(id, task.status)?;
            task.status = Some(TaskStatus::Pending);
            task.error = None;
            found = true;
            if run.status == PlanStatus::Completed {
                run.status = PlanStatus::Approved;
            }
            runs.save(&run)?;
        }
    }

    let store = plans(paths);
    if let Some(mut plan) = store.load()? {
        if let Some(task) = plan.task_mut(id) {
            if !found {
                check_resettable(id, task.status)?;
            }
            task.status = Some(TaskStatus::Pending);
            task.error = None;
            found = true;
            if plan.status == PlanStatus::Completed {
                plan.status = PlanStatus::Executing;
            }
            store.save(&plan)?;
        }
    }

    if !found {
        return Err(anyhow!("no task #{id} in the plan or dispatch run"));
    }
    info!(id, "task reset to pending");
    Ok(())
}

fn check_resettable(id: u32, status: Option<TaskStatus>) -> Result<()> {
    match status {
        Some(TaskStatus::Running) | Some(TaskStatus::Error) => Ok(()),
        other => Err(anyhow!(
            "task #{id} is {}; only running or error tasks can be reset",
            other.unwrap_or(TaskStatus::Pending).as_str()
        )),
    }
}

/// Drop the plan, the dispatch run, and any pending continue signal.
pub fn clear_plan(paths: &RelayPaths) -> Result<()> {
    plans(paths).clear()?;
    dispatch(paths).clear()?;
    signals::consume_continue(paths)?;
    info!("plan cleared");
    Ok(())
}

pub fn start_drafting(paths: &RelayPaths) -> Result<()> {
    signals::set_drafting(paths)?;
    info!("plan drafting started");
    Ok(())
}

pub fn stop_drafting(paths: &RelayPaths) -> Result<bool> {
    signals::clear_drafting(paths)
}

/// Archive the session branch and start a fresh one from trunk.
pub fn new_session(paths: &RelayPaths, config: &RelayConfig) -> Result<SessionBranch> {
    let _guard = lock::acquire(&paths.lock_path, LockHolder::Session, None)
        .context("cannot switch sessions while an invocation is running")?;
    let branch = SessionManager::new(paths, config).ensure_branch(SessionMode::Fresh)?;
    notify(paths, format!("Started fresh session on {}.", branch.name));
    Ok(branch)
}

/// Snapshot for `relay status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub plan: Option<ExecutionPlan>,
    pub run: Option<DispatchRun>,
    pub lock: Option<LockInfo>,
    pub drafting: bool,
    pub session: Option<SessionBranch>,
    pub unread_inbound: usize,
    pub unsent_outbound: usize,
}

pub fn status_report(paths: &RelayPaths, config: &RelayConfig) -> Result<StatusReport> {
    let unread_inbound = paths
        .inbox()
        .load()?
        .iter()
        .filter(|message| !message.read)
        .count();
    let unsent_outbound = paths
        .outbox()
        .load()?
        .iter()
        .filter(|message| !message.sent)
        .count();
    Ok(StatusReport {
        plan: plans(paths).load()?,
        run: dispatch(paths).load()?,
        lock: lock::read(&paths.lock_path)?,
        drafting: signals::is_drafting(paths),
        session: SessionManager::new(paths, config).load_record()?,
        unread_inbound,
        unsent_outbound,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plan {
            Some(plan) => writeln!(f, "{}", format_summary(plan))?,
            None => writeln!(f, "Plan: none")?,
        }
        match &self.run {
            Some(run) => {
                let progress = Progress::from_statuses(run.tasks.iter().map(|task| task.status));
                writeln!(
                    f,
                    "Dispatch: {} ({} mode, started {}, done {}, error {}, remaining {})",
                    run.status.as_str(),
                    mode_name(run.mode),
                    run.timestamp.to_rfc3339(),
                    progress.done,
                    progress.error,
                    progress.remaining()
                )?;
            }
            None => writeln!(f, "Dispatch: none")?,
        }
        match &self.lock {
            Some(info) => {
                write!(f, "Lock: held by {} (pid {})", info.holder.as_str(), info.pid)?;
                if let Some(id) = info.task_id {
                    write!(f, " on task #{id}")?;
                }
                writeln!(f)?;
            }
            None => writeln!(f, "Lock: free")?,
        }
        if let Some(session) = &self.session {
            writeln!(
                f,
                "Session: {} (since {})",
                session.name,
                session.started_at.to_rfc3339()
            )?;
        }
        if self.drafting {
            writeln!(f, "Drafting: active")?;
        }
        write!(
            f,
            "Messages: {} unread inbound, {} unsent outbound",
            self.unread_inbound, self.unsent_outbound
        )
    }
}
