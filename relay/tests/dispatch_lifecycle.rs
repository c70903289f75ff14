//! End-to-end dispatch scenarios against a scratch git repo and a scripted backend.
//!
//! Covers dependency stalls, step-through pauses, auto runs, the fallback retry,
//! the drafting guard, lock exclusion, and outbound redelivery.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use relay::chat::{ChatOutcome, process_inbox};
use relay::context::RelayContext;
use relay::control;
use relay::core::types::{
    BackendKind, DispatchRun, DispatchTask, ExecutionMode, PlanStatus, TaskStatus, Tier,
};
use relay::dispatch::{Dispatcher, TickOutcome};
use relay::io::dispatch_store::DispatchStore;
use relay::io::fsutil::write_json_atomic;
use relay::io::init::RelayPaths;
use relay::io::lock::{self, LockHolder};
use relay::io::plan_store::PlanStore;
use relay::io::signals::{self, WaitOutcome};
use relay::looping::run_loop;
use relay::test_support::{
    ScriptedBackend, ScriptedCall, TestRepo, dispatch_run, dispatch_task, plan_with, task,
};

fn save_run(paths: &RelayPaths, mode: ExecutionMode, tasks: Vec<DispatchTask>) {
    let mut run = dispatch_run(tasks);
    run.mode = mode;
    DispatchStore::new(&paths.dispatch_path)
        .save(&run)
        .expect("save run");
}

fn load_run(paths: &RelayPaths) -> DispatchRun {
    DispatchStore::new(&paths.dispatch_path)
        .load()
        .expect("load run")
        .expect("run present")
}

/// Poll the outbox from another thread until a message carries reply markup.
fn wait_for_markup(paths: &RelayPaths) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let pending = paths.outbox().drain_unsent_outbound().unwrap_or_default();
        if pending.iter().any(|message| message.reply_markup.is_some()) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn failed_dependency_stalls_run_and_narrates_once() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(BackendKind::Claude, vec![]);
    let backends = backend.registry();
    let mut failed = dispatch_task(1, &[]);
    failed.status = Some(TaskStatus::Error);
    save_run(&paths, ExecutionMode::Auto, vec![failed, dispatch_task(2, &[1])]);

    let ctx = RelayContext::new(&paths, &config, &backends);
    let mut dispatcher = Dispatcher::new();
    assert_eq!(dispatcher.tick(ctx).expect("tick"), TickOutcome::Waiting(vec![2]));
    assert_eq!(dispatcher.tick(ctx).expect("tick"), TickOutcome::Waiting(vec![2]));

    let narration = paths.outbox().drain_unsent_outbound().expect("outbox");
    assert_eq!(narration.len(), 1);
    assert!(narration[0].payload.display_text().contains("tasks #2"));
    assert!(backend.requests().is_empty());

    let run = load_run(&paths);
    assert_eq!(run.status, PlanStatus::Approved);
    assert_eq!(run.tasks[1].status, None);
}

#[test]
fn reset_task_recovers_a_stalled_run() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        vec![ScriptedCall::ok("retry worked"), ScriptedCall::ok("second done")],
    );
    let backends = backend.registry();
    let mut failed = dispatch_task(1, &[]);
    failed.status = Some(TaskStatus::Error);
    failed.error = Some("boom".to_string());
    save_run(&paths, ExecutionMode::Auto, vec![failed, dispatch_task(2, &[1])]);

    let ctx = RelayContext::new(&paths, &config, &backends);
    let mut dispatcher = Dispatcher::new();
    assert!(matches!(dispatcher.tick(ctx).expect("tick"), TickOutcome::Waiting(_)));

    control::reset_task(&paths, 1).expect("reset");
    let TickOutcome::Ran(first) = dispatcher.tick(ctx).expect("tick") else {
        panic!("expected task 1 to run");
    };
    assert_eq!((first.id, first.status), (1, TaskStatus::Done));
    let TickOutcome::Ran(second) = dispatcher.tick(ctx).expect("tick") else {
        panic!("expected task 2 to run");
    };
    assert_eq!(second.id, 2);
    assert!(second.completed);
}

#[test]
fn step_mode_pauses_until_continue_and_releases_lock() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        vec![ScriptedCall::ok("first done"), ScriptedCall::ok("second done")],
    )
    .observing(&paths.lock_path);
    let backends = backend.registry();
    save_run(&paths, ExecutionMode::Step, vec![dispatch_task(1, &[]), dispatch_task(2, &[1])]);

    let operator_paths = paths.clone();
    let operator = thread::spawn(move || {
        let saw_markup = wait_for_markup(&operator_paths);
        let lock_free = !operator_paths.lock_path.exists();
        signals::request_continue(&operator_paths).expect("continue");
        (saw_markup, lock_free)
    });

    let ctx = RelayContext::new(&paths, &config, &backends);
    let mut dispatcher = Dispatcher::new();
    let TickOutcome::Ran(first) = dispatcher.tick(ctx).expect("tick") else {
        panic!("expected task 1 to run");
    };
    let (saw_markup, lock_free) = operator.join().expect("operator thread");
    assert!(saw_markup);
    assert!(lock_free);
    assert_eq!(first.wait, Some(WaitOutcome::Continue));
    assert_eq!(first.progress.remaining(), 1);
    assert!(!paths.continue_path.exists());

    let TickOutcome::Ran(second) = dispatcher.tick(ctx).expect("tick") else {
        panic!("expected task 2 to run");
    };
    assert!(second.completed);
    assert_eq!(second.wait, None);
    assert_eq!(backend.observed(), vec![true, true]);
    assert_eq!(load_run(&paths).status, PlanStatus::Completed);
}

#[test]
fn stop_during_pause_ends_the_run() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(BackendKind::Claude, vec![ScriptedCall::ok("first done")]);
    let backends = backend.registry();
    PlanStore::new(&paths.plan_path)
        .save(&plan_with(vec![task(1, &[]), task(2, &[1])]))
        .expect("save plan");
    save_run(&paths, ExecutionMode::Step, vec![dispatch_task(1, &[]), dispatch_task(2, &[1])]);

    let operator_paths = paths.clone();
    let operator = thread::spawn(move || {
        assert!(wait_for_markup(&operator_paths));
        control::stop(&operator_paths).expect("stop");
    });

    let ctx = RelayContext::new(&paths, &config, &backends);
    let mut dispatcher = Dispatcher::new();
    let TickOutcome::Ran(first) = dispatcher.tick(ctx).expect("tick") else {
        panic!("expected task 1 to run");
    };
    operator.join().expect("operator thread");
    assert_eq!(first.wait, Some(WaitOutcome::Removed));
    assert_eq!(dispatcher.tick(ctx).expect("tick"), TickOutcome::Idle);

    let plan = PlanStore::new(&paths.plan_path).require().expect("plan");
    assert_eq!(plan.status, PlanStatus::Stopped);
    assert_eq!(plan.tasks[0].status, Some(TaskStatus::Done));
    assert_eq!(plan.tasks[1].status, None);
}

#[test]
fn auto_mode_runs_independent_tasks_to_completion() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let staged = paths.home.join("incoming-plan.json");
    write_json_atomic(&staged, &plan_with(vec![task(1, &[]), task(2, &[]), task(3, &[])]))
        .expect("write plan file");
    control::load_plan(&paths, &staged).expect("load plan");
    control::approve(&paths, &config, Some(ExecutionMode::Auto)).expect("approve");

    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        (1..=3)
            .map(|n| ScriptedCall::ok("done").writing(&format!("src/part{n}.txt"), "work\n"))
            .collect(),
    );
    let backends = backend.registry();
    let commits_before = repo.commit_count();

    let store = DispatchStore::new(&paths.dispatch_path);
    let stats = run_loop(RelayContext::new(&paths, &config, &backends), || {
        store
            .load()
            .ok()
            .flatten()
            .is_some_and(|run| run.status == PlanStatus::Completed)
    });
    assert_eq!(stats.tasks, 3);

    let run = load_run(&paths);
    assert!(run.tasks.iter().all(|task| task.status == Some(TaskStatus::Done)));
    let plan = PlanStore::new(&paths.plan_path).require().expect("plan");
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(backend.models(), vec!["sonnet", "sonnet", "sonnet"]);
    assert_eq!(repo.commit_count(), commits_before + 3);
    assert_eq!(
        repo.git(&["log", "-1", "--format=%s"]),
        "relay: task #3: task 3"
    );
    assert_eq!(repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]), "relay/session");

    let narration = paths.outbox().drain_unsent_outbound().expect("outbox");
    let last = narration.last().expect("final summary");
    assert!(last.payload.display_text().starts_with("Plan completed: 3 done, 0 error."));
    assert!(narration.iter().all(|message| message.reply_markup.is_none()));
}

#[test]
fn rate_limited_task_retries_once_with_fallback_model() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        vec![ScriptedCall::rate_limited(), ScriptedCall::ok("recovered on haiku")],
    );
    let backends = backend.registry();
    save_run(&paths, ExecutionMode::Auto, vec![dispatch_task(1, &[])]);

    let TickOutcome::Ran(ran) = Dispatcher::new()
        .tick(RelayContext::new(&paths, &config, &backends))
        .expect("tick")
    else {
        panic!("expected a task run");
    };
    assert_eq!(backend.models(), vec!["opus", "haiku"]);
    assert_eq!(ran.status, TaskStatus::Done);
    assert!(ran.fallback_used);
    assert_eq!(ran.model, "haiku");
}

#[test]
fn fallback_is_attempted_at_most_once() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        vec![
            ScriptedCall::rate_limited(),
            ScriptedCall::rate_limited(),
            ScriptedCall::ok("never used"),
        ],
    );
    let backends = backend.registry();
    save_run(&paths, ExecutionMode::Auto, vec![dispatch_task(1, &[])]);

    let TickOutcome::Ran(ran) = Dispatcher::new()
        .tick(RelayContext::new(&paths, &config, &backends))
        .expect("tick")
    else {
        panic!("expected a task run");
    };
    assert_eq!(backend.models(), vec!["opus", "haiku"]);
    assert_eq!(backend.remaining(), 1);
    assert_eq!(ran.status, TaskStatus::Error);
    let run = load_run(&paths);
    let error = run.tasks[0].error.clone().expect("error summary");
    assert!(error.contains("Fallback: no output from haiku"));
    assert!(ran.completed);
}

#[test]
fn drafting_guard_keeps_only_documents_in_the_commit() {
    let repo = TestRepo::new();
    repo.write("main.py", "print('committed')\n");
    repo.git(&["add", "main.py"]);
    repo.git(&["commit", "-q", "-m", "add main"]);
    let paths = repo.init_relay();
    let config = repo.config();
    control::start_drafting(&paths).expect("drafting");
    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        vec![
            ScriptedCall::ok("Wrote the spec.")
                .writing("main.py", "print('edited')\n")
                .writing("spec.md", "# Spec\n"),
        ],
    );
    let backends = backend.registry();
    paths.inbox().enqueue_inbound("please draft the spec").expect("inbound");

    let outcome = process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");
    assert_eq!(
        outcome,
        ChatOutcome::Replied {
            messages: 1,
            reverted: vec!["main.py".to_string()]
        }
    );
    assert_eq!(
        fs::read_to_string(repo.path().join("main.py")).expect("main.py"),
        "print('committed')\n"
    );
    assert_eq!(repo.git(&["show", "--name-only", "--format=", "HEAD"]), "spec.md");
    assert_eq!(repo.git(&["status", "--porcelain", "--", "main.py", "spec.md"]), "");
}

#[test]
fn dispatch_and_chat_never_invoke_concurrently() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backend = ScriptedBackend::new(
        BackendKind::Claude,
        vec![ScriptedCall::ok("chat reply"), ScriptedCall::ok("task done")],
    )
    .observing(&paths.lock_path);
    let backends = backend.registry();
    save_run(&paths, ExecutionMode::Auto, vec![dispatch_task(1, &[])]);
    paths.inbox().enqueue_inbound("status?").expect("inbound");
    let ctx = RelayContext::new(&paths, &config, &backends);

    let held = lock::acquire(&paths.lock_path, LockHolder::Chat, None).expect("lock");
    assert_eq!(Dispatcher::new().tick(ctx).expect("tick"), TickOutcome::Busy);
    assert_eq!(process_inbox(ctx).expect("chat"), ChatOutcome::Busy);
    assert!(backend.requests().is_empty());
    drop(held);

    assert!(matches!(process_inbox(ctx).expect("chat"), ChatOutcome::Replied { .. }));
    assert!(matches!(Dispatcher::new().tick(ctx).expect("tick"), TickOutcome::Ran(_)));
    assert_eq!(backend.observed(), vec![true, true]);
    assert!(!paths.lock_path.exists());
}

#[test]
fn outbound_messages_are_redelivered_until_marked_sent() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let backends = ScriptedBackend::new(BackendKind::Claude, vec![ScriptedCall::ok("pong")]).registry();
    paths.inbox().enqueue_inbound("ping").expect("inbound");
    process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");

    let outbox = paths.outbox();
    let first = outbox.drain_unsent_outbound().expect("drain");
    let again = outbox.drain_unsent_outbound().expect("drain");
    assert_eq!(first.len(), 1);
    assert_eq!(first, again);

    let ids: Vec<u64> = first.iter().map(|message| message.id).collect();
    assert_eq!(outbox.mark_sent(&ids).expect("mark"), 1);
    assert!(outbox.drain_unsent_outbound().expect("drain").is_empty());
}

#[test]
fn top_tier_tasks_get_the_top_model_at_approval() {
    let repo = TestRepo::new();
    let paths = repo.init_relay();
    let config = repo.config();
    let mut hard = task(2, &[1]);
    hard.tier = Tier::Top;
    let staged = paths.home.join("plan-in.json");
    write_json_atomic(&staged, &plan_with(vec![task(1, &[]), hard])).expect("write");
    control::load_plan(&paths, &staged).expect("load");

    let run = control::approve(&paths, &config, None).expect("approve");
    assert_eq!(run.mode, ExecutionMode::Step);
    let models: Vec<&str> = run.tasks.iter().map(|task| task.model.as_str()).collect();
    assert_eq!(models, vec!["sonnet", "opus"]);
}
