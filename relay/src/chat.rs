//! Conversational flow: answer unread operator messages with one agent invocation.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agents::runner::{AgentRequest, AgentRunner, RunnerPolicy};
use crate::context::RelayContext;
use crate::core::summary::format_summary;
use crate::io::lock::{self, LockHeldError, LockHolder};
use crate::io::plan_store::PlanStore;
use crate::io::prompt::{ChatLine, ChatPromptInputs, PromptBuilder};
use crate::io::queue::{Message, MessageQueue, OutboundPayload};
use crate::io::signals::is_drafting;
use crate::io::task_log::TaskLogPaths;
use crate::session::{SessionManager, SessionMode};

/// Bytes of the continuation log quoted in the chat prompt.
const CONTINUATION_TAIL_BYTES: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    NoMessages,
    /// Another invocation holds the lock; messages stay unread.
    Busy,
    Replied {
        messages: usize,
        /// Code files reverted by the draft guard.
        reverted: Vec<String>,
    },
}

/// Process every unread inbound message in a single invocation.
pub fn process_inbox(ctx: RelayContext<'_>) -> Result<ChatOutcome> {
    let paths = ctx.paths;
    let inbox = paths.inbox();
    if !inbox.has_unread_inbound()? {
        return Ok(ChatOutcome::NoMessages);
    }
    let guard = match lock::acquire(&paths.lock_path, LockHolder::Chat, None) {
        Ok(guard) => guard,
        Err(err) => {
            if let Some(held) = err.downcast_ref::<LockHeldError>() {
                debug!(%held, "chat deferred");
                return Ok(ChatOutcome::Busy);
            }
            return Err(err);
        }
    };
    let messages = inbox.drain_unread_inbound()?;
    if messages.is_empty() {
        return Ok(ChatOutcome::NoMessages);
    }
    info!(count = messages.len(), "answering operator messages");

    let session = SessionManager::new(paths, ctx.config);
    if let Err(err) = session.ensure_branch(SessionMode::Continue) {
        warn!(err = %err, "could not check out session branch; chatting on current branch");
    }

    let drafting = is_drafting(paths);
    let plan_summary = match PlanStore::new(&paths.plan_path).load() {
        Ok(plan) => plan.as_ref().map(format_summary),
        Err(err) => {
            warn!(err = %err, "plan unreadable; omitted from chat prompt");
            None
        }
    };
    let continuation = session
        .continuation_tail(CONTINUATION_TAIL_BYTES)
        .unwrap_or_else(|err| {
            warn!(err = %err, "continuation log unreadable");
            None
        });
    let prompt = PromptBuilder::new(ctx.config.agent.prompt_budget_bytes).build_chat(
        &ChatPromptInputs {
            messages: messages.iter().map(chat_line).collect(),
            drafting,
            plan_summary,
            continuation,
            continuation_path: paths.continuation_path.display().to_string(),
        },
    )?;

    let logs = TaskLogPaths::for_chat(
        &paths.runs_dir,
        &Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string(),
    );
    if let Err(err) = logs.write_prompt(&prompt) {
        warn!(err = %err, "failed to write chat prompt log");
    }

    let runner = AgentRunner::new(
        ctx.backends,
        RunnerPolicy::from_config(ctx.config, Some(paths.pid_path.clone())),
    );
    let run = ctx.config.chat_model().and_then(|model| {
        runner.run(&AgentRequest {
            platform: ctx.config.backend,
            model: model.to_string(),
            prompt,
            workdir: ctx.config.project_dir.clone(),
            sandboxed: false,
            primary_log: Some(logs.primary_log_path.clone()),
            fallback_log: Some(logs.fallback_log_path.clone()),
        })
    });
    let reply = match run {
        Ok(run) => run.output.trim().to_string(),
        Err(err) => {
            warn!(err = %err, "chat invocation failed");
            format!("Agent invocation failed: {err:#}")
        }
    };
    if let Err(err) = logs.write_report(&reply) {
        warn!(err = %err, "failed to write chat reply log");
    }

    let outbox = paths.outbox();
    let reverted = match session.enforce_draft_guard() {
        Ok(reverted) => {
            if !reverted.is_empty() {
                let list = reverted
                    .iter()
                    .map(|path| format!("- {path}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                notify(
                    &outbox,
                    format!("Plan drafting is active; reverted code changes:\n{list}"),
                );
            }
            if let Err(err) = session.commit("chat") {
                warn!(err = %err, "checkpoint commit failed");
            }
            reverted
        }
        Err(err) => {
            // Unreverted code must not reach a commit.
            warn!(err = %err, "draft guard failed; skipping checkpoint commit");
            notify(
                &outbox,
                format!(
                    "Plan drafting is active but reverting code changes failed; \
                     nothing was committed. Please check the working tree.\n{err:#}"
                ),
            );
            Vec::new()
        }
    };
    let operator = messages
        .iter()
        .map(|message| message.payload.display_text())
        .collect::<Vec<_>>()
        .join("\n");
    if let Err(err) =
        session.append_continuation("chat", &format!("Operator:\n{operator}\n\nAgent:\n{reply}"))
    {
        warn!(err = %err, "failed to append continuation log");
    }
    drop(guard);

    outbox.enqueue_outbound(OutboundPayload::Text(reply))?;
    Ok(ChatOutcome::Replied {
        messages: messages.len(),
        reverted,
    })
}

fn notify(outbox: &MessageQueue, text: String) {
    if let Err(err) = outbox.enqueue_outbound(OutboundPayload::Text(text)) {
        warn!(err = %err, "failed to enqueue draft guard notice");
    }
}

fn chat_line(message: &Message) -> ChatLine {
    ChatLine {
        timestamp: message.timestamp.format("%Y-%m-%d %H:%M").to_string(),
        text: message.payload.display_text().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BackendKind;
    use crate::io::signals::set_drafting;
    use crate::test_support::{ScriptedBackend, ScriptedCall, TestRepo};

    #[test]
    fn no_messages_means_no_invocation() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let backend = ScriptedBackend::new(BackendKind::Claude, vec![]);
        let backends = backend.registry();
        let outcome = process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");
        assert_eq!(outcome, ChatOutcome::NoMessages);
        assert!(backend.requests().is_empty());
    }

    #[test]
    fn replies_once_for_all_unread_messages() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let backend = ScriptedBackend::new(BackendKind::Claude, vec![ScriptedCall::ok("Sure, on it.\n")])
            .observing(&paths.lock_path);
        let backends = backend.registry();
        paths.inbox().enqueue_inbound("hello").expect("inbound");
        paths.inbox().enqueue_inbound("what is left?").expect("inbound");

        let outcome = process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");
        assert_eq!(
            outcome,
            ChatOutcome::Replied {
                messages: 2,
                reverted: Vec::new()
            }
        );
        assert_eq!(backend.models(), vec!["sonnet"]);
        assert_eq!(backend.observed(), vec![true]);
        let prompt = &backend.requests()[0].prompt;
        assert!(prompt.contains("hello"));
        assert!(prompt.contains("what is left?"));

        assert!(!paths.inbox().has_unread_inbound().expect("peek"));
        let outbox = paths.outbox().drain_unsent_outbound().expect("outbox");
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].payload.display_text(), "Sure, on it.");
        assert!(!paths.lock_path.exists());

        let log = std::fs::read_to_string(&paths.continuation_path).expect("log");
        assert!(log.contains("what is left?"));
    }

    #[test]
    fn busy_lock_leaves_messages_unread() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        let backend = ScriptedBackend::new(BackendKind::Claude, vec![ScriptedCall::ok("hi")]);
        let backends = backend.registry();
        paths.inbox().enqueue_inbound("ping").expect("inbound");

        let _held = lock::acquire(&paths.lock_path, LockHolder::Dispatch, Some(1)).expect("lock");
        let outcome = process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");
        assert_eq!(outcome, ChatOutcome::Busy);
        assert!(paths.inbox().has_unread_inbound().expect("peek"));
        assert_eq!(backend.remaining(), 1);
    }

    #[test]
    fn drafting_reverts_code_and_notifies_operator() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        set_drafting(&paths).expect("drafting");
        let backend = ScriptedBackend::new(
            BackendKind::Claude,
            vec![
                ScriptedCall::ok("Drafted the spec.")
                    .writing("app.py", "print(1)\n")
                    .writing("docs/spec.md", "# Spec\n"),
            ],
        );
        let backends = backend.registry();
        paths.inbox().enqueue_inbound("draft a plan").expect("inbound");

        let outcome = process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");
        assert_eq!(
            outcome,
            ChatOutcome::Replied {
                messages: 1,
                reverted: vec!["app.py".to_string()]
            }
        );
        assert!(backend.requests()[0].prompt.contains("### Plan Drafting"));
        assert!(!repo.path().join("app.py").exists());
        assert_eq!(
            repo.git(&["show", "--name-only", "--format=", "HEAD"]),
            "docs/spec.md"
        );

        let outbox = paths.outbox().drain_unsent_outbound().expect("outbox");
        assert_eq!(outbox.len(), 2);
        assert!(outbox[0].payload.display_text().contains("- app.py"));
        assert_eq!(outbox[1].payload.display_text(), "Drafted the spec.");
    }

    /// Paths git reads as pathspec magic make the guard's revert fail.
    #[test]
    fn draft_guard_failure_skips_the_commit_and_tells_the_operator() {
        let repo = TestRepo::new();
        let paths = repo.init_relay();
        let config = repo.config();
        set_drafting(&paths).expect("drafting");
        let backend = ScriptedBackend::new(
            BackendKind::Claude,
            vec![
                ScriptedCall::ok("Drafted the spec.")
                    .writing(":(nomagic)tool.py", "print(1)\n")
                    .writing("docs/spec.md", "# Spec\n"),
            ],
        );
        let backends = backend.registry();
        paths.inbox().enqueue_inbound("draft a plan").expect("inbound");
        let commits = repo.commit_count();

        let outcome = process_inbox(RelayContext::new(&paths, &config, &backends)).expect("chat");
        assert_eq!(
            outcome,
            ChatOutcome::Replied {
                messages: 1,
                reverted: Vec::new()
            }
        );
        assert_eq!(repo.commit_count(), commits);
        assert!(repo.path().join(":(nomagic)tool.py").exists());
        assert!(repo.path().join("docs/spec.md").exists());

        let outbox = paths.outbox().drain_unsent_outbound().expect("outbox");
        assert_eq!(outbox.len(), 2);
        assert!(outbox[0].payload.display_text().contains("nothing was committed"));
        assert_eq!(outbox[1].payload.display_text(), "Drafted the spec.");
        assert!(!paths.lock_path.exists());
    }
}
