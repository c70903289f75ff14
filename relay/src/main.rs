//! `relay`: drive a coding-agent session through file-backed message queues.
//!
//! The daemon polls the state home (`$RELAY_HOME` or `./.relay`), answers
//! operator messages, and dispatches approved plan tasks. The remaining
//! subcommands are the operator/frontend control surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use relay::chat::{ChatOutcome, process_inbox};
use relay::context::RelayContext;
use relay::control;
use relay::core::summary::format_summary;
use relay::core::types::{BackendKind, ExecutionMode, PlanStatus};
use relay::dispatch::{Dispatcher, TickOutcome};
use relay::exit_codes;
use relay::io::backend::Backends;
use relay::io::config::load_config_with_env;
use relay::io::init::{InitOptions, RelayPaths, init_relay};
use relay::io::plan_store::PlanStore;
use relay::logging;
use relay::looping::run_loop;

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Remote-operated orchestrator for coding-agent sessions"
)]
struct Cli {
    /// State home directory (default: $RELAY_HOME or ./.relay).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state home with a default config and empty queues.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the poll loop (chat, then one dispatch tick, per pass).
    Daemon {
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
    /// Run one dispatch tick.
    Tick,
    /// Answer unread operator messages once.
    Chat,
    /// Show plan, dispatch run, lock, and queue state.
    Status,
    /// Inbound operator messages.
    Inbox {
        #[command(subcommand)]
        command: InboxCommand,
    },
    /// Outbound narration for the frontend.
    Outbox {
        #[command(subcommand)]
        command: OutboxCommand,
    },
    /// Plan lifecycle.
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    /// Resume a paused step-through run.
    Continue,
    /// Stop execution and remove the dispatch run.
    Stop,
    /// Terminate the in-flight agent and clear the lock.
    Kill,
    /// Session branch management.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Plan-drafting marker (code edits are reverted while it is set).
    Draft {
        #[command(subcommand)]
        command: DraftCommand,
    },
}

#[derive(Subcommand)]
enum InboxCommand {
    /// Queue an operator message.
    Add {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Print inbound messages as JSON.
    List,
}

#[derive(Subcommand)]
enum OutboxCommand {
    /// Print unsent outbound messages as JSON (does not mark them).
    Pending,
    /// Mark outbound messages as delivered.
    MarkSent {
        #[arg(required = true)]
        ids: Vec<u64>,
    },
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Validate a plan file and store it for review.
    Load { file: PathBuf },
    /// Print the plan summary.
    Show,
    /// Set the plan status (e.g. confirming, selecting_model).
    Status { status: PlanStatus },
    /// Choose platform/model for one task or the whole plan.
    Model {
        platform: BackendKind,
        model: String,
        #[arg(long)]
        task: Option<u32>,
    },
    /// Approve the plan and start dispatch.
    Approve {
        /// `step` (pause after each task) or `auto`.
        #[arg(long)]
        mode: Option<ExecutionMode>,
    },
    /// Move a running/error task back to pending.
    ResetTask { id: u32 },
    /// Remove the plan and dispatch run.
    Clear,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Archive the session branch and start fresh from trunk.
    New,
}

#[derive(Subcommand)]
enum DraftCommand {
    Start,
    Clear,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let paths = match cli.home {
        Some(home) => RelayPaths::new(cwd.join(home)),
        None => RelayPaths::from_env(&cwd),
    };

    // A missing config loads as the default, so `init` goes through here too.
    let config = load_config_with_env(&paths.config_path)?;
    let backends = Backends::system();
    let ctx = RelayContext::new(&paths, &config, &backends);

    match cli.command {
        Command::Init { force } => {
            let paths = init_relay(&paths.home, &InitOptions { force })?;
            println!("initialized {}", paths.home.display());
        }
        Command::Daemon { once } => {
            let mut passes = 0u32;
            let stats = run_loop(ctx, || {
                if !once {
                    return false;
                }
                passes += 1;
                passes > 1
            });
            println!(
                "passes {}, replies {}, tasks {}, errors {}",
                stats.passes, stats.replies, stats.tasks, stats.errors
            );
        }
        Command::Tick => {
            let outcome = Dispatcher::new().tick(ctx)?;
            return Ok(print_tick(&outcome));
        }
        Command::Chat => {
            return Ok(match process_inbox(ctx)? {
                ChatOutcome::NoMessages => exit_codes::IDLE,
                ChatOutcome::Busy => {
                    println!("busy");
                    exit_codes::BUSY
                }
                ChatOutcome::Replied { messages, reverted } => {
                    println!("replied to {messages} message(s)");
                    for path in reverted {
                        println!("reverted {path}");
                    }
                    exit_codes::OK
                }
            });
        }
        Command::Status => println!("{}", control::status_report(&paths, &config)?),
        Command::Inbox { command } => match command {
            InboxCommand::Add { text } => {
                let message = paths.inbox().enqueue_inbound(&text.join(" "))?;
                println!("{}", message.id);
            }
            InboxCommand::List => print_json(&paths.inbox().load()?)?,
        },
        Command::Outbox { command } => match command {
            OutboxCommand::Pending => print_json(&paths.outbox().drain_unsent_outbound()?)?,
            OutboxCommand::MarkSent { ids } => {
                let marked = paths.outbox().mark_sent(&ids)?;
                println!("marked {marked}");
            }
        },
        Command::Plan { command } => run_plan(&paths, &config, command)?,
        Command::Continue => control::request_continue(&paths)?,
        Command::Stop => {
            if !control::stop(&paths)? {
                println!("no dispatch run was active");
            }
        }
        Command::Kill => {
            let report = control::kill(&paths)?;
            match report.agent_pid {
                Some(pid) => println!("terminated agent pid {pid}"),
                None => println!("no agent process recorded"),
            }
            if let Some(holder) = report.holder {
                println!("cleared lock held by {} (pid {})", holder.holder.as_str(), holder.pid);
            }
        }
        Command::Session {
            command: SessionCommand::New,
        } => {
            let branch = control::new_session(&paths, &config)?;
            println!("{}", branch.name);
        }
        Command::Draft { command } => match command {
            DraftCommand::Start => control::start_drafting(&paths)?,
            DraftCommand::Clear => {
                control::stop_drafting(&paths)?;
            }
        },
    }
    Ok(exit_codes::OK)
}

fn run_plan(
    paths: &RelayPaths,
    config: &relay::io::config::RelayConfig,
    command: PlanCommand,
) -> Result<()> {
    match command {
        PlanCommand::Load { file } => {
            let plan = control::load_plan(paths, &file)?;
            println!("{}", format_summary(&plan));
        }
        PlanCommand::Show => {
            let plan = PlanStore::new(&paths.plan_path).require()?;
            println!("{}", format_summary(&plan));
        }
        PlanCommand::Status { status } => {
            control::set_plan_status(paths, status)?;
        }
        PlanCommand::Model {
            platform,
            model,
            task,
        } => {
            let plan = control::select_model(paths, platform, &model, task)?;
            println!("{}", format_summary(&plan));
        }
        PlanCommand::Approve { mode } => {
            let run = control::approve(paths, config, mode)?;
            println!(
                "approved {} task(s) in {} mode",
                run.tasks.len(),
                run.mode.as_str()
            );
        }
        PlanCommand::ResetTask { id } => control::reset_task(paths, id)?,
        PlanCommand::Clear => control::clear_plan(paths)?,
    }
    Ok(())
}

fn print_tick(outcome: &TickOutcome) -> i32 {
    match outcome {
        TickOutcome::Idle => exit_codes::IDLE,
        TickOutcome::Drafting => {
            println!("drafting");
            exit_codes::IDLE
        }
        TickOutcome::Busy => {
            println!("busy");
            exit_codes::BUSY
        }
        TickOutcome::Waiting(ids) => {
            println!("waiting on {ids:?}");
            exit_codes::IDLE
        }
        TickOutcome::Completed => {
            println!("completed");
            exit_codes::OK
        }
        TickOutcome::Ran(task) => {
            println!(
                "task #{} {} (remaining {})",
                task.id,
                task.status.as_str(),
                task.progress.remaining()
            );
            exit_codes::OK
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["relay", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_plan_model_for_task() {
        let cli = Cli::parse_from(["relay", "plan", "model", "codex", "gpt-5", "--task", "3"]);
        let Command::Plan {
            command:
                PlanCommand::Model {
                    platform,
                    model,
                    task,
                },
        } = cli.command
        else {
            panic!("expected plan model");
        };
        assert_eq!(platform, BackendKind::Codex);
        assert_eq!(model, "gpt-5");
        assert_eq!(task, Some(3));
    }

    #[test]
    fn parse_approve_mode_and_global_home() {
        let cli = Cli::parse_from(["relay", "plan", "approve", "--mode", "auto", "--home", "/tmp/x"]);
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(
            cli.command,
            Command::Plan {
                command: PlanCommand::Approve {
                    mode: Some(ExecutionMode::Auto)
                }
            }
        ));
    }

    #[test]
    fn rejects_unknown_plan_status() {
        assert!(Cli::try_parse_from(["relay", "plan", "status", "bogus"]).is_err());
    }
}
