//! Remote-operated orchestrator for coding-agent sessions.
//!
//! An operator talks to the agent through file-backed message queues while the
//! dispatch engine works through an approved, dependency-ordered plan one
//! isolated agent invocation at a time. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task selection, invariants,
//!   failure classification, tier defaults). No I/O.
//! - **[`io`]**: Side-effecting operations (record stores, git, agent
//!   processes, prompts, signals, the invocation lock).
//! - **[`agents`]**: Agent invocation with a single fallback retry, and
//!   completion report extraction.
//!
//! Orchestration modules ([`dispatch`], [`chat`], [`session`], [`control`],
//! [`looping`]) coordinate core logic with I/O to implement CLI commands.

pub mod agents;
pub mod chat;
pub mod context;
pub mod control;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
