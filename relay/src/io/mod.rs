//! I/O helpers: state home records, git, agent processes, prompts.

pub mod backend;
pub mod config;
pub mod dispatch_store;
pub mod fsutil;
pub mod git;
pub mod init;
pub mod lock;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod schema;
pub mod signals;
pub mod task_log;
