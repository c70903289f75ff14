//! Diagnostic tracing for the relay daemon and CLI.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator/developer diagnostics via `RUST_LOG`,
//!   written to stderr. Not persisted by relay itself.
//!
//! - **Task logs (`io/task_log`)**: prompts, invocation logs, and reports under
//!   `runs/`. Always written, unaffected by `RUST_LOG`.
//!
//! - **Narration (`io/queue`)**: messages for the operator in `state/outbox.json`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "relay=info";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to [`DEFAULT_FILTER`].
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=relay=debug relay daemon
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
