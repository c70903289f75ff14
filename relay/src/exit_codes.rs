//! Stable exit codes for relay CLI commands.

/// Command succeeded (for `tick`/`chat`: work was done).
pub const OK: i32 = 0;
/// Invalid arguments, config, or records, or any other error.
pub const INVALID: i32 = 1;
/// `relay tick` or `relay chat` found the invocation lock held.
pub const BUSY: i32 = 2;
/// `relay tick` or `relay chat` had nothing to do.
pub const IDLE: i32 = 3;
