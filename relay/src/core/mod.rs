//! Deterministic, pure logic shared by the relay core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod failure;
pub mod invariants;
pub mod progress;
pub mod selector;
pub mod summary;
pub mod tiers;
pub mod types;
