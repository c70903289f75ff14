//! Agent invocation with fallback, and completion report extraction.

pub mod report;
pub mod runner;
