//! Completion report extraction after a task invocation.

use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::io::fsutil::{read_optional, remove_if_exists};

/// Where the report text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    File,
    OutputTail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub text: String,
    pub source: ReportSource,
}

/// Limits for report extraction.
#[derive(Debug, Clone, Copy)]
pub struct ReportLimits {
    /// Reports shorter than this (trimmed) fall back to the output tail.
    pub min_bytes: usize,
    pub tail_bytes: usize,
}

/// Read and remove `<workdir>/<report_file>`, falling back to the tail of `output`.
///
/// The file is removed even when it is too short so a stale report never
/// leaks into the next task.
pub fn read_completion_report(
    workdir: &Path,
    report_file: &str,
    output: &str,
    limits: ReportLimits,
) -> Result<CompletionReport> {
    let path = workdir.join(report_file);
    let contents = read_optional(&path)?;
    if contents.is_some() {
        remove_if_exists(&path)?;
    }
    if let Some(text) = contents.map(|text| text.trim().to_string())
        && text.len() >= limits.min_bytes
    {
        debug!(path = %path.display(), bytes = text.len(), "using report file");
        return Ok(CompletionReport {
            text,
            source: ReportSource::File,
        });
    }
    debug!(bytes = output.len(), "report missing or short, using output tail");
    Ok(CompletionReport {
        text: tail_bytes(output.trim(), limits.tail_bytes).to_string(),
        source: ReportSource::OutputTail,
    })
}

/// Last `max` bytes of `text`, widened to a char boundary.
fn tail_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const LIMITS: ReportLimits = ReportLimits {
        min_bytes: 10,
        tail_bytes: 8,
    };

    #[test]
    fn prefers_report_file_and_removes_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("REPORT.md"), "Changed src/lib.rs and added tests\n")
            .expect("write");
        let report = read_completion_report(temp.path(), "REPORT.md", "raw output", LIMITS)
            .expect("report");
        assert_eq!(report.source, ReportSource::File);
        assert_eq!(report.text, "Changed src/lib.rs and added tests");
        assert!(!temp.path().join("REPORT.md").exists());
    }

    #[test]
    fn short_report_falls_back_to_output_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("REPORT.md"), "ok").expect("write");
        let report =
            read_completion_report(temp.path(), "REPORT.md", "lots of output here\n", LIMITS)
                .expect("report");
        assert_eq!(report.source, ReportSource::OutputTail);
        assert_eq!(report.text, "put here");
        assert!(!temp.path().join("REPORT.md").exists());
    }

    #[test]
    fn missing_report_uses_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report =
            read_completion_report(temp.path(), "REPORT.md", "short", LIMITS).expect("report");
        assert_eq!(report.text, "short");
        assert_eq!(report.source, ReportSource::OutputTail);
    }

    #[test]
    fn tail_bytes_respects_char_boundaries() {
        assert_eq!(tail_bytes("aé", 1), "");
        assert_eq!(tail_bytes("aé", 2), "é");
    }
}
