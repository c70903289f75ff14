//! Classification of backend invocation results.

/// Default stderr markers that identify quota or rate-limit failures.
pub const DEFAULT_RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "quota",
    "usage limit",
    "too many requests",
    "resource_exhausted",
    "429",
    "overloaded",
];

/// Exit status and captured streams of one invocation, as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub struct AttemptView<'a> {
    pub exit_code: Option<i32>,
    pub output: &'a str,
    pub stderr: &'a str,
}

impl AttemptView<'_> {
    pub fn exited_ok(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn has_output(&self) -> bool {
        !self.output.trim().is_empty()
    }
}

/// Rate-limited iff the exit status is non-zero (or missing) and stderr carries a marker.
///
/// Exit status is checked first: backends that retry internally may print a
/// transient warning to stderr and still succeed.
pub fn is_rate_limited<S: AsRef<str>>(attempt: &AttemptView<'_>, markers: &[S]) -> bool {
    if attempt.exited_ok() {
        return false;
    }
    let stderr = attempt.stderr.to_lowercase();
    markers
        .iter()
        .any(|marker| stderr.contains(&marker.as_ref().to_lowercase()))
}

/// Whether a failed primary attempt earns the single fallback retry.
///
/// Any attempt without usable output qualifies, whatever its exit status:
/// rate limits, crashes, and clean exits with nothing to show. Partial output
/// is treated as success. The model must differ from both the routine and the
/// fallback model of the invoked backend.
pub fn should_fallback(
    attempt: &AttemptView<'_>,
    model: &str,
    routine_model: &str,
    fallback_model: &str,
) -> bool {
    if attempt.has_output() {
        return false;
    }
    model != routine_model && model != fallback_model
}
